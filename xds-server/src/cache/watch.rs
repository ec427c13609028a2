//! Watches: parked requests awaiting the next version of a resource type.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::cache::snapshot::Resources;
use crate::node::NodeKey;
use crate::resource::ResourceType;

/// Global counter for generating unique stream IDs.
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a discovery stream.
///
/// Watches are scoped to the stream that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Create a new unique stream ID.
    pub fn new() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Interest in the next version of one resource type for one node.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    /// The node whose snapshot is watched.
    pub node: NodeKey,
    /// The stream the watch belongs to.
    pub stream: StreamId,
    /// The watched resource type.
    pub resource_type: ResourceType,
    /// The version the proxy holds. Empty if it holds nothing yet.
    pub known_version: String,
    /// Resolve even if the snapshot version equals `known_version`.
    pub force: bool,
}

impl WatchRequest {
    /// Watch `resource_type` for `node` on behalf of `stream`, starting from
    /// no known version.
    pub fn new(node: NodeKey, stream: StreamId, resource_type: ResourceType) -> Self {
        Self {
            node,
            stream,
            resource_type,
            known_version: String::new(),
            force: false,
        }
    }

    /// Set the version the proxy holds.
    pub fn with_known_version(mut self, version: impl Into<String>) -> Self {
        self.known_version = version.into();
        self
    }

    /// Resolve on the current version even if the proxy already holds it.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Returns true if `resources` should be delivered to this watch.
    ///
    /// Versions the node rejected are filtered by the cache before this is
    /// asked.
    pub(crate) fn accepts(&self, resources: &Resources) -> bool {
        self.force || resources.version() != self.known_version
    }
}

/// The version delivered to a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    /// The resource type.
    pub resource_type: ResourceType,
    /// The resources under their new version.
    pub resources: Resources,
}

impl WatchResponse {
    /// The delivered version.
    pub fn version(&self) -> &str {
        self.resources.version()
    }
}

/// The result of registering a watch.
#[derive(Debug)]
pub enum WatchOutcome {
    /// The store already held a version the proxy does not have.
    Ready(WatchResponse),
    /// The proxy is current; the watch resolves on a later snapshot update.
    Parked(Watch),
}

/// A parked watch.
///
/// Resolves to `Some` when a new version is delivered, or to `None` when the
/// watch is cancelled or superseded by a newer watch for the same stream and
/// type. Dropping it does not remove the registration; cancel it through
/// the cache.
#[derive(Debug)]
pub struct Watch {
    resource_type: ResourceType,
    rx: oneshot::Receiver<WatchResponse>,
}

impl Watch {
    pub(crate) fn new(resource_type: ResourceType, rx: oneshot::Receiver<WatchResponse>) -> Self {
        Self { resource_type, rx }
    }

    /// The watched resource type.
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }
}

impl Future for Watch {
    type Output = Option<WatchResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// A registered watch awaiting resolution.
#[derive(Debug)]
pub(crate) struct ParkedWatch {
    pub(crate) request: WatchRequest,
    pub(crate) tx: oneshot::Sender<WatchResponse>,
}
