//! The state-of-the-world discovery session run for each proxy stream.
//!
//! A session tracks, for every resource type requested on its stream, the
//! last nonce it sent, the version it pushed and the version the proxy
//! confirmed. Each type moves through the same states independently:
//!
//! ```text
//! AwaitingRequest --request--> Watching --watch resolves--> AwaitingAck
//!                                  ^                             |
//!                                  +-------- ACK / NACK ---------+
//! ```
//!
//! After every push a new watch is parked right away, so a later snapshot
//! update reaches the proxy even before it acknowledges the previous push.
//! ACKs and NACKs whose nonce is not the latest one sent for their type
//! refer to a superseded push and are ignored. A NACK is recorded on the
//! node in the cache, so the rejected version is skipped by every stream of
//! that node, including ones opened after this stream closes.

use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::Arc;

use futures_util::stream::{self, Once};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt as _, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::cache::{SnapshotCache, StreamId, Watch, WatchOutcome, WatchRequest, WatchResponse};
use crate::error::{Error, Result};
use crate::message::{DiscoveryRequest, DiscoveryResponse};
use crate::node::{NodeHash, NodeKey};
use crate::resource::ResourceType;
use crate::server::callbacks::Callbacks;

/// State shared by every session of a server.
pub(crate) struct SessionContext<C, H> {
    pub(crate) cache: SnapshotCache,
    pub(crate) callbacks: Arc<C>,
    pub(crate) node_hash: Arc<H>,
    pub(crate) allow_unidentified_nodes: bool,
}

impl<C, H> Clone for SessionContext<C, H> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            callbacks: Arc::clone(&self.callbacks),
            node_hash: Arc::clone(&self.node_hash),
            allow_unidentified_nodes: self.allow_unidentified_nodes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    AwaitingRequest,
    Watching,
    AwaitingAck,
}

/// Protocol state for one resource type on one stream.
#[derive(Debug, Default)]
struct TypeState {
    phase: Phase,
    /// Nonce of the latest push. Empty until something is pushed.
    nonce: String,
    pushed_version: String,
    /// The version the proxy last reported holding.
    acked_version: String,
    /// Subscribed names. Empty is a wildcard subscription.
    names: Vec<String>,
}

/// One proxy stream.
pub(crate) struct DiscoverySession<C, H> {
    ctx: SessionContext<C, H>,
    id: StreamId,
    /// The only type served on a per-type endpoint.
    restrict: Option<ResourceType>,
    /// Fixed by the first request that identifies the proxy.
    node: Option<NodeKey>,
    types: HashMap<ResourceType, TypeState>,
    watches: StreamMap<ResourceType, Once<Watch>>,
    outbound: mpsc::Sender<DiscoveryResponse>,
    nonces: u64,
}

impl<C, H> DiscoverySession<C, H>
where
    C: Callbacks,
    H: NodeHash,
{
    pub(crate) fn new(
        ctx: SessionContext<C, H>,
        restrict: Option<ResourceType>,
        outbound: mpsc::Sender<DiscoveryResponse>,
    ) -> Self {
        Self {
            ctx,
            id: StreamId::new(),
            restrict,
            node: None,
            types: HashMap::new(),
            watches: StreamMap::new(),
            outbound,
            nonces: 0,
        }
    }

    /// Serve the stream until the proxy closes it, the response sink is
    /// dropped, or `shutdown` is cancelled.
    ///
    /// Returns an error only if the inbound stream failed.
    pub(crate) async fn run<S>(self, inbound: S, shutdown: CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<DiscoveryRequest>>,
    {
        let span = tracing::debug_span!(
            "xds_stream",
            stream_id = %self.id,
            node = tracing::field::Empty,
        );
        self.serve(inbound, shutdown).instrument(span).await
    }

    async fn serve<S>(mut self, inbound: S, shutdown: CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<DiscoveryRequest>>,
    {
        let mut inbound = pin!(inbound);
        let type_url = self.restrict.map(ResourceType::type_url).unwrap_or_default();
        self.ctx.callbacks.on_stream_open(self.id, type_url);
        tracing::debug!(type_url, "stream opened");

        let result = loop {
            tokio::select! {
                request = inbound.next() => match request {
                    Some(Ok(request)) => {
                        if let Err(e) = self.handle_request(request).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },

                Some((ty, resolved)) = self.watches.next(), if !self.watches.is_empty() => {
                    if let Err(e) = self.handle_watch(ty, resolved).await {
                        break Err(e);
                    }
                }

                _ = self.outbound.closed() => break Ok(()),

                _ = shutdown.cancelled() => {
                    tracing::debug!("closing stream for shutdown");
                    break Ok(());
                }
            }
        };

        let released = self.release();
        self.ctx.callbacks.on_stream_closed(self.id, self.node.as_ref());

        match result {
            // The proxy went away mid-push.
            Err(Error::StreamClosed) | Ok(()) => {
                tracing::debug!(released, "stream closed");
                Ok(())
            }
            Err(error) => {
                tracing::debug!(%error, released, "stream failed");
                Err(error)
            }
        }
    }

    async fn handle_request(&mut self, request: DiscoveryRequest) -> Result<()> {
        self.ctx.callbacks.on_stream_request(self.id, &request);

        let Some(ty) = self.resource_type(&request) else {
            return Ok(());
        };
        let Some(node) = self.identify(&request) else {
            return Ok(());
        };

        let state = self.types.entry(ty).or_default();

        if !request.response_nonce.is_empty() {
            if request.response_nonce != state.nonce {
                tracing::debug!(
                    type_url = ty.type_url(),
                    nonce = %request.response_nonce,
                    expected = %state.nonce,
                    "ignoring stale nonce"
                );
                return Ok(());
            }

            if let Some(error) = &request.error_detail {
                tracing::warn!(
                    type_url = ty.type_url(),
                    version = %state.pushed_version,
                    nonce = %state.nonce,
                    code = error.code,
                    message = %error.message,
                    "proxy rejected configuration"
                );
                self.ctx.cache.reject_version(&node, ty, state.pushed_version.clone());
            }
        }

        state.acked_version = request.version_info;

        // A new subscription set needs the matching resources even if the
        // version did not change.
        let force = state.phase != Phase::AwaitingRequest
            && !same_names(&state.names, &request.resource_names);
        state.names = request.resource_names;
        state.phase = Phase::Watching;

        let watch = WatchRequest::new(node, self.id, ty)
            .with_known_version(state.acked_version.clone())
            .with_force(force);
        self.register(watch).await
    }

    async fn handle_watch(
        &mut self,
        ty: ResourceType,
        resolved: Option<WatchResponse>,
    ) -> Result<()> {
        match resolved {
            Some(response) => {
                let next = self.push(response).await?;
                self.register(next).await
            }
            None => {
                tracing::debug!(type_url = ty.type_url(), "watch cancelled");
                Ok(())
            }
        }
    }

    /// Register `request` with the cache, pushing for as long as it resolves
    /// immediately.
    async fn register(&mut self, mut request: WatchRequest) -> Result<()> {
        loop {
            let ty = request.resource_type;
            match self.ctx.cache.watch(request) {
                WatchOutcome::Parked(watch) => {
                    self.watches.insert(ty, stream::once(watch));
                    return Ok(());
                }
                WatchOutcome::Ready(response) => {
                    self.watches.remove(&ty);
                    request = self.push(response).await?;
                }
            }
        }
    }

    /// Send `response` to the proxy and return the watch that awaits the
    /// version after it.
    async fn push(&mut self, response: WatchResponse) -> Result<WatchRequest> {
        let node = self.node.clone().ok_or(Error::MissingNodeIdentity)?;
        let ty = response.resource_type;
        self.nonces += 1;
        let nonce = self.nonces.to_string();

        let state = self.types.entry(ty).or_default();
        let message = DiscoveryResponse {
            version_info: response.version().to_owned(),
            resources: response.resources.select(&state.names),
            type_url: ty.type_url().to_owned(),
            nonce,
        };
        state.nonce = message.nonce.clone();
        state.pushed_version = message.version_info.clone();
        state.phase = Phase::AwaitingAck;

        let next = WatchRequest::new(node, self.id, ty)
            .with_known_version(state.pushed_version.clone());

        tracing::debug!(
            type_url = %message.type_url,
            version = %message.version_info,
            nonce = %message.nonce,
            resources = message.resources.len(),
            "pushing response"
        );
        self.ctx.callbacks.on_stream_response(self.id, &message);
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::StreamClosed)?;
        Ok(next)
    }

    /// The type a request is for, or `None` if the request is to be ignored.
    fn resource_type(&self, request: &DiscoveryRequest) -> Option<ResourceType> {
        let ty = if request.type_url.is_empty() {
            match self.restrict {
                Some(ty) => ty,
                None => {
                    tracing::warn!("ignoring aggregated request without a type URL");
                    return None;
                }
            }
        } else {
            match ResourceType::from_type_url(&request.type_url) {
                Some(ty) => ty,
                None => {
                    let error = Error::UnknownResourceType(request.type_url.clone());
                    tracing::warn!(%error, "ignoring request");
                    return None;
                }
            }
        };

        if let Some(expected) = self.restrict.filter(|expected| *expected != ty) {
            tracing::warn!(
                type_url = ty.type_url(),
                expected = expected.type_url(),
                "ignoring request for another type"
            );
            return None;
        }
        Some(ty)
    }

    /// The node this stream serves, or `None` if the proxy has not been
    /// identified and unidentified proxies are refused.
    fn identify(&mut self, request: &DiscoveryRequest) -> Option<NodeKey> {
        if let Some(node) = &self.node {
            return Some(node.clone());
        }

        let identified = request.node.as_ref().is_some_and(|n| n.id.is_some());
        if !identified && !self.ctx.allow_unidentified_nodes {
            tracing::warn!(error = %Error::MissingNodeIdentity, "ignoring request");
            return None;
        }

        let node = self.ctx.node_hash.hash(request.node.as_ref());
        tracing::Span::current().record("node", tracing::field::display(&node));
        tracing::debug!(%node, "node identified");
        self.node = Some(node.clone());
        Some(node)
    }
}

impl<C, H> DiscoverySession<C, H> {
    /// Cancel every watch this stream parked.
    fn release(&mut self) -> usize {
        self.watches.clear();
        match &self.node {
            Some(node) => self.ctx.cache.cancel_all(node.as_str(), self.id),
            None => 0,
        }
    }
}

impl<C, H> Drop for DiscoverySession<C, H> {
    fn drop(&mut self) {
        self.release();
    }
}

fn same_names(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<HashSet<_>>() == b.iter().collect::<HashSet<_>>()
}
