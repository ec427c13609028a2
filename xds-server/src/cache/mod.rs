//! The per-node snapshot store and its watch registry.
//!
//! [`SnapshotCache`] holds one immutable [`Snapshot`] per [`NodeKey`] and the
//! watches parked against it. Nodes are independent: each node has its own
//! entry with its own lock, so updates to different nodes never contend.
//!
//! Within a node, snapshot replacement and watch registration happen under
//! the node's lock, so a watch either observes a new snapshot when it is
//! registered or is resolved by it. Readers never take that lock: the current
//! snapshot is published through an [`ArcSwapOption`].
//!
//! A node also remembers the versions its proxies rejected, per resource
//! type, so a rejected version is not delivered again on a later stream. An
//! entry with no snapshot, no parked watch and no rejection is released as
//! soon as the last stream using it lets go.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::node::NodeKey;
use crate::resource::ResourceType;

pub mod snapshot;
pub mod watch;

#[cfg(feature = "codegen-prost")]
pub mod consistency;

pub use snapshot::{Resources, Snapshot, SnapshotBuilder};
pub use watch::{StreamId, Watch, WatchOutcome, WatchRequest, WatchResponse};

use watch::ParkedWatch;

/// Rejected versions remembered per node and resource type. The oldest is
/// forgotten first.
pub const MAX_REJECTED_VERSIONS: usize = 16;

/// Introspection data for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Number of parked watches.
    pub watches: usize,
    /// When a watch was last requested for this node.
    pub last_watch_request: Option<Instant>,
}

/// A thread-safe snapshot cache.
///
/// Cloning this handle creates a new reference to the same cache.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCache {
    nodes: Arc<DashMap<NodeKey, Arc<NodeEntry>>>,
}

#[derive(Debug, Default)]
struct NodeEntry {
    snapshot: ArcSwapOption<Snapshot>,
    watches: Mutex<WatchTable>,
}

impl NodeEntry {
    fn lock(&self) -> MutexGuard<'_, WatchTable> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_idle(&self) -> bool {
        self.snapshot.load().is_none() && self.lock().is_idle()
    }
}

#[derive(Debug, Default)]
struct WatchTable {
    parked: HashMap<(StreamId, ResourceType), ParkedWatch>,
    rejected: HashMap<ResourceType, VecDeque<String>>,
    last_watch_request: Option<Instant>,
}

impl WatchTable {
    fn is_idle(&self) -> bool {
        self.parked.is_empty() && self.rejected.is_empty()
    }

    fn is_rejected(&self, resource_type: ResourceType, version: &str) -> bool {
        self.rejected
            .get(&resource_type)
            .is_some_and(|versions| versions.iter().any(|v| v == version))
    }

    /// Returns true if `version` was not already rejected.
    fn reject(&mut self, resource_type: ResourceType, version: String) -> bool {
        if self.is_rejected(resource_type, &version) {
            return false;
        }
        let versions = self.rejected.entry(resource_type).or_default();
        if versions.len() == MAX_REJECTED_VERSIONS {
            versions.pop_front();
        }
        versions.push_back(version);
        true
    }

    fn deliverable<'a>(
        &self,
        request: &WatchRequest,
        snapshot: &'a Snapshot,
    ) -> Option<&'a Resources> {
        snapshot.get(request.resource_type).filter(|resources| {
            !self.is_rejected(request.resource_type, resources.version())
                && request.accepts(resources)
        })
    }

    /// Deliver `snapshot` to every parked watch it satisfies.
    ///
    /// Returns the number of watches resolved.
    fn resolve(&mut self, snapshot: &Snapshot) -> usize {
        // Watches whose owner went away without cancelling.
        self.parked.retain(|_, watch| !watch.tx.is_closed());

        let ready: Vec<_> = self
            .parked
            .iter()
            .filter(|(_, watch)| self.deliverable(&watch.request, snapshot).is_some())
            .map(|(key, _)| *key)
            .collect();

        let mut resolved = 0;
        for key in ready {
            let Some(watch) = self.parked.remove(&key) else {
                continue;
            };
            let Some(resources) = snapshot.get(key.1) else {
                continue;
            };
            let response = WatchResponse {
                resource_type: key.1,
                resources: resources.clone(),
            };
            if watch.tx.send(response).is_ok() {
                resolved += 1;
            }
        }
        resolved
    }
}

impl SnapshotCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `node`, creating it if needed.
    ///
    /// The map reference is released before returning so that no shard
    /// lock is held while the node lock is taken.
    fn entry(&self, node: &NodeKey) -> Arc<NodeEntry> {
        if let Some(entry) = self.nodes.get(node) {
            return Arc::clone(entry.value());
        }
        Arc::clone(self.nodes.entry(node.clone()).or_default().value())
    }

    /// Replace the snapshot of `node`.
    ///
    /// The snapshot is validated first; an invalid snapshot is rejected and
    /// the previous one stays in place. Parked watches of the node that the
    /// new snapshot satisfies are resolved before this returns.
    pub fn set_snapshot(&self, node: impl Into<NodeKey>, snapshot: Snapshot) -> Result<()> {
        snapshot.validate()?;

        let node = node.into();
        let snapshot = Arc::new(snapshot);
        let entry = self.entry(&node);

        let mut table = entry.lock();
        entry.snapshot.store(Some(Arc::clone(&snapshot)));
        let resolved = table.resolve(&snapshot);
        drop(table);

        tracing::debug!(%node, resolved, "snapshot set");
        Ok(())
    }

    /// Returns the current snapshot of `node`.
    pub fn get_snapshot(&self, node: &str) -> Option<Arc<Snapshot>> {
        self.nodes
            .get(node)
            .and_then(|entry| entry.snapshot.load_full())
    }

    /// Drop the snapshot of `node` and forget the versions its proxies
    /// rejected. Parked watches stay parked.
    ///
    /// Returns true if the node had a snapshot.
    pub fn clear_snapshot(&self, node: &str) -> bool {
        let Some(entry) = self.get_entry(node) else {
            return false;
        };
        let cleared = {
            let mut table = entry.lock();
            table.rejected.clear();
            entry.snapshot.swap(None).is_some()
        };
        drop(entry);
        self.prune(node);
        cleared
    }

    /// Keys of every node that currently has a snapshot.
    pub fn node_keys(&self) -> Vec<NodeKey> {
        self.nodes
            .iter()
            .filter(|entry| entry.snapshot.load().is_some())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Introspection data for `node`, if the cache holds any state for it.
    pub fn status(&self, node: &str) -> Option<NodeStatus> {
        let entry = self.get_entry(node)?;
        let table = entry.lock();
        Some(NodeStatus {
            watches: table.parked.len(),
            last_watch_request: table.last_watch_request,
        })
    }

    /// Register interest in the next version of a resource type.
    ///
    /// If the node's snapshot already holds a version the request accepts,
    /// the response is returned immediately. Otherwise the watch is parked
    /// until a snapshot update satisfies it.
    ///
    /// A stream holds at most one watch per resource type: registering
    /// again supersedes the earlier watch, which then resolves to `None`.
    pub fn watch(&self, request: WatchRequest) -> WatchOutcome {
        let entry = self.entry(&request.node);
        let key = (request.stream, request.resource_type);

        let mut table = entry.lock();
        table.last_watch_request = Some(Instant::now());

        let current = entry.snapshot.load_full();
        let ready = current
            .as_deref()
            .and_then(|snapshot| table.deliverable(&request, snapshot));

        if let Some(resources) = ready {
            table.parked.remove(&key);
            return WatchOutcome::Ready(WatchResponse {
                resource_type: request.resource_type,
                resources: resources.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let resource_type = request.resource_type;
        table.parked.insert(key, ParkedWatch { request, tx });
        WatchOutcome::Parked(Watch::new(resource_type, rx))
    }

    /// Record that a proxy of `node` rejected `version` of `resource_type`.
    ///
    /// Watches of every stream of the node skip that version from now on,
    /// until the node's snapshot is cleared. Only the latest
    /// [`MAX_REJECTED_VERSIONS`] rejections per type are remembered.
    ///
    /// Returns true if the version was not already rejected.
    pub fn reject_version(
        &self,
        node: &NodeKey,
        resource_type: ResourceType,
        version: impl Into<String>,
    ) -> bool {
        self.entry(node).lock().reject(resource_type, version.into())
    }

    /// Cancel the watch `stream` holds on `resource_type` of `node`.
    ///
    /// Returns true if a watch was removed.
    pub fn cancel_watch(&self, node: &str, stream: StreamId, resource_type: ResourceType) -> bool {
        let Some(entry) = self.get_entry(node) else {
            return false;
        };
        let removed = entry.lock().parked.remove(&(stream, resource_type)).is_some();
        drop(entry);
        self.prune(node);
        removed
    }

    /// Cancel every watch `stream` holds on `node`.
    ///
    /// Returns the number of watches removed.
    pub fn cancel_all(&self, node: &str, stream: StreamId) -> usize {
        let Some(entry) = self.get_entry(node) else {
            return 0;
        };
        let removed = {
            let mut table = entry.lock();
            let before = table.parked.len();
            table.parked.retain(|(owner, _), _| *owner != stream);
            before - table.parked.len()
        };
        drop(entry);
        self.prune(node);
        removed
    }

    fn get_entry(&self, node: &str) -> Option<Arc<NodeEntry>> {
        self.nodes.get(node).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the entry of `node` if it holds nothing.
    ///
    /// Runs under the shard's write lock: an entry nobody else holds a
    /// reference to cannot be picked up by a concurrent caller meanwhile.
    fn prune(&self, node: &str) {
        let removed = self
            .nodes
            .remove_if(node, |_, entry| Arc::strong_count(entry) == 1 && entry.is_idle())
            .is_some();
        if removed {
            tracing::trace!(node, "released idle node");
        }
    }

    /// Release every snapshot and watch. Parked watches resolve to `None`.
    pub fn clear(&self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::Error;
    use crate::message::ResourceAny;
    use crate::resource::NamedResource;

    fn cluster(name: &str) -> NamedResource {
        NamedResource::new(
            name,
            ResourceAny::new(ResourceType::Cluster.type_url(), name.as_bytes().to_vec()),
        )
    }

    fn clusters(version: &str, names: &[&str]) -> Snapshot {
        Snapshot::builder()
            .resources(
                ResourceType::Cluster,
                version,
                names.iter().map(|n| cluster(n)),
            )
            .build()
    }

    fn request(node: &str, stream: StreamId) -> WatchRequest {
        WatchRequest::new(NodeKey::new(node), stream, ResourceType::Cluster)
    }

    fn parked(outcome: WatchOutcome) -> Watch {
        match outcome {
            WatchOutcome::Parked(watch) => watch,
            WatchOutcome::Ready(response) => panic!("expected parked watch, got {response:?}"),
        }
    }

    fn ready(outcome: WatchOutcome) -> WatchResponse {
        match outcome {
            WatchOutcome::Ready(response) => response,
            WatchOutcome::Parked(_) => panic!("expected ready watch"),
        }
    }

    #[test]
    fn test_last_write_wins() {
        let cache = SnapshotCache::new();
        assert!(cache.get_snapshot("proxy-1").is_none());

        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        cache.set_snapshot("proxy-1", clusters("v2", &["c1", "c2"])).unwrap();
        cache.set_snapshot("proxy-1", clusters("v3", &["c3"])).unwrap();

        let snapshot = cache.get_snapshot("proxy-1").unwrap();
        assert_eq!(*snapshot, clusters("v3", &["c3"]));
    }

    #[test]
    fn test_invalid_snapshot_keeps_previous() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();

        let err = cache
            .set_snapshot("proxy-1", clusters("v2", &["c1", "c1"]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot(_)));

        let snapshot = cache.get_snapshot("proxy-1").unwrap();
        assert_eq!(snapshot.version(ResourceType::Cluster), Some("v1"));
    }

    #[test]
    fn test_watch_resolves_immediately_on_new_version() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();

        let response = ready(cache.watch(request("proxy-1", StreamId::new())));
        assert_eq!(response.version(), "v1");
        assert_eq!(response.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_parked_watch_resolves_on_set() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();

        let stream = StreamId::new();
        let watch = parked(cache.watch(request("proxy-1", stream).with_known_version("v1")));
        assert_eq!(cache.status("proxy-1").unwrap().watches, 1);

        cache.set_snapshot("proxy-1", clusters("v2", &["c1", "c2"])).unwrap();

        let response = watch.await.unwrap();
        assert_eq!(response.version(), "v2");
        assert_eq!(response.resources.len(), 2);
        assert_eq!(cache.status("proxy-1").unwrap().watches, 0);
    }

    #[tokio::test]
    async fn test_watch_parks_before_first_snapshot() {
        let cache = SnapshotCache::new();
        let watch = parked(cache.watch(request("proxy-1", StreamId::new())));

        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        assert_eq!(watch.await.unwrap().version(), "v1");
    }

    #[tokio::test]
    async fn test_same_version_does_not_resolve() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();

        let stream = StreamId::new();
        let mut watch = parked(cache.watch(request("proxy-1", stream).with_known_version("v1")));
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(20), &mut watch).await;
        assert!(pending.is_err());
        assert_eq!(cache.status("proxy-1").unwrap().watches, 1);
    }

    #[tokio::test]
    async fn test_other_types_do_not_resolve() {
        let cache = SnapshotCache::new();
        let stream = StreamId::new();
        let mut watch = parked(cache.watch(
            WatchRequest::new(NodeKey::new("proxy-1"), stream, ResourceType::Listener),
        ));

        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(20), &mut watch).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_rejected_version_is_skipped() {
        let cache = SnapshotCache::new();
        let node = NodeKey::new("proxy-1");
        cache.set_snapshot("proxy-1", clusters("v2", &["bad"])).unwrap();
        assert!(cache.reject_version(&node, ResourceType::Cluster, "v2"));
        assert!(!cache.reject_version(&node, ResourceType::Cluster, "v2"));

        let mut watch = parked(cache.watch(
            request("proxy-1", StreamId::new())
                .with_known_version("v1")
                .with_force(true),
        ));

        cache.set_snapshot("proxy-1", clusters("v2", &["bad"])).unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(20), &mut watch).await;
        assert!(pending.is_err());

        cache.set_snapshot("proxy-1", clusters("v3", &["good"])).unwrap();
        assert_eq!(watch.await.unwrap().version(), "v3");
    }

    #[test]
    fn test_rejection_applies_to_later_streams() {
        let cache = SnapshotCache::new();
        let node = NodeKey::new("proxy-1");
        cache.set_snapshot("proxy-1", clusters("v1", &["bad"])).unwrap();

        let first = StreamId::new();
        ready(cache.watch(request("proxy-1", first)));
        cache.reject_version(&node, ResourceType::Cluster, "v1");
        cache.cancel_all("proxy-1", first);

        // A reconnecting proxy reports no version at all.
        let _watch = parked(cache.watch(request("proxy-1", StreamId::new())));

        // Other types and other nodes are unaffected.
        let listeners = Snapshot::builder()
            .resources(ResourceType::Cluster, "v1", [cluster("bad")])
            .resources(ResourceType::Listener, "v1", [])
            .build();
        cache.set_snapshot("proxy-2", listeners.clone()).unwrap();
        ready(cache.watch(request("proxy-2", StreamId::new())));
        cache.set_snapshot("proxy-1", listeners).unwrap();
        let listener_watch =
            WatchRequest::new(node.clone(), StreamId::new(), ResourceType::Listener);
        ready(cache.watch(listener_watch));
    }

    #[test]
    fn test_rejected_versions_are_bounded() {
        let cache = SnapshotCache::new();
        let node = NodeKey::new("proxy-1");
        for v in 0..=MAX_REJECTED_VERSIONS {
            cache.reject_version(&node, ResourceType::Cluster, format!("v{v}"));
        }

        // The oldest rejection was forgotten, the newest are kept.
        cache.set_snapshot("proxy-1", clusters("v0", &["c1"])).unwrap();
        ready(cache.watch(request("proxy-1", StreamId::new())));
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        parked(cache.watch(request("proxy-1", StreamId::new())));
    }

    #[test]
    fn test_clear_snapshot_forgets_rejections() {
        let cache = SnapshotCache::new();
        let node = NodeKey::new("proxy-1");
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        cache.reject_version(&node, ResourceType::Cluster, "v1");

        assert!(cache.clear_snapshot("proxy-1"));
        assert!(cache.status("proxy-1").is_none());

        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        assert_eq!(ready(cache.watch(request("proxy-1", StreamId::new()))).version(), "v1");
    }

    #[test]
    fn test_idle_node_is_released() {
        let cache = SnapshotCache::new();
        let stream = StreamId::new();
        let _cluster_watch = parked(cache.watch(request("proxy-1", stream)));
        let _listener_watch = parked(cache.watch(WatchRequest::new(
            NodeKey::new("proxy-1"),
            stream,
            ResourceType::Listener,
        )));

        assert!(cache.cancel_watch("proxy-1", stream, ResourceType::Cluster));
        assert_eq!(cache.status("proxy-1").unwrap().watches, 1);
        assert_eq!(cache.cancel_all("proxy-1", stream), 1);
        assert!(cache.status("proxy-1").is_none());

        // Nodes with a snapshot or a rejection are kept.
        cache.set_snapshot("proxy-2", clusters("v1", &["c1"])).unwrap();
        let other = StreamId::new();
        let _watch = parked(cache.watch(request("proxy-2", other).with_known_version("v1")));
        cache.cancel_all("proxy-2", other);
        assert!(cache.status("proxy-2").is_some());

        let rejecting = NodeKey::new("proxy-3");
        let _watch = parked(cache.watch(request("proxy-3", other)));
        cache.reject_version(&rejecting, ResourceType::Cluster, "v1");
        cache.cancel_all("proxy-3", other);
        assert!(cache.status("proxy-3").is_some());
    }

    #[test]
    fn test_churning_nodes_do_not_accumulate() {
        let cache = SnapshotCache::new();
        for i in 0..1000 {
            let node = format!("pod-{i}");
            let stream = StreamId::new();
            let _watch = parked(cache.watch(request(&node, stream)));
            cache.cancel_all(&node, stream);
        }
        assert!(cache.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_second_watch_supersedes_first() {
        let cache = SnapshotCache::new();
        let stream = StreamId::new();

        let first = parked(cache.watch(request("proxy-1", stream)));
        let second = parked(cache.watch(request("proxy-1", stream)));
        assert_eq!(cache.status("proxy-1").unwrap().watches, 1);
        assert!(first.await.is_none());

        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        assert_eq!(second.await.unwrap().version(), "v1");
    }

    #[tokio::test]
    async fn test_streams_watch_independently() {
        let cache = SnapshotCache::new();
        let a = parked(cache.watch(request("proxy-1", StreamId::new())));
        let b = parked(cache.watch(request("proxy-1", StreamId::new())));

        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        assert_eq!(a.await.unwrap().version(), "v1");
        assert_eq!(b.await.unwrap().version(), "v1");
    }

    #[tokio::test]
    async fn test_cancel_all_releases_stream_watches() {
        let cache = SnapshotCache::new();
        let stream = StreamId::new();
        let other = StreamId::new();

        let cluster_watch = parked(cache.watch(request("proxy-1", stream)));
        let listener_watch = parked(cache.watch(WatchRequest::new(
            NodeKey::new("proxy-1"),
            stream,
            ResourceType::Listener,
        )));
        let _other_watch = parked(cache.watch(request("proxy-1", other)));

        assert_eq!(cache.cancel_all("proxy-1", stream), 2);
        assert_eq!(cache.status("proxy-1").unwrap().watches, 1);
        assert!(cluster_watch.await.is_none());
        assert!(listener_watch.await.is_none());

        // Nothing left to deliver to for the cancelled stream.
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        assert_eq!(cache.status("proxy-1").unwrap().watches, 0);
        assert_eq!(cache.cancel_all("proxy-1", stream), 0);
        assert_eq!(cache.cancel_all("nobody", stream), 0);
    }

    #[test]
    fn test_cancel_watch() {
        let cache = SnapshotCache::new();
        let stream = StreamId::new();
        let _watch = parked(cache.watch(request("proxy-1", stream)));

        assert!(cache.cancel_watch("proxy-1", stream, ResourceType::Cluster));
        assert!(!cache.cancel_watch("proxy-1", stream, ResourceType::Cluster));
    }

    #[test]
    fn test_dropped_watch_is_pruned_on_set() {
        let cache = SnapshotCache::new();
        drop(parked(cache.watch(request("proxy-1", StreamId::new()))));
        assert_eq!(cache.status("proxy-1").unwrap().watches, 1);

        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        assert_eq!(cache.status("proxy-1").unwrap().watches, 0);
    }

    #[test]
    fn test_clear_snapshot_and_node_keys() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        cache.set_snapshot("proxy-2", clusters("v1", &["c1"])).unwrap();

        let mut keys = cache.node_keys();
        keys.sort();
        assert_eq!(keys, vec![NodeKey::new("proxy-1"), NodeKey::new("proxy-2")]);

        assert!(cache.clear_snapshot("proxy-1"));
        assert!(!cache.clear_snapshot("proxy-1"));
        assert!(cache.get_snapshot("proxy-1").is_none());
        assert_eq!(cache.node_keys(), vec![NodeKey::new("proxy-2")]);
    }

    #[tokio::test]
    async fn test_clear_releases_watches() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("proxy-1", clusters("v1", &["c1"])).unwrap();
        let stream = StreamId::new();
        let watch = parked(cache.watch(request("proxy-1", stream).with_known_version("v1")));

        cache.clear();
        assert!(watch.await.is_none());
        assert!(cache.get_snapshot("proxy-1").is_none());
        assert!(cache.status("proxy-1").is_none());
    }

    #[test]
    fn test_concurrent_writers_on_distinct_nodes() {
        let cache = SnapshotCache::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let node = format!("proxy-{i}");
                    for v in 0..50 {
                        let version = format!("v{v}");
                        cache
                            .set_snapshot(node.as_str(), clusters(&version, &["c1"]))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..8 {
            let snapshot = cache.get_snapshot(&format!("proxy-{i}")).unwrap();
            assert_eq!(snapshot.version(ResourceType::Cluster), Some("v49"));
        }
    }

    fn sized(n: usize) -> Snapshot {
        let names: Vec<String> = (0..n % 5 + 1).map(|i| format!("c{i}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        clusters(&format!("v{n}"), &names)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_delivers_matching_resources() {
        const LAST: usize = 200;
        let cache = SnapshotCache::new();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let stream = StreamId::new();
                    let mut last = 0;
                    loop {
                        let known = if last == 0 { String::new() } else { format!("v{last}") };
                        let watch = request("proxy-1", stream).with_known_version(known);
                        let response = match cache.watch(watch) {
                            WatchOutcome::Ready(response) => response,
                            WatchOutcome::Parked(watch) => {
                                tokio::time::timeout(Duration::from_secs(5), watch)
                                    .await
                                    .expect("watch never resolved")
                                    .expect("watch cancelled")
                            }
                        };
                        let n: usize = response.version()[1..].parse().unwrap();
                        assert!(n > last, "went from v{last} to v{n}");
                        assert_eq!(response.resources.len(), n % 5 + 1);
                        last = n;
                        if n == LAST {
                            return;
                        }
                    }
                })
            })
            .collect();

        let writer = {
            let cache = cache.clone();
            tokio::task::spawn_blocking(move || {
                for n in 1..=LAST {
                    cache.set_snapshot("proxy-1", sized(n)).unwrap();
                }
            })
        };

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(cache.status("proxy-1").unwrap().watches, 0);
    }
}
