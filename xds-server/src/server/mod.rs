//! The xDS server: snapshot producer API and gRPC serving loop.

use std::fmt;
use std::sync::Arc;

use crate::cache::{Snapshot, SnapshotCache};
use crate::error::Result;
use crate::node::{IdHash, NodeHash, NodeKey};

pub mod callbacks;
pub mod config;
pub(crate) mod session;

#[cfg(feature = "transport-tonic")]
pub(crate) mod service;

use callbacks::{Callbacks, NoopCallbacks};
use config::ServerConfig;
use session::SessionContext;

/// An xDS control-plane server.
///
/// Producers push per-node snapshots with [`set_snapshot`](Self::set_snapshot);
/// every open discovery stream of that node receives the new versions
/// without asking again. The server serves the aggregated discovery service
/// and the cluster, listener, route and endpoint discovery services on one
/// port.
///
/// # Example
///
/// ```no_run
/// use xds_server::{ServerConfig, Snapshot, TracingCallbacks, XdsServer};
///
/// # async fn run() -> xds_server::Result<()> {
/// let server = XdsServer::new(ServerConfig::new(18000)).with_callbacks(TracingCallbacks);
/// server.set_snapshot("proxy-1", Snapshot::builder().build())?;
/// server.serve().await
/// # }
/// ```
pub struct XdsServer<C = NoopCallbacks, H = IdHash> {
    config: ServerConfig,
    cache: SnapshotCache,
    callbacks: Arc<C>,
    node_hash: Arc<H>,
}

impl XdsServer {
    /// Create a server with no callbacks that keys nodes by their ID.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            cache: SnapshotCache::new(),
            callbacks: Arc::new(NoopCallbacks),
            node_hash: Arc::new(IdHash),
        }
    }
}

impl<C, H> XdsServer<C, H> {
    /// Replace the stream callbacks.
    pub fn with_callbacks<C2: Callbacks>(self, callbacks: C2) -> XdsServer<C2, H> {
        XdsServer {
            config: self.config,
            cache: self.cache,
            callbacks: Arc::new(callbacks),
            node_hash: self.node_hash,
        }
    }

    /// Replace the mapping from node metadata to snapshot key.
    pub fn with_node_hash<H2: NodeHash>(self, node_hash: H2) -> XdsServer<C, H2> {
        XdsServer {
            config: self.config,
            cache: self.cache,
            callbacks: self.callbacks,
            node_hash: Arc::new(node_hash),
        }
    }

    /// Serve from an existing cache instead of a fresh one.
    pub fn with_cache(mut self, cache: SnapshotCache) -> Self {
        self.cache = cache;
        self
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The snapshot cache the server serves from.
    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Replace the snapshot of `node`.
    ///
    /// Fails if the snapshot is invalid, or if consistency checking is
    /// enabled and the snapshot refers to resources it does not contain. On
    /// failure the previous snapshot stays in place.
    pub fn set_snapshot(&self, node: impl Into<NodeKey>, snapshot: Snapshot) -> Result<()> {
        #[cfg(feature = "codegen-prost")]
        if self.config.check_consistency {
            snapshot.check_consistency()?;
        }
        self.cache.set_snapshot(node, snapshot)
    }

    /// Returns the current snapshot of `node`.
    pub fn get_snapshot(&self, node: &str) -> Option<Arc<Snapshot>> {
        self.cache.get_snapshot(node)
    }

    fn session_context(&self) -> SessionContext<C, H> {
        SessionContext {
            cache: self.cache.clone(),
            callbacks: Arc::clone(&self.callbacks),
            node_hash: Arc::clone(&self.node_hash),
            allow_unidentified_nodes: self.config.allow_unidentified_nodes,
        }
    }
}

impl<C, H> Clone for XdsServer<C, H> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            cache: self.cache.clone(),
            callbacks: Arc::clone(&self.callbacks),
            node_hash: Arc::clone(&self.node_hash),
        }
    }
}

impl<C, H> fmt::Debug for XdsServer<C, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XdsServer")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "transport-tonic")]
mod serve {
    use std::future::Future;

    use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer;
    use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
    use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryServiceServer;
    use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer;
    use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryServiceServer;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tokio_util::sync::CancellationToken;
    use tonic::transport::Server;

    use super::XdsServer;
    use super::callbacks::Callbacks;
    use super::service::XdsService;
    use crate::error::{Error, Result};
    use crate::node::NodeHash;

    impl<C, H> XdsServer<C, H>
    where
        C: Callbacks,
        H: NodeHash,
    {
        /// Serve on the configured port until ctrl-c is received.
        pub async fn serve(&self) -> Result<()> {
            self.serve_with_shutdown(ctrl_c()).await
        }

        /// Serve on the configured port until `signal` completes.
        ///
        /// Fails with [`Error::Bind`] if the port cannot be bound.
        pub async fn serve_with_shutdown<F>(&self, signal: F) -> Result<()>
        where
            F: Future<Output = ()>,
        {
            let addr = self.config.bind_address();
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| Error::Bind { addr, source })?;
            self.serve_with_listener(listener, signal).await
        }

        /// Serve connections accepted by `listener` until `signal` completes.
        ///
        /// Once `signal` completes no new connections are accepted. Open
        /// streams may keep running for the configured drain timeout and are
        /// then closed. When this returns every snapshot and watch has been
        /// released from the cache.
        pub async fn serve_with_listener<F>(&self, listener: TcpListener, signal: F) -> Result<()>
        where
            F: Future<Output = ()>,
        {
            let local_addr = listener.local_addr().ok();
            let streams = CancellationToken::new();
            let service = XdsService::new(
                self.session_context(),
                self.config.max_concurrent_streams,
                self.config.response_buffer,
                streams.clone(),
            );

            let drain_timeout = self.config.drain_timeout;
            let drain = streams.clone();
            let shutdown = async move {
                signal.await;
                tracing::info!(?drain_timeout, "shutdown requested, draining streams");
                tokio::spawn(async move {
                    tokio::time::sleep(drain_timeout).await;
                    drain.cancel();
                });
            };

            tracing::info!(addr = ?local_addr, "xDS server listening");
            let result = Server::builder()
                .max_concurrent_streams(self.config.max_concurrent_streams)
                .add_service(AggregatedDiscoveryServiceServer::new(service.clone()))
                .add_service(ClusterDiscoveryServiceServer::new(service.clone()))
                .add_service(ListenerDiscoveryServiceServer::new(service.clone()))
                .add_service(RouteDiscoveryServiceServer::new(service.clone()))
                .add_service(EndpointDiscoveryServiceServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await;

            streams.cancel();
            self.cache.clear();
            tracing::info!("xDS server stopped");
            result.map_err(Error::from)
        }
    }

    async fn ctrl_c() {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c; serving until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResourceAny;
    use crate::resource::{NamedResource, ResourceType};

    #[test]
    fn test_set_and_get_snapshot() {
        let server = XdsServer::new(ServerConfig::default());
        assert!(server.get_snapshot("proxy-1").is_none());

        let cluster = ResourceAny::new(ResourceType::Cluster.type_url(), b"c1".as_slice());
        let snapshot = Snapshot::builder()
            .resources(ResourceType::Cluster, "v1", [NamedResource::new("c1", cluster)])
            .build();
        server.set_snapshot("proxy-1", snapshot.clone()).unwrap();

        assert_eq!(*server.get_snapshot("proxy-1").unwrap(), snapshot);
        assert_eq!(server.cache().node_keys(), vec![NodeKey::new("proxy-1")]);
    }

    #[cfg(feature = "codegen-prost")]
    #[test]
    fn test_consistency_check_rejects_dangling_reference() {
        use envoy_types::pb::envoy::config::cluster::v3::Cluster;
        use envoy_types::pb::envoy::config::cluster::v3::cluster::{
            ClusterDiscoveryType, DiscoveryType,
        };

        let cluster = Cluster {
            name: "backend".to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
            ..Default::default()
        };
        let snapshot = Snapshot::builder()
            .resources(
                ResourceType::Cluster,
                "v1",
                [NamedResource::encode(ResourceType::Cluster, "backend", &cluster)],
            )
            .build();

        let lenient = XdsServer::new(ServerConfig::default());
        lenient.set_snapshot("proxy-1", snapshot.clone()).unwrap();

        let strict = XdsServer::new(ServerConfig::default().with_check_consistency(true));
        assert!(matches!(
            strict.set_snapshot("proxy-1", snapshot),
            Err(crate::error::Error::InconsistentSnapshot(_))
        ));
        assert!(strict.get_snapshot("proxy-1").is_none());
    }

    #[test]
    fn test_custom_node_hash() {
        let server = XdsServer::new(ServerConfig::default())
            .with_node_hash(|node: Option<&crate::message::Node>| {
                NodeKey::new(node.and_then(|n| n.cluster.as_deref()).unwrap_or("default"))
            });
        let ctx = server.session_context();
        let node = crate::message::Node::new("envoy", "1.30").with_cluster("edge");
        assert_eq!(ctx.node_hash.hash(Some(&node)).as_str(), "edge");
        assert_eq!(ctx.node_hash.hash(None).as_str(), "default");
    }
}
