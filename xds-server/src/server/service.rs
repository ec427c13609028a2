//! `tonic` services exposing discovery sessions over gRPC.
//!
//! One [`XdsService`] implements the aggregated endpoint and the four
//! per-type endpoints. Every stream runs a discovery session on its own task.
//! Incremental (delta) variants are not served.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryService;
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryService;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryService;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt as _};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use crate::error::Error;
use crate::message::{DiscoveryRequest, DiscoveryResponse};
use crate::node::NodeHash;
use crate::resource::ResourceType;
use crate::server::callbacks::Callbacks;
use crate::server::session::{DiscoverySession, SessionContext};

/// Responses of a state-of-the-world stream.
pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<discovery::DiscoveryResponse, Status>> + Send>>;

/// Responses of an incremental stream. Never produced.
pub type DeltaResponseStream =
    Pin<Box<dyn Stream<Item = Result<discovery::DeltaDiscoveryResponse, Status>> + Send>>;

/// Discovery endpoints backed by a snapshot cache.
pub struct XdsService<C, H> {
    ctx: SessionContext<C, H>,
    streams: Arc<Semaphore>,
    shutdown: CancellationToken,
    response_buffer: usize,
    fetch_nonces: Arc<AtomicU64>,
}

impl<C, H> Clone for XdsService<C, H> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            streams: Arc::clone(&self.streams),
            shutdown: self.shutdown.clone(),
            response_buffer: self.response_buffer,
            fetch_nonces: Arc::clone(&self.fetch_nonces),
        }
    }
}

impl<C, H> std::fmt::Debug for XdsService<C, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdsService")
            .field("available_streams", &self.streams.available_permits())
            .field("response_buffer", &self.response_buffer)
            .finish_non_exhaustive()
    }
}

impl<C, H> XdsService<C, H>
where
    C: Callbacks,
    H: NodeHash,
{
    pub(crate) fn new(
        ctx: SessionContext<C, H>,
        max_streams: u32,
        response_buffer: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = usize::try_from(max_streams)
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);
        Self {
            ctx,
            streams: Arc::new(Semaphore::new(permits)),
            shutdown,
            response_buffer: response_buffer.max(1),
            fetch_nonces: Arc::new(AtomicU64::new(0)),
        }
    }

    fn open_stream(
        &self,
        request: Request<Streaming<discovery::DiscoveryRequest>>,
        restrict: Option<ResourceType>,
    ) -> Result<Response<ResponseStream>, Status> {
        let permit = Arc::clone(&self.streams).try_acquire_owned().map_err(|_| {
            tracing::warn!("refusing stream: concurrent stream limit reached");
            Status::resource_exhausted("too many concurrent streams")
        })?;

        let inbound = request
            .into_inner()
            .map(|r| r.map(DiscoveryRequest::from).map_err(Error::from));
        let (tx, rx) = mpsc::channel(self.response_buffer);
        let session = DiscoverySession::new(self.ctx.clone(), restrict, tx);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(error) = session.run(inbound, shutdown).await {
                tracing::info!(%error, "discovery stream terminated");
            }
        });

        let outbound = ReceiverStream::new(rx)
            .map(|r| Ok::<_, Status>(discovery::DiscoveryResponse::from(r)));
        Ok(Response::new(Box::pin(outbound)))
    }

    fn fetch(
        &self,
        ty: ResourceType,
        request: Request<discovery::DiscoveryRequest>,
    ) -> Result<Response<discovery::DiscoveryResponse>, Status> {
        let request = DiscoveryRequest::from(request.into_inner());
        self.ctx.callbacks.on_fetch_request(&request);

        if !request.type_url.is_empty() && request.type_url != ty.type_url() {
            let error = Error::UnknownResourceType(request.type_url.clone());
            return Err(Status::invalid_argument(error.to_string()));
        }

        let identified = request.node.as_ref().is_some_and(|n| n.id.is_some());
        if !identified && !self.ctx.allow_unidentified_nodes {
            return Err(Status::invalid_argument(Error::MissingNodeIdentity.to_string()));
        }
        let node = self.ctx.node_hash.hash(request.node.as_ref());

        let snapshot = self
            .ctx
            .cache
            .get_snapshot(node.as_str())
            .ok_or_else(|| Status::unavailable(format!("no snapshot for node {node}")))?;
        let resources = snapshot
            .get(ty)
            .ok_or_else(|| Status::unavailable(format!("no {ty} resources for node {node}")))?;
        if resources.version() == request.version_info {
            return Err(Status::unavailable("version up to date"));
        }

        let nonce = self.fetch_nonces.fetch_add(1, Ordering::Relaxed) + 1;
        let response = DiscoveryResponse {
            version_info: resources.version().to_owned(),
            resources: resources.select(&request.resource_names),
            type_url: ty.type_url().to_owned(),
            nonce: nonce.to_string(),
        };
        tracing::debug!(
            %node,
            type_url = ty.type_url(),
            version = %response.version_info,
            "answering fetch"
        );
        self.ctx.callbacks.on_fetch_response(&request, &response);
        Ok(Response::new(response.into()))
    }
}

fn delta_unimplemented() -> Status {
    Status::unimplemented("incremental xDS is not supported")
}

#[tonic::async_trait]
impl<C, H> AggregatedDiscoveryService for XdsService<C, H>
where
    C: Callbacks,
    H: NodeHash,
{
    type StreamAggregatedResourcesStream = ResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<discovery::DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        self.open_stream(request, None)
    }

    type DeltaAggregatedResourcesStream = DeltaResponseStream;

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<discovery::DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(delta_unimplemented())
    }
}

#[tonic::async_trait]
impl<C, H> ClusterDiscoveryService for XdsService<C, H>
where
    C: Callbacks,
    H: NodeHash,
{
    type StreamClustersStream = ResponseStream;

    async fn stream_clusters(
        &self,
        request: Request<Streaming<discovery::DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamClustersStream>, Status> {
        self.open_stream(request, Some(ResourceType::Cluster))
    }

    type DeltaClustersStream = DeltaResponseStream;

    async fn delta_clusters(
        &self,
        _request: Request<Streaming<discovery::DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaClustersStream>, Status> {
        Err(delta_unimplemented())
    }

    async fn fetch_clusters(
        &self,
        request: Request<discovery::DiscoveryRequest>,
    ) -> Result<Response<discovery::DiscoveryResponse>, Status> {
        self.fetch(ResourceType::Cluster, request)
    }
}

#[tonic::async_trait]
impl<C, H> ListenerDiscoveryService for XdsService<C, H>
where
    C: Callbacks,
    H: NodeHash,
{
    type StreamListenersStream = ResponseStream;

    async fn stream_listeners(
        &self,
        request: Request<Streaming<discovery::DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamListenersStream>, Status> {
        self.open_stream(request, Some(ResourceType::Listener))
    }

    type DeltaListenersStream = DeltaResponseStream;

    async fn delta_listeners(
        &self,
        _request: Request<Streaming<discovery::DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaListenersStream>, Status> {
        Err(delta_unimplemented())
    }

    async fn fetch_listeners(
        &self,
        request: Request<discovery::DiscoveryRequest>,
    ) -> Result<Response<discovery::DiscoveryResponse>, Status> {
        self.fetch(ResourceType::Listener, request)
    }
}

#[tonic::async_trait]
impl<C, H> RouteDiscoveryService for XdsService<C, H>
where
    C: Callbacks,
    H: NodeHash,
{
    type StreamRoutesStream = ResponseStream;

    async fn stream_routes(
        &self,
        request: Request<Streaming<discovery::DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRoutesStream>, Status> {
        self.open_stream(request, Some(ResourceType::Route))
    }

    type DeltaRoutesStream = DeltaResponseStream;

    async fn delta_routes(
        &self,
        _request: Request<Streaming<discovery::DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaRoutesStream>, Status> {
        Err(delta_unimplemented())
    }

    async fn fetch_routes(
        &self,
        request: Request<discovery::DiscoveryRequest>,
    ) -> Result<Response<discovery::DiscoveryResponse>, Status> {
        self.fetch(ResourceType::Route, request)
    }
}

#[tonic::async_trait]
impl<C, H> EndpointDiscoveryService for XdsService<C, H>
where
    C: Callbacks,
    H: NodeHash,
{
    type StreamEndpointsStream = ResponseStream;

    async fn stream_endpoints(
        &self,
        request: Request<Streaming<discovery::DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamEndpointsStream>, Status> {
        self.open_stream(request, Some(ResourceType::Endpoint))
    }

    type DeltaEndpointsStream = DeltaResponseStream;

    async fn delta_endpoints(
        &self,
        _request: Request<Streaming<discovery::DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaEndpointsStream>, Status> {
        Err(delta_unimplemented())
    }

    async fn fetch_endpoints(
        &self,
        request: Request<discovery::DiscoveryRequest>,
    ) -> Result<Response<discovery::DiscoveryResponse>, Status> {
        self.fetch(ResourceType::Endpoint, request)
    }
}
