//! Crate-owned xDS message types.
//!
//! These types are codegen-agnostic and serve as the interface between
//! the discovery session logic and the transport layer. The codec converts
//! these to/from the wire format (e.g., prost/envoy-types).

use bytes::Bytes;

/// A discovery request received from a proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryRequest {
    /// The version_info of the most recent response the proxy accepted
    /// for this type, or empty for the first request.
    pub version_info: String,
    /// The node making the request. Proxies usually only send it on the
    /// first request of a stream.
    pub node: Option<Node>,
    /// Resource names the proxy subscribes to. Empty means all resources.
    pub resource_names: Vec<String>,
    /// Type URL of the resource being requested.
    pub type_url: String,
    /// The nonce of the response this request acknowledges, or empty for
    /// the first request.
    pub response_nonce: String,
    /// Error details if this is a NACK (negative acknowledgment).
    pub error_detail: Option<ErrorDetail>,
}

impl DiscoveryRequest {
    /// Create an initial request for `type_url` with no version and no nonce.
    pub fn new(type_url: impl Into<String>) -> Self {
        Self {
            type_url: type_url.into(),
            ..Default::default()
        }
    }

    /// Set the node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.node = Some(node);
        self
    }

    /// Set the version the proxy reports it holds.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version_info = version.into();
        self
    }

    /// Set the nonce being acknowledged.
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.response_nonce = nonce.into();
        self
    }

    /// Set the subscribed resource names.
    pub fn with_resource_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Mark this request as a NACK of the response with the given nonce.
    pub fn with_error(mut self, error: ErrorDetail) -> Self {
        self.error_detail = Some(error);
        self
    }

    /// Returns true if the proxy is rejecting the acknowledged response.
    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}

/// A discovery response pushed to a proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryResponse {
    /// The version of the response data.
    pub version_info: String,
    /// The response resources wrapped as Any protos.
    pub resources: Vec<ResourceAny>,
    /// Type URL of the resources.
    pub type_url: String,
    /// Nonce for this response, to be echoed back in the next request.
    pub nonce: String,
}

/// A resource wrapped as google.protobuf.Any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAny {
    /// Type URL of the resource.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

impl ResourceAny {
    /// Wrap already-serialized resource bytes.
    pub fn new(type_url: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
        }
    }
}

/// Node identification sent by a proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// An opaque node identifier.
    pub id: Option<String>,
    /// The cluster the node belongs to.
    pub cluster: Option<String>,
    /// Locality specifying where the node is running.
    pub locality: Option<Locality>,
    /// Free-form string identifying the client type (e.g., "envoy", "grpc").
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
}

impl Node {
    /// Create a new Node with the required user agent fields.
    ///
    /// Other fields (id, cluster, locality) can be set using builder methods.
    pub fn new(user_agent_name: impl Into<String>, user_agent_version: impl Into<String>) -> Self {
        Self {
            id: None,
            cluster: None,
            locality: None,
            user_agent_name: user_agent_name.into(),
            user_agent_version: user_agent_version.into(),
        }
    }

    /// Set the node ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// Error details carried by a NACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}
