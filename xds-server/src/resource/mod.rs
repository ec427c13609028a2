//! The resource types served over discovery streams.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::message::ResourceAny;

/// Type URL of cluster resources.
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
/// Type URL of listener resources.
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
/// Type URL of route configuration resources.
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
/// Type URL of endpoint (cluster load assignment) resources.
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// The closed set of resource types a snapshot can hold.
///
/// Each type is versioned independently within a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    /// Upstream clusters (CDS).
    Cluster,
    /// Listeners (LDS).
    Listener,
    /// Route configurations (RDS).
    Route,
    /// Cluster load assignments (EDS).
    Endpoint,
}

impl ResourceType {
    /// Every resource type, in the order proxies typically request them.
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Cluster,
        ResourceType::Endpoint,
        ResourceType::Listener,
        ResourceType::Route,
    ];

    /// The xDS type URL for this resource type.
    pub const fn type_url(self) -> &'static str {
        match self {
            ResourceType::Cluster => CLUSTER_TYPE_URL,
            ResourceType::Listener => LISTENER_TYPE_URL,
            ResourceType::Route => ROUTE_TYPE_URL,
            ResourceType::Endpoint => ENDPOINT_TYPE_URL,
        }
    }

    /// Look up a resource type by its type URL.
    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.type_url() == type_url)
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            ResourceType::Cluster => 0,
            ResourceType::Listener => 1,
            ResourceType::Route => 2,
            ResourceType::Endpoint => 3,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Cluster => "cluster",
            ResourceType::Listener => "listener",
            ResourceType::Route => "route",
            ResourceType::Endpoint => "endpoint",
        };
        f.write_str(name)
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(type_url: &str) -> Result<Self, Self::Err> {
        Self::from_type_url(type_url).ok_or_else(|| Error::UnknownResourceType(type_url.to_owned()))
    }
}

/// A serialized resource together with its name.
///
/// The name combined with the resource type uniquely identifies a resource
/// within a snapshot; proxies subscribe to resources by this name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedResource {
    /// The resource name.
    pub name: String,
    /// The serialized resource.
    pub resource: ResourceAny,
}

impl NamedResource {
    /// Pair a name with a serialized resource.
    pub fn new(name: impl Into<String>, resource: ResourceAny) -> Self {
        Self {
            name: name.into(),
            resource,
        }
    }

    /// Encode a prost message of type `ty` under `name`.
    #[cfg(feature = "codegen-prost")]
    pub fn encode<M: prost::Message>(
        ty: ResourceType,
        name: impl Into<String>,
        message: &M,
    ) -> Self {
        Self::new(
            name,
            ResourceAny::new(ty.type_url(), message.encode_to_vec()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_url_lookup() {
        for ty in ResourceType::ALL {
            assert_eq!(ResourceType::from_type_url(ty.type_url()), Some(ty));
        }
        assert_eq!(
            ResourceType::from_type_url("type.googleapis.com/envoy.api.v2.Cluster"),
            None
        );
    }

    #[test]
    fn test_from_str_unknown() {
        let err = "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret"
            .parse::<ResourceType>()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownResourceType(_)));
    }

    #[test]
    fn test_indices_are_distinct() {
        let mut seen = [false; 4];
        for ty in ResourceType::ALL {
            assert!(!seen[ty.index()]);
            seen[ty.index()] = true;
        }
    }
}
