//! Conversions for prost/envoy-types generated messages.

use envoy_types::pb::envoy::config::core::v3 as core;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::google::protobuf::Any;

use crate::message::{DiscoveryRequest, DiscoveryResponse, ErrorDetail, Locality, Node, ResourceAny};

impl From<discovery::DiscoveryRequest> for DiscoveryRequest {
    fn from(proto: discovery::DiscoveryRequest) -> Self {
        Self {
            version_info: proto.version_info,
            node: proto.node.map(Node::from),
            resource_names: proto.resource_names,
            type_url: proto.type_url,
            response_nonce: proto.response_nonce,
            error_detail: proto.error_detail.map(|status| ErrorDetail {
                code: status.code,
                message: status.message,
            }),
        }
    }
}

impl From<core::Node> for Node {
    fn from(proto: core::Node) -> Self {
        let user_agent_version = match proto.user_agent_version_type {
            Some(core::node::UserAgentVersionType::UserAgentVersion(version)) => version,
            Some(core::node::UserAgentVersionType::UserAgentBuildVersion(build)) => build
                .version
                .map(|v| format!("{}.{}.{}", v.major_number, v.minor_number, v.patch))
                .unwrap_or_default(),
            None => String::new(),
        };

        Self {
            id: Some(proto.id).filter(|id| !id.is_empty()),
            cluster: Some(proto.cluster).filter(|cluster| !cluster.is_empty()),
            locality: proto.locality.map(|l| Locality {
                region: l.region,
                zone: l.zone,
                sub_zone: l.sub_zone,
            }),
            user_agent_name: proto.user_agent_name,
            user_agent_version,
        }
    }
}

impl From<ResourceAny> for Any {
    fn from(resource: ResourceAny) -> Self {
        Any {
            type_url: resource.type_url,
            value: resource.value.to_vec(),
        }
    }
}

impl From<DiscoveryResponse> for discovery::DiscoveryResponse {
    fn from(response: DiscoveryResponse) -> Self {
        discovery::DiscoveryResponse {
            version_info: response.version_info,
            resources: response.resources.into_iter().map(Any::from).collect(),
            type_url: response.type_url,
            nonce: response.nonce,
            ..Default::default()
        }
    }
}
