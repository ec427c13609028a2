//! Cross-type reference checks for snapshots of envoy-types resources.

use std::collections::HashSet;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{ClusterDiscoveryType, DiscoveryType};
use envoy_types::pb::envoy::config::listener::v3::{Filter, Listener, filter};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_connection_manager::RouteSpecifier;
use prost::Message;

use crate::cache::snapshot::Snapshot;
use crate::error::{Error, Result};
use crate::resource::ResourceType;

const HTTP_CONNECTION_MANAGER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";

impl Snapshot {
    /// Check that the snapshot contains everything its resources refer to.
    ///
    /// - Every EDS cluster has a cluster load assignment named after its
    ///   service name (or the cluster name if none is set).
    /// - Every RDS route configuration named by a listener's HTTP connection
    ///   manager is present.
    ///
    /// Resource bodies are decoded as envoy v3 messages; a body that fails
    /// to decode is reported as [`Error::Decode`].
    pub fn check_consistency(&self) -> Result<()> {
        let mut eds_names = Vec::new();
        if let Some(clusters) = self.get(ResourceType::Cluster) {
            for item in clusters.items() {
                let cluster = Cluster::decode(item.resource.value.clone())?;
                if let Some(name) = eds_service_name(&cluster) {
                    eds_names.push(name);
                }
            }
        }
        ensure_present(self, ResourceType::Endpoint, &eds_names)?;

        let mut route_names = Vec::new();
        if let Some(listeners) = self.get(ResourceType::Listener) {
            for item in listeners.items() {
                let listener = Listener::decode(item.resource.value.clone())?;
                route_names.extend(rds_route_names(&listener)?);
            }
        }
        ensure_present(self, ResourceType::Route, &route_names)
    }
}

fn ensure_present(snapshot: &Snapshot, ty: ResourceType, referenced: &[String]) -> Result<()> {
    if referenced.is_empty() {
        return Ok(());
    }
    let defined: HashSet<&str> = snapshot
        .get(ty)
        .map(|resources| resources.names().collect())
        .unwrap_or_default();

    match referenced.iter().find(|name| !defined.contains(name.as_str())) {
        Some(missing) => Err(Error::InconsistentSnapshot(format!(
            "{ty} resource {missing:?} is referenced but not defined"
        ))),
        None => Ok(()),
    }
}

fn eds_service_name(cluster: &Cluster) -> Option<String> {
    let eds = Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
    if cluster.cluster_discovery_type != eds {
        return None;
    }
    let service_name = cluster
        .eds_cluster_config
        .as_ref()
        .map(|config| config.service_name.as_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(&cluster.name);
    Some(service_name.to_owned())
}

fn rds_route_names(listener: &Listener) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let chains = listener
        .filter_chains
        .iter()
        .chain(listener.default_filter_chain.as_ref());
    for chain in chains {
        for filter in &chain.filters {
            if let Some(hcm) = http_connection_manager(filter)? {
                if let Some(RouteSpecifier::Rds(rds)) = hcm.route_specifier {
                    names.push(rds.route_config_name);
                }
            }
        }
    }
    Ok(names)
}

fn http_connection_manager(filter: &Filter) -> Result<Option<HttpConnectionManager>> {
    match &filter.config_type {
        Some(filter::ConfigType::TypedConfig(any))
            if any.type_url == HTTP_CONNECTION_MANAGER_TYPE_URL =>
        {
            Ok(Some(HttpConnectionManager::decode(any.value.as_slice())?))
        }
        _ => Ok(None),
    }
}
