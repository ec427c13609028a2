//! Example demonstrating xds-server usage.
//!
//! This example shows:
//! - How to encode Envoy resources into a `Snapshot`
//! - How to serve snapshots with `XdsServer` over tonic
//! - How to push a new version to connected proxies while serving
//!
//! # Configuration (environment variables)
//!
//! - `XDS_PORT`: port to listen on (default: `18000`)
//! - `XDS_NODE_ID`: node id of the proxy to configure (default: `proxy-1`)
//! - `XDS_UPSTREAM`: `host:port` of the upstream the proxy routes to (default: `127.0.0.1:8080`)
//! - `RUST_LOG`: log filter (default: `info`)
//!
//! # Usage
//!
//! ```sh
//! RUST_LOG=xds_server=debug cargo run -p xds-server --example basic
//! ```
//!
//! Point an Envoy with node id `proxy-1` and an ADS config source at
//! `127.0.0.1:18000`. A new endpoint version is published every 30 seconds.

use std::time::Duration;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, EdsClusterConfig,
};
use envoy_types::pb::envoy::config::core::v3::{
    Address, AggregatedConfigSource, ConfigSource, SocketAddress, address, config_source,
    socket_address,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints, lb_endpoint,
};
use envoy_types::pb::envoy::config::listener::v3::{Filter, FilterChain, Listener, filter};
use envoy_types::pb::envoy::config::route::v3::{
    Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost, route, route_action,
    route_match,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    HttpConnectionManager, Rds, http_connection_manager::RouteSpecifier,
};
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use tracing_subscriber::EnvFilter;

use xds_server::{
    NamedResource, ResourceType, ServerConfig, Snapshot, TracingCallbacks, XdsServer,
};

const LISTENER: &str = "listener_0";
const ROUTE: &str = "local_route";
const CLUSTER: &str = "backend";
const HCM_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";

fn ads() -> Option<ConfigSource> {
    Some(ConfigSource {
        config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
            AggregatedConfigSource {},
        )),
        ..Default::default()
    })
}

fn socket(host: &str, port: u32) -> Option<Address> {
    Some(Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
        ..Default::default()
    })
}

fn cluster() -> NamedResource {
    let cluster = Cluster {
        name: CLUSTER.to_string(),
        connect_timeout: Some(envoy_types::pb::google::protobuf::Duration {
            seconds: 1,
            nanos: 0,
        }),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
        eds_cluster_config: Some(EdsClusterConfig {
            eds_config: ads(),
            ..Default::default()
        }),
        ..Default::default()
    };
    NamedResource::encode(ResourceType::Cluster, CLUSTER, &cluster)
}

fn endpoints(host: &str, port: u32) -> NamedResource {
    let assignment = ClusterLoadAssignment {
        cluster_name: CLUSTER.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints: vec![LbEndpoint {
                host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                    address: socket(host, port),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };
    NamedResource::encode(ResourceType::Endpoint, CLUSTER, &assignment)
}

fn route_config() -> NamedResource {
    let config = RouteConfiguration {
        name: ROUTE.to_string(),
        virtual_hosts: vec![VirtualHost {
            name: "local_service".to_string(),
            domains: vec!["*".to_string()],
            routes: vec![Route {
                r#match: Some(RouteMatch {
                    path_specifier: Some(route_match::PathSpecifier::Prefix("/".to_string())),
                    ..Default::default()
                }),
                action: Some(route::Action::Route(RouteAction {
                    cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(
                        CLUSTER.to_string(),
                    )),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };
    NamedResource::encode(ResourceType::Route, ROUTE, &config)
}

fn listener() -> NamedResource {
    let hcm = HttpConnectionManager {
        stat_prefix: "http".to_string(),
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            config_source: ads(),
            route_config_name: ROUTE.to_string(),
            ..Default::default()
        })),
        ..Default::default()
    };
    let listener = Listener {
        name: LISTENER.to_string(),
        address: socket("0.0.0.0", 10000),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: "envoy.filters.network.http_connection_manager".to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(Any {
                    type_url: HCM_TYPE_URL.to_string(),
                    value: hcm.encode_to_vec(),
                })),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };
    NamedResource::encode(ResourceType::Listener, LISTENER, &listener)
}

fn snapshot(generation: u64, host: &str, port: u32) -> Snapshot {
    Snapshot::builder()
        .resources(ResourceType::Cluster, "1", [cluster()])
        .resources(ResourceType::Listener, "1", [listener()])
        .resources(ResourceType::Route, "1", [route_config()])
        .resources(ResourceType::Endpoint, generation.to_string(), [endpoints(host, port)])
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = match std::env::var("XDS_PORT") {
        Ok(port) => port.parse()?,
        Err(_) => 18000,
    };
    let node_id = std::env::var("XDS_NODE_ID").unwrap_or_else(|_| "proxy-1".to_string());
    let upstream = std::env::var("XDS_UPSTREAM").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let (host, upstream_port) = upstream
        .rsplit_once(':')
        .ok_or("XDS_UPSTREAM must be host:port")?;
    let upstream_port: u32 = upstream_port.parse()?;

    let config = ServerConfig::new(port).with_check_consistency(true);
    let server = XdsServer::new(config).with_callbacks(TracingCallbacks);
    server.set_snapshot(node_id.as_str(), snapshot(1, host, upstream_port))?;

    let producer = server.clone();
    let host = host.to_string();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await;
        for generation in 2.. {
            interval.tick().await;
            let next = snapshot(generation, &host, upstream_port);
            match producer.set_snapshot(node_id.as_str(), next) {
                Ok(()) => tracing::info!(generation, "published endpoints"),
                Err(error) => tracing::error!(%error, "failed to publish snapshot"),
            }
        }
    });

    server.serve().await?;
    Ok(())
}
