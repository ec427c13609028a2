//! A Rust implementation of an [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol) control-plane server.
//!
//! This crate serves state-of-the-world discovery streams to data-plane
//! proxies such as Envoy. It handles:
//! - A per-node snapshot cache with atomic, last-write-wins replacement
//! - Watches that push new versions to open streams without polling
//! - Version/nonce tracking and ACK/NACK handling per stream and type
//! - Aggregated (ADS) and per-type (CDS/LDS/RDS/EDS) endpoints
//!
//! It does NOT translate higher-level configuration into xDS resources.
//! A producer builds [`Snapshot`]s of encoded resources and hands them to
//! the server whenever the desired state changes.
//!
//! # Example
//!
//! ```no_run
//! use envoy_types::pb::envoy::config::cluster::v3::Cluster;
//! use xds_server::{NamedResource, ResourceType, ServerConfig, Snapshot, XdsServer};
//!
//! # async fn run() -> xds_server::Result<()> {
//! let server = XdsServer::new(ServerConfig::new(18000));
//!
//! let cluster = Cluster {
//!     name: "backend".to_string(),
//!     ..Default::default()
//! };
//! let snapshot = Snapshot::builder()
//!     .resources(
//!         ResourceType::Cluster,
//!         "v1",
//!         [NamedResource::encode(ResourceType::Cluster, "backend", &cluster)],
//!     )
//!     .build();
//! server.set_snapshot("proxy-1", snapshot)?;
//!
//! // Every proxy with node id "proxy-1" now receives version "v1".
//! server.serve().await
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the `tonic` discovery services and the serving loop. This enables the `codegen-prost` feature. Enabled by default.
//! - `codegen-prost`: Enables conversions from and to the `prost` generated envoy messages and snapshot consistency checking. Enabled by default.

pub mod cache;
pub mod codec;
pub mod error;
pub mod message;
pub mod node;
pub mod resource;
pub mod server;

pub use cache::{
    NodeStatus, Resources, Snapshot, SnapshotBuilder, SnapshotCache, StreamId, Watch,
    WatchOutcome, WatchRequest, WatchResponse,
};
pub use error::{Error, Result};
pub use message::{DiscoveryRequest, DiscoveryResponse, ErrorDetail, Locality, Node, ResourceAny};
pub use node::{IdHash, NodeHash, NodeKey};
pub use resource::{NamedResource, ResourceType};
pub use server::XdsServer;
pub use server::callbacks::{Callbacks, NoopCallbacks, TracingCallbacks};
pub use server::config::ServerConfig;
