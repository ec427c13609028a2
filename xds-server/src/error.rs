//! Error types for the xDS server.

use std::net::SocketAddr;

use thiserror::Error;

/// Error type for the xDS server.
#[derive(Debug, Error)]
pub enum Error {
    /// A snapshot handed to the cache is malformed. The previous snapshot
    /// for the node stays authoritative.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// A snapshot refers to resources it does not contain.
    #[error("inconsistent snapshot: {0}")]
    InconsistentSnapshot(String),

    /// A request named a type URL that is not served.
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    /// A request carried no node identity and unidentified nodes are refused.
    #[error("request is missing node identity")]
    MissingNodeIdentity,

    /// The peer closed the stream, or the response sink went away.
    #[error("stream closed")]
    StreamClosed,

    /// A transport failure not carrying a gRPC status.
    #[error("transport error: {0}")]
    Transport(String),

    /// The stream failed with a gRPC status.
    #[cfg(feature = "transport-tonic")]
    #[error("stream error: {0}")]
    Stream(#[from] tonic::Status),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the server tried to listen on.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The serving loop failed.
    #[cfg(feature = "transport-tonic")]
    #[error("failed to serve: {0}")]
    Serve(#[from] tonic::transport::Error),

    /// A resource body could not be decoded.
    #[cfg(feature = "codegen-prost")]
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Result type alias for xDS server operations.
pub type Result<T> = std::result::Result<T, Error>;
