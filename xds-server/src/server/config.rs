//! Configuration for the xDS server.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Port the server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 18000;

/// Configuration for the xDS server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on, on all interfaces.
    pub port: u16,

    /// Upper bound on concurrently open discovery streams.
    ///
    /// Applied both as the HTTP/2 per-connection stream limit and as a
    /// server-wide bound. Streams over the bound are refused with
    /// `RESOURCE_EXHAUSTED`.
    pub max_concurrent_streams: u32,

    /// How long in-flight streams may keep running after shutdown is
    /// requested before they are closed.
    pub drain_timeout: Duration,

    /// Serve proxies that send no node id.
    ///
    /// When true, such proxies share the snapshot stored under
    /// [`NodeKey::UNKNOWN`](crate::NodeKey::UNKNOWN). When false, their
    /// requests are ignored until they identify themselves.
    pub allow_unidentified_nodes: bool,

    /// Run [`Snapshot::check_consistency`](crate::Snapshot::check_consistency)
    /// on every snapshot handed to the server.
    pub check_consistency: bool,

    /// Number of responses buffered per stream before a push waits for the
    /// proxy to read.
    pub response_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_concurrent_streams: 1_000_000,
            drain_timeout: Duration::from_secs(5),
            allow_unidentified_nodes: true,
            check_consistency: false,
            response_buffer: 16,
        }
    }
}

impl ServerConfig {
    /// Create a configuration listening on `port` with default settings.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use xds_server::ServerConfig;
    ///
    /// let config = ServerConfig::new(18001)
    ///     .with_max_concurrent_streams(1024)
    ///     .with_drain_timeout(Duration::from_secs(10))
    ///     .with_allow_unidentified_nodes(false);
    ///
    /// assert_eq!(config.bind_address().port(), 18001);
    /// ```
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Set the stream bound.
    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Set the drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set whether proxies without a node id are served.
    pub fn with_allow_unidentified_nodes(mut self, allow: bool) -> Self {
        self.allow_unidentified_nodes = allow;
        self
    }

    /// Set whether snapshots are checked for dangling references.
    pub fn with_check_consistency(mut self, check: bool) -> Self {
        self.check_consistency = check;
        self
    }

    /// Set the per-stream response buffer. Zero is raised to one.
    pub fn with_response_buffer(mut self, capacity: usize) -> Self {
        self.response_buffer = capacity.max(1);
        self
    }

    /// The address the server listens on.
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_concurrent_streams, 1_000_000);
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert!(config.allow_unidentified_nodes);
        assert!(!config.check_consistency);
        assert_eq!(config.bind_address(), "0.0.0.0:18000".parse().unwrap());
    }

    #[test]
    fn test_response_buffer_never_zero() {
        let config = ServerConfig::new(0).with_response_buffer(0);
        assert_eq!(config.response_buffer, 1);
    }
}
