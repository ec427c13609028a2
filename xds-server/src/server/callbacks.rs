//! Observation hooks invoked by discovery sessions.

use crate::cache::StreamId;
use crate::message::{DiscoveryRequest, DiscoveryResponse};
use crate::node::NodeKey;

/// Hooks invoked as streams open, exchange messages and close.
///
/// Every method defaults to doing nothing, so implementations only override
/// what they observe. Hooks run inline on the session task and must not
/// block.
pub trait Callbacks: Send + Sync + 'static {
    /// A stream was opened. `type_url` is empty for aggregated streams.
    fn on_stream_open(&self, stream: StreamId, type_url: &str) {
        let _ = (stream, type_url);
    }

    /// A stream ended. `node` is `None` if the proxy never identified itself.
    fn on_stream_closed(&self, stream: StreamId, node: Option<&NodeKey>) {
        let _ = (stream, node);
    }

    /// A request was received on a stream, before it is processed.
    fn on_stream_request(&self, stream: StreamId, request: &DiscoveryRequest) {
        let _ = (stream, request);
    }

    /// A response is about to be sent on a stream.
    fn on_stream_response(&self, stream: StreamId, response: &DiscoveryResponse) {
        let _ = (stream, response);
    }

    /// A unary fetch request was received.
    fn on_fetch_request(&self, request: &DiscoveryRequest) {
        let _ = request;
    }

    /// A unary fetch request is about to be answered.
    fn on_fetch_response(&self, request: &DiscoveryRequest, response: &DiscoveryResponse) {
        let _ = (request, response);
    }
}

/// Callbacks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl Callbacks for NoopCallbacks {}

/// Callbacks that log every event through `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingCallbacks;

impl Callbacks for TracingCallbacks {
    fn on_stream_open(&self, stream: StreamId, type_url: &str) {
        tracing::debug!(stream_id = %stream, type_url, "stream opened");
    }

    fn on_stream_closed(&self, stream: StreamId, node: Option<&NodeKey>) {
        tracing::debug!(stream_id = %stream, node = ?node, "stream closed");
    }

    fn on_stream_request(&self, stream: StreamId, request: &DiscoveryRequest) {
        tracing::debug!(
            stream_id = %stream,
            type_url = %request.type_url,
            version = %request.version_info,
            nonce = %request.response_nonce,
            resources = request.resource_names.len(),
            nack = request.is_nack(),
            "request received"
        );
    }

    fn on_stream_response(&self, stream: StreamId, response: &DiscoveryResponse) {
        tracing::debug!(
            stream_id = %stream,
            type_url = %response.type_url,
            version = %response.version_info,
            nonce = %response.nonce,
            resources = response.resources.len(),
            "response sent"
        );
    }

    fn on_fetch_request(&self, request: &DiscoveryRequest) {
        tracing::debug!(
            type_url = %request.type_url,
            version = %request.version_info,
            "fetch request received"
        );
    }

    fn on_fetch_response(&self, request: &DiscoveryRequest, response: &DiscoveryResponse) {
        tracing::debug!(
            type_url = %request.type_url,
            version = %response.version_info,
            resources = response.resources.len(),
            "fetch response sent"
        );
    }
}
