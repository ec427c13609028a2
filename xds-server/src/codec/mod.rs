//! Conversion between wire messages and the crate-owned message types.
//!
//! The discovery session logic only sees [`DiscoveryRequest`] and
//! [`DiscoveryResponse`] from [`crate::message`]. Each protobuf
//! implementation provides `From` conversions to and from its generated
//! types so that transports can hand messages across unchanged.
//!
//! [`DiscoveryRequest`]: crate::message::DiscoveryRequest
//! [`DiscoveryResponse`]: crate::message::DiscoveryResponse

#[cfg(feature = "codegen-prost")]
pub mod prost;
