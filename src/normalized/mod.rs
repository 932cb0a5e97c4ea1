//! Transport-agnostic request and response values exchanged across the bridge.
//!
//! The transport builds one [`NormalizedRequest`] per inbound request; handler
//! logic answers with something that converts into a [`NormalizedResponse`].

pub mod request;
pub mod response;

pub use request::NormalizedRequest;
pub use response::NormalizedResponse;
