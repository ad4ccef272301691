//! The certdx server: HTTP pull API, optional HTTPS self-hosting, the SDS
//! gRPC listener, and the mTLS material both of the latter two depend on.

pub mod http_api;
pub mod mtls;
pub mod sds_listener;

pub use http_api::{run_http_api, run_https_api};
pub use sds_listener::run_sds_listener;
