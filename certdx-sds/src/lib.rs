//! Envoy-style SDS bidirectional streaming engine (spec §4.7), shared
//! between the server (which drives the per-resource handler state
//! machine) and the client (which speaks the same wire protocol).

pub mod pb {
    tonic::include_proto!("envoy.service.secret.v3");
}

pub mod server;
pub mod wire;

pub const SDS_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

pub use server::SdsService;
