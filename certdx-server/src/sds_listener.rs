//! Binds the SDS gRPC listener behind control-plane mTLS (spec §4.7, §4.9).

use std::net::SocketAddr;
use std::time::Duration;

use certdx_cache::CertCache;
use certdx_common::error::{Error, Result};
use certdx_sds::pb::secret_discovery_service_server::SecretDiscoveryServiceServer;
use certdx_sds::SdsService;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::info;

pub async fn run_sds_listener(
    addr: SocketAddr,
    cache: CertCache,
    allowed_domains: Vec<String>,
    ca_pem: Vec<u8>,
    server_cert_pem: Vec<u8>,
    server_key_pem: Vec<u8>,
) -> Result<()> {
    let identity = Identity::from_pem(server_cert_pem, server_key_pem);
    let client_ca = tonic::transport::Certificate::from_pem(ca_pem);
    let tls = ServerTlsConfig::new().identity(identity).client_ca_root(client_ca);

    let service = SdsService::new(cache, allowed_domains);

    info!(%addr, "SDS gRPC listener starting");
    Server::builder()
        .tls_config(tls)
        .map_err(|e| Error::ConfigInvalid(format!("invalid SDS mTLS config: {e}")))?
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(25)))
        // tonic has no grpc-go-style keepalive enforcement policy to reject
        // pings faster than a configured minimum; the 30s interval above is
        // the only keepalive knob this stack exposes server-side.
        .add_service(SecretDiscoveryServiceServer::new(service))
        .serve(addr)
        .await
        .map_err(|e| Error::StreamIo(format!("SDS server exited: {e}")))
}
