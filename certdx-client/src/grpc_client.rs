//! gRPC stream protocol, client side (spec §4.8.3): one bidirectional
//! stream carrying every watched cert as a resource subscription.

use std::collections::HashMap;
use std::sync::Arc;

use certdx_common::error::Error;
use certdx_config::client::ClientGrpcServer;
use certdx_sds::pb::secret_discovery_service_client::SecretDiscoveryServiceClient;
use certdx_sds::pb::DiscoveryRequest;
use certdx_sds::wire::{ack_request, initial_request};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::{debug, warn};

use crate::watcher::{CertData, WatchingCert};

async fn build_channel(server: &ClientGrpcServer) -> Result<Channel, Error> {
    let ca = tokio::fs::read(&server.mtls.ca).await.map_err(Error::Io)?;
    let cert = tokio::fs::read(&server.mtls.certificate).await.map_err(Error::Io)?;
    let key = tokio::fs::read(&server.mtls.key).await.map_err(Error::Io)?;

    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key));

    Channel::from_shared(server.server.clone())
        .map_err(|e| Error::ConfigInvalid(format!("invalid grpc server address {}: {e}", server.server)))?
        .tls_config(tls)
        .map_err(|e| Error::ConfigInvalid(format!("invalid grpc mtls config for {}: {e}", server.server)))?
        .keep_alive_while_idle(true)
        .http2_keep_alive_interval(std::time::Duration::from_secs(30))
        .keep_alive_timeout(std::time::Duration::from_secs(25))
        .connect()
        .await
        .map_err(|e| Error::StreamIo(format!("connecting to {} failed: {e}", server.server)))
}

/// Opens one SDS stream against `server`, subscribes to every cert in
/// `certs`, and runs until the stream ends or `stop` fires. Every received
/// resource is delivered to its matching sender in `senders` and ACKed;
/// `received` is notified on every successful message so a fallback-watcher
/// can detect a recovered main connection.
pub async fn run_stream(
    server: &ClientGrpcServer,
    certs: &[WatchingCert],
    senders: &HashMap<String, mpsc::Sender<CertData>>,
    received: Arc<Notify>,
    stop: &CancellationToken,
) -> Result<(), Error> {
    let channel = build_channel(server).await?;
    let mut client = SecretDiscoveryServiceClient::new(channel);

    let resource_names: Vec<String> = certs.iter().map(|c| c.name.clone()).collect();
    let domains_by_name: HashMap<String, Vec<String>> = certs.iter().map(|c| (c.name.clone(), c.domains.clone())).collect();

    let (req_tx, req_rx) = mpsc::channel::<DiscoveryRequest>(16);
    req_tx
        .send(initial_request(resource_names, &domains_by_name))
        .await
        .map_err(|_| Error::StreamIo("initial request channel closed".into()))?;

    let outbound = ReceiverStream::new(req_rx);
    let response = client
        .stream_secrets(outbound)
        .await
        .map_err(|e| Error::StreamIo(format!("stream_secrets call failed: {e}")))?;
    let mut inbound = response.into_inner();

    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => return Err(Error::Killed),
            message = inbound.message() => message,
        };

        match message {
            Ok(Some(resp)) => {
                received.notify_one();
                for secret in &resp.resources {
                    let Some(tls_cert) = &secret.tls_certificate else { continue };
                    let fullchain = tls_cert.certificate_chain.as_ref().map(|d| d.inline_bytes.clone()).unwrap_or_default();
                    let key = tls_cert.private_key.as_ref().map(|d| d.inline_bytes.clone()).unwrap_or_default();
                    let domains = domains_by_name.get(&secret.name).cloned().unwrap_or_default();

                    if let Some(tx) = senders.get(&secret.name) {
                        debug!(resource = %secret.name, "delivering secret from gRPC stream");
                        let _ = tx.send(CertData { domains, fullchain, key }).await;
                    } else {
                        warn!(resource = %secret.name, "received secret for unknown resource, ignoring");
                    }

                    let ack = ack_request(&secret.name, &resp.version_info, None);
                    if req_tx.send(ack).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => return Err(Error::StreamIo(format!("SDS stream recv error: {e}"))),
        }
    }
}
