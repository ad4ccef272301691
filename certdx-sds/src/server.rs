//! Server-side SDS engine: one bidirectional stream per connected client,
//! multiplexing a per-resource handler task over it (spec §4.7).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use certdx_cache::CertCache;
use certdx_common::domain::domains_allowed;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::pb::secret_discovery_service_server::SecretDiscoveryService;
use crate::pb::{DiscoveryRequest, DiscoveryResponse};
use crate::wire::{parse_domains_metadata, response_for_cert};

pub struct SdsService {
    cache: CertCache,
    allowed_domains: Vec<String>,
}

impl SdsService {
    pub fn new(cache: CertCache, allowed_domains: Vec<String>) -> Self {
        Self { cache, allowed_domains }
    }
}

type ResponseStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

#[tonic::async_trait]
impl SecretDiscoveryService for SdsService {
    type StreamSecretsStream = ResponseStream;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        let mut inbound = request.into_inner();
        let (resp_tx, resp_rx) = mpsc::channel::<Result<DiscoveryResponse, Status>>(16);
        let cache = self.cache.clone();
        let allowed_domains = self.allowed_domains.clone();

        tokio::spawn(async move {
            // name -> channel the per-resource handler reads ACK/NACK requests from.
            let dispatch: Arc<Mutex<HashMap<String, mpsc::Sender<DiscoveryRequest>>>> = Arc::new(Mutex::new(HashMap::new()));
            let mut domains_by_name: HashMap<String, Vec<String>> = HashMap::new();
            let mut first = true;
            let mut handlers = Vec::new();

            while let Some(req) = match inbound.message().await {
                Ok(req) => req,
                Err(e) => {
                    warn!(error = %e, "SDS stream recv error");
                    None
                }
            } {
                if first {
                    first = false;
                    if let Some(node) = &req.node {
                        domains_by_name = parse_domains_metadata(node);
                    }
                }

                let mut newly_subscribed = std::collections::HashSet::new();
                let mut guard = dispatch.lock().await;
                for name in &req.resource_names {
                    if guard.contains_key(name) {
                        continue;
                    }
                    let Some(domains) = domains_by_name.get(name).cloned() else {
                        warn!(resource = %name, "subscription missing domains metadata, rejecting");
                        let _ = resp_tx.send(Err(Status::invalid_argument(format!("missing domains metadata for {name}")))).await;
                        continue;
                    };
                    if !domains_allowed(&domains, &allowed_domains) {
                        warn!(resource = %name, ?domains, "subscription rejected, domains not allowed");
                        let _ = resp_tx.send(Err(Status::permission_denied("domains not allowed"))).await;
                        continue;
                    }

                    let (ack_tx, ack_rx) = mpsc::channel::<DiscoveryRequest>(4);
                    guard.insert(name.clone(), ack_tx);
                    newly_subscribed.insert(name.clone());

                    let entry = cache.get_or_create(&domains).await;
                    entry.subscribe(&cache).await;

                    let handler = tokio::spawn(run_resource_handler(
                        name.clone(),
                        entry.clone(),
                        cache.clone(),
                        ack_rx,
                        resp_tx.clone(),
                    ));
                    handlers.push((entry, handler));
                }
                drop(guard);

                // Requests after the first, for an already-subscribed name, are ACK/NACK.
                // Names subscribed for the first time in this very request are excluded:
                // their handler hasn't offered anything yet, so this request (the initial
                // subscription, not an ack) must not be mistaken for one.
                if !req.resource_names.is_empty() {
                    let guard = dispatch.lock().await;
                    for name in &req.resource_names {
                        if newly_subscribed.contains(name) {
                            continue;
                        }
                        if let Some(tx) = guard.get(name) {
                            let _ = tx.send(req.clone()).await;
                        }
                    }
                }
            }

            info!("SDS stream ended, releasing {} subscription(s)", handlers.len());
            for (entry, handler) in handlers {
                handler.abort();
                entry.release().await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(resp_rx))))
    }
}

/// `WAIT_VALID -> OFFER -> AWAIT_ACK -> AWAIT_UPDATE -> OFFER` loop for one
/// subscribed resource (spec §4.7).
async fn run_resource_handler(
    name: String,
    entry: Arc<certdx_cache::CacheEntry>,
    cache: CertCache,
    mut acks: mpsc::Receiver<DiscoveryRequest>,
    responses: mpsc::Sender<Result<DiscoveryResponse, Status>>,
) {
    let mut updated = entry.updated();
    // A freshly cloned receiver is marked changed relative to the sender's
    // initial value; mark the current version seen so AWAIT_UPDATE only
    // resolves on a publish that happens after this handler started.
    updated.borrow_and_update();

    loop {
        // WAIT_VALID
        let cert = loop {
            let cert = entry.cert().await;
            if cert.is_valid() {
                break cert;
            }
            if let Err(e) = cache.renew_inline(&entry).await {
                warn!(resource = %name, error = %e, "on-demand renewal for SDS subscriber failed");
            }
            if updated.changed().await.is_err() {
                return;
            }
        };

        // OFFER
        let response = response_for_cert(&name, &cert);
        let sent_version = response.version_info.clone();
        if responses.send(Ok(response)).await.is_err() {
            return;
        }

        // AWAIT_ACK / NACK
        match acks.recv().await {
            Some(req) if req.version_info == sent_version => {
                tracing::debug!(resource = %name, version = %sent_version, "subscriber ACKed");
            }
            Some(req) => {
                warn!(resource = %name, expected = %sent_version, got = %req.version_info, "subscriber NACKed");
            }
            None => return,
        }

        // AWAIT_UPDATE
        if updated.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use certdx_acme::AcmeProvider;
    use certdx_cache::entry::RenewalPolicy;
    use certdx_common::error::Result as CertdxResult;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    struct MockAcme {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AcmeProvider for MockAcme {
        async fn obtain(&self, _domains: &[String], _not_after: Option<DateTime<Utc>>) -> CertdxResult<(Vec<u8>, Vec<u8>)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((vec![9, 9, 9], vec![8, 8, 8]))
        }
    }

    fn test_policy() -> RenewalPolicy {
        RenewalPolicy {
            cert_life_time: StdDuration::from_secs(3600),
            renew_time_left: StdDuration::from_secs(600),
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn resource_handler_offers_cert_then_waits_for_ack() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = certdx_cache::CatalogHandle::spawn(dir.path().join("cache.json"), Default::default());
        let acme = Arc::new(MockAcme { calls: AtomicU32::new(0) });
        let cache = CertCache::new(acme, catalog, test_policy());

        let entry = cache.get_or_create(&["svc.example.com".to_string()]).await;
        let cert = cache.renew_inline(&entry).await.unwrap();
        assert!(cert.is_valid());

        let (ack_tx, ack_rx) = mpsc::channel::<DiscoveryRequest>(4);
        let (resp_tx, mut resp_rx) = mpsc::channel(4);

        let handler = tokio::spawn(run_resource_handler("svc".to_string(), entry.clone(), cache.clone(), ack_rx, resp_tx));

        let offered = resp_rx.recv().await.unwrap().unwrap();
        assert_eq!(offered.resources[0].name, "svc");
        let version = offered.version_info.clone();

        ack_tx.send(crate::wire::ack_request("svc", &version, None)).await.unwrap();

        // handler is now parked in AWAIT_UPDATE; dropping the ack sender and
        // aborting confirms it didn't panic or loop tightly on the ACK.
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        handler.abort();
    }

    #[tokio::test]
    async fn resource_handler_renews_inline_when_cert_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = certdx_cache::CatalogHandle::spawn(dir.path().join("cache.json"), Default::default());
        let acme = Arc::new(MockAcme { calls: AtomicU32::new(0) });
        let cache = CertCache::new(acme, catalog, test_policy());

        // An entry fresh from get_or_create holds a placeholder, already-expired
        // cert; WAIT_VALID must trigger an inline renewal before offering.
        let entry = cache.get_or_create(&["fresh.example.com".to_string()]).await;
        let (_ack_tx, ack_rx) = mpsc::channel::<DiscoveryRequest>(4);
        let (resp_tx, mut resp_rx) = mpsc::channel(4);

        let handler = tokio::spawn(run_resource_handler("fresh".to_string(), entry.clone(), cache.clone(), ack_rx, resp_tx));

        let offered = resp_rx.recv().await.unwrap().unwrap();
        assert_eq!(offered.resources[0].name, "fresh");
        assert!(!offered.resources[0].tls_certificate.as_ref().unwrap().certificate_chain.as_ref().unwrap().inline_bytes.is_empty());

        handler.abort();
    }
}
