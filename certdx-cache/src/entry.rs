//! Cache entry with reference-counted renewal loop (spec §4.3-4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use certdx_acme::AcmeProvider;
use certdx_common::cert::Cert;
use certdx_common::domain::{key as fingerprint, same_domain_set};
use certdx_common::error::{Error, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{CatalogEntry, CatalogHandle};

/// Tuning knobs for the renewal loop, derived from `[acme]` configuration.
#[derive(Clone)]
pub struct RenewalPolicy {
    pub cert_life_time: StdDuration,
    pub renew_time_left: StdDuration,
    pub retry_count: u32,
}

/// A per-domain-set record: the latest certificate, a reference count of
/// active subscribers, and the version handle subscribers wait on.
pub struct CacheEntry {
    pub domains: Vec<String>,
    cert: AsyncMutex<Cert>,
    subscriber_count: AtomicU64,
    version_tx: watch::Sender<u64>,
    version_rx: watch::Receiver<u64>,
    /// Set while `subscriber_count > 0`; cancelling it stops the renewal loop.
    stop: AsyncMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CacheEntry {
    fn new(domains: Vec<String>, cert: Cert) -> Arc<Self> {
        let (version_tx, version_rx) = watch::channel(0);
        Arc::new(Self {
            domains,
            cert: AsyncMutex::new(cert),
            subscriber_count: AtomicU64::new(0),
            version_tx,
            version_rx,
            stop: AsyncMutex::new(None),
        })
    }

    pub fn fingerprint(&self) -> u64 {
        fingerprint(&self.domains)
    }

    pub fn subscriber_count(&self) -> u64 {
        self.subscriber_count.load(Ordering::Acquire)
    }

    pub async fn cert(&self) -> Cert {
        self.cert.lock().await.clone()
    }

    /// The current version handle; `changed()` on the returned receiver
    /// resolves once the loop has published a newer certificate.
    pub fn updated(&self) -> watch::Receiver<u64> {
        self.version_rx.clone()
    }

    /// Atomic fetch-and-add; spawns the renewal loop on the 0->1 transition.
    pub async fn subscribe(self: &Arc<Self>, cache: &CertCache) {
        let previous = self.subscriber_count.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            let mut guard = self.stop.lock().await;
            if guard.is_none() {
                let token = CancellationToken::new();
                let handle = spawn_renewal_loop(self.clone(), cache.clone_for_loop(), token.clone());
                *guard = Some((token, handle));
            }
        }
    }

    /// Atomic fetch-and-sub; stops the renewal loop on the 1->0 transition.
    pub async fn release(self: &Arc<Self>) {
        let previous = self.subscriber_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            let mut guard = self.stop.lock().await;
            if let Some((token, _handle)) = guard.take() {
                token.cancel();
            }
        }
    }

    async fn publish(&self, cert: Cert) {
        {
            let mut guard = self.cert.lock().await;
            *guard = cert;
        }
        self.version_tx.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Cache of fingerprint -> entry, plus the shared collaborators every
/// entry's renewal loop needs.
pub struct CertCache {
    entries: Arc<AsyncMutex<Vec<Arc<CacheEntry>>>>,
    acme: Arc<dyn AcmeProvider>,
    catalog: CatalogHandle,
    policy: RenewalPolicy,
}

impl Clone for CertCache {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            acme: self.acme.clone(),
            catalog: self.catalog.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl CertCache {
    pub fn new(acme: Arc<dyn AcmeProvider>, catalog: CatalogHandle, policy: RenewalPolicy) -> Self {
        Self { entries: Arc::new(AsyncMutex::new(Vec::new())), acme, catalog, policy }
    }

    fn clone_for_loop(&self) -> Self {
        self.clone()
    }

    /// Looks up by fingerprint, verifying set equality to reject a rare
    /// collision; creates a new entry (with an empty, already-expired
    /// certificate) if absent.
    pub async fn get_or_create(&self, domains: &[String]) -> Arc<CacheEntry> {
        let fp = fingerprint(domains);
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.iter().find(|e| e.fingerprint() == fp && same_domain_set(&e.domains, domains)) {
            return entry.clone();
        }

        let placeholder = Cert::new(Vec::new(), Vec::new(), Utc.timestamp_opt(0, 0).unwrap(), Utc.timestamp_opt(0, 0).unwrap());
        let entry = CacheEntry::new(domains.to_vec(), placeholder);
        entries.push(entry.clone());
        entry
    }

    /// Synchronous, non-retrying renewal used by the HTTP pull API when no
    /// subscriber is present (spec §4.6 step 3).
    pub async fn renew_inline(&self, entry: &Arc<CacheEntry>) -> Result<Cert> {
        self.renew(entry, false).await
    }

    /// Obtains and publishes a fresh certificate if the current one is
    /// within the renewal margin of expiry (or invalid). `retry` selects
    /// between the bounded retry primitive and a single attempt.
    pub async fn renew(&self, entry: &Arc<CacheEntry>, retry: bool) -> Result<Cert> {
        let now = Utc::now();
        let current = entry.cert().await;

        if current.is_valid_at(now) && current.valid_before - now > to_chrono(self.policy.renew_time_left) {
            return Ok(current);
        }

        let new_valid_before = floor_to_hour(now) + to_chrono(self.policy.cert_life_time);
        let not_after = Some(new_valid_before + to_chrono(self.policy.renew_time_left));
        let retry_count = if retry { self.policy.retry_count } else { 0 };

        let (fullchain, key) = self.acme.retry_obtain(&entry.domains, not_after, retry_count).await?;
        let cert = Cert::new(fullchain, key, new_valid_before, now);

        entry.publish(cert.clone()).await;
        self.catalog.update(
            format!("{:x}", entry.fingerprint()),
            CatalogEntry { domains: entry.domains.clone(), cert: cert.clone() },
        );

        Ok(cert)
    }
}

fn spawn_renewal_loop(entry: Arc<CacheEntry>, cache: CertCache, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match cache.renew(&entry, true).await {
                Ok(cert) => {
                    info!(domains = ?entry.domains, valid_before = %cert.valid_before, "renewed certificate");
                }
                Err(e) => {
                    warn!(domains = ?entry.domains, error = %e, "certificate renewal failed, will retry next tick");
                }
            }

            let sleep = cache.policy.renew_time_left / 4;
            tokio::select! {
                _ = stop.cancelled() => {
                    info!(domains = ?entry.domains, "renewal loop stopping, no subscribers remain");
                    break;
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    })
}

fn to_chrono(d: StdDuration) -> Duration {
    Duration::from_std(d).unwrap_or(Duration::zero())
}

fn floor_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    let secs = dt.timestamp() - dt.timestamp().rem_euclid(3600);
    Utc.timestamp_opt(secs, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct MockAcme {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl AcmeProvider for MockAcme {
        async fn obtain(&self, _domains: &[String], _not_after: Option<DateTime<Utc>>) -> Result<(Vec<u8>, Vec<u8>)> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(Error::AcmeTransient("mock failure".into()));
            }
            Ok((vec![1, 2, 3], vec![4, 5, 6]))
        }
    }

    fn test_policy() -> RenewalPolicy {
        RenewalPolicy {
            cert_life_time: StdDuration::from_secs(168 * 3600),
            renew_time_left: StdDuration::from_secs(24 * 3600),
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn get_or_create_returns_same_entry_for_same_domain_set_any_order() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogHandle::spawn(dir.path().join("cache.json"), Default::default());
        let acme = Arc::new(MockAcme { calls: AtomicU32::new(0), fail_first: false });
        let cache = CertCache::new(acme, catalog, test_policy());

        let a = cache.get_or_create(&["a.com".to_string(), "b.com".to_string()]).await;
        let b = cache.get_or_create(&["b.com".to_string(), "a.com".to_string()]).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn renew_inline_populates_cert() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogHandle::spawn(dir.path().join("cache.json"), Default::default());
        let acme = Arc::new(MockAcme { calls: AtomicU32::new(0), fail_first: false });
        let cache = CertCache::new(acme, catalog, test_policy());

        let entry = cache.get_or_create(&["a.example.com".to_string()]).await;
        let cert = cache.renew_inline(&entry).await.unwrap();
        assert_eq!(cert.fullchain, vec![1, 2, 3]);
        assert!(cert.is_valid());
    }

    #[tokio::test]
    async fn subscribe_release_converges_to_zero_loops() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogHandle::spawn(dir.path().join("cache.json"), Default::default());
        let acme = Arc::new(MockAcme { calls: AtomicU32::new(0), fail_first: false });
        let cache = CertCache::new(acme, catalog, test_policy());

        let entry = cache.get_or_create(&["a.example.com".to_string()]).await;
        entry.subscribe(&cache).await;
        entry.subscribe(&cache).await;
        entry.release().await;
        entry.release().await;

        assert!(entry.stop.lock().await.is_none());
    }
}
