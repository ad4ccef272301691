//! The `AcmeProvider` trait and its `instant-acme`-backed implementation.

use std::sync::Arc;

use async_trait::async_trait;
use certdx_common::error::{Error, Result};
use certdx_common::retry::retry;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType as AcmeChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use tracing::{debug, info, warn};

use crate::account::AccountKey;
use crate::challenge::ChallengeSolver;

/// Well-known ACME directory aliases, matching the provider names accepted
/// in `[acme] provider = "..."` configuration.
pub mod directory {
    pub const LETSENCRYPT: &str = "https://acme-v02.api.letsencrypt.org/directory";
    pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
    pub const GOOGLE: &str = "https://dv.acme-v02.api.pki.goog/directory";
    pub const GOOGLE_STAGING: &str = "https://dv.acme-v02.test-api.pki.goog/directory";

    /// Resolves a configured provider alias (or literal URL) to a directory
    /// URL, plus whether that CA honors the `NotAfter` order hint. Only
    /// Google's public CA is known to honor it.
    pub fn resolve(provider: &str) -> (&str, bool) {
        match provider {
            "letsencrypt" => (LETSENCRYPT, false),
            "letsencrypt-test" => (LETSENCRYPT_STAGING, false),
            "google" => (GOOGLE, true),
            "google-test" => (GOOGLE_STAGING, true),
            url => (url, false),
        }
    }
}

/// Thin contract the renewal loop depends on (spec §4.5): obtain a fresh
/// chain + key for a domain set, optionally hinting a desired expiry.
#[async_trait]
pub trait AcmeProvider: Send + Sync {
    async fn obtain(&self, domains: &[String], not_after: Option<DateTime<Utc>>) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Wraps `obtain` with the universal retry primitive (spec §4.5).
    async fn retry_obtain(
        &self,
        domains: &[String],
        not_after: Option<DateTime<Utc>>,
        retry_count: u32,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        retry(retry_count, || self.obtain(domains, not_after)).await
    }
}

pub struct InstantAcmeProvider {
    account: Account,
    honors_not_after: bool,
    challenge_solver: Arc<dyn ChallengeSolver>,
}

impl InstantAcmeProvider {
    /// Registers (or loads, if `account_key` already holds material) an
    /// ACME account against `provider` and returns a ready-to-use adapter.
    pub async fn new(
        provider: &str,
        email: &str,
        account_key: AccountKey,
        challenge_solver: Arc<dyn ChallengeSolver>,
    ) -> Result<Self> {
        let (directory_url, honors_not_after) = directory::resolve(provider);
        let contact = format!("mailto:{email}");
        let had_credentials = account_key.has_credentials();

        let account = if had_credentials {
            let credentials = account_key
                .into_credentials()
                .expect("has_credentials() just returned true");
            Account::builder()
                .map_err(|e| Error::AcmeTransient(format!("account builder init failed: {e}")))?
                .from_credentials(credentials)
                .await
                .map_err(|e| Error::AcmeTransient(format!("account restore failed: {e}")))?
        } else {
            let new_account = NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            };
            let (account, credentials) = Account::builder()
                .map_err(|e| Error::AcmeTransient(format!("account builder init failed: {e}")))?
                .create(&new_account, directory_url.to_string(), None)
                .await
                .map_err(|e| Error::AcmeTransient(format!("account registration failed: {e}")))?;
            account_key.persist(&credentials)?;
            account
        };

        Ok(Self { account, honors_not_after, challenge_solver })
    }
}

#[async_trait]
impl AcmeProvider for InstantAcmeProvider {
    async fn obtain(&self, domains: &[String], not_after: Option<DateTime<Utc>>) -> Result<(Vec<u8>, Vec<u8>)> {
        info!(?domains, "starting ACME order");

        let identifiers: Vec<Identifier> = domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let not_after = if self.honors_not_after { not_after.map(to_offset_date_time) } else { None };

        let mut order = self
            .account
            .new_order(&NewOrder { identifiers: &identifiers, not_before: None, not_after })
            .await
            .map_err(|e| Error::AcmeTransient(format!("order creation failed: {e}")))?;

        let mut deployed = Vec::new();
        let mut auths = order.authorizations();
        use futures::StreamExt;
        while let Some(auth_result) = auths.next().await {
            let mut auth = auth_result.map_err(|e| Error::AcmeTransient(format!("fetching authorization: {e}")))?;
            let domain = auth.identifier().to_string();

            if auth.status == AuthorizationStatus::Valid {
                debug!(%domain, "authorization already valid");
                continue;
            }

            let mut challenge = auth
                .challenge(AcmeChallengeType::Http01)
                .ok_or_else(|| Error::AcmeTransient(format!("no HTTP-01 challenge offered for {domain}")))?;

            let token = challenge.token.clone();
            let key_authorization = challenge.key_authorization().as_str().to_string();
            self.challenge_solver.deploy(&domain, &token, &key_authorization).await?;
            deployed.push((domain.clone(), token));

            challenge
                .set_ready()
                .await
                .map_err(|e| Error::AcmeTransient(format!("challenge set_ready failed for {domain}: {e}")))?;
        }
        drop(auths);

        let retry_policy = RetryPolicy::default();
        let state = order
            .poll_ready(&retry_policy)
            .await
            .map_err(|e| Error::AcmeTransient(format!("order polling failed: {e}")))?;

        for (domain, token) in &deployed {
            if let Err(e) = self.challenge_solver.cleanup(domain, token).await {
                warn!(%domain, error = %e, "challenge cleanup failed, ignoring");
            }
        }

        if state != OrderStatus::Ready && state != OrderStatus::Valid {
            return Err(Error::AcmeTransient(format!("order ended in unexpected state: {state:?}")));
        }

        let key_pem = order
            .finalize()
            .await
            .map_err(|e| Error::AcmeTransient(format!("order finalize failed: {e}")))?;
        let cert_pem = order
            .poll_certificate(&retry_policy)
            .await
            .map_err(|e| Error::AcmeTransient(format!("certificate download failed: {e}")))?;

        info!(?domains, "ACME order complete");
        Ok((cert_pem.into_bytes(), key_pem.into_bytes()))
    }
}

fn to_offset_date_time(dt: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp()).unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
}
