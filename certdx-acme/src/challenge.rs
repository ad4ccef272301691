//! Pluggable HTTP-01/DNS-01 challenge solving. Only the trait boundary and
//! an in-memory HTTP-01 solver are implemented here; DNS-01 providers
//! (Cloudflare, Tencent Cloud) are an out-of-scope collaborator (spec §1),
//! so they are named in configuration but not implemented.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use certdx_common::error::Result;
use tokio::sync::RwLock;

#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Makes `key_authorization` available at the well-known path for `token`.
    async fn deploy(&self, domain: &str, token: &str, key_authorization: &str) -> Result<()>;

    /// Removes a previously deployed token.
    async fn cleanup(&self, domain: &str, token: &str) -> Result<()>;
}

/// In-memory HTTP-01 solver; the HTTP pull API's
/// `/.well-known/acme-challenge/<token>` route reads from this map.
#[derive(Default)]
pub struct MemoryHttp01Solver {
    tokens: RwLock<HashMap<String, String>>,
}

impl MemoryHttp01Solver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }
}

#[async_trait]
impl ChallengeSolver for MemoryHttp01Solver {
    async fn deploy(&self, domain: &str, token: &str, key_authorization: &str) -> Result<()> {
        tracing::debug!(%domain, %token, "deploying HTTP-01 challenge");
        self.tokens.write().await.insert(token.to_string(), key_authorization.to_string());
        Ok(())
    }

    async fn cleanup(&self, domain: &str, token: &str) -> Result<()> {
        tracing::debug!(%domain, %token, "cleaning up HTTP-01 challenge");
        self.tokens.write().await.remove(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deploy_then_cleanup_round_trips() {
        let solver = MemoryHttp01Solver::new();
        solver.deploy("a.example.com", "tok", "keyauth").await.unwrap();
        assert_eq!(solver.get("tok").await.as_deref(), Some("keyauth"));
        solver.cleanup("a.example.com", "tok").await.unwrap();
        assert_eq!(solver.get("tok").await, None);
    }
}
