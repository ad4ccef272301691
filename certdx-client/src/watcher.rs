//! Per-cert watcher: receives `CertData` values, compares to the last
//! known bytes, and on change invokes the update handlers in order.

use certdx_config::client::WatchingCertConfig;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::update::UpdateHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertData {
    pub domains: Vec<String>,
    pub fullchain: Vec<u8>,
    pub key: Vec<u8>,
}

pub struct WatchingCert {
    pub name: String,
    pub domains: Vec<String>,
    pub save_path: String,
    pub reload_command: Option<String>,
}

impl WatchingCert {
    pub fn from_config(cfg: &WatchingCertConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            domains: cfg.domains.clone(),
            save_path: cfg.save_path.clone(),
            reload_command: cfg.reload_command.clone(),
        }
    }

    /// Best-effort load of previously saved `fullchain.pem`/`privkey.pem`
    /// under `save_path`, so a freshly started watcher doesn't rewrite and
    /// reload on an unchanged certificate (spec §4.8).
    pub async fn load_saved(&self) -> Option<CertData> {
        let dir = std::path::Path::new(&self.save_path);
        let fullchain = tokio::fs::read(dir.join("fullchain.pem")).await.ok()?;
        let key = tokio::fs::read(dir.join("privkey.pem")).await.ok()?;
        Some(CertData { domains: self.domains.clone(), fullchain, key })
    }
}

/// Spawns the watcher coroutine for one configured cert: reads `CertData`
/// off `rx`, skips byte-identical updates, and hands changes to `handler`.
pub fn spawn_watcher(cert: WatchingCert, handler: impl UpdateHandler + 'static, mut rx: mpsc::Receiver<CertData>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: Option<CertData> = cert.load_saved().await;
        if last.is_some() {
            debug!(name = %cert.name, "loaded previously saved certificate from disk");
        }
        let mut first_write = true;

        while let Some(data) = rx.recv().await {
            if last.as_ref() == Some(&data) {
                debug!(name = %cert.name, "certificate unchanged, skipping update");
                continue;
            }

            if let Err(e) = handler.apply(&cert, &data, first_write).await {
                warn!(name = %cert.name, error = %e, "update handler failed");
            } else {
                first_write = false;
            }
            last = Some(data);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::UpdateHandler;
    use certdx_common::error::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_cert(save_path: &str) -> WatchingCert {
        WatchingCert {
            name: "web".to_string(),
            domains: vec!["a.example.com".to_string()],
            save_path: save_path.to_string(),
            reload_command: None,
        }
    }

    #[tokio::test]
    async fn load_saved_is_none_when_no_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cert = test_cert(dir.path().to_str().unwrap());
        assert!(cert.load_saved().await.is_none());
    }

    #[tokio::test]
    async fn load_saved_reads_both_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fullchain.pem"), b"chain").unwrap();
        std::fs::write(dir.path().join("privkey.pem"), b"key").unwrap();

        let cert = test_cert(dir.path().to_str().unwrap());
        let data = cert.load_saved().await.unwrap();
        assert_eq!(data.fullchain, b"chain");
        assert_eq!(data.key, b"key");
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl UpdateHandler for CountingHandler {
        async fn apply(&self, _cert: &WatchingCert, _data: &CertData, _first_write: bool) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn identical_updates_are_not_reapplied() {
        let dir = tempfile::tempdir().unwrap();
        let cert = test_cert(dir.path().to_str().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(4);

        let handle = spawn_watcher(cert, CountingHandler { calls: calls.clone() }, rx);

        let data = CertData { domains: vec!["a.example.com".to_string()], fullchain: vec![1], key: vec![2] };
        tx.send(data.clone()).await.unwrap();
        tx.send(data.clone()).await.unwrap();
        tx.send(data).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_updates_are_each_applied() {
        let dir = tempfile::tempdir().unwrap();
        let cert = test_cert(dir.path().to_str().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(4);

        let handle = spawn_watcher(cert, CountingHandler { calls: calls.clone() }, rx);

        tx.send(CertData { domains: vec!["a.example.com".to_string()], fullchain: vec![1], key: vec![2] }).await.unwrap();
        tx.send(CertData { domains: vec!["a.example.com".to_string()], fullchain: vec![3], key: vec![4] }).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
