//! Update handlers: what happens when a watched certificate changes.
//!
//! The default handler writes `fullchain.pem`/`privkey.pem` under the
//! configured save path and then runs the configured reload command. The
//! reload command is skipped on the very first write after process start,
//! since nothing has been loaded yet for it to reload.

use std::path::Path;

use async_trait::async_trait;
use certdx_common::error::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::watcher::{CertData, WatchingCert};

#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn apply(&self, cert: &WatchingCert, data: &CertData, first_write: bool) -> Result<()>;
}

/// Writes `fullchain.pem` and `privkey.pem` into the cert's save path and
/// runs its reload command, if any. File permissions are left at the
/// process umask default; implementers who need tighter permissions can
/// chmod the save path themselves.
pub struct FileUpdateHandler;

impl FileUpdateHandler {
    pub fn new() -> Self {
        Self
    }

    async fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.flush().await
    }
}

impl Default for FileUpdateHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateHandler for FileUpdateHandler {
    async fn apply(&self, cert: &WatchingCert, data: &CertData, first_write: bool) -> Result<()> {
        let dir = Path::new(&cert.save_path);
        tokio::fs::create_dir_all(dir).await.map_err(Error::Io)?;

        let fullchain_path = dir.join("fullchain.pem");
        let key_path = dir.join("privkey.pem");

        Self::write_file(&fullchain_path, &data.fullchain).await.map_err(Error::Io)?;
        Self::write_file(&key_path, &data.key).await.map_err(Error::Io)?;

        info!(name = %cert.name, path = %cert.save_path, "wrote certificate material");

        if first_write {
            info!(name = %cert.name, "skipping reload command on first write");
            return Ok(());
        }

        let Some(command) = &cert.reload_command else {
            return Ok(());
        };

        run_reload_command(&cert.name, command).await;
        Ok(())
    }
}

async fn run_reload_command(name: &str, command: &str) {
    let argv = match shell_words::split(command) {
        Ok(argv) if !argv.is_empty() => argv,
        Ok(_) => {
            warn!(name, "reload command is empty, skipping");
            return;
        }
        Err(e) => {
            error!(name, command, error = %e, "failed to parse reload command");
            return;
        }
    };

    let status = Command::new(&argv[0]).args(&argv[1..]).status().await;
    match status {
        Ok(status) if status.success() => {
            info!(name, command, "reload command succeeded");
        }
        Ok(status) => {
            warn!(name, command, code = ?status.code(), "reload command exited non-zero");
        }
        Err(e) => {
            error!(name, command, error = %e, "failed to spawn reload command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cert(save_path: &str, reload_command: Option<&str>) -> WatchingCert {
        WatchingCert {
            name: "web".to_string(),
            domains: vec!["a.example.com".to_string()],
            save_path: save_path.to_string(),
            reload_command: reload_command.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn apply_writes_fullchain_and_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert = test_cert(dir.path().to_str().unwrap(), None);
        let data = CertData { domains: cert.domains.clone(), fullchain: b"chain-bytes".to_vec(), key: b"key-bytes".to_vec() };

        FileUpdateHandler::new().apply(&cert, &data, true).await.unwrap();

        assert_eq!(tokio::fs::read(dir.path().join("fullchain.pem")).await.unwrap(), b"chain-bytes");
        assert_eq!(tokio::fs::read(dir.path().join("privkey.pem")).await.unwrap(), b"key-bytes");
    }

    #[tokio::test]
    async fn first_write_skips_reload_command_even_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");
        let cert = test_cert(dir.path().to_str().unwrap(), Some(format!("touch {}", marker.display()).as_str()));
        let data = CertData { domains: cert.domains.clone(), fullchain: vec![1], key: vec![2] };

        FileUpdateHandler::new().apply(&cert, &data, true).await.unwrap();

        assert!(!marker.exists(), "reload command must not run on the first write since process start");
    }

    #[tokio::test]
    async fn subsequent_write_runs_reload_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");
        let cert = test_cert(dir.path().to_str().unwrap(), Some(format!("touch {}", marker.display()).as_str()));
        let data = CertData { domains: cert.domains.clone(), fullchain: vec![1], key: vec![2] };

        FileUpdateHandler::new().apply(&cert, &data, false).await.unwrap();

        assert!(marker.exists(), "reload command must run once a first write has already happened");
    }
}
