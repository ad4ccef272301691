//! Durable JSON cache file (spec §4.2), ported from the source's
//! `cache.json` single-writer catalog.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use certdx_common::cert::Cert;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub domains: Vec<String>,
    pub cert: Cert,
}

pub type Catalog = HashMap<String, CatalogEntry>;

/// Loads the catalog from `path`. A missing or malformed file is not
/// fatal: the server starts with an empty catalog and the caller logs a
/// warning. Entries whose certificate is already invalid are pruned.
pub fn load(path: impl AsRef<Path>) -> Catalog {
    let path = path.as_ref();
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Catalog::new(),
        Err(e) => {
            tracing::warn!(?path, error = %e, "failed to read cache file, starting empty");
            return Catalog::new();
        }
    };

    let catalog: Catalog = match serde_json::from_str(&raw) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(?path, error = %e, "malformed cache file, starting empty");
            return Catalog::new();
        }
    };

    let now = Utc::now();
    let (valid, dropped): (Catalog, Catalog) = catalog.into_iter().partition(|(_, e)| e.cert.is_valid_at(now));
    if !dropped.is_empty() {
        tracing::info!(count = dropped.len(), "dropped expired entries from cache file on load");
    }
    valid
}

/// Handle to the single writer task that owns the in-memory catalog and
/// serializes it to disk on every update.
#[derive(Clone)]
pub struct CatalogHandle {
    inbox: mpsc::Sender<(String, CatalogEntry)>,
}

impl CatalogHandle {
    /// Spawns the writer task, seeded with `initial` (typically the result
    /// of [`load`]), and returns a handle to enqueue updates.
    pub fn spawn(path: impl Into<PathBuf>, initial: Catalog) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::channel::<(String, CatalogEntry)>(256);

        tokio::spawn(async move {
            let mut catalog = initial;
            while let Some((key, entry)) = rx.recv().await {
                catalog.insert(key, entry);
                if let Err(e) = write_atomic(&path, &catalog) {
                    tracing::warn!(?path, error = %e, "failed to persist cache file, will retry on next update");
                }
            }
        });

        Self { inbox: tx }
    }

    /// Enqueues an update for the writer task. Non-blocking: if the inbox
    /// is full the update is dropped with a warning (spec §5 — the next
    /// renewal re-enqueues).
    pub fn update(&self, key: String, entry: CatalogEntry) {
        if let Err(e) = self.inbox.try_send((key, entry)) {
            tracing::warn!(error = %e, "cache file write queue full, dropping update");
        }
    }
}

fn write_atomic(path: &Path, catalog: &Catalog) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(catalog)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)?;
    set_owner_only(&tmp_path)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = load(dir.path().join("cache.json"));
        assert!(catalog.is_empty());
    }

    #[test]
    fn load_malformed_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"not json").unwrap();
        let catalog = load(&path);
        assert!(catalog.is_empty());
    }

    #[test]
    fn load_prunes_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let now = Utc::now();

        let mut catalog = Catalog::new();
        catalog.insert(
            "expired".to_string(),
            CatalogEntry {
                domains: vec!["a.example.com".into()],
                cert: Cert::new(vec![], vec![], now - Duration::hours(1), now - Duration::hours(200)),
            },
        );
        catalog.insert(
            "valid".to_string(),
            CatalogEntry {
                domains: vec!["b.example.com".into()],
                cert: Cert::new(vec![], vec![], now + Duration::hours(1), now),
            },
        );
        std::fs::write(&path, serde_json::to_vec(&catalog).unwrap()).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("valid"));
    }
}
