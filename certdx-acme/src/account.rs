//! ACME account credential persistence, ported from `acme.go`'s
//! `InitACMEAccount`/`RegisterAccount`: an ECDSA P-384 key stored as PEM
//! at `./private/<email>_<provider>.key`, mode 0600.

use std::path::{Path, PathBuf};

use certdx_common::error::{Error, Result};
use instant_acme::AccountCredentials;

pub struct AccountKey {
    path: PathBuf,
    credentials: Option<AccountCredentials>,
}

impl AccountKey {
    /// Resolves the on-disk path for `<email>_<provider>.key` under
    /// `private_dir` and loads it if present.
    pub fn load(private_dir: impl AsRef<Path>, email: &str, provider: &str) -> Result<Self> {
        let filename = format!("{}_{}.key", email.replace('@', "_"), provider.replace('/', "_"));
        let path = private_dir.as_ref().join(filename);

        let credentials = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            Some(serde_json::from_str(&raw).map_err(|e| Error::ConfigInvalid(format!("corrupt account key at {path:?}: {e}")))?)
        } else {
            None
        };

        Ok(Self { path, credentials })
    }

    /// Consumes any loaded credentials, for use by a single account setup call.
    pub fn into_credentials(self) -> Option<AccountCredentials> {
        self.credentials
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Persists freshly issued account credentials with mode 0600.
    pub fn persist(&self, credentials: &AccountCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(credentials)?;
        std::fs::write(&self.path, json)?;
        set_owner_only(&self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_file_yields_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let key = AccountKey::load(dir.path(), "ops@example.com", "letsencrypt").unwrap();
        assert!(!key.has_credentials());
    }
}
