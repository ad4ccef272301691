//! Control-plane mTLS material (spec §4.9): TLS 1.3 only, client
//! certificates required and verified against an offline-issued CA.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use certdx_common::error::{Error, Result};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

pub fn load_server_config(ca_path: &str, cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>> {
    let ca_certs = read_certs(ca_path)?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert).map_err(|e| Error::ConfigInvalid(format!("invalid CA certificate {ca_path}: {e}")))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::ConfigInvalid(format!("building client verifier failed: {e}")))?;

    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::ConfigInvalid(format!("invalid server certificate/key: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}

fn read_certs(path: &str) -> Result<Vec<rustls_pki_types::CertificateDer<'static>>> {
    if !Path::new(path).exists() {
        return Err(Error::ConfigInvalid(format!("mTLS certificate file not found: {path}")));
    }
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::ConfigInvalid(format!("invalid PEM in {path}: {e}")))
}

fn read_key(path: &str) -> Result<rustls_pki_types::PrivateKeyDer<'static>> {
    if !Path::new(path).exists() {
        return Err(Error::ConfigInvalid(format!("mTLS key file not found: {path}")));
    }
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::ConfigInvalid(format!("invalid key PEM in {path}: {e}")))?
        .ok_or_else(|| Error::ConfigInvalid(format!("no private key found in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ca_file_is_rejected_before_touching_rustls() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_server_config(dir.path().join("ca.pem").to_str().unwrap(), "cert.pem", "key.pem");
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn missing_cert_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&ca_path, "not a real cert, just needs to exist for this check").unwrap();

        let result = load_server_config(ca_path.to_str().unwrap(), "missing-cert.pem", "missing-key.pem");
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }
}
