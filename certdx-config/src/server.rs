//! Server-side configuration.

use certdx_common::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub acme: AcmeConfig,
    #[serde(default)]
    pub http: HttpServerConfig,
    #[serde(default)]
    pub grpc: GrpcServerConfig,
    #[serde(default)]
    pub mtls: MtlsConfig,
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.acme.validate()?;
        if !self.http.enabled && !self.grpc.enabled {
            return Err(Error::ConfigInvalid(
                "at least one of [http] or [grpc] must be enabled".into(),
            ));
        }
        if self.grpc.enabled {
            self.mtls.validate()?;
        }
        Ok(())
    }
}

fn default_cache_path() -> String {
    "./cache.json".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcmeConfig {
    pub email: String,
    /// One of the well-known ACME directory aliases (e.g. `"letsencrypt"`,
    /// `"google"`, `"letsencrypt-test"`, `"google-test"`) or a literal
    /// directory URL.
    pub provider: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Requested certificate lifetime, e.g. `"168h"`.
    #[serde(default = "default_cert_life_time")]
    pub cert_life_time: String,
    /// Renewal margin before expiry, e.g. `"24h"`.
    #[serde(default = "default_renew_time_left")]
    pub renew_time_left: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub dns_provider: Option<DnsProviderConfig>,
}

impl AcmeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.email.is_empty() {
            return Err(Error::ConfigInvalid("acme.email must not be empty".into()));
        }
        if self.provider.is_empty() {
            return Err(Error::ConfigInvalid("acme.provider must not be empty".into()));
        }
        if self.allowed_domains.is_empty() {
            return Err(Error::ConfigInvalid("acme.allowed_domains must not be empty".into()));
        }
        parse_duration(&self.cert_life_time)?;
        parse_duration(&self.renew_time_left)?;
        Ok(())
    }

    pub fn cert_life_time_duration(&self) -> Duration {
        parse_duration(&self.cert_life_time).unwrap_or(Duration::from_secs(168 * 3600))
    }

    pub fn renew_time_left_duration(&self) -> Duration {
        parse_duration(&self.renew_time_left).unwrap_or(Duration::from_secs(24 * 3600))
    }
}

fn default_retry_count() -> u32 {
    5
}
fn default_cert_life_time() -> String {
    "168h".to_string()
}
fn default_renew_time_left() -> String {
    "24h".to_string()
}

/// `"<n>h"` / `"<n>m"` / `"<n>s"` duration literal, matching the source's
/// `time.ParseDuration`-derived TOML fields.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, unit) = s.split_at(s.len().saturating_sub(1));
    let n: u64 = num
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid duration literal: {s}")))?;
    match unit {
        "h" => Ok(Duration::from_secs(n * 3600)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "s" => Ok(Duration::from_secs(n)),
        _ => Err(Error::ConfigInvalid(format!("invalid duration unit in: {s}"))),
    }
}

/// DNS-01 challenge provider selection; only the trait boundary is
/// implemented by `certdx-acme`, the concrete providers (Cloudflare,
/// Tencent Cloud) are an out-of-scope collaborator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DnsProviderConfig {
    Cloudflare { api_token: String },
    TencentCloud { secret_id: String, secret_key: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HttpServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_listen")]
    pub listen: String,
    #[serde(default = "default_api_path")]
    pub api_path: String,
    /// Serve HTTPS directly from the cache entry for `names[0]` instead of
    /// plain HTTP.
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub names: Vec<String>,
    /// Empty means no auth; non-empty enables bearer-token auth.
    #[serde(default)]
    pub token: String,
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_api_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GrpcServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_grpc_listen")]
    pub listen: String,
}

fn default_grpc_listen() -> String {
    "0.0.0.0:50051".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MtlsConfig {
    #[serde(default = "default_ca_path")]
    pub ca: String,
    #[serde(default = "default_server_cert_path")]
    pub certificate: String,
    #[serde(default = "default_server_key_path")]
    pub key: String,
}

impl MtlsConfig {
    pub fn validate(&self) -> Result<()> {
        for (label, path) in [("mtls.ca", &self.ca), ("mtls.certificate", &self.certificate), ("mtls.key", &self.key)] {
            if !std::path::Path::new(path).exists() {
                return Err(Error::ConfigInvalid(format!("{label} file not found: {path}")));
            }
        }
        Ok(())
    }
}

fn default_ca_path() -> String {
    "./mtls/ca.pem".to_string()
}
fn default_server_cert_path() -> String {
    "./mtls/server.pem".to_string()
}
fn default_server_key_path() -> String {
    "./mtls/server.key".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_allowed_domains() {
        let cfg = ServerConfig {
            acme: AcmeConfig {
                email: "a@example.com".into(),
                provider: "letsencrypt".into(),
                retry_count: 5,
                cert_life_time: "168h".into(),
                renew_time_left: "24h".into(),
                allowed_domains: vec![],
                dns_provider: None,
            },
            http: HttpServerConfig { enabled: true, ..Default::default() },
            grpc: GrpcServerConfig::default(),
            mtls: MtlsConfig::default(),
            cache_path: default_cache_path(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_hour_duration() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(24 * 3600));
    }
}
