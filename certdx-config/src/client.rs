//! Client-side configuration.

use certdx_common::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub common: ClientCommonConfig,
    #[serde(default)]
    pub http: Option<ClientHttpConfig>,
    #[serde(default)]
    pub grpc: Option<ClientGrpcConfig>,
    pub certs: Vec<WatchingCertConfig>,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.certs.is_empty() {
            return Err(Error::ConfigInvalid("at least one entry required under [[certs]]".into()));
        }
        match self.common.mode.as_str() {
            "http" => {
                if self.http.is_none() {
                    return Err(Error::ConfigInvalid("mode = \"http\" requires an [http] section".into()));
                }
            }
            "grpc" => {
                let grpc = self
                    .grpc
                    .as_ref()
                    .ok_or_else(|| Error::ConfigInvalid("mode = \"grpc\" requires a [grpc] section".into()))?;
                grpc.main.mtls.validate()?;
                if let Some(standby) = &grpc.standby {
                    standby.mtls.validate()?;
                }
            }
            other => return Err(Error::ConfigInvalid(format!("unknown client mode: {other}"))),
        }
        for cert in &self.certs {
            if cert.domains.is_empty() {
                return Err(Error::ConfigInvalid(format!("certs[{}] has no domains", cert.name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientCommonConfig {
    /// `"http"` or `"grpc"`.
    pub mode: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Sleep between reconnection attempts after the retry budget is
    /// exhausted, e.g. `"15s"`.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: String,
}

fn default_retry_count() -> u32 {
    5
}
fn default_reconnect_interval() -> String {
    "15s".to_string()
}

impl ClientCommonConfig {
    pub fn reconnect_interval_duration(&self) -> std::time::Duration {
        certdx_config_duration(&self.reconnect_interval)
    }
}

fn certdx_config_duration(s: &str) -> std::time::Duration {
    crate::server::parse_duration(s).unwrap_or(std::time::Duration::from_secs(15))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientHttpConfig {
    pub main: ClientHttpServer,
    #[serde(default)]
    pub standby: Option<ClientHttpServer>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientHttpServer {
    pub url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientGrpcConfig {
    pub main: ClientGrpcServer,
    #[serde(default)]
    pub standby: Option<ClientGrpcServer>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientGrpcServer {
    pub server: String,
    pub mtls: ClientMtlsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientMtlsConfig {
    pub ca: String,
    pub certificate: String,
    pub key: String,
}

impl ClientMtlsConfig {
    pub fn validate(&self) -> Result<()> {
        for (label, path) in [("ca", &self.ca), ("certificate", &self.certificate), ("key", &self.key)] {
            if !std::path::Path::new(path).exists() {
                return Err(Error::ConfigInvalid(format!("grpc mtls.{label} file not found: {path}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchingCertConfig {
    /// Logical resource name, used as the SDS resource name / HTTP-mode log key.
    pub name: String,
    pub domains: Vec<String>,
    pub save_path: String,
    #[serde(default)]
    pub reload_command: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_certs() {
        let cfg = ClientConfig {
            common: ClientCommonConfig {
                mode: "http".into(),
                retry_count: 5,
                reconnect_interval: "15s".into(),
            },
            http: Some(ClientHttpConfig {
                main: ClientHttpServer { url: "https://example.com/".into(), token: String::new() },
                standby: None,
            }),
            grpc: None,
            certs: vec![],
        };
        assert!(cfg.validate().is_err());
    }
}
