//! TOML configuration for both the certdx server and client daemon.
//!
//! Field shapes follow an `[acme]` section for CA interaction, an
//! `[http]`/`[grpc]` pair for the two server-facing protocols, and `[mtls]`
//! for control-plane material. Loading (`load_*_config`) is a thin
//! `toml::from_str` wrapper; the interesting part is `validate`, which
//! turns a missing or contradictory field into one `ConfigInvalid` before
//! the rest of the process starts.

pub mod client;
pub mod server;

pub use client::ClientConfig;
pub use server::ServerConfig;

use certdx_common::error::{Error, Result};
use std::path::Path;

pub fn load_server_config(path: impl AsRef<Path>) -> Result<ServerConfig> {
    let text = std::fs::read_to_string(path)?;
    let cfg: ServerConfig = toml::from_str(&text).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_client_config(path: impl AsRef<Path>) -> Result<ClientConfig> {
    let text = std::fs::read_to_string(path)?;
    let cfg: ClientConfig = toml::from_str(&text).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}
