//! Shared building blocks for certdx: the error type, the certificate data
//! model, the retry primitive and domain-set fingerprinting used by both
//! the server and the client daemon.

pub mod cert;
pub mod domain;
pub mod error;
pub mod retry;

pub use cert::Cert;
pub use error::{Error, Result};

/// certdx version, surfaced by `--version` on the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
