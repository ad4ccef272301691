//! certdx error taxonomy, grounded on the error-kind table in the design
//! (fatal config errors vs. locally-reported request errors vs. logged-only
//! background failures).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration, raised during startup validation. Fatal.
    #[error("configuration error: {0}")]
    ConfigInvalid(String),

    /// ACME `obtain` failed transiently; wrapped by the retry primitive.
    #[error("ACME request failed: {0}")]
    AcmeTransient(String),

    /// An `obtain` attempt failed in under the retry primitive's minimum dwell time.
    #[error("retry budget exhausted ({attempts} attempts, last error: {last})")]
    RetryExhausted { attempts: u32, last: String },

    /// A requested domain set was rejected by the allow-list.
    #[error("domains not allowed")]
    DomainsNotAllowed,

    /// HTTP/SDS authentication failed.
    #[error("authentication failed")]
    AuthFailure,

    /// JSON encode/decode failure.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cache file I/O failure; logged, never propagated to the renewal path.
    #[error("cache file error: {0}")]
    CacheFileWrite(String),

    /// gRPC transport/stream error.
    #[error("stream I/O error: {0}")]
    StreamIo(String),

    /// Stream ended due to an explicit shutdown, distinguished from `StreamIo`
    /// so the client state machine does not treat it as a failure to retry.
    #[error("killed")]
    Killed,

    /// Generic I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for conditions with no dedicated variant.
    #[error("internal error: {0}")]
    Internal(String),
}
