//! The certificate data model (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An opaque PEM-encoded certificate chain and private key, plus the
/// validity window the issuing CA granted.
///
/// Invariant: `renewed_at < valid_before`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cert {
    #[serde(with = "base64_bytes")]
    pub fullchain: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    pub valid_before: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
}

impl Cert {
    pub fn new(fullchain: Vec<u8>, key: Vec<u8>, valid_before: DateTime<Utc>, renewed_at: DateTime<Utc>) -> Self {
        Self { fullchain, key, valid_before, renewed_at }
    }

    /// A certificate is valid iff `now < valid_before`; exactly-expired counts as invalid.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_before
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn round_trip_preserves_bytes_and_timestamps() {
        let now = Utc::now();
        let cert = Cert::new(vec![1, 2, 3], vec![4, 5, 6], now + Duration::hours(1), now);
        let json = serde_json::to_string(&cert).unwrap();
        let back: Cert = serde_json::from_str(&json).unwrap();
        assert_eq!(back.fullchain, cert.fullchain);
        assert_eq!(back.key, cert.key);
        assert_eq!(back.valid_before.timestamp_millis(), cert.valid_before.timestamp_millis());
        assert_eq!(back.renewed_at.timestamp_millis(), cert.renewed_at.timestamp_millis());
    }

    #[test]
    fn exactly_expired_is_invalid() {
        let now = Utc::now();
        let cert = Cert::new(vec![], vec![], now, now - Duration::hours(1));
        assert!(!cert.is_valid_at(now));
    }
}
