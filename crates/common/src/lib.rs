use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub mod config;
pub mod error;
pub mod types;

pub use config::{ClientConfig, ConfigError};
pub use error::{Result, TorError};
pub use types::Timestamp;

/// Length of a relay identity digest (SHA-1 of the RSA identity key)
pub const FINGERPRINT_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid fingerprint length: expected {expected}, got {actual}")]
    InvalidFingerprint { expected: usize, actual: usize },
    #[error("invalid fingerprint hex: {0}")]
    InvalidFingerprintHex(String),
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("malformed directory entry: {0}")]
    MalformedEntry(String),
}

/// Relay identity fingerprint
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, DomainError> {
        if bytes.len() != FINGERPRINT_LEN {
            return Err(DomainError::InvalidFingerprint {
                expected: FINGERPRINT_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; FINGERPRINT_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Upper-case hex, the form used in directory URLs
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parses hex, tolerating the `$` prefix and spaced groups of descriptors
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, DomainError> {
        let cleaned: String = hex_str
            .trim_start_matches('$')
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let decoded = hex::decode(cleaned)
            .map_err(|err| DomainError::InvalidFingerprintHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; FINGERPRINT_LEN]> for Fingerprint {
    fn from(value: [u8; FINGERPRINT_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = DomainError;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        Self::from_slice(value)
    }
}

impl FromStr for Fingerprint {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_rejects_wrong_length() {
        let err = Fingerprint::from_slice(&[0u8; 3]).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidFingerprint {
                expected: FINGERPRINT_LEN,
                actual: 3
            }
        );
    }

    #[test]
    fn fingerprint_parses_hex_roundtrip() {
        let fp = Fingerprint::from_bytes([0xAB; FINGERPRINT_LEN]);
        let parsed: Fingerprint = fp.to_hex().parse().unwrap();
        assert_eq!(parsed, fp);
        assert_eq!(fp.to_string().len(), FINGERPRINT_LEN * 2);
    }

    #[test]
    fn fingerprint_accepts_descriptor_spacing() {
        let spaced = "$9695 DFC3 5FFE B861 329B 9F1A B04C 4639 7020 CE31";
        let fp = Fingerprint::from_hex(spaced).unwrap();
        assert_eq!(fp.to_hex(), "9695DFC35FFEB861329B9F1AB04C46397020CE31");
    }

    #[test]
    fn fingerprint_rejects_bad_hex() {
        let err = Fingerprint::from_hex("zz").unwrap_err();
        assert!(matches!(err, DomainError::InvalidFingerprintHex(_)));
    }

    #[test]
    fn hex_codec_roundtrips_all_lengths() {
        for len in 0..=64usize {
            let bytes: Vec<u8> = (0..len).map(|i| (i * 37 % 256) as u8).collect();
            let encoded = hex::encode(&bytes);
            assert_eq!(encoded.len(), len * 2);
            assert_eq!(hex::decode(&encoded).unwrap(), bytes);
        }
    }
}
