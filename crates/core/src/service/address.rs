/// .onion service addresses
///
/// A v3 address is the base32 encoding of the service's ed25519 public
/// key, a two-byte checksum and the version byte, so the address itself
/// authenticates the service. 16-character v2 identifiers are still
/// recognised so they can be routed and refused explicitly.
use crate::crypto::hash::sha3_256;
use minitor_common::TorError;
use std::fmt;

pub const ONION_SUFFIX: &str = ".onion";

/// Characters in a v3 identifier
pub const V3_IDENTIFIER_LEN: usize = 56;

/// Characters in a legacy v2 identifier
pub const V2_IDENTIFIER_LEN: usize = 16;

const V3_VERSION: u8 = 3;

/// A parsed onion service address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OnionAddress {
    /// Current addresses, naming the service's ed25519 identity key
    V3 { public_key: [u8; 32] },

    /// Legacy addresses; the network no longer serves their descriptors
    V2 { identifier: String },
}

impl OnionAddress {
    /// Address of the service with this identity key
    pub fn from_public_key(public_key: [u8; 32]) -> Self {
        Self::V3 { public_key }
    }

    /// Parse from hostname (with or without .onion suffix)
    pub fn from_hostname(hostname: &str) -> Result<Self, OnionAddressError> {
        let hostname = hostname.trim().trim_end_matches('.').to_lowercase();
        let identifier = hostname.strip_suffix(ONION_SUFFIX).unwrap_or(&hostname);
        // Subdomains of a service resolve to the service itself
        let identifier = identifier.rsplit('.').next().unwrap_or(identifier);

        match identifier.len() {
            V3_IDENTIFIER_LEN => Self::parse_v3(identifier),
            V2_IDENTIFIER_LEN => {
                data_encoding::BASE32_NOPAD
                    .decode(identifier.to_uppercase().as_bytes())
                    .map_err(|_| OnionAddressError::InvalidEncoding)?;
                Ok(Self::V2 {
                    identifier: identifier.to_string(),
                })
            }
            other => Err(OnionAddressError::InvalidLength(other)),
        }
    }

    fn parse_v3(identifier: &str) -> Result<Self, OnionAddressError> {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(identifier.to_uppercase().as_bytes())
            .map_err(|_| OnionAddressError::InvalidEncoding)?;
        if bytes.len() != 35 {
            return Err(OnionAddressError::InvalidLength(identifier.len()));
        }

        let version = bytes[34];
        if version != V3_VERSION {
            return Err(OnionAddressError::UnsupportedVersion(version));
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&bytes[..32]);
        if checksum(&public_key) != bytes[32..34] {
            return Err(OnionAddressError::BadChecksum);
        }
        Ok(Self::V3 { public_key })
    }

    /// Check if a hostname is a .onion address
    pub fn is_onion_address(hostname: &str) -> bool {
        hostname
            .trim()
            .trim_end_matches('.')
            .to_lowercase()
            .ends_with(ONION_SUFFIX)
    }

    pub fn public_key(&self) -> Option<&[u8; 32]> {
        match self {
            Self::V3 { public_key } => Some(public_key),
            Self::V2 { .. } => None,
        }
    }

    /// Identifier without the suffix
    pub fn identifier(&self) -> String {
        match self {
            Self::V3 { public_key } => {
                let mut bytes = public_key.to_vec();
                bytes.extend_from_slice(&checksum(public_key));
                bytes.push(V3_VERSION);
                data_encoding::BASE32_NOPAD.encode(&bytes).to_lowercase()
            }
            Self::V2 { identifier } => identifier.clone(),
        }
    }

    pub fn to_hostname(&self) -> String {
        format!("{}{}", self.identifier(), ONION_SUFFIX)
    }
}

fn checksum(public_key: &[u8; 32]) -> [u8; 2] {
    let digest = sha3_256(&[b".onion checksum", public_key, &[V3_VERSION]]);
    [digest[0], digest[1]]
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hostname())
    }
}

/// Onion address errors
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum OnionAddressError {
    #[error("Invalid base32 encoding")]
    InvalidEncoding,

    #[error("Invalid identifier length: {0} (expected 16 or 56)")]
    InvalidLength(usize),

    #[error("Address checksum mismatch")]
    BadChecksum,

    #[error("Unsupported onion address version {0}")]
    UnsupportedVersion(u8),
}

impl From<OnionAddressError> for TorError {
    fn from(err: OnionAddressError) -> Self {
        TorError::InvalidUrl(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curve25519_dalek::constants::ED25519_BASEPOINT_COMPRESSED;

    fn basepoint_address() -> OnionAddress {
        OnionAddress::from_public_key(ED25519_BASEPOINT_COMPRESSED.to_bytes())
    }

    #[test]
    fn v3_hostname_parses_back() {
        let address = basepoint_address();
        let hostname = address.to_hostname();
        assert!(hostname.ends_with(".onion"));
        assert_eq!(address.identifier().len(), V3_IDENTIFIER_LEN);

        assert_eq!(OnionAddress::from_hostname(&hostname).unwrap(), address);
        assert_eq!(
            OnionAddress::from_hostname(&hostname.to_uppercase()).unwrap(),
            address
        );
        assert_eq!(
            OnionAddress::from_hostname(&address.identifier()).unwrap(),
            address
        );
    }

    #[test]
    fn subdomain_resolves_to_service() {
        let address = basepoint_address();
        let hostname = format!("www.{}", address.to_hostname());
        assert_eq!(OnionAddress::from_hostname(&hostname).unwrap(), address);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut identifier = basepoint_address().identifier().into_bytes();
        // the checksum sits in characters 52..55
        identifier[53] = if identifier[53] == b'a' { b'b' } else { b'a' };
        let hostname = format!("{}.onion", String::from_utf8(identifier).unwrap());
        assert_eq!(
            OnionAddress::from_hostname(&hostname),
            Err(OnionAddressError::BadChecksum)
        );
    }

    #[test]
    fn legacy_identifier_is_recognised() {
        let address = OnionAddress::from_hostname("abcdefghijklmnop.onion").unwrap();
        assert_eq!(
            address,
            OnionAddress::V2 {
                identifier: "abcdefghijklmnop".to_string()
            }
        );
        assert!(address.public_key().is_none());
    }

    #[test]
    fn other_lengths_are_rejected() {
        assert_eq!(
            OnionAddress::from_hostname("short.onion"),
            Err(OnionAddressError::InvalidLength(5))
        );
    }

    #[test]
    fn is_onion_address() {
        assert!(OnionAddress::is_onion_address("test.onion"));
        assert!(OnionAddress::is_onion_address("TEST.ONION."));
        assert!(!OnionAddress::is_onion_address("example.com"));
        assert!(!OnionAddress::is_onion_address("onion.example"));
    }
}
