/// Time periods, blinded keys and subcredentials for v3 onion services
use crate::crypto::hash::sha3_256;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;
use minitor_common::config::onion::{TIME_PERIOD_LENGTH, TIME_PERIOD_ROTATION_OFFSET};
use minitor_common::{Result, Timestamp, TorError};

const BLIND_STRING: &[u8] = b"Derive temporary signing key\0";

/// The ed25519 basepoint in the textual form hashed into the blinding factor
const ED25519_BASEPOINT: &[u8] = b"(15112221349535400772501151409588531511454012693041857206046113283949847762202, 46316835694926478169428394003475163141307993866256225615783033603165251855960)";

/// Time period number containing `now`
pub fn time_period(now: Timestamp) -> u64 {
    now.as_minutes().saturating_sub(TIME_PERIOD_ROTATION_OFFSET) / TIME_PERIOD_LENGTH
}

/// Blinds the identity key `public_key` for `period`
pub fn blind_public_key(public_key: &[u8; 32], period: u64) -> Result<[u8; 32]> {
    let point = CompressedEdwardsY(*public_key)
        .decompress()
        .ok_or_else(|| TorError::onion("onion service key is not a curve point"))?;

    let mut h = sha3_256(&[
        BLIND_STRING,
        public_key,
        ED25519_BASEPOINT,
        b"key-blind",
        &period.to_be_bytes(),
        &TIME_PERIOD_LENGTH.to_be_bytes(),
    ]);
    h[0] &= 248;
    h[31] &= 63;
    h[31] |= 64;

    let blinded = point * Scalar::from_bytes_mod_order(h);
    Ok(blinded.compress().to_bytes())
}

pub fn credential(public_key: &[u8; 32]) -> [u8; 32] {
    sha3_256(&[b"credential", public_key])
}

pub fn subcredential(public_key: &[u8; 32], blinded_key: &[u8; 32]) -> [u8; 32] {
    sha3_256(&[b"subcredential", &credential(public_key), blinded_key])
}

/// Per-period keys of one onion service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceKeys {
    pub public_key: [u8; 32],
    pub period: u64,
    pub blinded_key: [u8; 32],
    pub subcredential: [u8; 32],
}

impl ServiceKeys {
    pub fn derive(public_key: &[u8; 32], period: u64) -> Result<Self> {
        let blinded_key = blind_public_key(public_key, period)?;
        Ok(Self {
            public_key: *public_key,
            period,
            blinded_key,
            subcredential: subcredential(public_key, &blinded_key),
        })
    }
}
