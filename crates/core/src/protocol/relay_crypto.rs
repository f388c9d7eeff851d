/// Per-hop relay cell crypto
///
/// Each hop holds a forward and a backward stream cipher (counter mode with
/// a zero IV) and a running digest in each direction. Hops negotiated with
/// CREATE_FAST or ntor use AES-128 and SHA-1; the onion service hop uses
/// AES-256 and SHA3-256.
use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use minitor_common::config::protocol::CELL_PAYLOAD_LEN;
use minitor_common::{Result, TorError};
use sha1::Sha1;
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use super::cell::{DIGEST_RANGE, RECOGNIZED_RANGE};

/// Key material for a normal hop: Df, Db (20 each), Kf, Kb (16 each)
pub const TOR_KEY_MATERIAL_LEN: usize = 72;

/// Key material for the onion service hop: Df, Db, Kf, Kb (32 each)
pub const HS_KEY_MATERIAL_LEN: usize = 128;

/// Bytes of the backward digest echoed in an authenticated SENDME
pub const SENDME_DIGEST_LEN: usize = 20;

enum RelayCipher {
    Aes128(Ctr128BE<Aes128>),
    Aes256(Ctr128BE<Aes256>),
}

impl RelayCipher {
    fn aes128(key: &[u8]) -> Result<Self> {
        Ctr128BE::<Aes128>::new_from_slices(key, &[0u8; 16])
            .map(Self::Aes128)
            .map_err(|_| TorError::protocol("bad AES-128 key length"))
    }

    fn aes256(key: &[u8]) -> Result<Self> {
        Ctr128BE::<Aes256>::new_from_slices(key, &[0u8; 16])
            .map(Self::Aes256)
            .map_err(|_| TorError::protocol("bad AES-256 key length"))
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Self::Aes128(cipher) => cipher.apply_keystream(data),
            Self::Aes256(cipher) => cipher.apply_keystream(data),
        }
    }
}

#[derive(Clone)]
enum RunningDigest {
    Sha1(Sha1),
    Sha3(Sha3_256),
}

impl RunningDigest {
    fn sha1(seed: &[u8]) -> Self {
        let mut digest = Sha1::new();
        Digest::update(&mut digest, seed);
        Self::Sha1(digest)
    }

    fn sha3(seed: &[u8]) -> Self {
        let mut digest = Sha3_256::new();
        Digest::update(&mut digest, seed);
        Self::Sha3(digest)
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(digest) => Digest::update(digest, data),
            Self::Sha3(digest) => Digest::update(digest, data),
        }
    }

    /// Digest of everything seen so far, leaving the running state untouched
    fn current(&self) -> Vec<u8> {
        match self {
            Self::Sha1(digest) => digest.clone().finalize().to_vec(),
            Self::Sha3(digest) => digest.clone().finalize().to_vec(),
        }
    }
}

/// Layer crypto state for a single hop
pub struct LayerCrypto {
    forward_cipher: RelayCipher,
    backward_cipher: RelayCipher,
    forward_digest: RunningDigest,
    backward_digest: RunningDigest,
    last_backward_digest: Vec<u8>,
}

// Manual Debug implementation: cipher and digest state stay out of logs
impl std::fmt::Debug for LayerCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let suite = match self.forward_cipher {
            RelayCipher::Aes128(_) => "aes128-sha1",
            RelayCipher::Aes256(_) => "aes256-sha3",
        };
        f.debug_struct("LayerCrypto").field("suite", &suite).finish()
    }
}

impl LayerCrypto {
    /// Builds a hop from KDF-TOR or ntor output
    pub fn from_tor_keys(material: &[u8]) -> Result<Self> {
        if material.len() < TOR_KEY_MATERIAL_LEN {
            return Err(TorError::protocol("short relay key material"));
        }
        let (df, rest) = material.split_at(20);
        let (db, rest) = rest.split_at(20);
        let (kf, rest) = rest.split_at(16);
        let kb = &rest[..16];

        Ok(Self {
            forward_cipher: RelayCipher::aes128(kf)?,
            backward_cipher: RelayCipher::aes128(kb)?,
            forward_digest: RunningDigest::sha1(df),
            backward_digest: RunningDigest::sha1(db),
            last_backward_digest: Vec::new(),
        })
    }

    /// Builds the virtual hop shared with an onion service
    pub fn from_hs_keys(material: &[u8]) -> Result<Self> {
        if material.len() < HS_KEY_MATERIAL_LEN {
            return Err(TorError::protocol("short onion service key material"));
        }
        Ok(Self {
            forward_cipher: RelayCipher::aes256(&material[64..96])?,
            backward_cipher: RelayCipher::aes256(&material[96..128])?,
            forward_digest: RunningDigest::sha3(&material[..32]),
            backward_digest: RunningDigest::sha3(&material[32..64]),
            last_backward_digest: Vec::new(),
        })
    }

    /// Fills in the digest field of an outbound payload addressed to this hop
    pub fn seal(&mut self, payload: &mut [u8; CELL_PAYLOAD_LEN]) {
        payload[DIGEST_RANGE].fill(0);
        self.forward_digest.update(payload);
        let digest = self.forward_digest.current();
        payload[DIGEST_RANGE].copy_from_slice(&digest[..4]);
    }

    /// Adds this hop's layer of encryption
    pub fn encrypt(&mut self, payload: &mut [u8; CELL_PAYLOAD_LEN]) {
        self.forward_cipher.apply(payload);
    }

    /// Strips this hop's layer from an inbound payload
    pub fn decrypt(&mut self, payload: &mut [u8; CELL_PAYLOAD_LEN]) {
        self.backward_cipher.apply(payload);
    }

    /// Whether a decrypted payload originated at this hop
    ///
    /// The backward digest only advances when the cell is recognized.
    pub fn recognize(&mut self, payload: &[u8; CELL_PAYLOAD_LEN]) -> bool {
        if payload[RECOGNIZED_RANGE] != [0, 0] {
            return false;
        }
        let mut zeroed = *payload;
        zeroed[DIGEST_RANGE].fill(0);

        let mut candidate = self.backward_digest.clone();
        candidate.update(&zeroed);
        let digest = candidate.current();
        if !bool::from(digest[..4].ct_eq(&payload[DIGEST_RANGE])) {
            return false;
        }

        self.backward_digest = candidate;
        self.last_backward_digest = digest;
        true
    }

    /// Backward digest after the most recently recognized cell
    pub fn sendme_digest(&self) -> Vec<u8> {
        self.last_backward_digest
            .iter()
            .take(SENDME_DIGEST_LEN)
            .copied()
            .collect()
    }

    /// The same keys seen from the relay's side of the hop
    #[cfg(test)]
    pub(crate) fn into_relay_side(self) -> Self {
        Self {
            forward_cipher: self.backward_cipher,
            backward_cipher: self.forward_cipher,
            forward_digest: self.backward_digest,
            backward_digest: self.forward_digest,
            last_backward_digest: Vec::new(),
        }
    }
}

/// Splits a handshake's key stream and wipes it once the hop is keyed
pub(crate) fn layer_from_material(mut material: Vec<u8>, hs: bool) -> Result<LayerCrypto> {
    let layer = if hs {
        LayerCrypto::from_hs_keys(&material)
    } else {
        LayerCrypto::from_tor_keys(&material)
    };
    material.zeroize();
    layer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::{RelayCommand, RelayMessage};

    fn pair(hs: bool) -> (LayerCrypto, LayerCrypto) {
        let len = if hs { HS_KEY_MATERIAL_LEN } else { TOR_KEY_MATERIAL_LEN };
        let material: Vec<u8> = (0..len as u8).collect();
        let client = layer_from_material(material.clone(), hs).unwrap();
        let relay = layer_from_material(material, hs).unwrap().into_relay_side();
        (client, relay)
    }

    #[test]
    fn relay_recognizes_sealed_cells() {
        for hs in [false, true] {
            let (mut client, mut relay) = pair(hs);
            for n in 0..3u8 {
                let message = RelayMessage::new(RelayCommand::Data, 9, vec![n; 40]);
                let mut payload = message.encode().unwrap();
                client.seal(&mut payload);
                client.encrypt(&mut payload);

                relay.decrypt(&mut payload);
                assert!(relay.recognize(&payload));
                assert_eq!(RelayMessage::decode(&payload).unwrap(), message);
            }
        }
    }

    #[test]
    fn tampered_cells_are_not_recognized() {
        let (mut client, mut relay) = pair(false);
        let mut payload = RelayMessage::new(RelayCommand::Data, 1, b"abc".to_vec())
            .encode()
            .unwrap();
        client.seal(&mut payload);
        client.encrypt(&mut payload);
        payload[20] ^= 1;

        relay.decrypt(&mut payload);
        assert!(!relay.recognize(&payload));
        assert!(relay.sendme_digest().is_empty());
    }

    #[test]
    fn sendme_digest_tracks_last_recognized_cell() {
        let (mut relay_side, mut client) = {
            let (client, relay) = pair(false);
            (relay, client)
        };
        let mut payload = RelayMessage::new(RelayCommand::Data, 1, vec![1; 10])
            .encode()
            .unwrap();
        relay_side.seal(&mut payload);
        let expected = payload[DIGEST_RANGE].to_vec();
        relay_side.encrypt(&mut payload);

        client.decrypt(&mut payload);
        assert!(client.recognize(&payload));
        let digest = client.sendme_digest();
        assert_eq!(digest.len(), SENDME_DIGEST_LEN);
        assert_eq!(&digest[..4], &expected[..]);
    }

    #[test]
    fn short_material_is_rejected() {
        assert!(LayerCrypto::from_tor_keys(&[0u8; 71]).is_err());
        assert!(LayerCrypto::from_hs_keys(&[0u8; 127]).is_err());
    }
}
