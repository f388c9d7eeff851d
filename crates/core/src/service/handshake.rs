/// hs-ntor: the client half of the onion service key exchange
///
/// The same ephemeral key encrypts the INTRODUCE1 payload for the service
/// and later completes the handshake carried back in RENDEZVOUS2.
use crate::crypto::hash::shake256;
use crate::crypto::{random_array, SecureRandom};
use crate::protocol::relay_crypto::{layer_from_material, LayerCrypto, HS_KEY_MATERIAL_LEN};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use minitor_common::{Result, TorError};
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
const T_HSENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const T_HSVERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
const T_HSMAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
const M_HSEXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// MAC(k, m) = SHA3-256(htonll(len(k)) | k | m)
pub fn hs_mac(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut digest = Sha3_256::new();
    digest.update((key.len() as u64).to_be_bytes());
    digest.update(key);
    digest.update(message);
    digest.finalize().into()
}

pub struct HsNtorClient {
    secret: StaticSecret,
    public: PublicKey,
    /// Introduction point encryption key, B
    enc_key: PublicKey,
    auth_key: [u8; 32],
    subcredential: [u8; 32],
}

impl HsNtorClient {
    pub fn new(
        rng: &dyn SecureRandom,
        enc_key: [u8; 32],
        auth_key: [u8; 32],
        subcredential: [u8; 32],
    ) -> Self {
        let secret = StaticSecret::from(random_array::<32>(rng));
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            enc_key: PublicKey::from(enc_key),
            auth_key,
            subcredential,
        }
    }

    pub fn client_public(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// ENC_KEY and MAC_KEY for the introduction payload
    fn intro_keys(&self) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
        let bx = self.secret.diffie_hellman(&self.enc_key);
        let mut keys = Zeroizing::new(shake256(
            &[
                bx.as_bytes(),
                &self.auth_key,
                self.public.as_bytes(),
                self.enc_key.as_bytes(),
                PROTOID,
                T_HSENC,
                M_HSEXPAND,
                &self.subcredential,
            ],
            64,
        ));
        let mac_key = Zeroizing::new(keys.split_off(32));
        (keys, mac_key)
    }

    /// Appends CLIENT_PK, the encrypted payload and the MAC to an INTRODUCE1 header
    ///
    /// The MAC covers everything in the cell before it.
    pub fn seal_introduce(&self, header: &[u8], mut plaintext: Vec<u8>) -> Result<Vec<u8>> {
        let (enc_key, mac_key) = self.intro_keys();
        let mut cipher = Ctr128BE::<Aes256>::new_from_slices(&enc_key, &[0u8; 16])
            .map_err(|_| TorError::onion("bad introduction key length"))?;
        cipher.apply_keystream(&mut plaintext);

        let mut cell = header.to_vec();
        cell.extend_from_slice(self.public.as_bytes());
        cell.extend_from_slice(&plaintext);
        let mac = hs_mac(&mac_key, &cell);
        cell.extend_from_slice(&mac);
        Ok(cell)
    }

    /// Verifies RENDEZVOUS2 (SERVER_PK | AUTH) and keys the service hop
    pub fn complete(&self, handshake_info: &[u8]) -> Result<LayerCrypto> {
        if handshake_info.len() < 64 {
            return Err(TorError::onion("short RENDEZVOUS2 handshake"));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&handshake_info[..32]);
        let server_public = PublicKey::from(y_bytes);
        let auth = &handshake_info[32..64];

        let xy = self.secret.diffie_hellman(&server_public);
        let xb = self.secret.diffie_hellman(&self.enc_key);
        if !xy.was_contributory() || !xb.was_contributory() {
            return Err(TorError::onion("degenerate rendezvous key"));
        }

        let mut secret_input = Zeroizing::new(Vec::with_capacity(256));
        secret_input.extend_from_slice(xy.as_bytes());
        secret_input.extend_from_slice(xb.as_bytes());
        secret_input.extend_from_slice(&self.auth_key);
        secret_input.extend_from_slice(self.enc_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(&y_bytes);
        secret_input.extend_from_slice(PROTOID);

        let key_seed = Zeroizing::new(hs_mac(&secret_input, T_HSENC));
        let verify = hs_mac(&secret_input, T_HSVERIFY);

        let mut auth_input = Vec::with_capacity(200);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.auth_key);
        auth_input.extend_from_slice(self.enc_key.as_bytes());
        auth_input.extend_from_slice(&y_bytes);
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");
        let expected = hs_mac(&auth_input, T_HSMAC);
        if !bool::from(expected.ct_eq(auth)) {
            return Err(TorError::onion("rendezvous authentication failed"));
        }

        let material = shake256(&[&*key_seed, M_HSEXPAND], HS_KEY_MATERIAL_LEN);
        layer_from_material(material, true)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::service_accept;
    use super::*;
    use crate::crypto::random::testing::SeededRandom;
    use crate::protocol::cell::{RelayCommand, RelayMessage};

    #[test]
    fn mac_matches_reference_vector() {
        assert_eq!(
            hex::encode(hs_mac(b"who", b"knows?")),
            "5e7da329630fdaa3eab7498bb1dc625bbb9ca968f10392b6af92d51d5db17473"
        );
    }

    #[test]
    fn client_and_service_agree() {
        let rng = SeededRandom::new(8);
        let intro_secret = StaticSecret::from([0x21; 32]);
        let enc_key = *PublicKey::from(&intro_secret).as_bytes();
        let client = HsNtorClient::new(&rng, enc_key, [0x31; 32], [0x41; 32]);

        let header = vec![0u8; 57];
        let cell = client.seal_introduce(&header, b"introduce me".to_vec()).unwrap();
        assert_eq!(&cell[57..89], &client.client_public());

        let (plaintext, reply, mut service) =
            service_accept(&intro_secret, [0x31; 32], [0x41; 32], 57, &cell, [0x51; 32]);
        assert_eq!(plaintext, b"introduce me");

        let mut layer = client.complete(&reply).unwrap();
        let mut payload = RelayMessage::new(RelayCommand::Begin, 1, b":80\0".to_vec())
            .encode()
            .unwrap();
        layer.seal(&mut payload);
        layer.encrypt(&mut payload);
        service.decrypt(&mut payload);
        assert!(service.recognize(&payload));
    }

    #[test]
    fn wrong_subcredential_breaks_rendezvous_auth() {
        let rng = SeededRandom::new(9);
        let intro_secret = StaticSecret::from([0x21; 32]);
        let enc_key = *PublicKey::from(&intro_secret).as_bytes();
        let client = HsNtorClient::new(&rng, enc_key, [0x31; 32], [0x41; 32]);
        let cell = client.seal_introduce(&[], vec![1, 2, 3]).unwrap();

        let (_, mut reply, _) =
            service_accept(&intro_secret, [0x31; 32], [0x41; 32], 0, &cell, [0x51; 32]);
        reply[40] ^= 0x80;
        assert!(client.complete(&reply).is_err());
    }
}
