/// Circuit key agreement: CREATE_FAST for the first hop, ntor for extensions
use minitor_common::{Result, TorError};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::relay_crypto::{layer_from_material, LayerCrypto, TOR_KEY_MATERIAL_LEN};
use crate::crypto::hash::{hmac_sha256, kdf_tor};
use crate::crypto::{random_array, SecureRandom};

const NTOR_PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const NTOR_T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const NTOR_T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const NTOR_T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const NTOR_M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// ntor handshake type in CREATE2/EXTEND2
pub const NTOR_HANDSHAKE_TYPE: u16 = 2;

/// ID | B | X
pub const NTOR_ONIONSKIN_LEN: usize = 84;

/// Client half of CREATE_FAST
pub struct CreateFastHandshake {
    x: Zeroizing<[u8; 20]>,
}

impl CreateFastHandshake {
    pub fn new(rng: &dyn SecureRandom) -> Self {
        Self {
            x: Zeroizing::new(random_array::<20>(rng)),
        }
    }

    pub fn client_payload(&self) -> [u8; 20] {
        *self.x
    }

    /// Checks KH in the CREATED_FAST reply and keys the hop
    pub fn complete(&self, reply: &[u8]) -> Result<LayerCrypto> {
        if reply.len() < 40 {
            return Err(TorError::protocol("short CREATED_FAST payload"));
        }
        let (y, kh) = (&reply[..20], &reply[20..40]);

        let mut seed = Zeroizing::new(Vec::with_capacity(40));
        seed.extend_from_slice(&*self.x);
        seed.extend_from_slice(y);

        let mut keys = kdf_tor(&seed, 20 + TOR_KEY_MATERIAL_LEN);
        if !bool::from(keys[..20].ct_eq(kh)) {
            return Err(TorError::protocol("CREATED_FAST key hash mismatch"));
        }
        let material = keys.split_off(20);
        layer_from_material(material, false)
    }
}

/// Client half of the ntor handshake
pub struct NtorHandshake {
    secret: StaticSecret,
    public: PublicKey,
    node_id: [u8; 20],
    onion_key: PublicKey,
}

impl NtorHandshake {
    pub fn new(rng: &dyn SecureRandom, node_id: [u8; 20], onion_key: [u8; 32]) -> Self {
        let secret = StaticSecret::from(random_array::<32>(rng));
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            node_id,
            onion_key: PublicKey::from(onion_key),
        }
    }

    /// ID | B | X
    pub fn onionskin(&self) -> [u8; NTOR_ONIONSKIN_LEN] {
        let mut out = [0u8; NTOR_ONIONSKIN_LEN];
        out[..20].copy_from_slice(&self.node_id);
        out[20..52].copy_from_slice(self.onion_key.as_bytes());
        out[52..].copy_from_slice(self.public.as_bytes());
        out
    }

    /// Verifies the server's AUTH and derives the hop keys from Y | AUTH
    pub fn complete(&self, reply: &[u8]) -> Result<LayerCrypto> {
        if reply.len() < 64 {
            return Err(TorError::protocol("short ntor reply"));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[..32]);
        let server_public = PublicKey::from(y_bytes);
        let auth = &reply[32..64];

        let exp_yx = self.secret.diffie_hellman(&server_public);
        let exp_bx = self.secret.diffie_hellman(&self.onion_key);
        if !exp_yx.was_contributory() || !exp_bx.was_contributory() {
            return Err(TorError::protocol("ntor produced a degenerate shared secret"));
        }

        let mut secret_input = Zeroizing::new(Vec::with_capacity(204));
        secret_input.extend_from_slice(exp_yx.as_bytes());
        secret_input.extend_from_slice(exp_bx.as_bytes());
        secret_input.extend_from_slice(&self.node_id);
        secret_input.extend_from_slice(self.onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(&y_bytes);
        secret_input.extend_from_slice(NTOR_PROTOID);

        let key_seed = Zeroizing::new(hmac_sha256(NTOR_T_KEY, &[&secret_input]));
        let verify = hmac_sha256(NTOR_T_VERIFY, &[&secret_input]);
        let expected_auth = hmac_sha256(
            NTOR_T_MAC,
            &[
                &verify,
                &self.node_id,
                self.onion_key.as_bytes(),
                &y_bytes,
                self.public.as_bytes(),
                NTOR_PROTOID,
                b"Server",
            ],
        );
        if !bool::from(expected_auth.ct_eq(auth)) {
            return Err(TorError::protocol("ntor server authentication failed"));
        }

        let hkdf = hkdf::Hkdf::<sha2::Sha256>::from_prk(&*key_seed)
            .map_err(|_| TorError::protocol("ntor key seed rejected"))?;
        let mut material = vec![0u8; TOR_KEY_MATERIAL_LEN];
        hkdf.expand(NTOR_M_EXPAND, &mut material)
            .map_err(|_| TorError::protocol("ntor key expansion failed"))?;
        layer_from_material(material, false)
    }
}
