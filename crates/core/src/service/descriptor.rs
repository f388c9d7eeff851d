/// Version 3 onion service descriptors
///
/// The outer document is signed by the blinded key and wraps two
/// encrypted layers; the inner one lists the introduction points. Only
/// descriptors without client authorization can be read.
use super::keyblind::ServiceKeys;
use crate::circuit::{ExtendTarget, LinkSpecifier};
use crate::crypto::hash::{sha3_256, shake256};
use crate::directory::decode_base64;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use minitor_common::{Result, TorError};
use subtle::ConstantTimeEq;
use tracing::debug;

const SUPERENCRYPTED_CONSTANT: &[u8] = b"hsdir-superencrypted-data";
const ENCRYPTED_CONSTANT: &[u8] = b"hsdir-encrypted-data";

const SALT_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// Offset and length of the certified key inside an ed25519 certificate
const CERTIFIED_KEY: std::ops::Range<usize> = 7..39;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroPoint {
    pub link_specifiers: Vec<LinkSpecifier>,
    /// ntor key used to extend to the introduction point
    pub onion_key: [u8; 32],
    /// Introduction point authentication key (AUTH_KEY in INTRODUCE1)
    pub auth_key: [u8; 32],
    /// Encryption key for the hs-ntor handshake (B)
    pub enc_key: [u8; 32],
}

impl IntroPoint {
    pub fn extend_target(&self) -> Result<ExtendTarget> {
        ExtendTarget::from_link_specifiers(self.link_specifiers.clone(), self.onion_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsDescriptor {
    pub revision_counter: u64,
    pub intro_points: Vec<IntroPoint>,
}

impl HsDescriptor {
    /// Decrypts both layers of a fetched descriptor
    pub fn decrypt(text: &str, keys: &ServiceKeys) -> Result<Self> {
        let outer = Item::parse_all(text);
        let revision_counter = find(&outer, "revision-counter")?
            .args
            .first()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| TorError::onion("bad revision-counter"))?;
        let superencrypted = object_of(&outer, "superencrypted")?;

        let middle = decrypt_layer(
            superencrypted,
            &keys.blinded_key,
            keys,
            revision_counter,
            SUPERENCRYPTED_CONSTANT,
        )?;
        let middle = Item::parse_all(&middle);
        let encrypted = object_of(&middle, "encrypted")?;

        let inner = decrypt_layer(
            encrypted,
            &keys.blinded_key,
            keys,
            revision_counter,
            ENCRYPTED_CONSTANT,
        )?;
        let intro_points = parse_intro_points(&Item::parse_all(&inner))?;
        debug!(
            "descriptor revision {} lists {} introduction points",
            revision_counter,
            intro_points.len()
        );

        Ok(Self {
            revision_counter,
            intro_points,
        })
    }
}

/// One keyword line and the object block following it, if any
struct Item<'a> {
    keyword: &'a str,
    args: Vec<&'a str>,
    object: Option<Vec<u8>>,
}

impl<'a> Item<'a> {
    fn parse_all(text: &'a str) -> Vec<Self> {
        let mut items: Vec<Self> = Vec::new();
        let mut block: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.starts_with("-----BEGIN ") {
                block = Some(String::new());
                continue;
            }
            if line.starts_with("-----END ") {
                if let (Some(body), Some(item)) = (block.take(), items.last_mut()) {
                    item.object = decode_base64(&body).ok();
                }
                continue;
            }
            if let Some(body) = block.as_mut() {
                body.push_str(line);
                continue;
            }

            let mut tokens = line.split_whitespace();
            let Some(keyword) = tokens.next() else {
                continue;
            };
            items.push(Self {
                keyword,
                args: tokens.collect(),
                object: None,
            });
        }
        items
    }
}

fn find<'i, 'a>(items: &'i [Item<'a>], keyword: &str) -> Result<&'i Item<'a>> {
    items
        .iter()
        .find(|item| item.keyword == keyword)
        .ok_or_else(|| TorError::onion(format!("descriptor lacks {keyword}")))
}

fn object_of<'i>(items: &'i [Item<'_>], keyword: &str) -> Result<&'i [u8]> {
    find(items, keyword)?
        .object
        .as_deref()
        .ok_or_else(|| TorError::onion(format!("{keyword} has no object")))
}

/// Derives (key, iv, mac key) for one layer
fn layer_keys(
    secret: &[u8],
    keys: &ServiceKeys,
    revision_counter: u64,
    salt: &[u8],
    constant: &[u8],
) -> Vec<u8> {
    shake256(
        &[
            secret,
            &keys.subcredential,
            &revision_counter.to_be_bytes(),
            salt,
            constant,
        ],
        32 + 16 + 32,
    )
}

fn layer_mac(mac_key: &[u8], salt: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    sha3_256(&[
        &(mac_key.len() as u64).to_be_bytes(),
        mac_key,
        &(salt.len() as u64).to_be_bytes(),
        salt,
        ciphertext,
    ])
}

fn decrypt_layer(
    blob: &[u8],
    secret: &[u8],
    keys: &ServiceKeys,
    revision_counter: u64,
    constant: &[u8],
) -> Result<String> {
    if blob.len() < SALT_LEN + MAC_LEN {
        return Err(TorError::onion("encrypted layer too short"));
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (ciphertext, mac) = rest.split_at(rest.len() - MAC_LEN);

    let material = layer_keys(secret, keys, revision_counter, salt, constant);
    let (key, rest) = material.split_at(32);
    let (iv, mac_key) = rest.split_at(16);

    if !bool::from(layer_mac(mac_key, salt, ciphertext).ct_eq(mac)) {
        return Err(TorError::onion("descriptor layer MAC mismatch"));
    }

    let mut plaintext = ciphertext.to_vec();
    Ctr128BE::<Aes256>::new_from_slices(key, iv)
        .map_err(|_| TorError::onion("bad descriptor key length"))?
        .apply_keystream(&mut plaintext);

    while plaintext.last() == Some(&0) {
        plaintext.pop();
    }
    String::from_utf8(plaintext).map_err(|_| TorError::onion("descriptor layer is not UTF-8"))
}

fn decode_key(value: Option<&&str>) -> Option<[u8; 32]> {
    decode_base64(value?).ok()?.try_into().ok()
}

#[derive(Default)]
struct PartialIntroPoint {
    link_specifiers: Vec<LinkSpecifier>,
    onion_key: Option<[u8; 32]>,
    auth_key: Option<[u8; 32]>,
    enc_key: Option<[u8; 32]>,
}

impl PartialIntroPoint {
    fn finish(self) -> Option<IntroPoint> {
        Some(IntroPoint {
            link_specifiers: self.link_specifiers,
            onion_key: self.onion_key?,
            auth_key: self.auth_key?,
            enc_key: self.enc_key?,
        })
    }
}

fn parse_intro_points(items: &[Item<'_>]) -> Result<Vec<IntroPoint>> {
    let mut partials: Vec<PartialIntroPoint> = Vec::new();

    for item in items {
        if item.keyword == "introduction-point" {
            let encoded = item
                .args
                .first()
                .ok_or_else(|| TorError::onion("empty introduction-point"))?;
            let raw = decode_base64(encoded)
                .map_err(|e| TorError::onion(format!("introduction-point: {e}")))?;
            let (link_specifiers, _) = LinkSpecifier::decode_list(&raw)?;
            partials.push(PartialIntroPoint {
                link_specifiers,
                ..PartialIntroPoint::default()
            });
            continue;
        }

        let Some(point) = partials.last_mut() else {
            continue;
        };
        match (item.keyword, item.args.first().copied()) {
            ("onion-key", Some("ntor")) => point.onion_key = decode_key(item.args.get(1)),
            ("enc-key", Some("ntor")) => point.enc_key = decode_key(item.args.get(1)),
            ("auth-key", _) => {
                point.auth_key = item
                    .object
                    .as_deref()
                    .and_then(|cert| cert.get(CERTIFIED_KEY))
                    .and_then(|key| key.try_into().ok());
            }
            _ => {}
        }
    }

    let total = partials.len();
    let intro_points: Vec<IntroPoint> = partials
        .into_iter()
        .filter_map(PartialIntroPoint::finish)
        .collect();
    if intro_points.len() < total {
        debug!("skipped {} incomplete introduction points", total - intro_points.len());
    }
    if intro_points.is_empty() {
        return Err(TorError::onion("descriptor has no usable introduction points"));
    }
    Ok(intro_points)
}


#[cfg(test)]
mod tests {
    use super::testing::render_hs_descriptor;
    use super::*;
    use curve25519_dalek::constants::ED25519_BASEPOINT_COMPRESSED;
    use minitor_common::Fingerprint;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn keys() -> ServiceKeys {
        ServiceKeys::derive(&ED25519_BASEPOINT_COMPRESSED.to_bytes(), 19_723).unwrap()
    }

    fn intro_point(id: u8) -> IntroPoint {
        IntroPoint {
            link_specifiers: vec![
                LinkSpecifier::Ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, id), 9001)),
                LinkSpecifier::LegacyId(Fingerprint::from_bytes([id; 20])),
            ],
            onion_key: [id; 32],
            auth_key: [id + 1; 32],
            enc_key: [id + 2; 32],
        }
    }

    #[test]
    fn decrypts_both_layers() {
        let points = vec![intro_point(3), intro_point(7)];
        let text = render_hs_descriptor(&keys(), 42, &points);

        let descriptor = HsDescriptor::decrypt(&text, &keys()).unwrap();
        assert_eq!(descriptor.revision_counter, 42);
        assert_eq!(descriptor.intro_points, points);

        let target = descriptor.intro_points[1].extend_target().unwrap();
        assert_eq!(target.fingerprint, Fingerprint::from_bytes([7; 20]));
        assert_eq!(target.ntor_onion_key, [7; 32]);
    }

    #[test]
    fn wrong_period_fails_the_mac() {
        let text = render_hs_descriptor(&keys(), 1, &[intro_point(3)]);
        let other = ServiceKeys::derive(&ED25519_BASEPOINT_COMPRESSED.to_bytes(), 19_724).unwrap();
        let err = HsDescriptor::decrypt(&text, &other).unwrap_err();
        assert!(err.to_string().contains("MAC"));
    }

    #[test]
    fn descriptor_without_intro_points_is_unusable() {
        let text = render_hs_descriptor(&keys(), 1, &[]);
        assert!(HsDescriptor::decrypt(&text, &keys()).is_err());
    }

    #[test]
    fn missing_superencrypted_block_is_reported() {
        let err = HsDescriptor::decrypt("hs-descriptor 3\nrevision-counter 5\n", &keys()).unwrap_err();
        assert!(err.to_string().contains("superencrypted"));
    }
}
