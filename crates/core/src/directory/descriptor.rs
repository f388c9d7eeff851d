/// Server descriptors (`/tor/server/fp/...`)
///
/// Only the fields the client needs are kept: the ntor onion key for
/// extending circuits and the ed25519 identity for the onion service
/// directory ring.
use super::decode_base64;
use async_trait::async_trait;
use minitor_common::{Fingerprint, Result};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub nickname: String,
    pub address: Option<Ipv4Addr>,
    pub or_port: u16,
    pub fingerprint: Option<Fingerprint>,
    pub ntor_onion_key: Option<[u8; 32]>,
    pub ed25519_identity: Option<[u8; 32]>,
}

impl ServerDescriptor {
    /// Splits a response holding one or more descriptors
    pub fn parse_all(text: &str) -> Vec<Self> {
        let mut descriptors = Vec::new();
        let mut current: Option<Self> = None;

        for line in text.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let Some(&keyword) = tokens.first() else {
                continue;
            };

            if keyword == "router" {
                descriptors.extend(current.take());
                current = Some(Self {
                    nickname: tokens.get(1).unwrap_or(&"").to_string(),
                    address: tokens.get(2).and_then(|ip| ip.parse().ok()),
                    or_port: tokens.get(3).and_then(|p| p.parse().ok()).unwrap_or(0),
                    ..Self::default()
                });
                continue;
            }

            let Some(descriptor) = current.as_mut() else {
                continue;
            };
            match keyword {
                "fingerprint" => {
                    descriptor.fingerprint = Fingerprint::from_hex(&tokens[1..].concat()).ok();
                }
                "ntor-onion-key" => {
                    descriptor.ntor_onion_key = tokens.get(1).and_then(|v| decode_key(v));
                }
                "master-key-ed25519" => {
                    descriptor.ed25519_identity = tokens.get(1).and_then(|v| decode_key(v));
                }
                _ => {}
            }
        }

        descriptors.extend(current);
        descriptors
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::parse_all(text).into_iter().next()
    }
}

fn decode_key(value: &str) -> Option<[u8; 32]> {
    decode_base64(value).ok()?.try_into().ok()
}

/// Source of server descriptors for circuit extension
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn server_descriptor(&self, fingerprint: &Fingerprint) -> Result<ServerDescriptor>;
}

#[cfg(test)]
pub(crate) mod testing {
    /// Renders a trimmed server descriptor
    pub fn render_descriptor(name: &str, id: u8, ntor: [u8; 32], ed: [u8; 32]) -> String {
        let fingerprint = hex::encode_upper([id; 20]);
        let spaced: Vec<String> = fingerprint
            .as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        format!(
            "router {name} 192.0.2.{id} 9001 0 0\n\
             identity-ed25519\n\
             -----BEGIN ED25519 CERT-----\nAQQ=\n-----END ED25519 CERT-----\n\
             master-key-ed25519 {}\n\
             platform Tor 0.4.8.10 on Linux\n\
             fingerprint {}\n\
             ntor-onion-key {}\n\
             router-signature\n",
            data_encoding::BASE64_NOPAD.encode(&ed),
            spaced.join(" "),
            data_encoding::BASE64.encode(&ntor),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::render_descriptor;
    use super::*;

    #[test]
    fn parses_keys_and_identity() {
        let text = render_descriptor("alpha", 9, [0x42; 32], [0x24; 32]);
        let descriptor = ServerDescriptor::parse(&text).unwrap();
        assert_eq!(descriptor.nickname, "alpha");
        assert_eq!(descriptor.address, Some(Ipv4Addr::new(192, 0, 2, 9)));
        assert_eq!(descriptor.or_port, 9001);
        assert_eq!(descriptor.fingerprint, Some(Fingerprint::from_bytes([9; 20])));
        assert_eq!(descriptor.ntor_onion_key, Some([0x42; 32]));
        assert_eq!(descriptor.ed25519_identity, Some([0x24; 32]));
    }

    #[test]
    fn splits_batched_responses() {
        let text = format!(
            "{}{}",
            render_descriptor("one", 1, [1; 32], [1; 32]),
            render_descriptor("two", 2, [2; 32], [2; 32])
        );
        let all = ServerDescriptor::parse_all(&text);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].ed25519_identity, Some([2; 32]));
    }

    #[test]
    fn missing_fields_stay_empty() {
        let descriptor = ServerDescriptor::parse("router bare 192.0.2.1 9001 0 0\n").unwrap();
        assert!(descriptor.ntor_onion_key.is_none());
        assert!(ServerDescriptor::parse("").is_none());
    }
}
