use crate::directory::{OnionRouter, ServerDescriptor};
use minitor_common::{Fingerprint, Result, TorError};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

/// State of the client's circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// No hops; the next extend connects directly to a first hop
    Empty,

    /// Established with the given number of hops
    Established(usize),
}

impl CircuitState {
    pub fn hop_count(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Established(hops) => *hops,
        }
    }
}

/// One entry of an EXTEND2 / INTRODUCE1 link specifier list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecifier {
    Ipv4(SocketAddrV4),
    Ipv6(SocketAddrV6),
    LegacyId(Fingerprint),
    Ed25519([u8; 32]),
    Unrecognized { kind: u8, data: Vec<u8> },
}

impl LinkSpecifier {
    fn kind(&self) -> u8 {
        match self {
            Self::Ipv4(_) => 0,
            Self::Ipv6(_) => 1,
            Self::LegacyId(_) => 2,
            Self::Ed25519(_) => 3,
            Self::Unrecognized { kind, .. } => *kind,
        }
    }

    fn body(&self) -> Vec<u8> {
        match self {
            Self::Ipv4(addr) => {
                let mut out = addr.ip().octets().to_vec();
                out.extend_from_slice(&addr.port().to_be_bytes());
                out
            }
            Self::Ipv6(addr) => {
                let mut out = addr.ip().octets().to_vec();
                out.extend_from_slice(&addr.port().to_be_bytes());
                out
            }
            Self::LegacyId(fingerprint) => fingerprint.as_bytes().to_vec(),
            Self::Ed25519(key) => key.to_vec(),
            Self::Unrecognized { data, .. } => data.clone(),
        }
    }

    /// Writes `NSPEC` followed by each `LSTYPE LSLEN LSPEC`
    pub fn encode_list(specifiers: &[LinkSpecifier], out: &mut Vec<u8>) {
        out.push(specifiers.len() as u8);
        for specifier in specifiers {
            let body = specifier.body();
            out.push(specifier.kind());
            out.push(body.len() as u8);
            out.extend_from_slice(&body);
        }
    }

    /// Reads an `NSPEC`-prefixed list, returning it and the bytes consumed
    pub fn decode_list(data: &[u8]) -> Result<(Vec<LinkSpecifier>, usize)> {
        let truncated = || TorError::protocol("truncated link specifier list");
        let count = *data.first().ok_or_else(truncated)? as usize;
        let mut offset = 1;
        let mut specifiers = Vec::with_capacity(count);

        for _ in 0..count {
            let header = data.get(offset..offset + 2).ok_or_else(truncated)?;
            let (kind, len) = (header[0], header[1] as usize);
            let body = data
                .get(offset + 2..offset + 2 + len)
                .ok_or_else(truncated)?;
            offset += 2 + len;

            let specifier = match (kind, len) {
                (0, 6) => Self::Ipv4(SocketAddrV4::new(
                    Ipv4Addr::new(body[0], body[1], body[2], body[3]),
                    u16::from_be_bytes([body[4], body[5]]),
                )),
                (1, 18) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&body[..16]);
                    Self::Ipv6(SocketAddrV6::new(
                        Ipv6Addr::from(octets),
                        u16::from_be_bytes([body[16], body[17]]),
                        0,
                        0,
                    ))
                }
                (2, 20) => Self::LegacyId(Fingerprint::from_slice(body)?),
                (3, 32) => {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(body);
                    Self::Ed25519(key)
                }
                _ => Self::Unrecognized {
                    kind,
                    data: body.to_vec(),
                },
            };
            specifiers.push(specifier);
        }
        Ok((specifiers, offset))
    }
}

/// Everything needed to extend a circuit to one more relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendTarget {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub ntor_onion_key: [u8; 32],
    pub link_specifiers: Vec<LinkSpecifier>,
}

impl ExtendTarget {
    /// A consensus relay plus the ntor key from its server descriptor
    pub fn from_router(router: &OnionRouter, descriptor: &ServerDescriptor) -> Result<Self> {
        let ntor_onion_key = descriptor.ntor_onion_key.ok_or_else(|| {
            TorError::directory(format!("descriptor of {} has no ntor-onion-key", router.name))
        })?;
        Ok(Self {
            name: router.name.clone(),
            fingerprint: router.fingerprint,
            ntor_onion_key,
            link_specifiers: vec![
                LinkSpecifier::Ipv4(SocketAddrV4::new(router.ip, router.or_port)),
                LinkSpecifier::LegacyId(router.fingerprint),
            ],
        })
    }

    /// A relay named only by its link specifiers, as in an onion service descriptor
    pub fn from_link_specifiers(
        link_specifiers: Vec<LinkSpecifier>,
        ntor_onion_key: [u8; 32],
    ) -> Result<Self> {
        let fingerprint = link_specifiers
            .iter()
            .find_map(|spec| match spec {
                LinkSpecifier::LegacyId(fingerprint) => Some(*fingerprint),
                _ => None,
            })
            .ok_or_else(|| TorError::protocol("link specifiers lack a legacy identity"))?;
        Ok(Self {
            name: fingerprint.to_hex(),
            fingerprint,
            ntor_onion_key,
            link_specifiers,
        })
    }

    pub fn ipv4(&self) -> Option<SocketAddrV4> {
        self.link_specifiers.iter().find_map(|spec| match spec {
            LinkSpecifier::Ipv4(addr) => Some(*addr),
            _ => None,
        })
    }
}

/// What the circuit knows about one of its hops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopInfo {
    pub name: String,
    pub fingerprint: Option<Fingerprint>,
    pub ntor_onion_key: Option<[u8; 32]>,
    pub link_specifiers: Vec<LinkSpecifier>,
    /// The end-to-end hop shared with an onion service
    pub is_virtual: bool,
}

impl HopInfo {
    /// First hop, reached directly and keyed with CREATE_FAST
    pub fn from_router(router: &OnionRouter) -> Self {
        Self {
            name: router.name.clone(),
            fingerprint: Some(router.fingerprint),
            ntor_onion_key: None,
            link_specifiers: vec![
                LinkSpecifier::Ipv4(SocketAddrV4::new(router.ip, router.or_port)),
                LinkSpecifier::LegacyId(router.fingerprint),
            ],
            is_virtual: false,
        }
    }

    pub fn from_target(target: &ExtendTarget) -> Self {
        Self {
            name: target.name.clone(),
            fingerprint: Some(target.fingerprint),
            ntor_onion_key: Some(target.ntor_onion_key),
            link_specifiers: target.link_specifiers.clone(),
            is_virtual: false,
        }
    }

    pub fn onion_service(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fingerprint: None,
            ntor_onion_key: None,
            link_specifiers: Vec::new(),
            is_virtual: true,
        }
    }
}

impl fmt::Display for HopInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fingerprint {
            Some(fingerprint) => write!(f, "{} (${})", self.name, fingerprint),
            None => write!(f, "{}", self.name),
        }
    }
}
