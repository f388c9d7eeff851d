/// Onion router records as published in the consensus
use bitflags::bitflags;
use minitor_common::Fingerprint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

bitflags! {
    /// Status flags assigned by the directory authorities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RouterFlags: u16 {
        const AUTHORITY = 1 << 0;
        const BAD_EXIT = 1 << 1;
        const EXIT = 1 << 2;
        const FAST = 1 << 3;
        const GUARD = 1 << 4;
        const HSDIR = 1 << 5;
        const NO_ED_CONSENSUS = 1 << 6;
        const RUNNING = 1 << 7;
        const STABLE = 1 << 8;
        const STALE_DESC = 1 << 9;
        const V2DIR = 1 << 10;
        const VALID = 1 << 11;
        const MIDDLE_ONLY = 1 << 12;
        const SYBIL = 1 << 13;
    }
}

const FLAG_NAMES: [(&str, RouterFlags); 14] = [
    ("Authority", RouterFlags::AUTHORITY),
    ("BadExit", RouterFlags::BAD_EXIT),
    ("Exit", RouterFlags::EXIT),
    ("Fast", RouterFlags::FAST),
    ("Guard", RouterFlags::GUARD),
    ("HSDir", RouterFlags::HSDIR),
    ("NoEdConsensus", RouterFlags::NO_ED_CONSENSUS),
    ("Running", RouterFlags::RUNNING),
    ("Stable", RouterFlags::STABLE),
    ("StaleDesc", RouterFlags::STALE_DESC),
    ("V2Dir", RouterFlags::V2DIR),
    ("Valid", RouterFlags::VALID),
    ("MiddleOnly", RouterFlags::MIDDLE_ONLY),
    ("Sybil", RouterFlags::SYBIL),
];

impl RouterFlags {
    /// Flag for a consensus `s` line keyword
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        FLAG_NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(keyword))
            .map(|(_, flag)| *flag)
    }

    /// Parses the keywords of an `s` line, ignoring unknown flags
    pub fn from_keywords<'a>(keywords: impl IntoIterator<Item = &'a str>) -> Self {
        keywords
            .into_iter()
            .filter_map(Self::from_keyword)
            .fold(Self::empty(), |acc, flag| acc | flag)
    }

    /// Every bit of `required` is set (AND semantics)
    pub fn satisfies(&self, required: RouterFlags) -> bool {
        (*self & required) == required
    }

    pub fn keywords(&self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl fmt::Display for RouterFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keywords().join(" "))
    }
}

/// A relay listed in the consensus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionRouter {
    /// Identity digest, the registry key
    pub fingerprint: Fingerprint,

    /// Nickname; display only, not unique
    pub name: String,

    pub ip: Ipv4Addr,

    pub or_port: u16,

    /// Zero when the relay does not serve directory requests
    pub dir_port: u16,

    pub flags: RouterFlags,
}

impl OnionRouter {
    pub fn new(
        fingerprint: Fingerprint,
        name: impl Into<String>,
        ip: Ipv4Addr,
        or_port: u16,
        dir_port: u16,
        flags: RouterFlags,
    ) -> Self {
        Self {
            fingerprint,
            name: name.into(),
            ip,
            or_port,
            dir_port,
            flags,
        }
    }

    pub fn or_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.or_port))
    }

    pub fn dir_addr(&self) -> Option<SocketAddr> {
        (self.dir_port != 0).then(|| SocketAddr::V4(SocketAddrV4::new(self.ip, self.dir_port)))
    }
}

impl fmt::Display for OnionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.ip, self.or_port)
    }
}
