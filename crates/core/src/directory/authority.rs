/// Compiled-in directory authorities used to bootstrap
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryAuthority {
    /// Cosmetic; the address and directory port do the work
    pub name: &'static str,
    pub ip: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: u16,
}

impl DirectoryAuthority {
    pub const fn new(name: &'static str, ip: [u8; 4], or_port: u16, dir_port: u16) -> Self {
        Self {
            name,
            ip: Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
            or_port,
            dir_port,
        }
    }

    pub fn dir_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.dir_port))
    }
}

pub const DEFAULT_AUTHORITIES: [DirectoryAuthority; 10] = [
    DirectoryAuthority::new("moria1", [128, 31, 0, 39], 9101, 9131),
    DirectoryAuthority::new("tor26", [217, 196, 147, 77], 443, 80),
    DirectoryAuthority::new("dizum", [45, 66, 35, 11], 443, 80),
    DirectoryAuthority::new("Serge", [66, 111, 2, 131], 9001, 9030),
    DirectoryAuthority::new("gabelmoo", [131, 188, 40, 189], 443, 80),
    DirectoryAuthority::new("dannenberg", [193, 23, 244, 244], 443, 80),
    DirectoryAuthority::new("maatuska", [171, 25, 193, 9], 80, 443),
    DirectoryAuthority::new("longclaw", [199, 58, 81, 140], 443, 80),
    DirectoryAuthority::new("bastet", [204, 13, 164, 118], 443, 80),
    DirectoryAuthority::new("faravahar", [216, 218, 219, 41], 443, 80),
];
