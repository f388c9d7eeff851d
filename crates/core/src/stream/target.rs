/// Stream targets and the URLs that name them
use crate::service::OnionAddress;
use minitor_common::{Result, TorError};
use std::fmt;
use url::Url;

/// Where a stream should lead once opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    /// Resolved and connected to by the exit relay
    Direct { host: String, port: u16 },

    /// Reached through a rendezvous with the onion service
    Onion {
        address: OnionAddress,
        /// Hostname as given, kept for TLS and `Host`
        host: String,
        port: u16,
    },
}

impl StreamTarget {
    /// Picks the onion path for `.onion` hosts and the exit path otherwise
    pub fn new(host: &str, port: u16) -> Result<Self> {
        if host.is_empty() {
            return Err(TorError::InvalidUrl("empty host".into()));
        }
        if OnionAddress::is_onion_address(host) {
            let address = OnionAddress::from_hostname(host)?;
            return Ok(Self::Onion {
                address,
                host: host.trim_end_matches('.').to_lowercase(),
                port,
            });
        }
        Ok(Self::Direct {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Direct { host, .. } | Self::Onion { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Direct { port, .. } | Self::Onion { port, .. } => *port,
        }
    }

    pub fn is_onion(&self) -> bool {
        matches!(self, Self::Onion { .. })
    }

    /// Address argument of RELAY_BEGIN; onion services only see the port
    pub fn begin_address(&self) -> String {
        match self {
            Self::Direct { host, port } if host.contains(':') => format!("[{host}]:{port}"),
            Self::Direct { host, port } => format!("{host}:{port}"),
            Self::Onion { port, .. } => format!(":{port}"),
        }
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}

/// A parsed `http://` or `https://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub target: StreamTarget,
    pub tls: bool,
    /// Path and query, always starting with `/`
    pub path: String,
}

impl HttpTarget {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| TorError::InvalidUrl(format!("{input}: {e}")))?;
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(TorError::Unsupported(format!("URL scheme {other}")));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| TorError::InvalidUrl(format!("{input}: no host")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TorError::InvalidUrl(format!("{input}: no port")))?;

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            target: StreamTarget::new(host, port)?,
            tls,
            path,
        })
    }

    /// Value of the `Host` header
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.target.port() == default_port {
            self.target.host().to_string()
        } else {
            self.target.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::address::V2_IDENTIFIER_LEN;
    use curve25519_dalek::constants::ED25519_BASEPOINT_COMPRESSED;

    #[test]
    fn https_defaults_to_443() {
        let target = HttpTarget::parse("https://example.com/a/b?c=d").unwrap();
        assert!(target.tls);
        assert_eq!(
            target.target,
            StreamTarget::Direct {
                host: "example.com".into(),
                port: 443
            }
        );
        assert_eq!(target.path, "/a/b?c=d");
        assert_eq!(target.host_header(), "example.com");
        assert_eq!(target.target.begin_address(), "example.com:443");
    }

    #[test]
    fn http_with_explicit_port() {
        let target = HttpTarget::parse("http://example.com:8080").unwrap();
        assert!(!target.tls);
        assert_eq!(target.path, "/");
        assert_eq!(target.host_header(), "example.com:8080");
    }

    #[test]
    fn onion_hosts_take_the_onion_path() {
        let address = OnionAddress::from_public_key(ED25519_BASEPOINT_COMPRESSED.to_bytes());
        let target = HttpTarget::parse(&format!("http://{address}/")).unwrap();
        assert!(target.target.is_onion());
        assert_eq!(target.target.begin_address(), ":80");

        let legacy = StreamTarget::new("abcdefghijklmnop.onion", 80).unwrap();
        match legacy {
            StreamTarget::Onion { address, .. } => {
                assert_eq!(address.identifier().len(), V2_IDENTIFIER_LEN)
            }
            other => panic!("expected onion target, got {other:?}"),
        }
    }

    #[test]
    fn malformed_onion_is_an_invalid_url() {
        assert!(matches!(
            StreamTarget::new("nope.onion", 80),
            Err(TorError::InvalidUrl(_))
        ));
    }

    #[test]
    fn other_schemes_are_unsupported() {
        assert!(matches!(
            HttpTarget::parse("ftp://example.com/"),
            Err(TorError::Unsupported(_))
        ));
        assert!(HttpTarget::parse("not a url").is_err());
    }

    #[test]
    fn ipv6_literal_is_bracketed_for_begin() {
        let target = HttpTarget::parse("http://[2001:db8::1]/").unwrap();
        assert_eq!(target.target.begin_address(), "[2001:db8::1]:80");
    }
}
