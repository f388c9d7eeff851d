/// Network-status consensus parser
///
/// Parsing is best effort: a router entry that cannot be fully interpreted
/// is skipped and the rest of the document is still used.
use super::decode_base64;
use super::router::{OnionRouter, RouterFlags};
use minitor_common::{DomainError, Fingerprint, Timestamp};
use std::net::Ipv4Addr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusFlavor {
    Ns,
    Microdesc,
}

#[derive(Debug, Clone, Default)]
pub struct ConsensusDocument {
    pub flavor: Option<ConsensusFlavor>,
    pub valid_after: Option<Timestamp>,
    pub fresh_until: Option<Timestamp>,
    pub valid_until: Option<Timestamp>,
    pub shared_rand_current: Option<[u8; 32]>,
    pub shared_rand_previous: Option<[u8; 32]>,
    pub routers: Vec<OnionRouter>,
    /// Router entries dropped because they were malformed
    pub skipped_entries: usize,
}

impl ConsensusDocument {
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();
        let mut pending: Option<OnionRouter> = None;

        for line in text.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let Some(&keyword) = tokens.first() else {
                continue;
            };

            match keyword {
                "network-status-version" => {
                    doc.flavor = Some(if tokens.get(2) == Some(&"microdesc") {
                        ConsensusFlavor::Microdesc
                    } else {
                        ConsensusFlavor::Ns
                    });
                }
                "valid-after" => doc.valid_after = parse_time_line(&tokens),
                "fresh-until" => doc.fresh_until = parse_time_line(&tokens),
                "valid-until" => doc.valid_until = parse_time_line(&tokens),
                "shared-rand-current-value" => doc.shared_rand_current = parse_srv_line(&tokens),
                "shared-rand-previous-value" => doc.shared_rand_previous = parse_srv_line(&tokens),
                "r" => {
                    doc.routers.extend(pending.take());
                    match parse_router_line(&tokens) {
                        Ok(router) => pending = Some(router),
                        Err(err) => {
                            debug!("Skipping consensus entry: {}", err);
                            doc.skipped_entries += 1;
                        }
                    }
                }
                "s" => {
                    if let Some(router) = pending.as_mut() {
                        router.flags = RouterFlags::from_keywords(tokens[1..].iter().copied());
                    }
                }
                "directory-footer" => break,
                _ => {}
            }
        }

        doc.routers.extend(pending.take());
        doc
    }

    /// A cached document is usable while `now` has not passed `valid-until`
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        self.valid_until.is_some_and(|until| until >= now)
    }
}

fn parse_time_line(tokens: &[&str]) -> Option<Timestamp> {
    if tokens.len() < 3 {
        return None;
    }
    Timestamp::parse_directory_time(&format!("{} {}", tokens[1], tokens[2])).ok()
}

fn parse_srv_line(tokens: &[&str]) -> Option<[u8; 32]> {
    let value = decode_base64(tokens.get(2)?).ok()?;
    value.try_into().ok()
}

/// `r` line: nine fields for `ns`, eight for microdescriptor consensuses
fn parse_router_line(tokens: &[&str]) -> Result<OnionRouter, DomainError> {
    let (name, identity, ip, or_port, dir_port) = match tokens.len() {
        9 => (tokens[1], tokens[2], tokens[6], tokens[7], tokens[8]),
        8 => (tokens[1], tokens[2], tokens[5], tokens[6], tokens[7]),
        n => {
            return Err(DomainError::MalformedEntry(format!(
                "router line has {n} fields"
            )))
        }
    };

    let fingerprint = Fingerprint::from_slice(&decode_base64(identity)?)?;
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| DomainError::MalformedEntry(format!("bad address {ip:?}")))?;
    let or_port = parse_port(or_port)?;
    let dir_port = parse_port(dir_port)?;

    Ok(OnionRouter::new(
        fingerprint,
        name,
        ip,
        or_port,
        dir_port,
        RouterFlags::empty(),
    ))
}

fn parse_port(value: &str) -> Result<u16, DomainError> {
    value
        .parse()
        .map_err(|_| DomainError::MalformedEntry(format!("bad port {value:?}")))
}
