/// A link-protocol channel to a single relay
///
/// Negotiates the link version over the TLS connection, swallows the
/// relay's certificates and auth challenge, answers NETINFO and then moves
/// cells in both directions.
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use minitor_common::config::protocol::LINK_VERSIONS;
use minitor_common::{Result, TorError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::cell::{Cell, CellCommand};
use crate::transport::LinkStream;

pub struct Channel<S = LinkStream> {
    stream: S,
    peer: SocketAddr,
    link_version: u16,
    io_timeout: Duration,
    buffer: Vec<u8>,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs the VERSIONS / CERTS / AUTH_CHALLENGE / NETINFO exchange
    pub async fn handshake(mut stream: S, peer: SocketAddr, io_timeout: Duration) -> Result<Self> {
        let versions = versions_cell();
        write_with_timeout(&mut stream, &versions, io_timeout).await?;

        let mut channel = Self {
            stream,
            peer,
            link_version: 0,
            io_timeout,
            buffer: Vec::with_capacity(4096),
        };

        let offered = channel.read_versions().await?;
        channel.link_version = LINK_VERSIONS
            .iter()
            .copied()
            .filter(|v| offered.contains(v))
            .max()
            .ok_or_else(|| {
                TorError::protocol(format!("no common link version in {offered:?}"))
            })?;
        debug!(
            "Negotiated link version {} with {}",
            channel.link_version, channel.peer
        );

        loop {
            let cell = channel.recv_cell().await?;
            match cell.command {
                CellCommand::Certs | CellCommand::AuthChallenge => {
                    trace!("Received {:?} from {}", cell.command, channel.peer);
                }
                CellCommand::Netinfo => break,
                CellCommand::Padding | CellCommand::Vpadding => {}
                other => {
                    return Err(TorError::protocol(format!(
                        "unexpected {other:?} during link handshake"
                    )));
                }
            }
        }

        let netinfo = Cell::new(0, CellCommand::Netinfo, netinfo_payload(peer.ip()));
        channel.send_cell(&netinfo).await?;
        Ok(channel)
    }

    pub fn link_version(&self) -> u16 {
        self.link_version
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send_cell(&mut self, cell: &Cell) -> Result<()> {
        let bytes = cell.to_bytes()?;
        write_with_timeout(&mut self.stream, &bytes, self.io_timeout).await
    }

    /// Next cell from the relay; padding is returned like any other cell
    pub async fn recv_cell(&mut self) -> Result<Cell> {
        loop {
            if let Some((cell, used)) = Cell::parse(&self.buffer)? {
                self.buffer.drain(..used);
                return Ok(cell);
            }
            self.fill().await?;
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await.map_err(TorError::from)
    }

    /// The relay's VERSIONS cell, which still uses a 2-byte circuit id
    async fn read_versions(&mut self) -> Result<Vec<u16>> {
        while self.buffer.len() < 5 {
            self.fill().await?;
        }
        if self.buffer[2] != CellCommand::Versions.as_u8() {
            return Err(TorError::protocol(format!(
                "expected VERSIONS, got command {}",
                self.buffer[2]
            )));
        }
        let len = u16::from_be_bytes([self.buffer[3], self.buffer[4]]) as usize;
        while self.buffer.len() < 5 + len {
            self.fill().await?;
        }
        let versions = self.buffer[5..5 + len]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.buffer.drain(..5 + len);
        Ok(versions)
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let n = timeout(self.io_timeout, self.stream.read(&mut chunk))
            .await
            .map_err(|_| TorError::Timeout)??;
        if n == 0 {
            return Err(TorError::network(format!(
                "link to {} closed by relay",
                self.peer
            )));
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

async fn write_with_timeout<S>(stream: &mut S, data: &[u8], limit: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    timeout(limit, async {
        stream.write_all(data).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| TorError::Timeout)??;
    Ok(())
}

fn versions_cell() -> Vec<u8> {
    let mut out = vec![0, 0, CellCommand::Versions.as_u8()];
    out.extend_from_slice(&((LINK_VERSIONS.len() * 2) as u16).to_be_bytes());
    for version in LINK_VERSIONS {
        out.extend_from_slice(&version.to_be_bytes());
    }
    out
}

/// Timestamp 0, the relay's address, and no addresses of our own
fn netinfo_payload(peer: IpAddr) -> Vec<u8> {
    let mut payload = vec![0u8; 4];
    match peer {
        IpAddr::V4(ip) => {
            payload.extend_from_slice(&[4, 4]);
            payload.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            payload.extend_from_slice(&[6, 16]);
            payload.extend_from_slice(&ip.octets());
        }
    }
    payload.push(0);
    payload
}
