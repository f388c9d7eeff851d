/// A single relay stream over the client's circuit
///
/// The stream borrows the circuit exclusively, so streams on one circuit
/// are used one after another.
use crate::circuit::OnionCircuit;
use crate::protocol::cell::{RelayCommand, RelayMessage};
use crate::transport::ByteStream;
use async_trait::async_trait;
use minitor_common::config::circuit::STREAM_SENDME_INCREMENT;
use minitor_common::config::protocol::RELAY_DATA_LEN;
use minitor_common::{Result, TorError};
use tracing::debug;

/// END reason sent when the client closes a stream
const END_REASON_DONE: u8 = 6;

pub struct TorStream<'c, C: OnionCircuit + ?Sized> {
    circuit: &'c mut C,
    stream_id: u16,
    pending: Vec<u8>,
    offset: usize,
    /// DATA cells received since the last stream SENDME
    delivered: u32,
    remote_closed: bool,
    local_closed: bool,
}

impl<'c, C: OnionCircuit + ?Sized> TorStream<'c, C> {
    /// RELAY_BEGIN to `address` (`host:port`, or `:port` on an onion service)
    pub async fn begin(circuit: &'c mut C, address: &str) -> Result<Self> {
        let mut body = address.as_bytes().to_vec();
        body.push(0);
        Self::open(circuit, RelayCommand::Begin, body).await
    }

    /// RELAY_BEGIN_DIR to the last hop's directory service
    pub async fn begin_dir(circuit: &'c mut C) -> Result<Self> {
        Self::open(circuit, RelayCommand::BeginDir, Vec::new()).await
    }

    async fn open(circuit: &'c mut C, command: RelayCommand, body: Vec<u8>) -> Result<Self> {
        let stream_id = circuit.allocate_stream_id();
        debug!("Opening stream {} with {:?}", stream_id, command);
        circuit
            .send_relay(RelayMessage::new(command, stream_id, body))
            .await?;

        loop {
            let message = circuit.recv_relay().await?;
            if message.stream_id != stream_id {
                debug!("Ignoring {:?} for stream {}", message.command, message.stream_id);
                continue;
            }
            match message.command {
                RelayCommand::Connected => break,
                RelayCommand::End => {
                    let reason = message.data.first().copied().unwrap_or(0);
                    debug!("Stream {} refused, reason {}", stream_id, reason);
                    return Err(TorError::StreamRefused(reason));
                }
                other => {
                    return Err(TorError::stream(format!(
                        "unexpected {other:?} while opening stream"
                    )));
                }
            }
        }

        Ok(Self {
            circuit,
            stream_id,
            pending: Vec::new(),
            offset: 0,
            delivered: 0,
            remote_closed: false,
            local_closed: false,
        })
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Waits for the next DATA cell; false once the stream has ended
    async fn fill(&mut self) -> Result<bool> {
        while !self.remote_closed {
            let message = self.circuit.recv_relay().await?;
            if message.stream_id != self.stream_id {
                debug!("Ignoring {:?} for stream {}", message.command, message.stream_id);
                continue;
            }
            match message.command {
                RelayCommand::Data => {
                    self.delivered += 1;
                    if self.delivered >= STREAM_SENDME_INCREMENT {
                        self.delivered = 0;
                        self.circuit
                            .send_relay(RelayMessage::new(
                                RelayCommand::Sendme,
                                self.stream_id,
                                Vec::new(),
                            ))
                            .await?;
                    }
                    if message.data.is_empty() {
                        continue;
                    }
                    self.pending = message.data;
                    self.offset = 0;
                    return Ok(true);
                }
                RelayCommand::End => {
                    debug!(
                        "Stream {} ended by peer, reason {}",
                        self.stream_id,
                        message.data.first().copied().unwrap_or(0)
                    );
                    self.remote_closed = true;
                }
                RelayCommand::Sendme => {}
                other => debug!("Ignoring {:?} on stream {}", other, self.stream_id),
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl<'c, C: OnionCircuit + ?Sized> ByteStream for TorStream<'c, C> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.offset >= self.pending.len() && !self.fill().await? {
            return Ok(0);
        }
        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.local_closed || self.remote_closed {
            return Err(TorError::stream("write on closed stream"));
        }
        for chunk in data.chunks(RELAY_DATA_LEN) {
            self.circuit
                .send_relay(RelayMessage::new(
                    RelayCommand::Data,
                    self.stream_id,
                    chunk.to_vec(),
                ))
                .await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.local_closed {
            return Ok(());
        }
        self.local_closed = true;
        if self.remote_closed {
            return Ok(());
        }
        self.circuit
            .send_relay(RelayMessage::new(
                RelayCommand::End,
                self.stream_id,
                vec![END_REASON_DONE],
            ))
            .await
    }
}
