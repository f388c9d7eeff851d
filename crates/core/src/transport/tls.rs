/// TLS client session layered over any `ByteStream`
///
/// Used to reach HTTPS servers through a Tor stream: the handshake and all
/// records travel inside relay DATA cells. Certificates are checked against
/// the Mozilla root store.
use super::ByteStream;
use async_trait::async_trait;
use minitor_common::{Result, TorError};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, RootCertStore};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use tracing::debug;

/// Ciphertext read from the inner stream per refill
const TLS_READ_CHUNK: usize = 8 * 1024;

pub struct TlsStream<S: ByteStream> {
    inner: S,
    conn: ClientConnection,
    eof: bool,
}

impl<S: ByteStream> TlsStream<S> {
    /// Performs the TLS handshake for `host` over `inner`
    pub async fn connect(inner: S, host: &str) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TorError::tls(format!("invalid server name {host:?}: {e}")))?;
        let conn = ClientConnection::new(Arc::new(create_client_config()?), server_name)
            .map_err(|e| TorError::tls(e.to_string()))?;

        let mut stream = Self {
            inner,
            conn,
            eof: false,
        };
        stream.handshake().await?;
        debug!("TLS session with {} established", host);
        Ok(stream)
    }

    async fn handshake(&mut self) -> Result<()> {
        while self.conn.is_handshaking() {
            self.flush_tls().await?;
            if self.conn.is_handshaking() && self.conn.wants_read() && !self.fill_from_inner().await? {
                return Err(TorError::tls("connection closed during handshake"));
            }
        }
        self.flush_tls().await
    }

    /// Sends every pending TLS record to the inner stream
    async fn flush_tls(&mut self) -> Result<()> {
        while self.conn.wants_write() {
            let mut records = Vec::new();
            self.conn.write_tls(&mut records)?;
            self.inner.write_all(&records).await?;
        }
        Ok(())
    }

    /// Feeds one chunk of ciphertext into the session; false at end of stream
    async fn fill_from_inner(&mut self) -> Result<bool> {
        let mut buf = vec![0u8; TLS_READ_CHUNK];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }

        let mut pending = &buf[..n];
        while !pending.is_empty() {
            self.conn.read_tls(&mut pending)?;
            self.conn
                .process_new_packets()
                .map_err(|e| TorError::tls(e.to_string()))?;
        }
        Ok(true)
    }
}

#[async_trait]
impl<S: ByteStream> ByteStream for TlsStream<S> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let result = self.conn.reader().read(buf);
            match result {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if self.eof || !self.fill_from_inner().await? {
                        return Ok(0);
                    }
                    // Replies may carry handshake messages such as session tickets
                    self.flush_tls().await?;
                }
                // Servers commonly close without close_notify
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.conn.writer().write_all(data)?;
        self.flush_tls().await
    }

    async fn close(&mut self) -> Result<()> {
        self.conn.send_close_notify();
        self.flush_tls().await?;
        self.inner.close().await
    }
}

fn create_client_config() -> Result<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TorError::tls(format!("failed to set protocol versions: {e:?}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MemoryStream;

    #[tokio::test]
    async fn handshake_starts_with_client_hello() {
        // Peer closes immediately: the handshake fails after the hello is sent
        let mut inner = MemoryStream::new(Vec::new());
        let result = {
            let stream = TlsStream::connect(&mut inner, "example.com").await;
            stream.map(|_| ())
        };

        assert!(matches!(result, Err(TorError::Tls(_))));
        // TLS handshake record, ClientHello message
        assert_eq!(inner.written[0], 0x16);
        assert_eq!(inner.written[5], 0x01);
    }

    #[tokio::test]
    async fn rejects_invalid_server_name() {
        let result = TlsStream::connect(MemoryStream::new(Vec::new()), "bad host name").await;
        assert!(matches!(result, Err(TorError::Tls(_))));
    }
}
