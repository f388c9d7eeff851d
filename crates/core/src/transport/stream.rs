use super::ByteStream;
use async_trait::async_trait;
use minitor_common::{Result, TorError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Plain TCP connection with per-operation timeouts
pub struct TcpTransport {
    inner: TcpStream,
    io_timeout: Duration,
}

impl TcpTransport {
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        let inner = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TorError::Timeout)?
            .map_err(|e| TorError::network(format!("connect to {addr} failed: {e}")))?;
        inner.set_nodelay(true)?;

        Ok(Self { inner, io_timeout })
    }
}

#[async_trait]
impl ByteStream for TcpTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        timeout(self.io_timeout, self.inner.read(buf))
            .await
            .map_err(|_| TorError::Timeout)?
            .map_err(TorError::from)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        timeout(self.io_timeout, self.inner.write_all(data))
            .await
            .map_err(|_| TorError::Timeout)?
            .map_err(TorError::from)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_transport_exchanges_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"pong").await.unwrap();
            buf
        });

        let mut transport =
            TcpTransport::connect(addr, Duration::from_secs(5), Duration::from_secs(5))
                .await
                .unwrap();
        transport.write_all(b"ping").await.unwrap();
        let mut reply = Vec::new();
        transport.read_to_end(&mut reply, 64).await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
        assert_eq!(reply, b"pong");
    }
}
