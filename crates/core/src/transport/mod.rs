/// Byte-stream transports
///
/// Everything above this layer talks to a `ByteStream`: a raw TCP
/// connection, a stream multiplexed over a Tor circuit, or a TLS session
/// layered on either of them.
mod endpoint;
pub mod http;
mod stream;
pub mod tls;

pub use endpoint::{connect_relay_link, LinkStream};
pub use http::{HttpRequest, HttpResponse};
pub use stream::TcpTransport;
pub use tls::TlsStream;

use async_trait::async_trait;
use minitor_common::{Result, TorError};

#[async_trait]
pub trait ByteStream: Send {
    /// Reads into `buf`, returning 0 at end of stream
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Reads until end of stream or until `limit` bytes have arrived
    async fn read_to_end(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<usize> {
        let start = out.len();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out.len() - start);
            }
            out.extend_from_slice(&buf[..n]);
            if out.len() - start > limit {
                return Err(TorError::network(format!(
                    "response exceeds {limit} bytes"
                )));
            }
        }
    }
}

#[async_trait]
impl<S: ByteStream + ?Sized> ByteStream for &mut S {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_all(data).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}
