use crate::transport::{http, ByteStream, HttpRequest, TcpTransport};
use async_trait::async_trait;
use minitor_common::config::directory::MAX_DOCUMENT_SIZE;
use minitor_common::{Result, TorError};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// Fetches directory documents from a directory port
#[async_trait]
pub trait DirectoryFetcher: Send + Sync {
    /// Body of `GET path` from `addr`; compressed bodies are inflated
    async fn fetch(&self, addr: SocketAddr, path: &str) -> Result<Vec<u8>>;
}

/// Plain HTTP over TCP to a directory port
#[derive(Debug, Clone)]
pub struct HttpDirectoryFetcher {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl HttpDirectoryFetcher {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl DirectoryFetcher for HttpDirectoryFetcher {
    async fn fetch(&self, addr: SocketAddr, path: &str) -> Result<Vec<u8>> {
        debug!("Fetching http://{}{}", addr, path);
        let mut stream = TcpTransport::connect(addr, self.connect_timeout, self.io_timeout).await?;
        let request = HttpRequest::directory(addr.ip().to_string(), path);
        let response = http::fetch(&mut stream, &request, MAX_DOCUMENT_SIZE).await;
        // The response is complete; a failed shutdown changes nothing
        let _ = stream.close().await;
        directory_body(path, response?)
    }
}

/// Checks the status and undoes `.z` compression when the server did not
/// label it with `Content-Encoding`
pub fn directory_body(path: &str, response: http::HttpResponse) -> Result<Vec<u8>> {
    if response.status != 200 {
        return Err(TorError::directory(format!(
            "{path}: HTTP {} {}",
            response.status, response.reason
        )));
    }
    let labelled = response.header("Content-Encoding").is_some();
    // 0x78 is the zlib header byte
    if path.ends_with(".z") && !labelled && response.body.first() == Some(&0x78) {
        return http::inflate_zlib(&response.body);
    }
    Ok(response.body)
}
