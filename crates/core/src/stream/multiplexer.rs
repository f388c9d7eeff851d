/// Opens application streams over the client's circuit
///
/// Direct targets go through the exit with RELAY_BEGIN. Onion targets
/// first join the circuit to the service through an `OnionResolver`, then
/// BEGIN on the service's virtual hop. Either kind can be wrapped in TLS.
use super::target::{HttpTarget, StreamTarget};
use super::tor_stream::TorStream;
use crate::circuit::OnionCircuit;
use crate::service::OnionAddress;
use crate::transport::{ByteStream, HttpRequest, HttpResponse, TlsStream};
use async_trait::async_trait;
use minitor_common::config::directory::MAX_DOCUMENT_SIZE;
use minitor_common::{Result, TorError};
use tracing::{debug, info, warn};

/// Joins a circuit to an onion service
#[async_trait]
pub trait OnionResolver: Send {
    /// On success the circuit ends in a virtual hop shared with the service
    async fn rendezvous(
        &mut self,
        circuit: &mut dyn OnionCircuit,
        address: &OnionAddress,
    ) -> Result<()>;
}

/// A stream as handed to the application
pub enum AppStream<'c, C: OnionCircuit + ?Sized> {
    Plain(TorStream<'c, C>),
    Tls(Box<TlsStream<TorStream<'c, C>>>),
}

impl<C: OnionCircuit + ?Sized> AppStream<'_, C> {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

#[async_trait]
impl<'c, C: OnionCircuit + ?Sized> ByteStream for AppStream<'c, C> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await,
            Self::Tls(stream) => stream.write_all(data).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.close().await,
            Self::Tls(stream) => stream.close().await,
        }
    }
}

/// Pairs the circuit with whatever resolves onion addresses for it
///
/// Each call consumes the multiplexer; the stream it returns keeps the
/// circuit borrowed until it is dropped.
pub struct StreamMultiplexer<'c, 'r, C: OnionCircuit> {
    circuit: &'c mut C,
    resolver: &'r mut dyn OnionResolver,
}

impl<'c, 'r, C: OnionCircuit> StreamMultiplexer<'c, 'r, C> {
    pub fn new(circuit: &'c mut C, resolver: &'r mut dyn OnionResolver) -> Self {
        Self { circuit, resolver }
    }

    /// Opens a stream to `target`, wrapped in TLS when `tls` is set
    pub async fn open_stream(self, target: &StreamTarget, tls: bool) -> Result<AppStream<'c, C>> {
        let stream = self.open_plain(target).await?;
        if !tls {
            return Ok(AppStream::Plain(stream));
        }
        let stream = TlsStream::connect(stream, target.host()).await?;
        Ok(AppStream::Tls(Box::new(stream)))
    }

    async fn open_plain(self, target: &StreamTarget) -> Result<TorStream<'c, C>> {
        if self.circuit.hop_count() == 0 {
            return Err(TorError::CircuitNotEstablished);
        }
        if let StreamTarget::Onion { address, .. } = target {
            info!("Connecting to onion service {}", address);
            self.resolver.rendezvous(&mut *self.circuit, address).await?;
        }
        debug!("Opening stream to {}", target);
        TorStream::begin(self.circuit, &target.begin_address()).await
    }

    /// GET `url` over a fresh stream
    ///
    /// Any status is a response; only a failed stage is an error.
    pub async fn http_get(self, url: &str) -> Result<HttpResponse> {
        let target = HttpTarget::parse(url).map_err(|err| {
            warn!("Cannot parse URL {}: {}", url, err);
            err
        })?;
        let request = HttpRequest::get(target.host_header(), target.path.clone())
            .with_header("Accept", "*/*");

        let plain = self.open_plain(&target.target).await.map_err(|err| {
            warn!("Failed to open stream to {}: {}", target.target, err);
            err
        })?;
        let mut stream = if target.tls {
            let tls = TlsStream::connect(plain, target.target.host())
                .await
                .map_err(|err| {
                    warn!("TLS handshake with {} failed: {}", target.target.host(), err);
                    err
                })?;
            AppStream::Tls(Box::new(tls))
        } else {
            AppStream::Plain(plain)
        };

        if let Err(err) = stream.write_all(&request.to_bytes()).await {
            warn!("Failed to send request to {}: {}", target.target, err);
            return Err(err);
        }
        let mut raw = Vec::new();
        if let Err(err) = stream.read_to_end(&mut raw, MAX_DOCUMENT_SIZE).await {
            warn!("Failed to read response from {}: {}", target.target, err);
            return Err(err);
        }
        if let Err(err) = stream.close().await {
            debug!("Error closing stream: {}", err);
        }

        HttpResponse::parse(&raw).map_err(|err| {
            warn!("Malformed response from {}: {}", target.target, err);
            err
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingResolver;
    use super::*;
    use crate::circuit::testing::{CircuitLog, MockCircuit};
    use crate::circuit::HopInfo;
    use crate::directory::{OnionRouter, RouterFlags};
    use crate::protocol::cell::RelayCommand;
    use curve25519_dalek::constants::ED25519_BASEPOINT_COMPRESSED;
    use minitor_common::Fingerprint;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    fn circuit() -> (MockCircuit, Arc<Mutex<CircuitLog>>) {
        let log = Arc::new(Mutex::new(CircuitLog::default()));
        let exit = OnionRouter::new(
            Fingerprint::from_bytes([3; 20]),
            "exit",
            Ipv4Addr::new(10, 0, 0, 3),
            9001,
            0,
            RouterFlags::EXIT,
        );
        (MockCircuit::new(HopInfo::from_router(&exit), log.clone()), log)
    }

    #[tokio::test]
    async fn plain_http_sends_request_bytes_first() {
        let (mut circuit, log) = circuit();
        circuit.reply(RelayCommand::Connected, 1, &[]);
        circuit.reply(
            RelayCommand::Data,
            1,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi",
        );
        circuit.reply(RelayCommand::End, 1, &[6]);

        let mut resolver = RecordingResolver::default();
        let mux = StreamMultiplexer::new(&mut circuit, &mut resolver);
        let response = mux.http_get("http://example.com/index.html").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hi");

        let log = log.lock().unwrap();
        assert_eq!(log.sent[0].command, RelayCommand::Begin);
        assert_eq!(log.sent[0].data, b"example.com:80\0");
        assert_eq!(log.sent[1].command, RelayCommand::Data);
        assert!(log.sent[1].data.starts_with(b"GET /index.html HTTP/1.1\r\n"));
        assert!(resolver.requested.is_empty());
    }

    #[tokio::test]
    async fn https_starts_with_tls_handshake() {
        let (mut circuit, log) = circuit();
        circuit.reply(RelayCommand::Connected, 1, &[]);
        circuit.reply(RelayCommand::End, 1, &[6]);

        let mut resolver = RecordingResolver::default();
        let mux = StreamMultiplexer::new(&mut circuit, &mut resolver);
        assert!(mux.http_get("https://example.com/").await.is_err());

        let log = log.lock().unwrap();
        assert_eq!(log.sent[0].data, b"example.com:443\0");
        // first application byte is a TLS handshake record, not HTTP
        assert_eq!(log.sent[1].command, RelayCommand::Data);
        assert_eq!(log.sent[1].data[0], 0x16);
    }

    #[tokio::test]
    async fn onion_targets_rendezvous_before_begin() {
        let address = OnionAddress::from_public_key(ED25519_BASEPOINT_COMPRESSED.to_bytes());
        let hosts = [address.to_hostname(), "abcdefghijklmnop.onion".to_string()];

        for host in hosts {
            let (mut circuit, log) = circuit();
            circuit.reply(RelayCommand::Connected, 1, &[]);
            let mut resolver = RecordingResolver::default();
            let target = StreamTarget::new(&host, 80).unwrap();

            let mux = StreamMultiplexer::new(&mut circuit, &mut resolver);
            let stream = mux.open_stream(&target, false).await.unwrap();
            assert!(!stream.is_tls());
            drop(stream);

            assert_eq!(resolver.requested.len(), 1);
            assert_eq!(resolver.requested[0].to_hostname(), host);
            let log = log.lock().unwrap();
            assert_eq!(log.sent.len(), 1);
            assert_eq!(log.sent[0].data, b":80\0");
        }
    }

    #[tokio::test]
    async fn failed_rendezvous_fails_the_stream() {
        let (mut circuit, log) = circuit();
        let mut resolver = RecordingResolver {
            refuse: true,
            ..Default::default()
        };
        let mux = StreamMultiplexer::new(&mut circuit, &mut resolver);
        let address = OnionAddress::from_public_key(ED25519_BASEPOINT_COMPRESSED.to_bytes());
        let url = format!("http://{address}/");
        assert!(mux.http_get(&url).await.is_err());
        assert!(log.lock().unwrap().sent.is_empty());
    }

    #[tokio::test]
    async fn empty_circuit_cannot_open_streams() {
        let (mut circuit, _) = circuit();
        circuit.hops.clear();
        let mut resolver = RecordingResolver::default();
        let mux = StreamMultiplexer::new(&mut circuit, &mut resolver);
        let target = StreamTarget::new("example.com", 80).unwrap();
        assert!(matches!(
            mux.open_stream(&target, false).await.err(),
            Some(TorError::CircuitNotEstablished)
        ));
    }
}
