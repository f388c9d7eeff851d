/// TLS link to a relay's OR port
///
/// Relays present self-signed link certificates, so the TLS layer accepts
/// any certificate; the link is only used to carry cells.
use minitor_common::{Result, TorError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// TLS session carrying the cells of one channel
pub type LinkStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Open a TCP connection to `addr` and complete the TLS handshake
pub async fn connect_relay_link(addr: SocketAddr, connect_timeout: Duration) -> Result<LinkStream> {
    let connector = TlsConnector::from(Arc::new(create_link_config()?));

    let tcp = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TorError::Timeout)?
        .map_err(|e| TorError::network(format!("connect to {addr} failed: {e}")))?;
    tcp.set_nodelay(true)?;

    let server_name = ServerName::IpAddress(addr.ip().into());
    timeout(connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| TorError::Timeout)?
        .map_err(|e| TorError::tls(format!("link handshake with {addr} failed: {e}")))
}

/// Client configuration that accepts any relay certificate
fn create_link_config() -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(RelayLinkVerifier {
        schemes: provider
            .signature_verification_algorithms
            .supported_schemes(),
    });
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TorError::tls(format!("no usable protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

/// Relay link certificates are self-signed; identity is not checked here
#[derive(Debug)]
struct RelayLinkVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for RelayLinkVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_config_offers_provider_schemes() {
        let config = create_link_config().unwrap();
        assert!(config.alpn_protocols.is_empty());
        let provider = rustls::crypto::ring::default_provider();
        let schemes = provider.signature_verification_algorithms.supported_schemes();
        assert!(schemes.contains(&SignatureScheme::ED25519));
    }
}
