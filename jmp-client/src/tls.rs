use jmp_proto::{ProtocolError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Out-of-band token telling the device to switch the socket to TLS.
/// Sent raw, outside the frame grammar.
pub const STARTTLS_TOKEN: &[u8] = b"[STARTTLS]";

/// Pause between sending the token and starting the handshake. Both sides
/// observe the same timing convention; the switch is unacknowledged.
pub const SETTLE_INTERVAL: Duration = Duration::from_millis(200);

/// Upgrades an established socket to TLS.
///
/// No protocol frames may be sent or expected between the token write and
/// handshake completion.
pub async fn upgrade(
    mut stream: TcpStream,
    host: &str,
    accept_invalid_certs: bool,
) -> Result<TlsStream<TcpStream>> {
    info!("upgrading connection to {} to TLS", host);

    stream.write_all(STARTTLS_TOKEN).await?;
    stream.flush().await?;
    tokio::time::sleep(SETTLE_INTERVAL).await;

    let connector = TlsConnector::from(Arc::new(client_config(accept_invalid_certs)));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProtocolError::Tls(format!("invalid server name {}: {}", host, e)))?;

    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProtocolError::Tls(e.to_string()))?;

    debug!("TLS handshake with {} complete", host);
    Ok(tls_stream)
}

fn client_config(accept_invalid_certs: bool) -> ClientConfig {
    if accept_invalid_certs {
        // devices commonly ship self-signed certificates
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Certificate verifier that trusts whatever the device presents.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
