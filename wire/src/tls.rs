// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::LinkError;

/// Managers routinely run with self-signed certificates: the password exchange, not the
/// certificate chain, is what authenticates the two sides. This verifier accepts any
/// certificate while still getting transport encryption.
#[derive(Debug)]
struct AcceptAnyCertificate(rustls::crypto::CryptoProvider);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A client configuration that encrypts but does not verify the peer certificate.
pub fn permissive_client_config() -> Arc<ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Arc::new(config)
}

/// A client configuration that verifies the peer against the given PEM bundle.
pub fn verifying_client_config(ca_pem_path: &std::path::Path) -> Result<Arc<ClientConfig>, String> {
    let pem = std::fs::read(ca_pem_path)
        .map_err(|e| format!("failed to read {}: {e}", ca_pem_path.display()))?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| format!("bad certificate in {}: {e}", ca_pem_path.display()))?;
        roots
            .add(cert)
            .map_err(|e| format!("rejected certificate in {}: {e}", ca_pem_path.display()))?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Upgrade a freshly connected TCP stream to TLS, bounded by the deadline.
pub async fn wrap_connect(
    config: Arc<ClientConfig>,
    host: &str,
    stream: TcpStream,
    stop: Instant,
) -> Result<TlsStream<TcpStream>, LinkError> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| LinkError::Protocol(format!("invalid tls server name: {host}")))?;
    let connector = TlsConnector::from(config);
    tokio::time::timeout_at(stop, connector.connect(server_name, stream))
        .await
        .map_err(|_| LinkError::Timeout)?
        .map_err(LinkError::Io)
}
