//! mTLS listener support
//!
//! The second port serves the same router over TLS and *requests* (does not
//! require) a client certificate. The acceptor copies whatever certificate
//! the peer presented into a request extension, where the token-exchange
//! handler can verify it against the CA.

use std::io;
use std::sync::Arc;

use axum::middleware::AddExtension;
use axum::Extension;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;

use crate::ca::{CertificateAuthority, IssuedCertificate};
use crate::errors::{RegistryError, Result};

/// DER client certificates presented during the handshake; empty when the
/// peer sent none.
#[derive(Clone, Default)]
pub struct PeerCertificates(pub Arc<Vec<Vec<u8>>>);

impl PeerCertificates {
    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(Vec::as_slice)
    }
}

/// rustls config for the mTLS port: our own server certificate, client
/// certificates requested against the CA trust anchors but anonymous peers
/// admitted (they simply cannot exchange certificates for tokens). The ring
/// provider is selected explicitly; dependency features may put more than one
/// provider in the graph.
pub fn build_server_config(
    ca: &CertificateAuthority,
    server_cert: &IssuedCertificate,
) -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca.ca_chain_pem().as_bytes()) {
        let cert = cert.map_err(|e| RegistryError::Certificate(format!("ca chain: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| RegistryError::Certificate(format!("trust anchor: {e}")))?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(|e| RegistryError::Certificate(format!("client verifier: {e}")))?;

    let chain_pem = format!("{}{}", server_cert.cert_pem, ca.ca_chain_pem());
    let certs = rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| RegistryError::Certificate(format!("server chain: {e}")))?;
    let key = rustls_pemfile::private_key(&mut server_cert.key_pem.as_bytes())
        .map_err(|e| RegistryError::Certificate(format!("server key: {e}")))?
        .ok_or_else(|| RegistryError::Certificate("no server key in PEM".into()))?;

    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| RegistryError::Certificate(format!("tls versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| RegistryError::Certificate(format!("tls config: {e}")))
}

/// TLS acceptor that exposes the handshake's peer certificates to handlers.
#[derive(Clone)]
pub struct MtlsAcceptor {
    inner: RustlsAcceptor,
}

impl MtlsAcceptor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(config))),
        }
    }
}

impl<I, S> Accept<I, S> for MtlsAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCertificates>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let certs = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default();
            let service = Extension(PeerCertificates(Arc::new(certs))).layer(service);
            Ok((stream, service))
        })
    }
}
