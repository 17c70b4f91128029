//! QUIC peer server for the notify protocol.
//!
//! Plays the remote end of [`crate::QuicProxyClient`]: accepts connections,
//! reads the metadata frame of each stream, and hands every inbound envelope
//! to a [`PeerHandler`] whose replies are written back on the same stream.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use proto::{Envelope, Metadata, TransportError};
use quinn::Endpoint;
use rustls::pki_types::CertificateDer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::session::PeerSession;
use crate::tls::{generate_self_signed, load_certs_pem, load_key_pem, server_config};

/// Async callback answering one inbound envelope with zero or more replies.
///
/// Receives the metadata the client attached to the stream.
pub type PeerHandler = Arc<
    dyn Fn(Metadata, Envelope) -> Pin<Box<dyn Future<Output = Vec<Envelope>> + Send>>
        + Send
        + Sync,
>;

/// QUIC server that accepts notify streams and spawns peer sessions.
pub struct ProxyServer {
    endpoint: Endpoint,
    handler: PeerHandler,
    certificate: Option<(CertificateDer<'static>, String)>,
}

impl ProxyServer {
    /// Create a server with an auto-generated self-signed certificate.
    ///
    /// Clients must trust [`ProxyServer::certificate`] to connect.
    pub fn new_self_signed(addr: SocketAddr, handler: PeerHandler) -> Result<Self, TransportError> {
        let generated = generate_self_signed()?;
        let config = server_config(vec![generated.cert.clone()], generated.key)?;
        let endpoint = Endpoint::server(config, addr)
            .map_err(|e| TransportError::Other(e.to_string()))?;

        info!("Notify server listening on {addr}");
        Ok(Self {
            endpoint,
            handler,
            certificate: Some((generated.cert, generated.cert_pem)),
        })
    }

    /// Create a server with provided PEM cert and key.
    pub fn new_with_certs(
        addr: SocketAddr,
        cert_pem: &[u8],
        key_pem: &[u8],
        handler: PeerHandler,
    ) -> Result<Self, TransportError> {
        let certs = load_certs_pem(cert_pem)?;
        let key = load_key_pem(key_pem)?;
        let config = server_config(certs, key)?;
        let endpoint = Endpoint::server(config, addr)
            .map_err(|e| TransportError::Other(e.to_string()))?;

        info!("Notify server listening on {addr} (custom cert)");
        Ok(Self {
            endpoint,
            handler,
            certificate: None,
        })
    }

    /// Generated certificate, for self-signed servers.
    pub fn certificate(&self) -> Option<&CertificateDer<'static>> {
        self.certificate.as_ref().map(|(der, _)| der)
    }

    /// PEM form of [`ProxyServer::certificate`].
    pub fn certificate_pem(&self) -> Option<&str> {
        self.certificate.as_ref().map(|(_, pem)| pem.as_str())
    }

    /// Local address the server is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Accept loop: runs until `cancel` fires, then closes the endpoint.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Notify server accept loop started");
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => {
                    self.endpoint.close(0u32.into(), b"shutdown");
                    info!("Notify server stopped");
                    break;
                }
                incoming = self.endpoint.accept() => incoming,
            };

            let Some(incoming) = incoming else {
                info!("QUIC endpoint closed");
                break;
            };

            let handler = self.handler.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        info!("New notify connection from {remote}");
                        let session = PeerSession::new(conn, handler);
                        if let Err(e) = session.run().await {
                            warn!("Session error from {remote}: {e}");
                        }
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {e}");
                    }
                }
            });
        }
    }
}

/// Wraps an async closure as a [`PeerHandler`].
pub fn peer_handler<F, Fut>(f: F) -> PeerHandler
where
    F: Fn(Metadata, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<Envelope>> + Send + 'static,
{
    Arc::new(move |metadata, envelope| Box::pin(f(metadata, envelope)))
}
