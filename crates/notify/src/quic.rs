//! QUIC-backed [`ProxyClient`].
//!
//! Every [`ProxyClient::notify`] call dials a fresh connection and opens one
//! bidirectional stream on it. The stream starts with a metadata frame, then
//! carries envelope frames in both directions (see [`crate::codec`]).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use proto::{Envelope, Metadata, TransportError};
use quinn::{Endpoint, RecvStream, SendStream};
use rustls::pki_types::CertificateDer;
use tokio::sync::Mutex;
use tracing::debug;

use crate::codec::{encode_metadata, read_envelope, write_envelope, write_frame};
use crate::tls::{client_config, load_certs_pem};
use crate::transport::{NotifyStream, ProxyClient};

/// Dials one peer over QUIC, trusting an explicit set of root certificates.
pub struct QuicProxyClient {
    endpoint: Endpoint,
    addr: SocketAddr,
    server_name: String,
}

impl QuicProxyClient {
    /// Creates a client for `addr`, validating the peer as `server_name`.
    pub fn new(
        addr: SocketAddr,
        server_name: impl Into<String>,
        roots: Vec<CertificateDer<'static>>,
    ) -> Result<Self, TransportError> {
        let config = client_config(roots)?;
        let bind = if addr.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let mut endpoint =
            Endpoint::client(bind).map_err(|e| TransportError::Other(e.to_string()))?;
        endpoint.set_default_client_config(config);

        Ok(Self {
            endpoint,
            addr,
            server_name: server_name.into(),
        })
    }

    /// Like [`QuicProxyClient::new`], reading the roots from a PEM bundle.
    pub fn from_pem(
        addr: SocketAddr,
        server_name: impl Into<String>,
        ca_pem: &[u8],
    ) -> Result<Self, TransportError> {
        Self::new(addr, server_name, load_certs_pem(ca_pem)?)
    }

    /// Peer address this client dials.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl ProxyClient for QuicProxyClient {
    async fn notify(&self, metadata: &Metadata) -> Result<Arc<dyn NotifyStream>, TransportError> {
        let connecting = self
            .endpoint
            .connect(self.addr, &self.server_name)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let conn = connecting.await.map_err(map_connection_error)?;
        let (mut send, recv) = conn.open_bi().await.map_err(map_connection_error)?;

        // The peer only learns about the stream once bytes arrive.
        write_frame(&mut send, &encode_metadata(metadata)?).await?;
        debug!(remote = %self.addr, "Notify stream opened");

        Ok(Arc::new(QuicNotifyStream {
            _conn: conn,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
        }))
    }
}

fn map_connection_error(err: quinn::ConnectionError) -> TransportError {
    match err {
        quinn::ConnectionError::VersionMismatch | quinn::ConnectionError::TransportError(_) => {
            TransportError::Other(err.to_string())
        }
        _ => TransportError::Unavailable(err.to_string()),
    }
}

struct QuicNotifyStream {
    // keeps the connection open for as long as the stream is in use
    _conn: quinn::Connection,
    send: Mutex<SendStream>,
    recv: Mutex<RecvStream>,
}

#[async_trait]
impl NotifyStream for QuicNotifyStream {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut send = self.send.lock().await;
        write_envelope(&mut *send, envelope).await
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        let mut recv = self.recv.lock().await;
        read_envelope(&mut *recv).await
    }
}
