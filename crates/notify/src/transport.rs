//! Seams between connections, the wire, and inbound dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use proto::{Envelope, Metadata, TransportError};

/// Client able to open a bidirectional notify stream to one peer.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Opens a new stream, attaching `metadata` to it.
    async fn notify(&self, metadata: &Metadata) -> Result<Arc<dyn NotifyStream>, TransportError>;
}

/// One open bidirectional stream.
///
/// Both halves take `&self` so the send and receive pumps can share a handle.
#[async_trait]
pub trait NotifyStream: Send + Sync {
    /// Writes one envelope.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Reads the next envelope, waiting until one arrives or the stream fails.
    async fn recv(&self) -> Result<Envelope, TransportError>;
}

/// Destination for successful inbound envelopes.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn deliver(&self, msg_id: u32, payload: Vec<u8>);
}
