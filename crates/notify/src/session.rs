//! Per-connection QUIC session handling on the peer side.

use proto::TransportError;
use quinn::Connection;
use tracing::{debug, error, info};

use crate::codec::{decode_metadata, read_envelope, read_frame, write_envelope};
use crate::server::PeerHandler;

/// Manages a single QUIC connection from a notify client
pub struct PeerSession {
    conn: Connection,
    handler: PeerHandler,
}

impl PeerSession {
    pub fn new(conn: Connection, handler: PeerHandler) -> Self {
        Self { conn, handler }
    }

    /// Run the session: accept streams until the client goes away.
    pub async fn run(self) -> Result<(), TransportError> {
        let remote = self.conn.remote_address();
        info!("PeerSession started for {remote}");

        loop {
            match self.conn.accept_bi().await {
                Ok((mut send, mut recv)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        match handle_stream(&mut recv, &mut send, handler).await {
                            Ok(()) => debug!("Stream finished by {remote}"),
                            Err(e) => error!("Stream error from {remote}: {e}"),
                        }
                    });
                }
                Err(
                    quinn::ConnectionError::ApplicationClosed(_)
                    | quinn::ConnectionError::LocallyClosed,
                ) => {
                    info!("Connection closed from {remote}");
                    break;
                }
                Err(e) => {
                    error!("Connection error from {remote}: {e}");
                    return Err(TransportError::Unavailable(e.to_string()));
                }
            }
        }

        Ok(())
    }
}

/// Reads the metadata frame, then answers envelopes until the stream ends.
async fn handle_stream(
    recv: &mut quinn::RecvStream,
    send: &mut quinn::SendStream,
    handler: PeerHandler,
) -> Result<(), TransportError> {
    let metadata = decode_metadata(&read_frame(recv).await?)?;
    debug!(identity = ?metadata.first(proto::IDENTITY_KEY), "Notify stream accepted");

    loop {
        let envelope = match read_envelope(recv).await {
            Ok(envelope) => envelope,
            Err(TransportError::Closed) => break,
            Err(e) => return Err(e),
        };
        debug!(msg_id = envelope.msg_id(), "Received envelope");

        for reply in handler(metadata.clone(), envelope).await {
            write_envelope(send, &reply).await?;
        }
    }

    send.finish()
        .map_err(|e| TransportError::Other(e.to_string()))?;
    Ok(())
}
