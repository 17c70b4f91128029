//! Length-prefixed JSON framing shared by the QUIC client and server.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! JSON. The first frame on a stream carries the client's [`Metadata`];
//! every later frame carries one [`Envelope`].

use std::io;

use proto::{Envelope, Metadata, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame size (1 MiB).
pub const MAX_FRAME_LEN: usize = 1_048_576;

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(recv: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await.map_err(classify_io)?;
    let len = parse_frame_len(len_buf);
    ensure_frame_len(len)?;

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await.map_err(classify_io)?;
    Ok(buf)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(send: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    ensure_frame_len(payload.len())?;
    let len = (payload.len() as u32).to_be_bytes();
    send.write_all(&len).await.map_err(classify_io)?;
    send.write_all(payload).await.map_err(classify_io)?;
    Ok(())
}

/// Reads and decodes one envelope frame.
pub async fn read_envelope<R>(recv: &mut R) -> Result<Envelope, TransportError>
where
    R: AsyncRead + Unpin,
{
    let buf = read_frame(recv).await?;
    decode_envelope(&buf)
}

/// Encodes and writes one envelope frame.
pub async fn write_envelope<W>(send: &mut W, envelope: &Envelope) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_envelope(envelope)?;
    write_frame(send, &bytes).await
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(envelope).map_err(|e| TransportError::Codec(format!("Serialize error: {e}")))
}

pub fn decode_envelope(buf: &[u8]) -> Result<Envelope, TransportError> {
    serde_json::from_slice(buf).map_err(|e| TransportError::Codec(format!("Deserialize error: {e}")))
}

pub fn encode_metadata(metadata: &Metadata) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(metadata).map_err(|e| TransportError::Codec(format!("Serialize error: {e}")))
}

pub fn decode_metadata(buf: &[u8]) -> Result<Metadata, TransportError> {
    serde_json::from_slice(buf).map_err(|e| TransportError::Codec(format!("Deserialize error: {e}")))
}

/// Parses a big-endian 4-byte frame length prefix.
fn parse_frame_len(len_buf: [u8; 4]) -> usize {
    u32::from_be_bytes(len_buf) as usize
}

/// Validates a frame size against [`MAX_FRAME_LEN`].
fn ensure_frame_len(len: usize) -> Result<(), TransportError> {
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    Ok(())
}

/// Maps an I/O failure onto the transport error taxonomy.
pub fn classify_io(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => TransportError::Closed,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut => TransportError::Unavailable(err.to_string()),
        _ => TransportError::Other(err.to_string()),
    }
}
