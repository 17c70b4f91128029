use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Coarse classification of transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Peer cannot be reached or the connection was lost.
    Unavailable,
    /// The peer finished the stream.
    Closed,
    /// Framing, codec or TLS problem.
    Protocol,
    /// Anything else.
    Other,
}

/// Stream transport errors
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Peer unreachable or connection lost.
    #[error("Peer unavailable: {0}")]
    Unavailable(String),

    /// Stream finished by the peer.
    #[error("Stream closed")]
    Closed,

    /// TLS setup failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Inbound frame exceeds the maximum frame length.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame body could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Classifies the error for reconnect policy decisions.
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            Self::Unavailable(_) => TransportErrorKind::Unavailable,
            Self::Closed => TransportErrorKind::Closed,
            Self::Tls(_) | Self::FrameTooLarge(_) | Self::Codec(_) => TransportErrorKind::Protocol,
            Self::Other(_) => TransportErrorKind::Other,
        }
    }

    /// Returns `true` when the peer is unreachable.
    pub fn is_unavailable(&self) -> bool {
        self.kind() == TransportErrorKind::Unavailable
    }
}

/// Inbound dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Message id has no entry in the route table.
    #[error("Unknown message id: {0}")]
    UnknownMsgId(u32),

    /// Route path cannot be bound to a handler.
    #[error("Invalid route path: {0:?}")]
    InvalidRoute(String),

    /// Route exists but no handler has been registered for it.
    #[error("No handler registered for {0}")]
    NoHandler(String),

    /// Synthetic request could not be built.
    #[error("Invalid dispatch request: {0}")]
    Request(String),

    /// Handler response body could not be read.
    #[error("Invalid handler response: {0}")]
    Response(String),
}

/// Connection registry errors
#[derive(Debug, Error)]
pub enum NotifyError {
    /// No connection registered under the given name.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Connection has been shut down.
    #[error("Connection closed: {0}")]
    Closed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_config_error_variant() {
        let err = ConfigError::MissingField("peers.addr".to_string());
        assert!(err.to_string().contains("Missing required field"));
    }

    #[test]
    fn classifies_transport_errors() {
        assert!(TransportError::Unavailable("x".into()).is_unavailable());
        assert_eq!(TransportError::Closed.kind(), TransportErrorKind::Closed);
        assert_eq!(
            TransportError::FrameTooLarge(10).kind(),
            TransportErrorKind::Protocol
        );
        assert_eq!(
            TransportError::Codec("bad".into()).kind(),
            TransportErrorKind::Protocol
        );
        assert_eq!(
            TransportError::Other("?".into()).kind(),
            TransportErrorKind::Other
        );
    }

    #[test]
    fn transport_error_kind_uses_snake_case() {
        let kind: TransportErrorKind = serde_json::from_str("\"unavailable\"").expect("kind");
        assert_eq!(kind, TransportErrorKind::Unavailable);
        assert_eq!(
            serde_json::to_string(&TransportErrorKind::Protocol).expect("serialize"),
            "\"protocol\""
        );
    }

    #[test]
    fn displays_dispatch_and_notify_errors() {
        let err = DispatchError::UnknownMsgId(42);
        assert!(err.to_string().contains("Unknown message id: 42"));
        let err = DispatchError::InvalidRoute("seven".to_string());
        assert_eq!(err.to_string(), "Invalid route path: \"seven\"");
        let err = NotifyError::UnknownConnection("worker-9".to_string());
        assert!(err.to_string().contains("worker-9"));
    }
}
