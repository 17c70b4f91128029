use serde::{Deserialize, Serialize};

/// Status code carried by envelopes that completed successfully.
pub const CODE_SUCCESS: i32 = 0;

/// Reserved message-type identifiers.
pub mod msg_id {
    /// Outbound control message announcing a logical connection. Never dispatched.
    pub const CONNECT_REQ: u32 = 1;
    /// Node heartbeat acknowledgement.
    pub const NODE_HEARTBEAT_RESP: u32 = 1002;
    /// Progress update for a running test step.
    pub const TEST_STEP_UPDATE_RESP: u32 = 1004;
    /// Worker heartbeat acknowledgement.
    pub const WORKER_HEARTBEAT_RESP: u32 = 1006;
}

/// Unit exchanged over a notify stream in either direction.
///
/// The payload is opaque here; only dispatch handlers interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    msg_id: u32,
    #[serde(default)]
    code: i32,
    #[serde(default, with = "payload_base64")]
    payload: Vec<u8>,
}

impl Envelope {
    /// Creates a successful envelope for `msg_id`.
    pub fn new(msg_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_code(msg_id, CODE_SUCCESS, payload)
    }

    /// Creates an envelope with an explicit status code.
    pub fn with_code(msg_id: u32, code: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_id,
            code,
            payload: payload.into(),
        }
    }

    /// The connect announcement sent first on every fresh stream.
    pub fn connect() -> Self {
        Self::new(msg_id::CONNECT_REQ, Vec::new())
    }

    /// Message-type identifier.
    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    /// Status code reported by the producer.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Opaque payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the envelope, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns `true` when `code` is [`CODE_SUCCESS`].
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// Returns `true` for the reserved connect announcement.
    pub fn is_connect(&self) -> bool {
        self.msg_id == msg_id::CONNECT_REQ
    }
}

/// Payload bytes travel as base64 inside the JSON frame.
mod payload_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
