//! Shared protocol types for notify streams.
//!
//! This crate defines the message envelope exchanged with downstream peers,
//! the outgoing stream metadata, and strongly-typed error enums shared across
//! the workspace.

pub mod envelope;
pub mod error;
pub mod metadata;

/// Re-export of envelope types and reserved message ids.
pub use envelope::{CODE_SUCCESS, Envelope, msg_id};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of stream metadata types.
pub use metadata::{IDENTITY_KEY, Metadata};
