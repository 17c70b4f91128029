//! Resilient multiplexed notify streams to downstream peers.
//!
//! A [`Registry`] owns one self-healing [`Connection`] per named peer. Outbound
//! envelopes are queued and written in order by a background send pump; inbound
//! envelopes are dispatched by message id to axum handlers via a [`Dispatcher`].

pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod memory;
pub mod quic;
pub mod registry;
pub mod route;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;

/// Per-peer connection with bounded outbound queue and reconnect.
pub use connection::{Connection, ConnectionOptions};
/// Message-id keyed dispatch into an axum router.
pub use dispatcher::Dispatcher;
/// In-process transport for tests and local wiring.
pub use memory::{MemoryClient, MemoryPeer, PeerStream, Written};
/// QUIC client transport.
pub use quic::QuicProxyClient;
/// Named connection registry.
pub use registry::{PeerSpec, Registry};
/// Static message-id to path mapping.
pub use route::RouteTable;
/// QUIC peer server.
pub use server::{PeerHandler, ProxyServer, peer_handler};
/// Transport seams.
pub use transport::{InboundSink, NotifyStream, ProxyClient};
