//! Process-wide owner of named connections and the inbound dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use axum::handler::Handler;
use proto::{DispatchError, Envelope, NotifyError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::{Connection, ConnectionOptions};
use crate::dispatcher::Dispatcher;
use crate::route::RouteTable;
use crate::transport::{InboundSink, ProxyClient};

/// One downstream peer to connect to.
pub struct PeerSpec {
    pub name: String,
    pub client: Arc<dyn ProxyClient>,
    pub options: ConnectionOptions,
}

impl PeerSpec {
    /// Peer with default connection options.
    pub fn new(name: impl Into<String>, client: Arc<dyn ProxyClient>) -> Self {
        Self {
            name: name.into(),
            client,
            options: ConnectionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }
}

/// Binds named [`Connection`]s to a single [`Dispatcher`].
///
/// Construct once at startup and share it (usually behind an `Arc`) with
/// every component that enqueues envelopes or registers handlers.
pub struct Registry {
    connections: HashMap<String, Connection>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl Registry {
    /// Connects to every peer using the standard route table.
    pub fn initialize(peers: Vec<PeerSpec>) -> Self {
        Self::with_routes(RouteTable::standard(), peers)
    }

    /// Connects to every peer, dispatching inbound traffic through `routes`.
    ///
    /// Each connection starts connecting and pumping immediately. Must be
    /// called within a tokio runtime.
    pub fn with_routes(routes: RouteTable, peers: Vec<PeerSpec>) -> Self {
        Self::with_dispatcher(Arc::new(Dispatcher::new(routes)), peers)
    }

    /// Connects to every peer, delivering inbound traffic to `dispatcher`.
    ///
    /// Handlers bound on `dispatcher` beforehand see the very first inbound
    /// envelope. Must be called within a tokio runtime.
    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>, peers: Vec<PeerSpec>) -> Self {
        let cancel = CancellationToken::new();
        let sink: Arc<dyn InboundSink> = dispatcher.clone();

        let mut connections = HashMap::with_capacity(peers.len());
        for peer in peers {
            let connection = Connection::spawn_with_cancel(
                peer.name.clone(),
                peer.client,
                Arc::clone(&sink),
                peer.options,
                cancel.child_token(),
            );
            if let Some(previous) = connections.insert(peer.name.clone(), connection) {
                warn!(connection = %peer.name, "Duplicate peer name, replacing earlier connection");
                drop(previous);
            }
        }
        info!(count = connections.len(), "Notify registry initialized");

        Self {
            connections,
            dispatcher,
            cancel,
        }
    }

    /// Binds `handler` to the route of `msg_id`. Unknown ids are rejected.
    pub fn register_handler<H, T>(&self, msg_id: u32, handler: H) -> Result<(), DispatchError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.dispatcher.register_handler(msg_id, handler)
    }

    /// Dispatches an inbound payload, discarding the handler's response.
    pub async fn deliver(&self, msg_id: u32, payload: Vec<u8>) {
        self.dispatcher.deliver(msg_id, payload).await;
    }

    /// Connection registered under `name`.
    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }

    /// Queues `envelope` on the connection named `name`.
    pub async fn enqueue(&self, name: &str, envelope: Envelope) -> Result<(), NotifyError> {
        let connection = self
            .connections
            .get(name)
            .ok_or_else(|| NotifyError::UnknownConnection(name.to_string()))?;
        if connection.is_shut_down() {
            return Err(NotifyError::Closed(name.to_string()));
        }
        connection.enqueue(envelope).await;
        Ok(())
    }

    /// Peer names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Dispatcher shared by all connections.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stops every connection and waits for their pumps to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for connection in self.connections.values() {
            connection.shutdown().await;
        }
        info!("Notify registry stopped");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
