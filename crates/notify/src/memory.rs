//! In-process transport using tokio channels (for tests and local wiring without QUIC).
//!
//! [`MemoryClient::pair`] returns a [`ProxyClient`] together with a
//! [`MemoryPeer`] that plays the remote side: it sees every connect attempt
//! and written envelope, and can inject inbound envelopes or failures into any
//! stream it handed out.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{Envelope, Metadata, TransportError};
use tokio::sync::{Semaphore, mpsc};

use crate::transport::{NotifyStream, ProxyClient};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Envelope observed at the write boundary of stream `stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    /// Zero-based index of the stream, in opening order.
    pub stream: usize,
    pub envelope: Envelope,
}

struct Shared {
    attempts: AtomicUsize,
    opened: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    refuse: AtomicUsize,
    write_attempts: AtomicUsize,
    connect_delay: Mutex<Duration>,
    write_gate: Option<Semaphore>,
    written_tx: mpsc::UnboundedSender<Written>,
    streams_tx: mpsc::UnboundedSender<PeerStream>,
}

/// Client half of an in-process transport.
#[derive(Clone)]
pub struct MemoryClient {
    shared: Arc<Shared>,
}

/// Remote half of an in-process transport.
pub struct MemoryPeer {
    shared: Arc<Shared>,
    written_rx: mpsc::UnboundedReceiver<Written>,
    streams_rx: mpsc::UnboundedReceiver<PeerStream>,
}

impl MemoryClient {
    /// Creates a connected client/peer pair with ungated writes.
    pub fn pair() -> (MemoryClient, MemoryPeer) {
        Self::build(None)
    }

    /// Creates a pair whose writes each consume one permit; starts with `permits`.
    ///
    /// Writes beyond the available permits block until
    /// [`MemoryPeer::release_writes`] is called.
    pub fn pair_with_write_gate(permits: usize) -> (MemoryClient, MemoryPeer) {
        Self::build(Some(Semaphore::new(permits)))
    }

    fn build(write_gate: Option<Semaphore>) -> (MemoryClient, MemoryPeer) {
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            attempts: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            refuse: AtomicUsize::new(0),
            write_attempts: AtomicUsize::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            write_gate,
            written_tx,
            streams_tx,
        });
        (
            MemoryClient {
                shared: Arc::clone(&shared),
            },
            MemoryPeer {
                shared,
                written_rx,
                streams_rx,
            },
        )
    }
}

/// Decrements the in-flight connect counter when the attempt ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyClient for MemoryClient {
    async fn notify(&self, metadata: &Metadata) -> Result<Arc<dyn NotifyStream>, TransportError> {
        let shared = &self.shared;
        shared.attempts.fetch_add(1, Ordering::SeqCst);
        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&shared.in_flight);

        let delay = *shared.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if shared
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Unavailable("connection refused".into()));
        }

        let index = shared.opened.fetch_add(1, Ordering::SeqCst);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(StreamState::default());
        let _ = shared.streams_tx.send(PeerStream {
            index,
            metadata: metadata.clone(),
            inbound: inbound_tx,
            state: Arc::clone(&state),
        });

        Ok(Arc::new(MemoryStream {
            index,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            state,
            shared: Arc::clone(shared),
        }))
    }
}

#[derive(Default)]
struct StreamState {
    fail_writes: Mutex<Option<TransportError>>,
}

struct MemoryStream {
    index: usize,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Envelope, TransportError>>>,
    state: Arc<StreamState>,
    shared: Arc<Shared>,
}

#[async_trait]
impl NotifyStream for MemoryStream {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.shared.write_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.state.fail_writes.lock().clone() {
            return Err(err);
        }
        if let Some(gate) = &self.shared.write_gate {
            gate.acquire()
                .await
                .map_err(|_| TransportError::Closed)?
                .forget();
        }
        self.shared
            .written_tx
            .send(Written {
                stream: self.index,
                envelope: envelope.clone(),
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }
}

/// Peer-side handle for one opened stream.
///
/// Dropping it finishes the stream: the client's next read reports
/// [`TransportError::Closed`].
pub struct PeerStream {
    index: usize,
    metadata: Metadata,
    inbound: mpsc::UnboundedSender<Result<Envelope, TransportError>>,
    state: Arc<StreamState>,
}

impl PeerStream {
    /// Zero-based index of the stream, in opening order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Metadata the client attached when opening the stream.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Delivers `envelope` to the client's next read.
    pub fn push(&self, envelope: Envelope) -> bool {
        self.inbound.send(Ok(envelope)).is_ok()
    }

    /// Makes the client's next read fail with `err`.
    pub fn push_error(&self, err: TransportError) -> bool {
        self.inbound.send(Err(err)).is_ok()
    }

    /// Makes every following write on this stream fail with `err`.
    pub fn fail_writes(&self, err: TransportError) {
        *self.state.fail_writes.lock() = Some(err);
    }
}

impl MemoryPeer {
    /// Connect attempts made so far, including refused ones.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Streams successfully opened so far.
    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Highest number of connect attempts ever observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Write calls made so far, including gated and failed ones.
    pub fn write_attempts(&self) -> usize {
        self.shared.write_attempts.load(Ordering::SeqCst)
    }

    /// Refuses the next `count` connect attempts with `Unavailable`.
    pub fn refuse_connects(&self, count: usize) {
        self.shared.refuse.store(count, Ordering::SeqCst);
    }

    /// Delays every following connect attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock() = delay;
    }

    /// Lets `count` more gated writes through. No-op for ungated pairs.
    pub fn release_writes(&self, count: usize) {
        if let Some(gate) = &self.shared.write_gate {
            gate.add_permits(count);
        }
    }

    /// Next envelope that reached the write boundary.
    pub async fn next_written(&mut self) -> Option<Written> {
        self.written_rx.recv().await
    }

    /// Next stream the client opened.
    pub async fn next_stream(&mut self) -> Option<PeerStream> {
        self.streams_rx.recv().await
    }

    /// Waits until at least `count` streams have been opened.
    pub async fn wait_for_opened(&self, count: usize) {
        while self.opened() < count {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Waits until at least `count` writes have been attempted.
    pub async fn wait_for_write_attempts(&self, count: usize) {
        while self.write_attempts() < count {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
