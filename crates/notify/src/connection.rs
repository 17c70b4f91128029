//! Per-peer notify stream with automatic reconnect.
//!
//! A [`Connection`] owns at most one live stream to its peer. Two background
//! tasks share that stream: the send pump drains the bounded outbound queue,
//! the receive pump forwards successful inbound envelopes to an
//! [`InboundSink`]. Opening a stream happens under the link lock, so
//! concurrent callers never open two physical streams. Reads and writes run
//! outside it: a stuck write never holds up inbound delivery, and a failed
//! operation only invalidates the stream generation it ran on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use proto::{Envelope, Metadata, TransportError, TransportErrorKind};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transport::{InboundSink, NotifyStream, ProxyClient};

/// Outbound queue capacity used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Delay between connect attempts and after a failed read.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Identity attached to streams when none is configured.
pub const DEFAULT_IDENTITY: &str = "1";

/// Tuning for one [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Capacity of the outbound queue; `enqueue` blocks when it is full.
    pub queue_capacity: usize,
    /// Sleep between connect attempts and after a failed read.
    pub retry_interval: Duration,
    /// Value sent under the `gid` metadata key.
    pub identity: String,
    /// Caller-supplied metadata, sent before the identity pair.
    pub metadata: Metadata,
    /// Read/write error kinds that are logged without dropping the stream.
    pub tolerated_errors: Vec<TransportErrorKind>,
    /// Write a connect envelope first on every reopened stream.
    pub announce_on_reconnect: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            identity: DEFAULT_IDENTITY.to_string(),
            metadata: Metadata::new(),
            tolerated_errors: Vec::new(),
            announce_on_reconnect: true,
        }
    }
}

impl ConnectionOptions {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Keeps the stream open when an error of `kind` occurs.
    pub fn tolerate(mut self, kind: TransportErrorKind) -> Self {
        if !self.tolerated_errors.contains(&kind) {
            self.tolerated_errors.push(kind);
        }
        self
    }

    /// Metadata attached when opening a stream: caller pairs, then identity.
    pub fn outgoing_metadata(&self) -> Metadata {
        self.metadata
            .clone()
            .join(Metadata::identity(self.identity.clone()))
    }

    /// Returns `true` when `err` should drop the live stream.
    pub fn invalidates(&self, err: &TransportError) -> bool {
        !self.tolerated_errors.contains(&err.kind())
    }
}

#[derive(Clone)]
struct LiveStream {
    generation: u64,
    stream: Arc<dyn NotifyStream>,
    /// set once a connect envelope has been written on this stream
    announced: Arc<AtomicBool>,
}

impl LiveStream {
    fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct LinkState {
    live: Option<LiveStream>,
    /// streams opened so far; the live stream's generation
    opened: u64,
}

/// State shared by both pumps and external callers.
struct Link {
    name: String,
    client: Arc<dyn ProxyClient>,
    metadata: Metadata,
    options: ConnectionOptions,
    state: Mutex<LinkState>,
    /// Raised when a reopened stream still owes the peer a connect envelope.
    reopened: Notify,
}

impl Link {
    fn new(name: String, client: Arc<dyn ProxyClient>, options: ConnectionOptions) -> Self {
        Self {
            name,
            client,
            metadata: options.outgoing_metadata(),
            options,
            state: Mutex::new(LinkState::default()),
            reopened: Notify::new(),
        }
    }

    /// Returns the live stream, opening one if needed.
    ///
    /// The lock is held while a stream is being opened and never across a
    /// read or a write. `None` once cancelled.
    async fn acquire(&self, cancel: &CancellationToken) -> Option<LiveStream> {
        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            guard = self.state.lock() => guard,
        };
        if let Some(live) = &state.live {
            return Some(live.clone());
        }

        let stream = self.connect(cancel).await?;
        state.opened += 1;
        let live = LiveStream {
            generation: state.opened,
            stream,
            announced: Arc::default(),
        };
        state.live = Some(live.clone());
        info!(connection = %self.name, generation = live.generation, "Notify stream established");

        if self.owes_announcement(&live) {
            self.reopened.notify_one();
        }
        Some(live)
    }

    /// Opens a stream, retrying every `retry_interval` until it succeeds.
    async fn connect(&self, cancel: &CancellationToken) -> Option<Arc<dyn NotifyStream>> {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                attempt = self.client.notify(&self.metadata) => attempt,
            };
            match attempt {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    error!(connection = %self.name, "Get notify stream failed: {e}");
                    if !sleep_or_cancel(cancel, self.options.retry_interval).await {
                        return None;
                    }
                }
            }
        }
    }

    /// The first stream is announced by the connect queued at spawn.
    fn owes_announcement(&self, live: &LiveStream) -> bool {
        live.generation > 1 && self.options.announce_on_reconnect && !live.is_announced()
    }

    /// Sends one envelope on `live`. `None` if cancelled mid-write.
    async fn send_on(
        &self,
        live: &LiveStream,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Option<Result<(), TransportError>> {
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            sent = live.stream.send(envelope) => sent,
        };
        if sent.is_ok() && envelope.is_connect() {
            live.announced.store(true, Ordering::Release);
        }
        Some(sent)
    }

    /// Writes a connect envelope on a reopened stream that has not had one yet.
    ///
    /// Returns `false` if cancelled.
    async fn announce_reopened(&self, cancel: &CancellationToken) -> bool {
        let connect = Envelope::connect();
        loop {
            let Some(live) = self.acquire(cancel).await else {
                return false;
            };
            if !self.owes_announcement(&live) {
                return true;
            }
            match self.send_on(&live, &connect, cancel).await {
                None => return false,
                Some(Ok(())) => return true,
                Some(Err(e)) => {
                    error!(connection = %self.name, generation = live.generation, "Connect announcement failed: {e}");
                    if self.options.invalidates(&e) {
                        self.invalidate(live.generation, "announcement failure", cancel)
                            .await;
                    }
                    if !sleep_or_cancel(cancel, self.options.retry_interval).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Writes one envelope. Failures drop the envelope.
    ///
    /// Only the send pump writes, so envelopes keep their queue order. A
    /// connect envelope is written at most once per stream.
    async fn write(&self, envelope: &Envelope, cancel: &CancellationToken) {
        let live = loop {
            let Some(live) = self.acquire(cancel).await else {
                return;
            };
            if envelope.is_connect() || !self.owes_announcement(&live) {
                break live;
            }
            if !self.announce_reopened(cancel).await {
                return;
            }
        };
        if envelope.is_connect() && live.is_announced() {
            debug!(connection = %self.name, generation = live.generation, "Stream already announced, connect envelope skipped");
            return;
        }

        let Some(sent) = self.send_on(&live, envelope, cancel).await else {
            return;
        };
        if let Err(e) = sent {
            error!(
                connection = %self.name,
                msg_id = envelope.msg_id(),
                "There was error sending data, message dropped: {e}"
            );
            if self.options.invalidates(&e) {
                self.invalidate(live.generation, "write failure", cancel)
                    .await;
            }
        }
    }

    /// Drops the live stream if it is still the one from `generation`.
    async fn invalidate(&self, generation: u64, cause: &str, cancel: &CancellationToken) {
        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            guard = self.state.lock() => guard,
        };
        if state
            .live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
        {
            state.live = None;
            debug!(connection = %self.name, generation, "Stream invalidated after {cause}");
        }
    }
}

/// Sleeps for `duration`; returns `false` if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Lazily-established, self-healing notify stream to one named peer.
pub struct Connection {
    name: String,
    queue: mpsc::Sender<Envelope>,
    link: Arc<Link>,
    cancel: CancellationToken,
    pumps: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Creates the connection and starts both pumps.
    ///
    /// A connect envelope is queued before the pumps start, so it is the
    /// first write the peer sees. Must be called within a tokio runtime.
    pub fn spawn(
        name: impl Into<String>,
        client: Arc<dyn ProxyClient>,
        sink: Arc<dyn InboundSink>,
        options: ConnectionOptions,
    ) -> Self {
        Self::spawn_with_cancel(name, client, sink, options, CancellationToken::new())
    }

    /// Like [`Connection::spawn`], stopping when `cancel` fires.
    pub fn spawn_with_cancel(
        name: impl Into<String>,
        client: Arc<dyn ProxyClient>,
        sink: Arc<dyn InboundSink>,
        options: ConnectionOptions,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let (queue, outbound) = mpsc::channel(options.queue_capacity.max(1));
        if let Err(e) = queue.try_send(Envelope::connect()) {
            warn!(connection = %name, "Failed to queue connect announcement: {e}");
        }

        let link = Arc::new(Link::new(name.clone(), client, options));

        let pumps = vec![
            tokio::spawn(receive_pump(Arc::clone(&link), sink, cancel.clone())),
            tokio::spawn(send_pump(Arc::clone(&link), outbound, cancel.clone())),
        ];
        info!(connection = %name, "Connection started");

        Self {
            name,
            queue,
            link,
            cancel,
            pumps: parking_lot::Mutex::new(pumps),
        }
    }

    /// Peer name this connection was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options the connection was created with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.link.options
    }

    /// Queues `envelope` for the peer, waiting while the queue is full.
    ///
    /// Delivery failures are handled by the send pump and never reported
    /// here. After shutdown the envelope is dropped.
    pub async fn enqueue(&self, envelope: Envelope) {
        let msg_id = envelope.msg_id();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!(connection = %self.name, msg_id, "Connection shut down, envelope dropped");
            }
            sent = self.queue.send(envelope) => {
                if sent.is_err() {
                    warn!(connection = %self.name, msg_id, "Send pump stopped, envelope dropped");
                }
            }
        }
    }

    /// Blocking variant of [`Connection::enqueue`] for producers outside the runtime.
    ///
    /// Panics if called from within an async context.
    pub fn enqueue_blocking(&self, envelope: Envelope) {
        let msg_id = envelope.msg_id();
        if self.cancel.is_cancelled() {
            warn!(connection = %self.name, msg_id, "Connection shut down, envelope dropped");
            return;
        }
        if self.queue.blocking_send(envelope).is_err() {
            warn!(connection = %self.name, msg_id, "Send pump stopped, envelope dropped");
        }
    }

    /// Envelopes waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    /// Returns the live stream, opening one first if none exists.
    ///
    /// Waits for any connect attempt already in progress. `None` after shutdown.
    pub async fn acquire_stream(&self) -> Option<Arc<dyn NotifyStream>> {
        self.link
            .acquire(&self.cancel)
            .await
            .map(|live| live.stream)
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops both pumps and waits for them to exit. Queued envelopes are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let pumps = std::mem::take(&mut *self.pumps.lock());
        for pump in pumps {
            if let Err(e) = pump.await {
                warn!(connection = %self.name, "Pump task ended abnormally: {e}");
            }
        }
        info!(connection = %self.name, "Connection stopped");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn send_pump(
    link: Arc<Link>,
    mut outbound: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = link.reopened.notified() => {
                link.announce_reopened(&cancel).await;
            }
            next = outbound.recv() => match next {
                Some(envelope) => link.write(&envelope, &cancel).await,
                None => break,
            },
        }
    }
    debug!(connection = %link.name, "Send pump stopped");
}

async fn receive_pump(link: Arc<Link>, sink: Arc<dyn InboundSink>, cancel: CancellationToken) {
    loop {
        let Some(live) = link.acquire(&cancel).await else {
            break;
        };

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = live.stream.recv() => received,
        };

        match received {
            Ok(envelope) if envelope.is_success() => {
                sink.deliver(envelope.msg_id(), envelope.into_payload())
                    .await;
            }
            Ok(envelope) => {
                debug!(
                    connection = %link.name,
                    msg_id = envelope.msg_id(),
                    code = envelope.code(),
                    "Dropping non-success envelope"
                );
            }
            Err(e) => {
                error!(connection = %link.name, "Read from peer failed, retrying: {e}");
                if link.options.invalidates(&e) {
                    link.invalidate(live.generation, "read failure", &cancel)
                        .await;
                }
                if !sleep_or_cancel(&cancel, link.options.retry_interval).await {
                    break;
                }
            }
        }
    }
    debug!(connection = %link.name, "Receive pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_observed_design() {
        let options = ConnectionOptions::default();
        assert_eq!(options.queue_capacity, 1000);
        assert_eq!(options.retry_interval, Duration::from_secs(1));
        assert_eq!(options.identity, "1");
        assert!(options.announce_on_reconnect);
        assert!(options.tolerated_errors.is_empty());
    }

    #[test]
    fn outgoing_metadata_appends_identity_after_caller_pairs() {
        let options = ConnectionOptions::default()
            .with_identity("9")
            .with_metadata(Metadata::pairs([("zone", "a")]));
        let md = options.outgoing_metadata();
        assert_eq!(
            md.iter().collect::<Vec<_>>(),
            vec![("zone", "a"), ("gid", "9")]
        );
    }

    #[test]
    fn every_error_invalidates_unless_tolerated() {
        let options = ConnectionOptions::default();
        assert!(options.invalidates(&TransportError::Unavailable("x".into())));
        assert!(options.invalidates(&TransportError::Closed));
        assert!(options.invalidates(&TransportError::Codec("x".into())));

        let options = options
            .tolerate(TransportErrorKind::Protocol)
            .tolerate(TransportErrorKind::Protocol);
        assert_eq!(options.tolerated_errors.len(), 1);
        assert!(!options.invalidates(&TransportError::Codec("x".into())));
        assert!(options.invalidates(&TransportError::Closed));
    }

    fn test_link(name: &str) -> (Link, crate::memory::MemoryPeer) {
        let (client, peer) = crate::memory::MemoryClient::pair();
        let options = ConnectionOptions::default().with_retry_interval(Duration::from_millis(10));
        (Link::new(name.to_string(), Arc::new(client), options), peer)
    }

    #[tokio::test]
    async fn queued_connect_is_skipped_after_reopened_stream_was_announced() {
        let (link, mut peer) = test_link("stale-connect");
        let cancel = CancellationToken::new();

        let first = link.acquire(&cancel).await.expect("stream 0");
        link.invalidate(first.generation, "read failure", &cancel)
            .await;
        assert!(link.announce_reopened(&cancel).await);

        link.write(&Envelope::connect(), &cancel).await;
        link.write(&Envelope::new(2001, b"x".to_vec()), &cancel)
            .await;

        let announce = peer.next_written().await.expect("announce");
        assert_eq!(announce.stream, 1);
        assert!(announce.envelope.is_connect());
        let written = peer.next_written().await.expect("written");
        assert_eq!(written.envelope.msg_id(), 2001);
        assert_eq!(peer.write_attempts(), 2);
    }

    #[tokio::test]
    async fn queued_connect_counts_as_announcement_for_reopened_stream() {
        let (link, mut peer) = test_link("late-connect");
        let cancel = CancellationToken::new();

        let first = link.acquire(&cancel).await.expect("stream 0");
        link.invalidate(first.generation, "read failure", &cancel)
            .await;

        link.write(&Envelope::connect(), &cancel).await;
        assert!(link.announce_reopened(&cancel).await);
        link.write(&Envelope::new(2001, b"y".to_vec()), &cancel)
            .await;

        let connect = peer.next_written().await.expect("connect");
        assert_eq!(connect.stream, 1);
        assert!(connect.envelope.is_connect());
        let written = peer.next_written().await.expect("written");
        assert_eq!(written.envelope.msg_id(), 2001);
        assert_eq!(peer.write_attempts(), 2);
    }

    #[tokio::test]
    async fn stale_generation_does_not_invalidate_newer_stream() {
        let (link, peer) = test_link("generations");
        let cancel = CancellationToken::new();

        let first = link.acquire(&cancel).await.expect("stream 0");
        link.invalidate(first.generation, "read failure", &cancel)
            .await;
        let second = link.acquire(&cancel).await.expect("stream 1");
        assert_eq!(second.generation, 2);

        link.invalidate(first.generation, "write failure", &cancel)
            .await;
        let still = link.acquire(&cancel).await.expect("stream 1 kept");
        assert_eq!(still.generation, 2);
        assert_eq!(peer.opened(), 2);
    }
}
