#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use notify::{ConnectionOptions, InboundSink};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Outbound msg id used by tests; the route table never sees it.
pub const OUTBOUND_ID: u32 = 2001;

/// Records every delivered envelope and forwards it to a channel.
pub struct RecordingSink {
    delivered: AtomicUsize,
    tx: mpsc::UnboundedSender<(u32, Vec<u8>)>,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(u32, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                delivered: AtomicUsize::new(0),
                tx,
            }),
            rx,
        )
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InboundSink for RecordingSink {
    async fn deliver(&self, msg_id: u32, payload: Vec<u8>) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send((msg_id, payload));
    }
}

/// Default options with a short retry interval.
pub fn fast_options() -> ConnectionOptions {
    ConnectionOptions::default().with_retry_interval(Duration::from_millis(10))
}

/// Awaits `fut`, failing the test if it takes longer than [`WAIT`].
pub async fn within<F: Future>(fut: F) -> F::Output {
    timeout(WAIT, fut).await.expect("timed out waiting")
}
