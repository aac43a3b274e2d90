use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Documented ceiling of the session signaling channel, in bytes of `data`.
pub const DEFAULT_MAX_SIGNAL_BYTES: usize = 8 * 1024;
const TOPIC_CAPACITY: usize = 256;

/// One signal as carried by the session channel. `data` is always a serialized string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub kind: String,
    pub data: String,
}

impl Signal {
    pub fn new(kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
        }
    }
}

/// Event name a handler registers under for signals of `kind`.
pub fn event_name(kind: &str) -> String {
    format!("signal:{kind}")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal channel closed")]
    Closed,
    #[error("signal payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("signal transport error: {0}")]
    Transport(String),
}

pub type SignalResult<T> = Result<T, SignalError>;

/// Narrow view of the session signaling channel consumed by the sync layer.
///
/// Handlers are modelled as broadcast receivers: dropping the receiver
/// unregisters the handler.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    fn on(&self, kind: &str) -> broadcast::Receiver<Signal>;
    async fn send(&self, signal: Signal) -> SignalResult<()>;

    fn max_signal_bytes(&self) -> usize {
        DEFAULT_MAX_SIGNAL_BYTES
    }
}

#[derive(Debug, Default)]
struct Inbox {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<Signal>>>,
}

impl Inbox {
    fn sender_for(&self, event: &str) -> broadcast::Sender<Signal> {
        if let Some(sender) = self.topics.read().get(event) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

/// In-memory signaling pair for tests and the replay tool.
///
/// Each end delivers what it sends to the other end's handlers, and enforces
/// the same payload ceiling as the real channel.
#[derive(Debug)]
pub struct LocalSignalBus {
    inbox: Arc<Inbox>,
    peer: Arc<Inbox>,
    connected: Arc<AtomicBool>,
    max_signal_bytes: usize,
    sent: AtomicU64,
}

impl LocalSignalBus {
    pub fn pair() -> (Self, Self) {
        Self::pair_with_limit(DEFAULT_MAX_SIGNAL_BYTES)
    }

    pub fn pair_with_limit(max_signal_bytes: usize) -> (Self, Self) {
        let left = Arc::new(Inbox::default());
        let right = Arc::new(Inbox::default());
        let connected = Arc::new(AtomicBool::new(true));
        let a = Self {
            inbox: Arc::clone(&left),
            peer: Arc::clone(&right),
            connected: Arc::clone(&connected),
            max_signal_bytes,
            sent: AtomicU64::new(0),
        };
        let b = Self {
            inbox: right,
            peer: left,
            connected,
            max_signal_bytes,
            sent: AtomicU64::new(0),
        };
        (a, b)
    }

    /// Severs both directions; later sends fail with [`SignalError::Closed`].
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of signals this end has handed to its peer.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SignalTransport for LocalSignalBus {
    fn on(&self, kind: &str) -> broadcast::Receiver<Signal> {
        self.inbox.sender_for(&event_name(kind)).subscribe()
    }

    async fn send(&self, signal: Signal) -> SignalResult<()> {
        if !self.is_connected() {
            return Err(SignalError::Closed);
        }
        let size = signal.data.len();
        if size > self.max_signal_bytes {
            return Err(SignalError::PayloadTooLarge {
                size,
                max: self.max_signal_bytes,
            });
        }
        let sender = self.peer.sender_for(&event_name(&signal.kind));
        // a signal with no registered handler is dropped, as on the real channel
        let _ = sender.send(signal);
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn max_signal_bytes(&self) -> usize {
        self.max_signal_bytes
    }
}
