use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use signal_bus::{Signal, SignalTransport};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::chunk::{
    ChunkConfig, GcEvent, Reassembled, Reassembler, decode_chunk, encode_chunk, split_payload,
};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::metrics;

/// Signal kind carrying a whole serialized action.
pub const SIGNAL_ACTION: &str = "sync-action";
/// Signal kind carrying one fragment of a chunked transfer.
pub const SIGNAL_CHUNK: &str = "sync-chunk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub percent: u8,
    pub sent: u32,
    pub total: u32,
}

impl Progress {
    fn of(sent: u32, total: u32) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (u64::from(sent) * 100 / u64::from(total)) as u8
        };
        Self {
            percent,
            sent,
            total,
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Present only when the payload went out as fragments.
    pub transfer_id: Option<String>,
    pub fragments: u32,
    pub bytes: usize,
}

/// Serializes payloads onto the signaling channel, fragmenting the ones that
/// would not fit, and rebuilds fragmented payloads on the receiving side.
pub struct ChunkedCodec {
    transport: Arc<dyn SignalTransport>,
    config: ChunkConfig,
    send_timeout: Duration,
    reassembler: Mutex<Reassembler>,
}

impl fmt::Debug for ChunkedCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedCodec")
            .field("config", &self.config)
            .field("send_timeout", &self.send_timeout)
            .field("inflight", &self.inflight())
            .finish()
    }
}

impl ChunkedCodec {
    pub fn new(transport: Arc<dyn SignalTransport>, config: &SyncConfig) -> Self {
        let mut chunk = config.chunk;
        chunk.max_signal_bytes = chunk.max_signal_bytes.min(transport.max_signal_bytes());
        Self {
            transport,
            config: chunk,
            send_timeout: config.send_timeout,
            reassembler: Mutex::new(Reassembler::new(chunk)),
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub async fn send<T>(&self, payload: &T, on_progress: Option<&ProgressFn>) -> SyncResult<SendReport>
    where
        T: Serialize + ?Sized,
    {
        let serialized = serde_json::to_string(payload)
            .map_err(|err| SyncError::MalformedPayload(err.to_string()))?;
        self.send_serialized(&serialized, on_progress).await
    }

    /// Sends an already serialized payload. Fragments leave strictly one after
    /// another; the first failure aborts the transfer without retry.
    pub async fn send_serialized(
        &self,
        serialized: &str,
        on_progress: Option<&ProgressFn>,
    ) -> SyncResult<SendReport> {
        if !self.config.needs_chunking(serialized) {
            self.send_signal(SIGNAL_ACTION, serialized.to_string()).await?;
            report(on_progress, Progress::of(1, 1));
            return Ok(SendReport {
                transfer_id: None,
                fragments: 1,
                bytes: serialized.len(),
            });
        }

        let transfer_id = Uuid::new_v4().to_string();
        let chunks = split_payload(serialized, &transfer_id, &self.config)?;
        let total = chunks.len() as u32;
        debug!(
            target = "costate::codec",
            transfer_id = %transfer_id,
            bytes = serialized.len(),
            fragments = total,
            "sending chunked transfer"
        );
        metrics::CHUNKED_TRANSFERS.with_label_values(&["out"]).inc();

        for chunk in chunks {
            let seq = chunk.seq;
            let encoded = encode_chunk(&chunk)?;
            if let Err(err) = self.send_signal(SIGNAL_CHUNK, encoded).await {
                warn!(
                    target = "costate::codec",
                    transfer_id = %transfer_id,
                    seq,
                    total,
                    error = %err,
                    "chunked transfer aborted"
                );
                return Err(err);
            }
            report(on_progress, Progress::of(seq + 1, total));
        }

        Ok(SendReport {
            transfer_id: Some(transfer_id),
            fragments: total,
            bytes: serialized.len(),
        })
    }

    /// Buffers one raw chunk signal; returns the rebuilt payload once every
    /// fragment of its transfer is present.
    pub fn receive_chunk(&self, raw: &str, now: Instant) -> SyncResult<Option<Reassembled>> {
        let chunk = decode_chunk(raw)?;
        trace!(
            target = "costate::codec",
            transfer_id = %chunk.transfer_id,
            seq = chunk.seq,
            total = chunk.total,
            "chunk received"
        );
        let outcome = {
            let mut reassembler = self.reassembler.lock();
            let outcome = reassembler.ingest(chunk, now);
            record_inflight(&reassembler);
            outcome?
        };
        for event in &outcome.gc_events {
            log_gc(event);
        }
        if let Some(done) = &outcome.completed {
            if done.fragments > 1 {
                metrics::CHUNKED_TRANSFERS.with_label_values(&["in"]).inc();
                debug!(
                    target = "costate::codec",
                    transfer_id = %done.transfer_id,
                    fragments = done.fragments,
                    bytes = done.payload.len(),
                    elapsed_ms = now.saturating_duration_since(done.started_at).as_millis() as u64,
                    "chunked transfer reassembled"
                );
            }
        }
        Ok(outcome.completed)
    }

    /// Evicts idle partial transfers.
    pub fn sweep(&self, now: Instant) -> Vec<GcEvent> {
        let events = {
            let mut reassembler = self.reassembler.lock();
            let events = reassembler.gc(now);
            record_inflight(&reassembler);
            events
        };
        for event in &events {
            log_gc(event);
        }
        events
    }

    /// Discards every partial transfer.
    pub fn clear(&self) -> usize {
        let mut reassembler = self.reassembler.lock();
        let dropped = reassembler.clear();
        record_inflight(&reassembler);
        dropped
    }

    pub fn inflight(&self) -> usize {
        self.reassembler.lock().inflight()
    }

    async fn send_signal(&self, kind: &str, data: String) -> SyncResult<()> {
        let signal = Signal::new(kind, data);
        let result = match tokio::time::timeout(self.send_timeout, self.transport.send(signal)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SyncError::Transport(err)),
            Err(_) => Err(SyncError::SendTimeout(self.send_timeout)),
        };
        match &result {
            Ok(()) => metrics::SIGNALS_SENT.with_label_values(&[kind]).inc(),
            Err(err) => metrics::SIGNAL_SEND_FAILURES
                .with_label_values(&[err.kind()])
                .inc(),
        }
        result
    }
}

fn report(on_progress: Option<&ProgressFn>, progress: Progress) {
    if let Some(callback) = on_progress {
        callback(progress);
    }
}

fn record_inflight(reassembler: &Reassembler) {
    metrics::CHUNK_INFLIGHT
        .with_label_values(&["transfers"])
        .set(reassembler.inflight() as i64);
    metrics::CHUNK_INFLIGHT
        .with_label_values(&["bytes"])
        .set(reassembler.inflight_bytes() as i64);
}

fn log_gc(event: &GcEvent) {
    metrics::CHUNK_PARTIAL_GCED
        .with_label_values(&[event.reason.as_str()])
        .inc();
    let err = SyncError::IncompleteTransfer {
        transfer_id: event.transfer_id.clone(),
        received: event.received,
        total: event.total,
    };
    warn!(
        target = "costate::codec",
        reason = event.reason.as_str(),
        error = %err,
        "discarded partial transfer"
    );
}
