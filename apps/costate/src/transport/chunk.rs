use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{parse_duration_ms, parse_usize};

pub const DEFAULT_MAX_SIGNAL_BYTES: usize = signal_bus::DEFAULT_MAX_SIGNAL_BYTES;
pub const DEFAULT_SINGLE_SHOT_BYTES: usize = 6 * 1024;
pub const DEFAULT_FRAGMENT_BYTES: usize = 6 * 1024;
pub const DEFAULT_MAX_TRANSFER_BYTES: usize = 1024 * 1024;
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_INFLIGHT: usize = 64;
pub const MIN_FRAGMENT_BYTES: usize = 64;
/// Room reserved for the chunk envelope around a fragment.
const ENVELOPE_OVERHEAD: usize = 128;
const MAX_TRANSFER_ID_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Hard ceiling of the signaling channel.
    pub max_signal_bytes: usize,
    /// Serialized payloads up to this size go out as a single signal.
    pub single_shot_bytes: usize,
    /// Budget per fragment, measured on the fragment's escaped JSON form.
    pub fragment_bytes: usize,
    pub max_transfer_bytes: usize,
    /// Partial transfers idle longer than this are dropped.
    pub reassembly_timeout: Duration,
    pub max_inflight: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_signal_bytes: DEFAULT_MAX_SIGNAL_BYTES,
            single_shot_bytes: DEFAULT_SINGLE_SHOT_BYTES,
            fragment_bytes: DEFAULT_FRAGMENT_BYTES,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

impl ChunkConfig {
    pub fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let min_signal = ENVELOPE_OVERHEAD + MIN_FRAGMENT_BYTES;
        Self {
            max_signal_bytes: parse_usize(
                lookup,
                "COSTATE_MAX_SIGNAL_BYTES",
                DEFAULT_MAX_SIGNAL_BYTES,
                min_signal,
            ),
            single_shot_bytes: parse_usize(
                lookup,
                "COSTATE_SINGLE_SHOT_BYTES",
                DEFAULT_SINGLE_SHOT_BYTES,
                MIN_FRAGMENT_BYTES,
            ),
            fragment_bytes: parse_usize(
                lookup,
                "COSTATE_FRAGMENT_BYTES",
                DEFAULT_FRAGMENT_BYTES,
                MIN_FRAGMENT_BYTES,
            ),
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            reassembly_timeout: parse_duration_ms(
                lookup,
                "COSTATE_REASSEMBLY_TIMEOUT_MS",
                DEFAULT_REASSEMBLY_TIMEOUT,
                Duration::from_millis(1),
            ),
            max_inflight: parse_usize(lookup, "COSTATE_MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT, 1),
        }
    }

    /// Largest payload sent without chunking; never above the channel ceiling.
    pub fn single_shot_limit(&self) -> usize {
        self.single_shot_bytes.min(self.max_signal_bytes)
    }

    /// Fragment budget that keeps an encoded chunk under the channel ceiling.
    pub fn fragment_budget(&self) -> usize {
        self.fragment_bytes
            .min(self.max_signal_bytes.saturating_sub(ENVELOPE_OVERHEAD))
            .max(MIN_FRAGMENT_BYTES)
    }

    /// Upper bound on fragments per transfer, assuming worst-case escaping.
    pub fn max_fragments(&self) -> usize {
        let min_raw = (self.fragment_budget() / 6).max(1);
        self.max_transfer_bytes.div_ceil(min_raw)
    }

    pub fn needs_chunking(&self, serialized: &str) -> bool {
        serialized.len() > self.single_shot_limit()
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("transfer exceeds max size: {0} bytes")]
    TransferTooLarge(usize),
    #[error("fragment too large: {0} bytes")]
    FragmentTooLarge(usize),
    #[error("chunk malformed: {0}")]
    Malformed(&'static str),
    #[error("chunk json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One fragment of a chunked transfer, as carried in a chunk signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub transfer_id: String,
    pub seq: u32,
    pub total: u32,
    pub fragment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    Timeout,
    Capacity,
}

impl GcReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GcReason::Timeout => "timeout",
            GcReason::Capacity => "capacity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEvent {
    pub transfer_id: String,
    pub reason: GcReason,
    pub received: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub transfer_id: String,
    pub payload: String,
    pub fragments: u32,
    pub started_at: Instant,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub completed: Option<Reassembled>,
    pub gc_events: Vec<GcEvent>,
}

#[derive(Debug)]
struct PartialTransfer {
    created_at: Instant,
    last_seen: Instant,
    total: u32,
    fragments: Vec<Option<String>>,
    received: u32,
    received_bytes: usize,
}

impl PartialTransfer {
    fn new(total: u32, now: Instant) -> Self {
        Self {
            created_at: now,
            last_seen: now,
            total,
            fragments: vec![None; total as usize],
            received: 0,
            received_bytes: 0,
        }
    }

    fn gc_event(&self, transfer_id: &str, reason: GcReason) -> GcEvent {
        GcEvent {
            transfer_id: transfer_id.to_string(),
            reason,
            received: self.received,
            total: self.total,
        }
    }
}

/// Buffers fragments per transfer and rebuilds payloads in `seq` order,
/// whatever order the fragments arrive in.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<String, PartialTransfer>,
    config: ChunkConfig,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            config,
        }
    }

    pub fn inflight(&self) -> usize {
        self.partials.len()
    }

    pub fn inflight_bytes(&self) -> usize {
        self.partials.values().map(|p| p.received_bytes).sum()
    }

    pub fn ingest(&mut self, chunk: Chunk, now: Instant) -> Result<IngestOutcome, ChunkError> {
        let mut outcome = IngestOutcome::default();
        validate_chunk(&chunk, &self.config)?;

        if chunk.total == 1 {
            outcome.completed = Some(Reassembled {
                transfer_id: chunk.transfer_id,
                payload: chunk.fragment,
                fragments: 1,
                started_at: now,
            });
            return Ok(outcome);
        }

        let Chunk {
            transfer_id,
            seq,
            total,
            fragment,
        } = chunk;

        if !self.partials.contains_key(&transfer_id) && self.partials.len() >= self.config.max_inflight
        {
            if let Some(evicted) = self.evict_oldest() {
                outcome.gc_events.push(evicted);
            }
        }

        let mut total_mismatch = false;
        let mut oversize_bytes = None;
        let mut completed: Option<(String, Instant)> = None;

        {
            let entry = self
                .partials
                .entry(transfer_id.clone())
                .or_insert_with(|| PartialTransfer::new(total, now));
            entry.last_seen = now;

            if entry.total != total {
                total_mismatch = true;
            } else {
                let slot = seq as usize;
                if entry.fragments[slot].is_none() {
                    entry.received_bytes = entry.received_bytes.saturating_add(fragment.len());
                    entry.fragments[slot] = Some(fragment);
                    entry.received += 1;
                    if entry.received_bytes > self.config.max_transfer_bytes {
                        oversize_bytes = Some(entry.received_bytes);
                    }
                }

                if entry.received == entry.total && oversize_bytes.is_none() {
                    let mut combined = String::with_capacity(entry.received_bytes);
                    for part in entry.fragments.iter() {
                        match part {
                            Some(part) => combined.push_str(part),
                            None => {
                                return Err(ChunkError::Malformed(
                                    "missing fragment during reassembly",
                                ));
                            }
                        }
                    }
                    completed = Some((combined, entry.created_at));
                }
            }
        }

        if total_mismatch {
            self.partials.remove(&transfer_id);
            return Err(ChunkError::Malformed("chunk total changed for transfer"));
        }

        if let Some(size) = oversize_bytes {
            self.partials.remove(&transfer_id);
            return Err(ChunkError::TransferTooLarge(size));
        }

        if let Some((payload, started_at)) = completed {
            self.partials.remove(&transfer_id);
            outcome.completed = Some(Reassembled {
                transfer_id,
                payload,
                fragments: total,
                started_at,
            });
        }

        Ok(outcome)
    }

    /// Drops transfers that have not seen a fragment within the timeout.
    pub fn gc(&mut self, now: Instant) -> Vec<GcEvent> {
        let timeout = self.config.reassembly_timeout;
        let mut dropped = Vec::new();
        self.partials.retain(|transfer_id, partial| {
            let expired = now.saturating_duration_since(partial.last_seen) > timeout;
            if expired {
                dropped.push(partial.gc_event(transfer_id, GcReason::Timeout));
            }
            !expired
        });
        dropped
    }

    pub fn clear(&mut self) -> usize {
        let count = self.partials.len();
        self.partials.clear();
        count
    }

    fn evict_oldest(&mut self) -> Option<GcEvent> {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.last_seen)
            .map(|(transfer_id, _)| transfer_id.clone())?;
        let partial = self.partials.remove(&oldest)?;
        Some(partial.gc_event(&oldest, GcReason::Capacity))
    }
}

/// Splits a serialized payload into fragments whose escaped form fits the
/// fragment budget. Cuts only on character boundaries.
pub fn split_payload(
    payload: &str,
    transfer_id: &str,
    config: &ChunkConfig,
) -> Result<Vec<Chunk>, ChunkError> {
    if payload.len() > config.max_transfer_bytes {
        return Err(ChunkError::TransferTooLarge(payload.len()));
    }
    let budget = config.fragment_budget();

    let mut pieces: Vec<&str> = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (idx, ch) in payload.char_indices() {
        let cost = escaped_len(ch);
        if used + cost > budget && idx > start {
            pieces.push(&payload[start..idx]);
            start = idx;
            used = 0;
        }
        used += cost;
    }
    if start < payload.len() || pieces.is_empty() {
        pieces.push(&payload[start..]);
    }

    let total =
        u32::try_from(pieces.len()).map_err(|_| ChunkError::Malformed("chunk total overflow"))?;
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(seq, piece)| Chunk {
            transfer_id: transfer_id.to_string(),
            seq: seq as u32,
            total,
            fragment: piece.to_string(),
        })
        .collect())
}

pub fn encode_chunk(chunk: &Chunk) -> Result<String, ChunkError> {
    Ok(serde_json::to_string(chunk)?)
}

pub fn decode_chunk(raw: &str) -> Result<Chunk, ChunkError> {
    Ok(serde_json::from_str(raw)?)
}

/// Bytes `ch` occupies inside a JSON string literal.
fn escaped_len(ch: char) -> usize {
    match ch {
        '"' | '\\' | '\u{08}' | '\u{0c}' | '\n' | '\r' | '\t' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

fn validate_chunk(chunk: &Chunk, config: &ChunkConfig) -> Result<(), ChunkError> {
    if chunk.transfer_id.is_empty() || chunk.transfer_id.len() > MAX_TRANSFER_ID_LEN {
        return Err(ChunkError::Malformed("invalid transfer id"));
    }
    if chunk.total == 0 {
        return Err(ChunkError::Malformed("chunk total cannot be zero"));
    }
    if chunk.seq >= chunk.total {
        return Err(ChunkError::Malformed("chunk seq out of range"));
    }
    if chunk.total as usize > config.max_fragments() {
        return Err(ChunkError::TransferTooLarge(
            chunk.total as usize * config.fragment_budget(),
        ));
    }
    if chunk.fragment.len() > config.max_signal_bytes {
        return Err(ChunkError::FragmentTooLarge(chunk.fragment.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, thread_rng};
    use serde_json::json;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            max_signal_bytes: 512,
            single_shot_bytes: 256,
            fragment_bytes: 256,
            max_transfer_bytes: 1024 * 1024,
            reassembly_timeout: Duration::from_secs(1),
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }

    fn reassemble(chunks: Vec<Chunk>, config: ChunkConfig) -> Option<String> {
        let mut reassembler = Reassembler::new(config);
        let mut recovered = None;
        for chunk in chunks {
            let result = reassembler
                .ingest(chunk, Instant::now())
                .expect("ingest chunk");
            if let Some(done) = result.completed {
                recovered = Some(done.payload);
            }
        }
        recovered
    }

    #[test]
    fn split_and_reassemble_at_fragment_multiples() {
        let config = small_config();
        let budget = config.fragment_budget();
        for multiple in [1usize, 5, 50] {
            let payload = "a".repeat(multiple * budget);
            let chunks = split_payload(&payload, "t-1", &config).expect("split");
            assert_eq!(chunks.len(), multiple);
            assert_eq!(reassemble(chunks, config).as_deref(), Some(payload.as_str()));
        }
    }

    #[test]
    fn structured_payload_round_trips_deeply_equal() {
        let config = small_config();
        let budget = config.fragment_budget();
        for multiple in [1usize, 5, 50] {
            let items: Vec<_> = (0..multiple * budget / 24)
                .map(|i| json!({"id": format!("p{i}"), "q": "\"quoted\""}))
                .collect();
            let value = json!({"items": items});
            let serialized = serde_json::to_string(&value).expect("serialize");
            let chunks = split_payload(&serialized, "t-2", &config).expect("split");
            let rebuilt = reassemble(chunks, config).expect("complete");
            let parsed: serde_json::Value = serde_json::from_str(&rebuilt).expect("parse");
            assert_eq!(parsed, value);
        }
    }

    #[test]
    fn encoded_chunks_fit_the_signal_ceiling() {
        let config = small_config();
        let payload = "\"\\\n\u{1}é".repeat(400);
        let chunks = split_payload(&payload, "9b2f6a70-0000-4000-8000-000000000000", &config)
            .expect("split");
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let encoded = encode_chunk(chunk).expect("encode");
            assert!(
                encoded.len() <= config.max_signal_bytes,
                "chunk of {} bytes exceeds ceiling",
                encoded.len()
            );
        }
        assert_eq!(reassemble(chunks, config).as_deref(), Some(payload.as_str()));
    }

    #[test]
    fn duplicate_and_out_of_order_chunks_reassemble() {
        let config = small_config();
        let payload = "abcdefghijklmnopqrstuvwxyz".repeat(60);
        let chunks = split_payload(&payload, "t-3", &config).expect("split");
        assert!(chunks.len() > 2);

        let mut shuffled = chunks.clone();
        shuffled.shuffle(&mut thread_rng());
        // a duplicate of the first chunk must be ignored
        shuffled.insert(0, chunks[0].clone());

        assert_eq!(reassemble(shuffled, config).as_deref(), Some(payload.as_str()));
    }

    #[test]
    fn missing_chunk_gets_gced() {
        let config = small_config();
        let mut reassembler = Reassembler::new(config);
        let now = Instant::now();
        let first = Chunk {
            transfer_id: "t-4".into(),
            seq: 0,
            total: 2,
            fragment: "hello ".into(),
        };
        let outcome = reassembler.ingest(first, now).expect("ingest first");
        assert!(outcome.completed.is_none());
        assert!(reassembler.gc(now + Duration::from_millis(500)).is_empty());

        let dropped = reassembler.gc(now + config.reassembly_timeout + Duration::from_millis(1));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].reason, GcReason::Timeout);
        assert_eq!((dropped[0].received, dropped[0].total), (1, 2));
        assert_eq!(reassembler.inflight(), 0);
    }

    #[test]
    fn capacity_evicts_least_recent_transfer() {
        let config = ChunkConfig {
            max_inflight: 2,
            ..small_config()
        };
        let mut reassembler = Reassembler::new(config);
        let start = Instant::now();
        for (offset, id) in ["a", "b", "c"].into_iter().enumerate() {
            let outcome = reassembler
                .ingest(
                    Chunk {
                        transfer_id: id.into(),
                        seq: 0,
                        total: 3,
                        fragment: "x".into(),
                    },
                    start + Duration::from_millis(offset as u64),
                )
                .expect("ingest");
            if id == "c" {
                assert_eq!(outcome.gc_events.len(), 1);
                assert_eq!(outcome.gc_events[0].transfer_id, "a");
                assert_eq!(outcome.gc_events[0].reason, GcReason::Capacity);
            }
        }
        assert_eq!(reassembler.inflight(), 2);
    }

    #[test]
    fn inconsistent_total_is_rejected() {
        let mut reassembler = Reassembler::new(small_config());
        let now = Instant::now();
        let chunk = |seq, total| Chunk {
            transfer_id: "t-5".into(),
            seq,
            total,
            fragment: "x".into(),
        };
        reassembler.ingest(chunk(0, 3), now).expect("first");
        let err = reassembler.ingest(chunk(1, 4), now).expect_err("total changed");
        assert!(matches!(err, ChunkError::Malformed(_)));
        assert_eq!(reassembler.inflight(), 0);

        let err = reassembler.ingest(chunk(3, 3), now).expect_err("seq out of range");
        assert!(matches!(err, ChunkError::Malformed(_)));
    }

    #[test]
    fn oversize_rejected() {
        let config = ChunkConfig {
            max_transfer_bytes: 1024,
            ..small_config()
        };
        let payload = "z".repeat(2048);
        let err = split_payload(&payload, "t-6", &config).expect_err("expected oversize error");
        assert!(matches!(err, ChunkError::TransferTooLarge(2048)));
    }

    #[test]
    fn empty_payload_is_one_fragment() {
        let chunks = split_payload("", "t-7", &small_config()).expect("split");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total, 1);
    }

    #[test]
    fn wire_names_are_camel_case() {
        let chunk = Chunk {
            transfer_id: "t-8".into(),
            seq: 1,
            total: 2,
            fragment: "{\"a\"".into(),
        };
        let encoded = encode_chunk(&chunk).expect("encode");
        assert!(encoded.contains("\"transferId\":\"t-8\""));
        assert_eq!(decode_chunk(&encoded).expect("decode"), chunk);
    }
}
