use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static ACTIONS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "costate_actions_applied_total",
            "Actions run through the reducer",
        ),
        &["source", "type"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ACTIONS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "costate_actions_dropped_total",
            "Actions discarded before reaching the reducer",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SIGNALS_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "costate_signals_sent_total",
            "Signals handed to the session transport",
        ),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SIGNAL_SEND_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "costate_signal_send_failures_total",
            "Signals the session transport refused or timed out on",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CHUNKED_TRANSFERS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "costate_chunked_transfers_total",
            "Logical payloads split into or rebuilt from fragments",
        ),
        &["direction"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CHUNK_PARTIAL_GCED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "costate_chunk_partial_gced_total",
            "Partial transfers evicted or expired",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CHUNK_INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "costate_chunk_inflight",
            "Partial transfers currently buffered",
        ),
        &["unit"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static CATALOG_UNRESOLVED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "costate_catalog_unresolved_total",
            "Identifiers missing from the local catalog",
        ),
        &["catalog"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Text exposition of every registered metric.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
