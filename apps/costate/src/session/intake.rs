use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use signal_bus::Signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tracing::{trace, warn};

use super::manager::Shared;
use crate::metrics;
use crate::model::Role;
use crate::transport::ChunkedCodec;

/// Remote intake loop: whole actions, chunk fragments, and the periodic
/// reassembly sweep. Holds the manager weakly and exits once it is gone.
pub(super) async fn run(
    shared: Weak<Shared>,
    codec: Arc<ChunkedCodec>,
    local_role: Role,
    mut actions: broadcast::Receiver<Signal>,
    mut chunks: broadcast::Receiver<Signal>,
    sweep_every: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = actions.recv() => match received {
                Ok(signal) => {
                    let Some(shared) = shared.upgrade() else { break };
                    shared.receive_payload(&signal.data, None, local_role);
                }
                Err(RecvError::Lagged(skipped)) => lagged("action", skipped),
                Err(RecvError::Closed) => break,
            },
            received = chunks.recv() => match received {
                Ok(signal) => {
                    let Some(shared) = shared.upgrade() else { break };
                    match codec.receive_chunk(&signal.data, Instant::now()) {
                        Ok(Some(done)) => {
                            shared.receive_payload(&done.payload, Some(done.transfer_id), local_role);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            metrics::ACTIONS_DROPPED.with_label_values(&[err.kind()]).inc();
                            warn!(
                                target = "costate::intake",
                                error = %err,
                                "dropping chunk signal"
                            );
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => lagged("chunk", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = sweep.tick() => {
                if shared.strong_count() == 0 {
                    break;
                }
                codec.sweep(Instant::now());
            }
        }
    }
    trace!(target = "costate::intake", "intake loop exited");
}

fn lagged(kind: &'static str, skipped: u64) {
    metrics::ACTIONS_DROPPED
        .with_label_values(&["lagged"])
        .inc_by(skipped);
    warn!(
        target = "costate::intake",
        kind,
        skipped,
        "intake lagged; signals lost"
    );
}
