use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::error::SyncResult;
use crate::model::Action;
use crate::transport::{ChunkedCodec, ProgressFn, SendReport};

pub(super) struct OutboundJob {
    pub action: Action,
    pub on_progress: Option<ProgressFn>,
    pub done: Option<oneshot::Sender<SyncResult<SendReport>>>,
}

/// Drains the session's outbound queue one action at a time, so whole
/// actions leave in dispatch order and fragments never interleave.
pub(super) async fn run(codec: Arc<ChunkedCodec>, mut jobs: mpsc::UnboundedReceiver<OutboundJob>) {
    while let Some(job) = jobs.recv().await {
        let OutboundJob {
            action,
            on_progress,
            done,
        } = job;
        let result = codec.send(&action, on_progress.as_ref()).await;
        match &result {
            Ok(report) => trace!(
                target = "costate::outbound",
                action = %action.action_type(),
                ts = action.ts,
                fragments = report.fragments,
                bytes = report.bytes,
                "action sent"
            ),
            Err(err) => warn!(
                target = "costate::outbound",
                action = %action.action_type(),
                ts = action.ts,
                error = %err,
                "action send failed; local state kept"
            ),
        }
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }
    trace!(target = "costate::outbound", "outbound queue closed");
}
