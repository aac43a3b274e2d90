use std::time::Duration;

use signal_bus::SignalError;
use thiserror::Error;

use crate::model::{ActionError, ItemId};
use crate::transport::chunk::ChunkError;

/// Failure taxonomy of the sync layer. None of these reach UI callers
/// synchronously; they are logged, or surfaced through the awaitable send path.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport send failed: {0}")]
    Transport(#[from] SignalError),
    #[error("transport send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("incomplete transfer {transfer_id}: {received}/{total} fragments")]
    IncompleteTransfer {
        transfer_id: String,
        received: u32,
        total: u32,
    },
    #[error("unresolved catalog reference {0:?}")]
    UnresolvedReference(ItemId),
    #[error("action arrived after shutdown")]
    StaleAction,
    #[error("sync manager is not active")]
    NotActive,
    #[error("local action rejected: {0}")]
    Rejected(&'static str),
    #[error("no tokio runtime available to drive the session")]
    NoRuntime,
    #[error("outbound queue closed before the action was sent")]
    QueueClosed,
}

impl From<ChunkError> for SyncError {
    fn from(err: ChunkError) -> Self {
        SyncError::MalformedPayload(err.to_string())
    }
}

impl From<ActionError> for SyncError {
    fn from(err: ActionError) -> Self {
        SyncError::MalformedPayload(err.to_string())
    }
}

impl SyncError {
    /// Stable label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transport(_) => "transport",
            SyncError::SendTimeout(_) => "send_timeout",
            SyncError::MalformedPayload(_) => "malformed",
            SyncError::IncompleteTransfer { .. } => "incomplete",
            SyncError::UnresolvedReference(_) => "unresolved",
            SyncError::StaleAction => "stale",
            SyncError::NotActive => "inactive",
            SyncError::Rejected(_) => "rejected",
            SyncError::NoRuntime => "no_runtime",
            SyncError::QueueClosed => "queue_closed",
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
