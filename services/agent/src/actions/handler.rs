//! The action handler seam.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{Action, ActionKind};
use crate::acker::{AckError, Acker};
use crate::storage::StorageError;

/// Errors from handling one action.
///
/// Every variant means the action is not complete and the whole action can be
/// retried.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The action was delivered to a handler for a different kind.
    #[error("invalid type, expected {expected} and received {actual}")]
    UnexpectedKind {
        expected: ActionKind,
        actual: ActionKind,
    },

    #[error("failed to ack action: {0}")]
    Ack(#[source] AckError),

    #[error("failed to commit acks: {0}")]
    Commit(#[source] AckError),

    #[error("failed to persist action: {0}")]
    Persist(#[source] StorageError),

    #[error("cancelled while {stage}")]
    Cancelled { stage: &'static str },

    /// A blocking persistence task panicked or was aborted.
    #[error("persistence task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Handles one kind of action.
///
/// Handlers are single-attempt: they never retry. The caller delivers actions
/// one at a time per handler.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &CancellationToken,
        action: &Action,
        acker: &dyn Acker,
    ) -> Result<(), HandlerError>;
}
