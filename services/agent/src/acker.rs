//! Acknowledging actions back to the controller.
//!
//! `ack` must precede `commit`; `commit` finalises every ack issued since the
//! previous successful commit. Neither retries: a failed commit keeps its
//! acks buffered and the caller decides when to try again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hostd_id::RequestId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::actions::Action;
use crate::client::{AckEvent, AckRequest, ClientError, ControllerClient};

/// Errors from the ack protocol.
#[derive(Debug, Error)]
pub enum AckError {
    #[error("ack transport failed: {0}")]
    Transport(#[from] ClientError),

    #[error("ack cancelled")]
    Cancelled,
}

/// Ack/commit protocol client.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Record `action` as handled. Not final until [`Acker::commit`].
    async fn ack(&self, ctx: &CancellationToken, action: &Action) -> Result<(), AckError>;

    /// Deliver every ack recorded since the last successful commit.
    async fn commit(&self, ctx: &CancellationToken) -> Result<(), AckError>;
}

/// [`Acker`] that buffers acks in memory and posts them on commit.
#[derive(Debug)]
pub struct HttpAcker {
    client: Arc<ControllerClient>,
    pending: Mutex<Vec<AckEvent>>,
}

impl HttpAcker {
    pub fn new(client: Arc<ControllerClient>) -> Self {
        Self {
            client,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<AckEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of acks waiting for a commit.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

#[async_trait]
impl Acker for HttpAcker {
    async fn ack(&self, ctx: &CancellationToken, action: &Action) -> Result<(), AckError> {
        if ctx.is_cancelled() {
            return Err(AckError::Cancelled);
        }
        self.pending().push(AckEvent::for_action(action));
        debug!(action_id = %action.id, "Action acked, waiting for commit");
        Ok(())
    }

    async fn commit(&self, ctx: &CancellationToken) -> Result<(), AckError> {
        let events = self.pending().clone();
        if events.is_empty() {
            return Ok(());
        }

        let request = AckRequest {
            request_id: RequestId::new(),
            events,
        };

        tokio::select! {
            result = self.client.send_acks(&request) => result?,
            _ = ctx.cancelled() => return Err(AckError::Cancelled),
        }

        // Only drop what was sent; acks added during the request stay queued.
        let sent = request.events.len();
        {
            let mut pending = self.pending();
            let sent_still_queued = sent.min(pending.len());
            pending.drain(..sent_still_queued);
        }

        info!(
            request_id = %request.request_id,
            event_count = sent,
            "Committed acks"
        );
        Ok(())
    }
}
