//! UNENROLL: take the agent out of management.
//!
//! Unenrolling leaves the agent idle: not managed and not standalone. It has
//! to be enrolled or reconfigured before it does anything again.
//!
//! Sequence per action:
//!
//! ```text
//! Received → RoutingStopped → {RemoteAcked | LocallyPersisted | Skipped} → ClosersInvoked → Done
//! ```
//!
//! Routing is stopped before anything else so old work never keeps running
//! next to state that says it stopped. Any failure after that returns early
//! without closing the background loops: the action is not handled yet.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Action, ActionHandler, ActionKind, CloserSet, HandlerError};
use crate::acker::Acker;
use crate::router::{Router, RoutingMap};
use crate::storage::ActionLog;

/// Handler for [`ActionKind::Unenroll`].
pub struct UnenrollHandler {
    router: Arc<dyn Router>,
    closers: CloserSet,
    action_log: Option<Arc<ActionLog>>,
}

impl UnenrollHandler {
    /// `closers` end the loops that must stop once the agent is unenrolled
    /// (at least the check-in loop). Without an `action_log`, detected
    /// unenrolls are not recorded.
    pub fn new(
        router: Arc<dyn Router>,
        closers: CloserSet,
        action_log: Option<Arc<ActionLog>>,
    ) -> Self {
        if closers.is_empty() {
            warn!("Unenroll handler has no background loops to close");
        }
        Self {
            router,
            closers,
            action_log,
        }
    }

    /// Record a detected unenroll so the next start does not go back to the
    /// controller.
    async fn persist(
        &self,
        ctx: &CancellationToken,
        log: &Arc<ActionLog>,
        action: &Action,
    ) -> Result<(), HandlerError> {
        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled {
                stage: "saving action store",
            });
        }

        // Already recorded by an earlier attempt whose closers never ran.
        if log.actions().iter().any(|a| a.id == action.id) {
            return Ok(());
        }

        let log = Arc::clone(log);
        let action = action.clone();
        let save = tokio::task::spawn_blocking(move || log.record(action));

        tokio::select! {
            joined = save => joined?.map_err(HandlerError::Persist),
            // The blocking write is not aborted and may still land on disk.
            _ = ctx.cancelled() => Err(HandlerError::Cancelled {
                stage: "saving action store",
            }),
        }
    }
}

#[async_trait]
impl ActionHandler for UnenrollHandler {
    async fn handle(
        &self,
        ctx: &CancellationToken,
        action: &Action,
        acker: &dyn Acker,
    ) -> Result<(), HandlerError> {
        debug!(
            action_id = %action.id,
            kind = %action.kind(),
            is_detected = action.is_detected,
            "Unenroll handler received action"
        );

        if action.kind() != ActionKind::Unenroll {
            return Err(HandlerError::UnexpectedKind {
                expected: ActionKind::Unenroll,
                actual: action.kind(),
            });
        }

        // Empty mapping stops every routed program.
        self.router.route(&action.id, RoutingMap::new());

        if !action.is_detected {
            // Only controller-issued actions are acked.
            acker.ack(ctx, action).await.map_err(HandlerError::Ack)?;
            acker.commit(ctx).await.map_err(HandlerError::Commit)?;
        } else if let Some(log) = &self.action_log {
            self.persist(ctx, log, action).await?;
        }

        let closed = self.closers.close_all();

        info!(
            action_id = %action.id,
            is_detected = action.is_detected,
            loops_closed = closed,
            loops_total = self.closers.len(),
            "Agent unenrolled"
        );
        Ok(())
    }
}
