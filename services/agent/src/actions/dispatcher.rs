//! Routes actions to the handler registered for their kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Action, ActionHandler, ActionKind, HandlerError};
use crate::acker::Acker;

/// Fallback for kinds nobody registered: logs and moves on.
#[derive(Debug, Default)]
pub struct UnsupportedHandler;

#[async_trait]
impl ActionHandler for UnsupportedHandler {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        action: &Action,
        _acker: &dyn Acker,
    ) -> Result<(), HandlerError> {
        warn!(
            action_id = %action.id,
            kind = %action.kind(),
            "Action not supported by this agent, ignoring"
        );
        Ok(())
    }
}

/// Delivers actions to handlers strictly one at a time.
pub struct ActionDispatcher {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
    fallback: Arc<dyn ActionHandler>,
    // Serialises batches from concurrent callers.
    in_flight: Mutex<()>,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(UnsupportedHandler),
            in_flight: Mutex::new(()),
        }
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Handle `actions` in order. Stops at the first failure and returns it;
    /// the caller retries the batch.
    pub async fn dispatch(
        &self,
        ctx: &CancellationToken,
        acker: &dyn Acker,
        actions: &[Action],
    ) -> Result<(), HandlerError> {
        let _serial = self.in_flight.lock().await;

        for action in actions {
            let handler = self
                .handlers
                .get(&action.kind())
                .unwrap_or(&self.fallback);

            debug!(action_id = %action.id, kind = %action.kind(), "Dispatching action");

            if let Err(e) = handler.handle(ctx, action, acker).await {
                error!(
                    action_id = %action.id,
                    kind = %action.kind(),
                    error = %e,
                    "Action handling failed"
                );
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
