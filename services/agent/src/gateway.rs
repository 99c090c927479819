//! Check-in loop with the controller.
//!
//! The gateway periodically checks in with the last persisted ack token,
//! dispatches whatever actions come back, and advances the ack token only
//! after the whole batch was handled. It is one of the background loops an
//! unenroll ends: its cancellation token is registered as a closer.
//!
//! If the controller keeps rejecting the agent's credentials, the gateway
//! concludes the agent was unenrolled behind its back and dispatches a
//! locally detected unenroll.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acker::Acker;
use crate::actions::{Action, ActionDispatcher, ActionKind};
use crate::client::{CheckinResponse, ClientError, ControllerClient};
use crate::config::Config;
use crate::storage::ActionLog;

/// Whether the action log records an unenroll, in which case the agent must
/// not start checking in again.
pub fn unenrolled(log: &ActionLog) -> bool {
    log.actions()
        .iter()
        .any(|action| action.kind() == ActionKind::Unenroll)
}

/// Gateway loop configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Interval between check-ins.
    pub checkin_interval: Duration,

    /// Consecutive unauthorized check-ins that trigger a detected unenroll.
    pub unauthorized_threshold: u32,
}

impl From<&Config> for GatewayConfig {
    fn from(config: &Config) -> Self {
        Self {
            checkin_interval: Duration::from_secs(config.checkin_interval_secs.max(1)),
            unauthorized_threshold: config.unauthorized_threshold.max(1),
        }
    }
}

/// Polls the controller and feeds actions to the dispatcher.
pub struct CheckinGateway {
    client: Arc<ControllerClient>,
    dispatcher: Arc<ActionDispatcher>,
    acker: Arc<dyn Acker>,
    action_log: Arc<ActionLog>,
    config: GatewayConfig,
    // Detected unenroll that failed and is retried under the same id.
    pending_detected: Mutex<Option<Action>>,
}

impl CheckinGateway {
    pub fn new(
        client: Arc<ControllerClient>,
        dispatcher: Arc<ActionDispatcher>,
        acker: Arc<dyn Acker>,
        action_log: Arc<ActionLog>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            client,
            dispatcher,
            acker,
            action_log,
            config,
            pending_detected: Mutex::new(None),
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            agent_id = %self.client.agent_id(),
            interval_ms = self.config.checkin_interval.as_millis() as u64,
            "Starting check-in loop"
        );

        let mut interval = tokio::time::interval(self.config.checkin_interval);
        let mut unauthorized = 0u32;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Check-in loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.checkin(&cancel, &mut unauthorized).await;
                }
            }
        }
    }

    async fn checkin(&self, cancel: &CancellationToken, unauthorized: &mut u32) {
        let ack_token = self.action_log.ack_token();

        let result = tokio::select! {
            result = self.client.checkin(&ack_token) => result,
            _ = cancel.cancelled() => return,
        };

        match result {
            Ok(response) => {
                *unauthorized = 0;
                self.pending().take();
                self.apply(cancel, response).await;
            }
            Err(ClientError::Unauthorized) => {
                *unauthorized += 1;
                warn!(
                    consecutive = *unauthorized,
                    threshold = self.config.unauthorized_threshold,
                    "Check-in unauthorized"
                );
                if *unauthorized >= self.config.unauthorized_threshold {
                    self.unenroll_detected(cancel).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Check-in failed, will retry");
            }
        }
    }

    async fn apply(&self, cancel: &CancellationToken, response: CheckinResponse) {
        let actions = response.decode_actions();

        if !actions.is_empty() {
            if let Err(e) = self
                .dispatcher
                .dispatch(cancel, self.acker.as_ref(), &actions)
                .await
            {
                warn!(error = %e, "Actions not handled, will retry on next check-in");
                return;
            }
        }

        let Some(token) = response.ack_token else {
            return;
        };
        if token == self.action_log.ack_token() {
            return;
        }

        self.action_log.set_ack_token(token);
        let log = Arc::clone(&self.action_log);
        match tokio::task::spawn_blocking(move || log.save()).await {
            Ok(Ok(())) => debug!("Ack token persisted"),
            Ok(Err(e)) => error!(error = %e, "Failed to persist ack token"),
            Err(e) => error!(error = %e, "Ack token save task failed"),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<Action>> {
        self.pending_detected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch a detected unenroll. A failed attempt is retried with the
    /// same action id, so the action log never holds more than one.
    async fn unenroll_detected(&self, cancel: &CancellationToken) {
        let action = self
            .pending()
            .get_or_insert_with(Action::detected_unenroll)
            .clone();
        warn!(
            action_id = %action.id,
            "Controller keeps rejecting this agent, unenrolling locally"
        );

        match self
            .dispatcher
            .dispatch(cancel, self.acker.as_ref(), std::slice::from_ref(&action))
            .await
        {
            Ok(()) => {
                self.pending().take();
            }
            Err(e) => error!(action_id = %action.id, error = %e, "Detected unenroll failed"),
        }
    }
}
