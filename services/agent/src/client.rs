//! Controller API client for the agent.
//!
//! Provides methods for communicating with the controller:
//! - Checking in (fetching pending actions, advancing the ack token)
//! - Posting action acknowledgements

use std::time::Duration;

use chrono::{DateTime, Utc};
use hostd_id::{AgentId, RequestId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::actions::{Action, ActionId, ActionKind};
use crate::config::Config;

/// Errors talking to the controller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("controller request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The controller no longer accepts this agent's credentials.
    #[error("controller rejected agent credentials")]
    Unauthorized,

    #[error("controller returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Controller API client.
#[derive(Debug)]
pub struct ControllerClient {
    client: reqwest::Client,
    base_url: String,
    agent_id: AgentId,
}

impl ControllerClient {
    /// Create a new controller client.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: config.controller_url.trim_end_matches('/').to_string(),
            agent_id: config.agent_id,
        })
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Check in, reporting the last ack token and receiving pending actions.
    pub async fn checkin(&self, ack_token: &str) -> Result<CheckinResponse, ClientError> {
        let url = format!("{}/v1/agents/{}/checkin", self.base_url, self.agent_id);
        debug!(url = %url, "Checking in");

        let request = CheckinRequest {
            ack_token: (!ack_token.is_empty()).then(|| ack_token.to_string()),
        };
        let response = self.client.post(&url).json(&request).send().await?;
        let response = check_status(response, "check in").await?;

        let body: CheckinResponse = response.json().await?;
        debug!(action_count = body.actions.len(), "Check-in completed");
        Ok(body)
    }

    /// Post a batch of acknowledgements.
    pub async fn send_acks(&self, request: &AckRequest) -> Result<(), ClientError> {
        let url = format!("{}/v1/agents/{}/acks", self.base_url, self.agent_id);
        debug!(
            request_id = %request.request_id,
            event_count = request.events.len(),
            "Sending acks"
        );

        let response = self.client.post(&url).json(request).send().await?;
        check_status(response, "send acks").await?;
        Ok(())
    }
}

async fn check_status(
    response: reqwest::Response,
    what: &'static str,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        warn!(operation = what, "Controller rejected agent credentials");
        return Err(ClientError::Unauthorized);
    }

    let body = response.text().await.unwrap_or_default();
    error!(operation = what, status = %status, body = %body, "Controller request failed");
    Err(ClientError::Status { status, body })
}

#[derive(Debug, Serialize)]
struct CheckinRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    ack_token: Option<String>,
}

/// Check-in response from the controller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckinResponse {
    /// New ack token, to be persisted once `actions` are handled.
    #[serde(default)]
    pub ack_token: Option<String>,

    /// Raw actions; decoded one by one so a single unknown action does not
    /// poison the whole batch.
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
}

impl CheckinResponse {
    /// Decode the actions this agent understands, skipping the rest.
    pub fn decode_actions(&self) -> Vec<Action> {
        self.actions
            .iter()
            .filter_map(|raw| match serde_json::from_value::<Action>(raw.clone()) {
                Ok(action) => Some(action),
                Err(e) => {
                    warn!(error = %e, action = %raw, "Skipping undecodable action");
                    None
                }
            })
            .collect()
    }
}

/// One acknowledged action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AckEvent {
    pub action_id: ActionId,
    pub action_type: ActionKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl AckEvent {
    pub fn for_action(action: &Action) -> Self {
        Self {
            action_id: action.id.clone(),
            action_type: action.kind(),
            timestamp: Utc::now(),
            message: format!("Action '{}' of type '{}' acknowledged.", action.id, action.kind()),
        }
    }
}

/// Body of an ack commit.
#[derive(Debug, Clone, Serialize)]
pub struct AckRequest {
    pub request_id: RequestId,
    pub events: Vec<AckEvent>,
}
