//! Administrative actions and their handlers.
//!
//! An [`Action`] is an immutable instruction, either delivered by the
//! controller or inferred locally by the agent (`is_detected`). The
//! [`ActionDispatcher`] hands each action to the [`ActionHandler`] registered
//! for its [`ActionKind`].

mod closers;
mod dispatcher;
mod handler;
mod unenroll;

use std::fmt;

use hostd_id::DetectedActionId;
use serde::{Deserialize, Serialize};

pub use closers::CloserSet;
pub use dispatcher::{ActionDispatcher, UnsupportedHandler};
pub use handler::{ActionHandler, HandlerError};
pub use unenroll::UnenrollHandler;

/// Identifier assigned to an action by whoever created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ActionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Discriminant of an action payload, as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Unenroll,
    PolicyChange,
    Upgrade,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unenroll => "UNENROLL",
            Self::PolicyChange => "POLICY_CHANGE",
            Self::Upgrade => "UPGRADE",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// New policy for the agent to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyChangeAction {
    pub policy: serde_json::Value,
}

/// Request to move to another agent version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAction {
    pub version: String,
    #[serde(default)]
    pub source_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    Unenroll,
    PolicyChange(PolicyChangeAction),
    Upgrade(UpgradeAction),
}

/// One administrative action.
///
/// Wire and on-disk form:
/// `{"id": "a1", "type": "UNENROLL", "data": null, "is_detected": false}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub struct Action {
    pub id: ActionId,

    /// True when the agent inferred this action itself instead of receiving
    /// it from the controller. Detected actions are never acked remotely.
    pub is_detected: bool,

    pub payload: ActionPayload,
}

impl Action {
    pub fn new(id: impl Into<ActionId>, payload: ActionPayload) -> Self {
        Self {
            id: id.into(),
            is_detected: false,
            payload,
        }
    }

    /// A controller-issued unenroll.
    pub fn unenroll(id: impl Into<ActionId>) -> Self {
        Self::new(id, ActionPayload::Unenroll)
    }

    /// An unenroll the agent decided on by itself, e.g. after the controller
    /// stopped accepting its credentials.
    pub fn detected_unenroll() -> Self {
        Self {
            id: ActionId::new(DetectedActionId::new().to_string()),
            is_detected: true,
            payload: ActionPayload::Unenroll,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self.payload {
            ActionPayload::Unenroll => ActionKind::Unenroll,
            ActionPayload::PolicyChange(_) => ActionKind::PolicyChange,
            ActionPayload::Upgrade(_) => ActionKind::Upgrade,
        }
    }
}

/// Flat serde shape of [`Action`]; `data` is decoded according to `type`.
#[derive(Serialize, Deserialize)]
struct RawAction {
    id: ActionId,
    #[serde(rename = "type")]
    kind: ActionKind,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    is_detected: bool,
}

impl TryFrom<RawAction> for Action {
    type Error = serde_json::Error;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let payload = match raw.kind {
            ActionKind::Unenroll => ActionPayload::Unenroll,
            ActionKind::PolicyChange => ActionPayload::PolicyChange(serde_json::from_value(raw.data)?),
            ActionKind::Upgrade => ActionPayload::Upgrade(serde_json::from_value(raw.data)?),
        };
        Ok(Self {
            id: raw.id,
            is_detected: raw.is_detected,
            payload,
        })
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        let kind = action.kind();
        let data = match action.payload {
            ActionPayload::Unenroll => serde_json::Value::Null,
            ActionPayload::PolicyChange(p) => serde_json::json!({ "policy": p.policy }),
            ActionPayload::Upgrade(u) => serde_json::json!({
                "version": u.version,
                "source_uri": u.source_uri,
            }),
        };
        Self {
            id: action.id,
            kind,
            data,
            is_detected: action.is_detected,
        }
    }
}
