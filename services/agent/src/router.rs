//! Desired running set, keyed by routing key.
//!
//! Action handlers express "what should run" by submitting a full mapping to
//! a [`Router`]. An empty mapping is the way to ask for nothing to run. The
//! program supervisor follows changes through [`RoutingTable::subscribe`] and
//! owns actually starting and stopping programs, so a submitted update may
//! still be settling when `route` returns.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::actions::ActionId;

/// Unit under which a group of programs is routed (e.g. an output name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A worker program that should be running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Full desired mapping. Empty means "run nothing".
pub type RoutingMap = BTreeMap<RoutingKey, Vec<ProgramSpec>>;

/// The last accepted update.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    /// Action that submitted this mapping.
    pub action_id: ActionId,
    pub programs: RoutingMap,
}

impl DesiredState {
    pub fn program_count(&self) -> usize {
        self.programs.values().map(Vec::len).sum()
    }
}

/// Accepts desired-state updates.
pub trait Router: Send + Sync {
    /// Replace the desired running set with `mapping`.
    ///
    /// Returns once the update is accepted, not once programs have settled.
    fn route(&self, action_id: &ActionId, mapping: RoutingMap);
}

/// In-process [`Router`] backed by a watch channel.
#[derive(Debug)]
pub struct RoutingTable {
    tx: watch::Sender<Option<Arc<DesiredState>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Current desired state; `None` until the first update.
    pub fn desired(&self) -> Option<Arc<DesiredState>> {
        self.tx.borrow().clone()
    }

    /// Follow desired-state changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<DesiredState>>> {
        self.tx.subscribe()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for RoutingTable {
    fn route(&self, action_id: &ActionId, mapping: RoutingMap) {
        let state = DesiredState {
            action_id: action_id.clone(),
            programs: mapping,
        };

        info!(
            action_id = %action_id,
            routing_keys = state.programs.len(),
            programs = state.program_count(),
            "Desired running set updated"
        );

        // send_replace stores the value even when nobody is subscribed.
        self.tx.send_replace(Some(Arc::new(state)));
    }
}
