//! Persisted log of handled actions and the controller ack token.
//!
//! The agent records actions it decided on locally (a detected unenroll) so
//! that after a restart it does not go back to the controller for work it
//! has already abandoned. The ack token is the controller's cursor into its
//! action stream.
//!
//! Mutations are in memory only until [`ActionLog::save`] is called; there is
//! no background flush. [`ActionLog::record`] appends and saves as one step.

use std::io::Read;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::disk_store::DiskStore;
use super::error::StorageError;
use crate::actions::Action;

/// On-disk format version.
const STORE_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct PersistedLog {
    version: u32,
    #[serde(default)]
    ack_token: String,
    #[serde(default)]
    actions: Vec<Action>,
}

#[derive(Serialize)]
struct PersistedLogRef<'a> {
    version: u32,
    ack_token: &'a str,
    actions: &'a [Action],
}

#[derive(Debug, Default)]
struct LogState {
    actions: Vec<Action>,
    ack_token: String,
}

/// Ordered action record plus ack token, saved together in one file.
///
/// Appends are never reordered or deduplicated here. Callers that need
/// duplicate suppression check [`ActionLog::actions`] first.
#[derive(Debug)]
pub struct ActionLog {
    store: DiskStore,
    state: Mutex<LogState>,
}

impl ActionLog {
    /// Load the log from `store`, starting empty if nothing was saved yet.
    pub fn open(store: DiskStore) -> Result<Self, StorageError> {
        let mut raw = Vec::new();
        store
            .load()?
            .read_to_end(&mut raw)
            .map_err(|e| StorageError::fs("could not read", store.path(), e))?;

        let state = if raw.iter().all(u8::is_ascii_whitespace) {
            debug!(path = %store.path().display(), "No saved actions, starting fresh");
            LogState::default()
        } else {
            let persisted: PersistedLog =
                serde_json::from_slice(&raw).map_err(|source| StorageError::Decode {
                    path: store.path().to_path_buf(),
                    source,
                })?;

            if persisted.version != STORE_VERSION {
                return Err(StorageError::UnsupportedVersion {
                    path: store.path().to_path_buf(),
                    found: persisted.version,
                    expected: STORE_VERSION,
                });
            }

            info!(
                path = %store.path().display(),
                action_count = persisted.actions.len(),
                "Loaded action store"
            );

            LogState {
                actions: persisted.actions,
                ack_token: persisted.ack_token,
            }
        };

        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an action in memory. Call [`ActionLog::save`] to persist it.
    pub fn add(&self, action: Action) {
        self.lock().actions.push(action);
    }

    pub fn ack_token(&self) -> String {
        self.lock().ack_token.clone()
    }

    pub fn set_ack_token(&self, token: impl Into<String>) {
        self.lock().ack_token = token.into();
    }

    /// Snapshot of the recorded actions, oldest first.
    pub fn actions(&self) -> Vec<Action> {
        self.lock().actions.clone()
    }

    /// Persist the actions and ack token together.
    ///
    /// The state lock is held across the write, so saves of this log are
    /// serialised and never land on disk out of order.
    pub fn save(&self) -> Result<(), StorageError> {
        let state = self.lock();
        self.write(&state.ack_token, &state.actions)
    }

    /// Append `action` and persist it in one step.
    ///
    /// The action only becomes part of the in-memory log once it is on disk.
    /// On error the log is left as it was, so a later [`ActionLog::save`]
    /// cannot make it durable behind the caller's back.
    pub fn record(&self, action: Action) -> Result<(), StorageError> {
        let mut state = self.lock();
        let mut actions = Vec::with_capacity(state.actions.len() + 1);
        actions.extend_from_slice(&state.actions);
        actions.push(action);

        self.write(&state.ack_token, &actions)?;
        state.actions = actions;
        Ok(())
    }

    fn write(&self, ack_token: &str, actions: &[Action]) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec_pretty(&PersistedLogRef {
            version: STORE_VERSION,
            ack_token,
            actions,
        })
        .map_err(StorageError::Encode)?;

        self.store.save(encoded.as_slice())?;

        debug!(
            path = %self.store.path().display(),
            action_count = actions.len(),
            "Saved action store"
        );
        Ok(())
    }
}
