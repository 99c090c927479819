//! Configuration for the agent.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use hostd_id::AgentId;

/// File name of the action store inside the data directory.
const ACTION_STORE_FILE: &str = "action_store.json";

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this agent installation.
    pub agent_id: AgentId,

    /// Controller API URL.
    pub controller_url: String,

    /// Data directory for local state.
    pub data_dir: String,

    /// Check-in interval in seconds.
    pub checkin_interval_secs: u64,

    /// Consecutive unauthorized check-ins before the agent unenrolls itself.
    pub unauthorized_threshold: u32,

    /// Permission bits for persisted state files.
    pub state_file_mode: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let agent_id = match std::env::var("HOSTD_AGENT_ID") {
            Ok(s) => s
                .parse()
                .with_context(|| format!("invalid HOSTD_AGENT_ID '{s}'"))?,
            Err(_) => AgentId::new(),
        };

        let controller_url = std::env::var("HOSTD_CONTROLLER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8220".to_string());

        let data_dir =
            std::env::var("HOSTD_DATA_DIR").unwrap_or_else(|_| "/var/lib/hostd".to_string());

        let checkin_interval_secs = match std::env::var("HOSTD_CHECKIN_INTERVAL") {
            Ok(s) => parse_interval(&s)?,
            Err(_) => 30,
        };

        let unauthorized_threshold = std::env::var("HOSTD_UNAUTHORIZED_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(7);

        let state_file_mode = match std::env::var("HOSTD_STATE_MODE") {
            Ok(s) => parse_mode(&s)?,
            Err(_) => 0o600,
        };

        Ok(Self {
            agent_id,
            controller_url,
            data_dir,
            checkin_interval_secs,
            unauthorized_threshold,
            state_file_mode,
        })
    }

    /// Where the action log is persisted.
    pub fn action_store_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(ACTION_STORE_FILE)
    }
}

/// Parse a check-in interval in whole seconds. Zero is rejected: the loop
/// needs a non-zero period.
pub fn parse_interval(secs: &str) -> Result<u64> {
    let secs: u64 = secs
        .trim()
        .parse()
        .with_context(|| format!("invalid check-in interval '{secs}'"))?;
    if secs == 0 {
        bail!("check-in interval must be at least 1 second");
    }
    Ok(secs)
}

/// Parse an octal mode string (e.g. "0600"). State files must not be
/// readable by group or others.
pub fn parse_mode(mode_str: &str) -> Result<u32> {
    let digits = mode_str.trim().trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8)
        .with_context(|| format!("invalid file mode '{mode_str}'"))?;

    if mode > 0o777 {
        bail!("file mode '{mode_str}' is out of range");
    }
    if mode & 0o077 != 0 {
        bail!("file mode '{mode_str}' grants group or world access");
    }
    Ok(mode)
}
