//! Durable agent state.
//!
//! - [`DiskStore`]: atomic replace of a single file (temp, fsync, rename, chmod)
//! - [`ActionLog`]: the actions the agent already decided on plus the
//!   controller's ack token, persisted through a `DiskStore`

mod action_log;
mod disk_store;
mod error;

pub use action_log::ActionLog;
pub use disk_store::DiskStore;
pub use error::StorageError;
