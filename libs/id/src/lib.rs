//! # hostd-id
//!
//! Typed identifiers minted by the hostd agent itself.
//!
//! Identifiers handed to us by the remote controller (action ids, ack tokens)
//! are opaque strings and are not modelled here. Only ids the agent generates
//! locally use these types, so they can be recognised on sight in logs and in
//! the persisted action store.
//!
//! ## ID Format
//!
//! `{prefix}_{ulid}`, for example:
//! - `agent_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `detected_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
