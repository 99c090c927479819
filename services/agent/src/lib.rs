//! hostd Agent Library
//!
//! The agent runs on each managed host. It checks in with the controller,
//! executes the administrative actions it receives, and keeps the small
//! amount of state it must not lose in crash-safe files.
//!
//! ## Architecture
//!
//! ```text
//! CheckinGateway ──actions──▶ ActionDispatcher ──▶ UnenrollHandler
//!                                                    ├── Router      (stop all routed programs)
//!                                                    ├── Acker       (controller-issued actions)
//!                                                    ├── ActionLog   (locally detected actions)
//!                                                    └── CloserSet   (end background loops)
//! ```
//!
//! ## Modules
//!
//! - `actions`: action model, dispatcher and handlers
//! - `storage`: atomic file store and the persisted action log
//! - `router`: desired running set
//! - `acker`: ack/commit protocol
//! - `gateway`: check-in loop

pub mod acker;
pub mod actions;
pub mod client;
pub mod config;
pub mod gateway;
pub mod router;
pub mod storage;

// Re-export commonly used types
pub use acker::{Acker, HttpAcker};
pub use actions::{Action, ActionDispatcher, ActionHandler, UnenrollHandler};
pub use router::{Router, RoutingTable};
pub use storage::{ActionLog, DiskStore};
