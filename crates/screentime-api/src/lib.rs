//! Shared types for screentime
//!
//! This crate defines the vocabulary every other crate speaks:
//! - Schedule model (windows, daily limits, linked learning apps, unlock mode)
//! - Usage events and snapshots coming from the monitor collaborator
//! - Blocking decisions and persisted block reasons
//! - Remote configuration commands
//! - IPC commands, responses and events, with versioning

mod commands;
mod decision;
mod events;
mod remote;
mod types;

pub use commands::*;
pub use decision::*;
pub use events::*;
pub use remote::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
