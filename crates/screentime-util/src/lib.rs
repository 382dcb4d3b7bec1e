//! Shared utilities for screentime
//!
//! This crate provides:
//! - ID types (AppId, AppToken, EventName, CommandId, ClientId)
//! - Time utilities (mockable wall clock, time-of-day windows, weekday helpers)
//! - Default paths for socket, data, and config

mod ids;
mod paths;
mod time;

pub use ids::*;
pub use paths::*;
pub use time::*;
