//! Collaborator interfaces for screentimed
//!
//! This crate defines the boundary between the service core and the OS-level
//! usage monitor and app shield. It contains no platform code itself.

mod mock;
mod traits;

pub use mock::*;
pub use traits::*;
