//! Core enforcement engine for screentimed
//!
//! This crate is the heart of screentimed, containing:
//! - Threshold event validation (grace period, dedup, cascade and replay filtering)
//! - The usage ledger with day rollover
//! - Snapshot reconciliation
//! - Blocking decisions and learning-goal reward accounting
//! - End-of-day reward settlement and remote configuration

mod engine;
mod evaluator;
mod events;
mod ledger;
mod reconcile;
mod remote;
mod reward;
mod settlement;
mod summary;
mod thresholds;
mod validator;

pub use engine::*;
pub use evaluator::*;
pub use events::*;
pub use ledger::*;
pub use reconcile::*;
pub use remote::{apply_override, resolve as resolve_remote};
pub use reward::*;
pub use settlement::*;
pub use summary::*;
pub use thresholds::*;
pub use validator::{EventValidator, RejectReason, Verdict};

use screentime_host_api::HostError;
use screentime_store::StoreError;
use screentime_util::AppId;
use thiserror::Error;

/// Core engine errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("App not found: {0}")]
    AppNotFound(AppId),

    #[error("App is still configured: {0}")]
    StillConfigured(AppId),

    #[error("Collaborator error: {0}")]
    Host(#[from] HostError),
}

pub type CoreResult<T> = Result<T, CoreError>;
