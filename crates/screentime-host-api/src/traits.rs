//! Collaborator traits at the OS boundary

use async_trait::async_trait;
use screentime_api::{ShieldUpdate, UsageEvent};
use screentime_util::{AppId, AppToken, EventName};
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the monitor -> service event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors from collaborator operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Threshold registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Shield update failed: {0}")]
    ShieldFailed(String),

    #[error("Event stream already taken")]
    AlreadySubscribed,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type HostResult<T> = Result<T, HostError>;

/// One rung of a threshold ladder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Threshold {
    pub event_name: EventName,
    pub cumulative_seconds: u64,
}

/// The ladder of thresholds registered for one app token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdRegistration {
    pub app_id: AppId,
    pub token: AppToken,
    pub thresholds: Vec<Threshold>,
}

impl ThresholdRegistration {
    pub fn event_names(&self) -> Vec<EventName> {
        self.thresholds.iter().map(|t| t.event_name.clone()).collect()
    }
}

/// Usage monitor: emits "threshold crossed" events.
///
/// Delivery is at-least-once with no ordering guarantee; a restart may replay
/// thresholds already crossed today.
#[async_trait]
pub trait UsageMonitor: Send + Sync {
    /// Register (or replace) the threshold ladder for an app token
    async fn register_thresholds(&self, registration: ThresholdRegistration) -> HostResult<()>;

    /// Begin emitting events
    async fn start(&self) -> HostResult<()>;

    /// Stop emitting events
    async fn stop(&self) -> HostResult<()>;

    /// Take the event stream. Only one consumer exists.
    fn subscribe(&self) -> HostResult<mpsc::Receiver<UsageEvent>>;

    /// Optional: check if the monitor is healthy
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Shield primitive: the set of app tokens currently blocked.
///
/// The effect of an update may be applied with a delay.
#[async_trait]
pub trait ShieldController: Send + Sync {
    async fn apply(&self, update: ShieldUpdate) -> HostResult<()>;

    /// Tokens this controller believes are shielded
    fn shielded(&self) -> BTreeSet<AppToken>;
}
