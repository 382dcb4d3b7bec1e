//! Event types for screentimed -> client streaming

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use screentime_util::{AppId, AppToken};
use std::collections::BTreeSet;

use crate::{API_VERSION, BlockReason, ServiceStateSnapshot, ShieldUpdate};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: screentime_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Full state snapshot (sent on major changes)
    StateChanged(ServiceStateSnapshot),

    /// The enforced shield set changed; shield helpers apply `update`
    ShieldChanged {
        update: ShieldUpdate,
        shielded: BTreeSet<AppToken>,
    },

    /// Block reason for an app changed (None = unblocked)
    ReasonUpdated {
        app_id: AppId,
        reason: Option<BlockReason>,
    },

    /// Monitoring was started or stopped
    MonitoringChanged { active: bool },

    /// Threshold ladder (re)registered for an app
    ThresholdsRegistered {
        app_id: AppId,
        token: AppToken,
        thresholds: usize,
    },

    /// Policy was reloaded
    PolicyReloaded { app_count: usize },

    /// Service is shutting down
    Shutdown,
}
