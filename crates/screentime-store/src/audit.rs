//! Audit event types

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use screentime_api::{CommandStatus, ReasonKind};
use screentime_util::{AppId, AppToken, CommandId};

/// Where a usage credit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    ThresholdEvent,
    Reconciliation,
}

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// Policy loaded/reloaded
    PolicyLoaded { app_count: usize },

    /// Usage monitoring started
    MonitoringStarted,

    /// Usage monitoring stopped
    MonitoringStopped { shields_cleared: bool },

    /// Seconds credited to an app's ledger
    UsageCredited {
        app_id: AppId,
        seconds: u64,
        source: CreditSource,
    },

    /// Threshold ladder registered with the monitor
    ThresholdsRegistered {
        app_id: AppId,
        token: AppToken,
        count: usize,
    },

    /// App became blocked
    AppBlocked { app_id: AppId, reason: ReasonKind },

    /// App became usable again
    AppUnblocked { app_id: AppId },

    /// Remote configuration command processed
    RemoteCommand {
        command_id: CommandId,
        app_id: AppId,
        status: CommandStatus,
    },

    /// Previous day's reward minutes settled into the bank
    DaySettled {
        app_id: AppId,
        day: NaiveDate,
        leftover_minutes: i64,
        streak_days: u32,
        bonus_minutes: u32,
    },

    /// Stored usage deleted for an app no longer configured
    AppForgotten { app_id: AppId },

    /// Config reload requested
    ConfigReloaded { success: bool },

    /// Client connected
    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    /// Client disconnected
    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Local>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: screentime_util::now(),
            event,
        }
    }
}
