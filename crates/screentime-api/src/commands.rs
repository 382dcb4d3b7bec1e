//! Command types for the screentimed protocol

use serde::{Deserialize, Serialize};
use screentime_util::{AppId, AppToken, ClientId};
use std::collections::BTreeSet;

use crate::{
    API_VERSION, AppCategory, BlockReason, BlockingDecision, CommandStatus, ReasonKind,
    RemoteConfigCommand, UsageEvent, UsageSnapshot,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    pub api_version: u32,
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub api_version: u32,
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    AppNotFound,
    MonitoringStopped,
    PermissionDenied,
    ConfigError,
    StoreError,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Get current service state
    GetState,

    /// Evaluate whether an app should be blocked right now
    Evaluate { token: AppToken },

    /// Get the persisted block reason for an app
    GetReason { app_id: AppId },

    /// Usage monitor: a threshold was crossed
    ReportUsage { event: UsageEvent },

    /// Usage monitor: independently captured usage snapshot
    ReportSnapshot { snapshot: UsageSnapshot },

    /// Begin accepting usage events
    StartMonitoring,

    /// Stop accepting usage events
    StopMonitoring,

    // Admin commands

    /// Apply a remote configuration command (admin only)
    ApplyRemoteConfig { command: RemoteConfigCommand },

    /// Reload configuration (admin only)
    ReloadConfig,

    /// Delete the stored usage of an app removed from the configuration (admin only)
    ForgetApp { app_id: AppId },

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    /// Unsubscribe from events
    UnsubscribeEvents,

    /// Get health status
    GetHealth,

    /// Ping for keepalive
    Ping,
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    State(ServiceStateSnapshot),
    Decision(BlockingDecision),
    Reason { reason: Option<BlockReason> },
    UsageReported { accepted: bool },
    SnapshotReconciled { applied: usize, skipped: usize },
    RemoteConfig { status: CommandStatus },
    MonitoringStarted,
    MonitoringStopped,
    ConfigReloaded,
    AppForgotten,
    Subscribed { client_id: ClientId },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}

/// Per-app status for clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatusView {
    pub app_id: AppId,
    pub label: String,
    pub category: AppCategory,
    pub today_minutes: u32,
    pub blocked: bool,
    pub primary_reason: Option<ReasonKind>,
}

/// Full service state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStateSnapshot {
    pub api_version: u32,
    pub monitoring_active: bool,
    pub shielded: BTreeSet<AppToken>,
    #[serde(default)]
    pub apps: Vec<AppStatusView>,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_ok: bool,
    pub monitoring_active: bool,
}

/// Role for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Read-only: state, decisions, reasons
    Observer,
    /// Monitor extension or shield helper: may also report usage and toggle monitoring
    Reporter,
    /// Local admin: may also reload config and apply remote commands
    Admin,
}

impl ClientRole {
    pub fn can_report(&self) -> bool {
        matches!(self, ClientRole::Reporter | ClientRole::Admin)
    }

    pub fn can_control_monitoring(&self) -> bool {
        matches!(self, ClientRole::Reporter | ClientRole::Admin)
    }

    pub fn can_apply_remote_config(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }

    pub fn can_reload_config(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }

    pub fn can_forget_apps(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use screentime_util::EventName;

    #[test]
    fn request_serialization() {
        let req = Request::new(1, Command::GetState);
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.request_id, 1);
        assert!(matches!(parsed.command, Command::GetState));
    }

    #[test]
    fn report_usage_wire_format() {
        let event = UsageEvent {
            event_name: EventName::new("usage.minecraft.60s"),
            app_token: AppToken::new("tok-1"),
            cumulative_threshold_seconds: 60,
            fired_at: Local.with_ymd_and_hms(2025, 12, 29, 15, 0, 0).unwrap(),
        };
        let json = serde_json::to_string(&Request::new(7, Command::ReportUsage { event })).unwrap();

        assert!(json.contains("\"type\":\"report_usage\""));
        assert!(json.contains("\"app_token\":\"tok-1\""));
    }

    #[test]
    fn response_serialization() {
        let resp = Response::success(
            1,
            ResponsePayload::State(ServiceStateSnapshot {
                api_version: API_VERSION,
                monitoring_active: true,
                shielded: BTreeSet::new(),
                apps: vec![],
            }),
        );

        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, 1);
    }

    #[test]
    fn role_permissions() {
        assert!(!ClientRole::Observer.can_report());
        assert!(ClientRole::Reporter.can_report());
        assert!(!ClientRole::Reporter.can_apply_remote_config());
        assert!(ClientRole::Admin.can_reload_config());
        assert!(!ClientRole::Reporter.can_forget_apps());
    }
}
