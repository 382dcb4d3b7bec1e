//! Store trait definitions

use screentime_api::BlockReason;
use screentime_util::{AppId, AppToken, CommandId, EventName};

use crate::{AppOverride, AppUsageRecord, AuditEvent, RemoteCommandRecord, RewardBank, StoreResult};

/// Main store trait
pub trait Store: Send + Sync {
    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Usage ledger

    /// Load the usage record for an app
    fn load_record(&self, app_id: &AppId) -> StoreResult<Option<AppUsageRecord>>;

    /// Insert or replace a usage record, mirroring its counters into the key-value table
    fn save_record(&self, record: &AppUsageRecord) -> StoreResult<()>;

    /// All usage records
    fn list_records(&self) -> StoreResult<Vec<AppUsageRecord>>;

    /// Remove an app from monitoring
    fn delete_record(&self, app_id: &AppId) -> StoreResult<()>;

    // Shared key-value table

    fn kv_get(&self, key: &str) -> StoreResult<Option<String>>;

    fn kv_set(&self, key: &str, value: &str) -> StoreResult<()>;

    // Identity mappings

    /// Remember which logical app an OS token belongs to
    fn map_token(&self, token: &AppToken, app_id: &AppId) -> StoreResult<()>;

    fn resolve_token(&self, token: &AppToken) -> StoreResult<Option<AppId>>;

    /// Replace every event-name mapping of an app
    fn replace_event_mappings(&self, app_id: &AppId, events: &[EventName]) -> StoreResult<()>;

    fn resolve_event(&self, event: &EventName) -> StoreResult<Option<AppId>>;

    // Block reasons

    fn set_block_reason(&self, app_id: &AppId, reason: &BlockReason) -> StoreResult<()>;

    fn clear_block_reason(&self, app_id: &AppId) -> StoreResult<()>;

    fn get_block_reason(&self, app_id: &AppId) -> StoreResult<Option<BlockReason>>;

    // Reward banks

    fn load_bank(&self, app_id: &AppId) -> StoreResult<Option<RewardBank>>;

    fn save_bank(&self, bank: &RewardBank) -> StoreResult<()>;

    // Remote configuration

    fn find_remote_command(&self, id: &CommandId) -> StoreResult<Option<RemoteCommandRecord>>;

    fn record_remote_command(&self, record: &RemoteCommandRecord) -> StoreResult<()>;

    /// Category and schedule that replaced the configured ones for an app
    fn load_app_override(&self, app_id: &AppId) -> StoreResult<Option<AppOverride>>;

    fn save_app_override(&self, over: &AppOverride) -> StoreResult<()>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}

/// Key-value key mirroring an app's seconds today
pub fn today_key(app_id: &AppId) -> String {
    format!("usage_{}_today", app_id.as_str())
}

/// Key-value key mirroring an app's lifetime seconds
pub fn total_key(app_id: &AppId) -> String {
    format!("usage_{}_total", app_id.as_str())
}

/// Key-value flag shared with observer processes
pub const MONITORING_ACTIVE_KEY: &str = "monitoring_active";

/// Key-value marker holding the last day whose rewards were settled
pub const SETTLED_THROUGH_KEY: &str = "rewards_settled_through";
