//! SQLite-based store implementation

use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension};
use screentime_api::BlockReason;
use screentime_util::{AppId, AppToken, CommandId, EventName};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    AppOverride, AppUsageRecord, AuditEvent, RemoteCommandRecord, RewardBank, Store, StoreError, StoreResult,
    today_key, total_key,
};

/// How long a writer waits for another process holding the database
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // Observer processes read while the service writes
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Usage ledger, one row per logical app
            CREATE TABLE IF NOT EXISTS usage_records (
                app_id TEXT PRIMARY KEY,
                record_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Shared key-value counters and flags
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- OS token -> logical app
            CREATE TABLE IF NOT EXISTS token_map (
                token TEXT PRIMARY KEY,
                app_id TEXT NOT NULL
            );

            -- Threshold event name -> logical app
            CREATE TABLE IF NOT EXISTS event_map (
                event_name TEXT PRIMARY KEY,
                app_id TEXT NOT NULL
            );

            -- Current block reason per blocked app
            CREATE TABLE IF NOT EXISTS block_reasons (
                app_id TEXT PRIMARY KEY,
                reason_json TEXT NOT NULL
            );

            -- Carried-over reward minutes and streaks
            CREATE TABLE IF NOT EXISTS reward_banks (
                app_id TEXT PRIMARY KEY,
                bank_json TEXT NOT NULL
            );

            -- Processed remote configuration commands
            CREATE TABLE IF NOT EXISTS remote_commands (
                command_id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                status TEXT NOT NULL,
                record_json TEXT NOT NULL
            );

            -- App configuration replaced by remote commands
            CREATE TABLE IF NOT EXISTS app_overrides (
                app_id TEXT PRIMARY KEY,
                override_json TEXT NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_event_map_app ON event_map(app_id);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(sql, [key], |row| row.get(0))
            .optional()?;

        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }
}

impl Store for SqliteStore {
    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![event.timestamp.to_rfc3339(), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                .map(|dt| dt.with_timezone(&Local))
                .unwrap_or_else(|_| screentime_util::now());
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn load_record(&self, app_id: &AppId) -> StoreResult<Option<AppUsageRecord>> {
        self.get_json(
            "SELECT record_json FROM usage_records WHERE app_id = ?",
            app_id.as_str(),
        )
    }

    fn save_record(&self, record: &AppUsageRecord) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let json = serde_json::to_string(record)?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO usage_records (app_id, record_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(app_id)
            DO UPDATE SET record_json = excluded.record_json, updated_at = excluded.updated_at
            "#,
            params![
                record.logical_id.as_str(),
                json,
                record.updated_at.to_rfc3339()
            ],
        )?;

        for (key, value) in [
            (today_key(&record.logical_id), record.today_seconds),
            (total_key(&record.logical_id), record.total_seconds),
        ] {
            tx.execute(
                "INSERT INTO kv (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value.to_string()],
            )?;
        }

        tx.commit()?;

        debug!(
            app_id = %record.logical_id,
            today_secs = record.today_seconds,
            total_secs = record.total_seconds,
            "Usage record saved"
        );
        Ok(())
    }

    fn list_records(&self) -> StoreResult<Vec<AppUsageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT record_json FROM usage_records ORDER BY app_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    fn delete_record(&self, app_id: &AppId) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM usage_records WHERE app_id = ?", [app_id.as_str()])?;
        conn.execute(
            "DELETE FROM kv WHERE key IN (?, ?)",
            params![today_key(app_id), total_key(app_id)],
        )?;
        Ok(())
    }

    fn kv_get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn kv_set(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn map_token(&self, token: &AppToken, app_id: &AppId) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO token_map (token, app_id) VALUES (?, ?)
             ON CONFLICT(token) DO UPDATE SET app_id = excluded.app_id",
            params![token.as_str(), app_id.as_str()],
        )?;
        Ok(())
    }

    fn resolve_token(&self, token: &AppToken) -> StoreResult<Option<AppId>> {
        let conn = self.conn()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT app_id FROM token_map WHERE token = ?",
                [token.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(AppId::new))
    }

    fn replace_event_mappings(&self, app_id: &AppId, events: &[EventName]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM event_map WHERE app_id = ?", [app_id.as_str()])?;
        for event in events {
            tx.execute(
                "INSERT INTO event_map (event_name, app_id) VALUES (?, ?)
                 ON CONFLICT(event_name) DO UPDATE SET app_id = excluded.app_id",
                params![event.as_str(), app_id.as_str()],
            )?;
        }

        tx.commit()?;
        debug!(app_id = %app_id, count = events.len(), "Event mappings replaced");
        Ok(())
    }

    fn resolve_event(&self, event: &EventName) -> StoreResult<Option<AppId>> {
        let conn = self.conn()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT app_id FROM event_map WHERE event_name = ?",
                [event.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(AppId::new))
    }

    fn set_block_reason(&self, app_id: &AppId, reason: &BlockReason) -> StoreResult<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(reason)?;
        conn.execute(
            "INSERT INTO block_reasons (app_id, reason_json) VALUES (?, ?)
             ON CONFLICT(app_id) DO UPDATE SET reason_json = excluded.reason_json",
            params![app_id.as_str(), json],
        )?;
        Ok(())
    }

    fn clear_block_reason(&self, app_id: &AppId) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM block_reasons WHERE app_id = ?", [app_id.as_str()])?;
        Ok(())
    }

    fn get_block_reason(&self, app_id: &AppId) -> StoreResult<Option<BlockReason>> {
        self.get_json(
            "SELECT reason_json FROM block_reasons WHERE app_id = ?",
            app_id.as_str(),
        )
    }

    fn load_bank(&self, app_id: &AppId) -> StoreResult<Option<RewardBank>> {
        self.get_json(
            "SELECT bank_json FROM reward_banks WHERE app_id = ?",
            app_id.as_str(),
        )
    }

    fn save_bank(&self, bank: &RewardBank) -> StoreResult<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(bank)?;
        conn.execute(
            "INSERT INTO reward_banks (app_id, bank_json) VALUES (?, ?)
             ON CONFLICT(app_id) DO UPDATE SET bank_json = excluded.bank_json",
            params![bank.app_id.as_str(), json],
        )?;
        Ok(())
    }

    fn find_remote_command(&self, id: &CommandId) -> StoreResult<Option<RemoteCommandRecord>> {
        self.get_json(
            "SELECT record_json FROM remote_commands WHERE command_id = ?",
            &id.to_string(),
        )
    }

    fn record_remote_command(&self, record: &RemoteCommandRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(record)?;
        conn.execute(
            "INSERT INTO remote_commands (command_id, app_id, status, record_json)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(command_id) DO NOTHING",
            params![
                record.command.command_id.to_string(),
                record.command.logical_id.as_str(),
                record.status.as_str(),
                json
            ],
        )?;
        Ok(())
    }

    fn load_app_override(&self, app_id: &AppId) -> StoreResult<Option<AppOverride>> {
        self.get_json(
            "SELECT override_json FROM app_overrides WHERE app_id = ?",
            app_id.as_str(),
        )
    }

    fn save_app_override(&self, over: &AppOverride) -> StoreResult<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(over)?;
        conn.execute(
            "INSERT INTO app_overrides (app_id, override_json) VALUES (?, ?)
             ON CONFLICT(app_id) DO UPDATE SET override_json = excluded.override_json",
            params![over.app_id.as_str(), json],
        )?;
        debug!(app_id = %over.app_id, category = %over.category, "App override saved");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => {
                conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
            }
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}
