//! Remote configuration commands

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use screentime_util::{AppId, CommandId};

use crate::{AppCategory, LinkedLearningApp, StreakSettings, UnlockMode};

/// Full replacement of an app's goal linkage, pushed from another device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfigCommand {
    pub command_id: CommandId,
    pub logical_id: AppId,
    pub category: AppCategory,
    #[serde(default)]
    pub linked_learning_apps: Vec<LinkedLearningApp>,
    #[serde(default)]
    pub unlock_mode: UnlockMode,
    #[serde(default)]
    pub streak_settings: Option<StreakSettings>,
    pub is_enabled: bool,
    pub modified_at: DateTime<Local>,
}

/// What happened to a remote command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Incoming values replaced the local configuration
    Applied,
    /// A newer local configuration won; the command is kept for audit
    Superseded,
    /// The command ID was already processed
    Duplicate,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Applied => "applied",
            CommandStatus::Superseded => "superseded",
            CommandStatus::Duplicate => "duplicate",
        }
    }
}
