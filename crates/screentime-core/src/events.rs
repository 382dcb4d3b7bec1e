//! Core events emitted by the engine

use screentime_api::{BlockReason, CommandStatus, ShieldUpdate};
use screentime_store::CreditSource;
use screentime_util::{AppId, AppToken};
use std::collections::BTreeSet;

use crate::Settlement;

/// Events emitted by the core engine
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// Shield set changed
    ShieldChanged {
        update: ShieldUpdate,
        shielded: BTreeSet<AppToken>,
    },

    /// An app's block reason was set or cleared
    ReasonUpdated {
        app_id: AppId,
        reason: Option<BlockReason>,
    },

    /// Monitoring started or stopped
    MonitoringChanged {
        active: bool,
    },

    /// Threshold ladder registered for a token
    ThresholdsRegistered {
        app_id: AppId,
        token: AppToken,
        count: usize,
    },

    /// Usage credited to the ledger
    UsageCredited {
        app_id: AppId,
        seconds: u64,
        source: CreditSource,
    },

    /// Previous day settled into a reward bank
    DaySettled {
        app_id: AppId,
        settlement: Settlement,
    },

    /// Remote command processed for an app
    ScheduleChanged {
        app_id: AppId,
        status: CommandStatus,
    },

    /// Policy was reloaded
    PolicyReloaded {
        app_count: usize,
    },
}
