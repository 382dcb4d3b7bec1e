//! Core enforcement engine

use chrono::{DateTime, Days, Local, NaiveDate};
use screentime_api::{
    API_VERSION, AppStatusView, BlockReason, BlockingDecision, CommandStatus, RemoteConfigCommand,
    ServiceStateSnapshot, ShieldUpdate, UsageEvent, UsageSnapshot,
};
use screentime_config::{AppEntry, OnStop, Policy};
use screentime_host_api::{ShieldController, UsageMonitor};
use screentime_store::{
    AppOverride, AuditEvent, AuditEventType, CreditSource, MONITORING_ACTIVE_KEY,
    RemoteCommandRecord, RewardBank, SETTLED_THROUGH_KEY, Store,
};
use screentime_util::{AppId, AppToken};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::evaluator::{Evaluator, LedgerView, fallback_decision, tracked_reward_apps};
use crate::ledger::{Ledger, seconds_on};
use crate::reconcile::{AppState, ReconcileOutcome, ReconcileReport, Reconciler, SkipReason};
use crate::remote;
use crate::settlement::{DayResult, settle};
use crate::thresholds::{registration_for, threshold_ladder};
use crate::validator::{EventValidator, RejectReason, Verdict};
use crate::{CoreError, CoreEvent, CoreResult};

/// Longest stretch of missed days settled after downtime
const MAX_SETTLE_DAYS: u64 = 7;

/// What happened to one threshold event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Seconds credited to the ledger
    Credited { app_id: AppId, seconds: u64 },
    /// Dropped by the validator
    Rejected(RejectReason),
    /// Neither the token nor the event name maps to a configured app
    Unresolved,
    /// Fired on a day other than today
    OtherDay,
    /// The ledger already covers the event's watermark
    AlreadyCounted,
}

/// The core enforcement engine
pub struct CoreEngine {
    policy: Policy,
    store: Arc<dyn Store>,
    /// Configured apps with remote overrides applied
    apps: Vec<AppEntry>,
    ledger: Ledger,
    validator: EventValidator,
    reconciler: Reconciler,
    last_credit_at: HashMap<AppId, DateTime<Local>>,
    last_event_at: HashMap<AppId, DateTime<Local>>,
    shielded: BTreeSet<AppToken>,
    blocked: BTreeMap<AppId, BlockReason>,
    current_day: Option<NaiveDate>,
}

impl CoreEngine {
    /// Create a new core engine
    pub fn new(policy: Policy, store: Arc<dyn Store>, now: DateTime<Local>) -> Self {
        let app_count = policy.apps.len();
        info!(app_count, "Core engine initialized");

        let _ = store.append_audit(AuditEvent::new(AuditEventType::PolicyLoaded { app_count }));

        let mut engine = Self {
            validator: EventValidator::new(policy.validator),
            reconciler: Reconciler::new(policy.reconciliation),
            ledger: Ledger::new(store.clone()),
            apps: Vec::new(),
            policy,
            store,
            last_credit_at: HashMap::new(),
            last_event_at: HashMap::new(),
            shielded: BTreeSet::new(),
            blocked: BTreeMap::new(),
            current_day: None,
        };
        engine.rebuild_apps(now);
        engine
    }

    /// Get current policy
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Configured apps with remote overrides applied
    pub fn apps(&self) -> &[AppEntry] {
        &self.apps
    }

    pub fn get_app(&self, app_id: &AppId) -> Option<&AppEntry> {
        self.apps.iter().find(|a| &a.id == app_id)
    }

    /// Whether threshold events are currently accepted
    pub fn monitoring_active(&self) -> bool {
        self.validator.is_running()
    }

    /// Whether the shared flag says monitoring was on before a restart
    pub fn monitoring_was_active(&self) -> bool {
        matches!(
            self.store.kv_get(MONITORING_ACTIVE_KEY),
            Ok(Some(value)) if value == "true"
        )
    }

    /// Tokens the engine has shielded
    pub fn shielded(&self) -> &BTreeSet<AppToken> {
        &self.shielded
    }

    /// Reload policy
    pub fn reload_policy(&mut self, policy: Policy, now: DateTime<Local>) -> CoreEvent {
        let app_count = policy.apps.len();
        self.validator.set_settings(policy.validator);
        self.reconciler.set_settings(policy.reconciliation);
        self.policy = policy;
        self.rebuild_apps(now);

        let _ = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::PolicyLoaded { app_count }));

        info!(app_count, "Policy reloaded");

        CoreEvent::PolicyReloaded { app_count }
    }

    /// Rebuild the effective app list and make sure every app has a record and token mapping
    fn rebuild_apps(&mut self, now: DateTime<Local>) {
        let mut apps = self.policy.apps.clone();
        for app in &mut apps {
            match self.store.load_app_override(&app.id) {
                Ok(Some(over)) => {
                    if remote::apply_override(app, &over) {
                        debug!(app_id = %app.id, "Applied remote override");
                    } else {
                        debug!(
                            app_id = %app.id,
                            override_modified_at = %over.modified_at,
                            "Configured schedule is newer than remote override"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(app_id = %app.id, error = %e, "Failed to load app override"),
            }

            if let Err(e) = self.ledger.ensure_record(app, now) {
                warn!(app_id = %app.id, error = %e, "Failed to prepare usage record");
            }
            for token in &app.tokens {
                if let Err(e) = self.store.map_token(token, &app.id) {
                    warn!(app_id = %app.id, token = %token, error = %e, "Failed to map token");
                }
            }
        }
        self.apps = apps;
    }

    /// Register the threshold ladder of every configured token with the monitor
    pub async fn register_thresholds(&self, monitor: &dyn UsageMonitor) -> Vec<CoreEvent> {
        let ladder = threshold_ladder(
            self.policy.service.threshold_step,
            self.policy.service.threshold_ceiling,
        );
        let mut events = Vec::new();

        for app in &self.apps {
            let mut event_names = Vec::new();

            for token in &app.tokens {
                let registration = registration_for(&app.id, token, &ladder);
                let names = registration.event_names();

                if let Err(e) = monitor.register_thresholds(registration).await {
                    warn!(app_id = %app.id, token = %token, error = %e, "Threshold registration failed");
                    continue;
                }

                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::ThresholdsRegistered {
                        app_id: app.id.clone(),
                        token: token.clone(),
                        count: names.len(),
                    },
                ));
                events.push(CoreEvent::ThresholdsRegistered {
                    app_id: app.id.clone(),
                    token: token.clone(),
                    count: names.len(),
                });

                if event_names.is_empty() {
                    event_names = names;
                }
            }

            if let Err(e) = self.store.replace_event_mappings(&app.id, &event_names) {
                warn!(app_id = %app.id, error = %e, "Failed to store event mappings");
            }
        }

        info!(
            apps = self.apps.len(),
            rungs = ladder.len(),
            "Threshold ladders registered"
        );
        events
    }

    /// Start accepting threshold events
    pub async fn start_monitoring(
        &mut self,
        now: DateTime<Local>,
        monitor: &dyn UsageMonitor,
    ) -> CoreResult<Vec<CoreEvent>> {
        if self.validator.is_running() {
            debug!("Monitoring already active");
            return Ok(Vec::new());
        }

        monitor.start().await?;
        self.validator.start(now);
        self.store.kv_set(MONITORING_ACTIVE_KEY, "true")?;

        let _ = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::MonitoringStarted));
        info!(grace_secs = self.policy.validator.grace_period.as_secs(), "Monitoring started");

        Ok(vec![CoreEvent::MonitoringChanged { active: true }])
    }

    /// Stop accepting events, then clear or keep shields according to policy
    pub async fn stop_monitoring(
        &mut self,
        monitor: &dyn UsageMonitor,
        shield: &dyn ShieldController,
    ) -> CoreResult<Vec<CoreEvent>> {
        let was_running = self.validator.is_running();
        self.validator.stop();

        if let Err(e) = monitor.stop().await {
            warn!(error = %e, "Monitor did not stop cleanly");
        }
        self.store.kv_set(MONITORING_ACTIVE_KEY, "false")?;

        let mut events = Vec::new();
        if was_running {
            events.push(CoreEvent::MonitoringChanged { active: false });
        }

        let shields_cleared = self.policy.service.on_stop == OnStop::Clear;
        if shields_cleared {
            let update = ShieldUpdate::Replace(BTreeSet::new());
            shield.apply(update.clone()).await?;
            update.apply_to(&mut self.shielded);
            events.push(CoreEvent::ShieldChanged {
                update,
                shielded: self.shielded.clone(),
            });

            for app_id in std::mem::take(&mut self.blocked).into_keys() {
                if let Err(e) = self.store.clear_block_reason(&app_id) {
                    warn!(app_id = %app_id, error = %e, "Failed to clear block reason");
                }
                events.push(CoreEvent::ReasonUpdated {
                    app_id,
                    reason: None,
                });
            }
        }

        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::MonitoringStopped {
            shields_cleared,
        }));
        info!(shields_cleared, "Monitoring stopped");

        Ok(events)
    }

    /// Validate a threshold event and credit the ledger if it passes
    pub fn ingest_event(
        &mut self,
        event: &UsageEvent,
        now: DateTime<Local>,
    ) -> CoreResult<IngestOutcome> {
        self.ensure_current_day(now);

        if let Verdict::Rejected(reason) = self.validator.validate(event) {
            return Ok(IngestOutcome::Rejected(reason));
        }

        let Some(app) = self.resolve_event(event).cloned() else {
            debug!(
                token = %event.app_token,
                event = %event.event_name,
                "Threshold event for unknown app"
            );
            return Ok(IngestOutcome::Unresolved);
        };

        let today = now.date_naive();
        if event.fired_at.date_naive() != today {
            debug!(app_id = %app.id, fired_at = %event.fired_at, "Threshold event from another day");
            return Ok(IngestOutcome::OtherDay);
        }

        let record = match self.ledger.record(&app.id)? {
            Some(record) => record,
            None => self.ledger.ensure_record(&app, now)?,
        };
        let counted = seconds_on(&record, today);
        let step = self.policy.service.threshold_step.as_secs();
        let delta = step.min(event.cumulative_threshold_seconds.saturating_sub(counted));
        if delta == 0 {
            debug!(
                app_id = %app.id,
                threshold_secs = event.cumulative_threshold_seconds,
                today_secs = counted,
                "Threshold already counted"
            );
            return Ok(IngestOutcome::AlreadyCounted);
        }

        self.ledger
            .apply_increment(&app.id, delta, app.reward_points_per_minute, event.fired_at)?;
        self.last_credit_at.insert(app.id.clone(), event.fired_at);
        self.last_event_at.insert(app.id.clone(), event.fired_at);

        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::UsageCredited {
            app_id: app.id.clone(),
            seconds: delta,
            source: CreditSource::ThresholdEvent,
        }));

        Ok(IngestOutcome::Credited {
            app_id: app.id,
            seconds: delta,
        })
    }

    /// Token mapping first, then the event-name mapping, then the policy
    fn resolve_event(&self, event: &UsageEvent) -> Option<&AppEntry> {
        let by_token = self.store.resolve_token(&event.app_token).unwrap_or_else(|e| {
            warn!(token = %event.app_token, error = %e, "Token lookup failed");
            None
        });
        let app_id = by_token.or_else(|| {
            self.store.resolve_event(&event.event_name).unwrap_or_else(|e| {
                warn!(event = %event.event_name, error = %e, "Event lookup failed");
                None
            })
        });

        match app_id {
            Some(id) => self.get_app(&id),
            None => self.app_for_token(&event.app_token),
        }
    }

    fn app_for_token(&self, token: &AppToken) -> Option<&AppEntry> {
        self.apps.iter().find(|a| a.tokens.contains(token))
    }

    fn resolve_token(&self, token: &AppToken) -> Option<&AppEntry> {
        match self.store.resolve_token(token) {
            Ok(Some(id)) => self.get_app(&id),
            Ok(None) => self.app_for_token(token),
            Err(e) => {
                warn!(token = %token, error = %e, "Token lookup failed");
                self.app_for_token(token)
            }
        }
    }

    /// Credit missed usage from an independently captured snapshot
    pub fn reconcile(
        &mut self,
        snapshot: &UsageSnapshot,
        now: DateTime<Local>,
    ) -> CoreResult<ReconcileReport> {
        self.ensure_current_day(now);

        if !self.validator.is_running() {
            return Ok(ReconcileReport::rejected(
                snapshot.captured_at,
                SkipReason::MonitoringStopped,
            ));
        }
        if let Some(reason) = self.reconciler.check_snapshot(snapshot, now) {
            debug!(captured_at = %snapshot.captured_at, reason = %reason, "Snapshot rejected");
            return Ok(ReconcileReport::rejected(snapshot.captured_at, reason));
        }

        let day = snapshot.captured_at.date_naive();
        let mut outcomes = Vec::new();

        for (token, &reported) in &snapshot.reported {
            let Some(app) = self.resolve_token(token).cloned() else {
                outcomes.push(ReconcileOutcome::Skipped {
                    token: token.clone(),
                    app_id: None,
                    reason: SkipReason::UnknownToken,
                });
                continue;
            };

            let record = match self.ledger.record(&app.id)? {
                Some(record) => record,
                None => self.ledger.ensure_record(&app, now)?,
            };
            let state = AppState {
                ledger_today_seconds: seconds_on(&record, day),
                last_credit_at: self.last_credit_at.get(&app.id).copied(),
                last_event_at: self.last_event_at.get(&app.id).copied(),
            };

            let correction = match self.reconciler.plan(&app.id, reported, snapshot.captured_at, state) {
                Ok(c) if c.seconds > 0 => c,
                Ok(_) => {
                    outcomes.push(ReconcileOutcome::Skipped {
                        token: token.clone(),
                        app_id: Some(app.id.clone()),
                        reason: SkipReason::LedgerAhead,
                    });
                    continue;
                }
                Err(reason) => {
                    debug!(app_id = %app.id, reported, reason = %reason, "Snapshot entry skipped");
                    outcomes.push(ReconcileOutcome::Skipped {
                        token: token.clone(),
                        app_id: Some(app.id.clone()),
                        reason,
                    });
                    continue;
                }
            };

            self.ledger.apply_increment(
                &app.id,
                correction.seconds,
                app.reward_points_per_minute,
                snapshot.captured_at,
            )?;
            self.reconciler.mark_applied(&app.id, snapshot.captured_at, reported);
            self.last_credit_at.insert(app.id.clone(), snapshot.captured_at);

            let _ = self.store.append_audit(AuditEvent::new(AuditEventType::UsageCredited {
                app_id: app.id.clone(),
                seconds: correction.seconds,
                source: CreditSource::Reconciliation,
            }));
            info!(
                app_id = %app.id,
                reported,
                ledger_secs = state.ledger_today_seconds,
                credited_secs = correction.seconds,
                clamped = correction.clamped,
                "Usage corrected from snapshot"
            );

            outcomes.push(ReconcileOutcome::Applied {
                app_id: app.id,
                seconds: correction.seconds,
                clamped: correction.clamped,
            });
        }

        Ok(ReconcileReport {
            captured_at: snapshot.captured_at,
            rejected: None,
            outcomes,
        })
    }

    fn load_view(&self) -> CoreResult<LedgerView> {
        LedgerView::load(
            self.store.as_ref(),
            tracked_reward_apps(&self.apps).map(|(app, _)| &app.id),
        )
    }

    /// Decide whether an app should be blocked. A store failure degrades to blocked.
    pub fn evaluate(&self, app_id: &AppId, now: DateTime<Local>) -> BlockingDecision {
        match self.load_view() {
            Ok(view) => Evaluator::new(&self.apps, &view, &self.policy.goals).evaluate(Some(app_id), now),
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "Ledger unavailable, blocking");
                fallback_decision(
                    Some(app_id.clone()),
                    self.policy.goals.fallback_learning_minutes,
                    now,
                )
            }
        }
    }

    /// Decide for an OS token, blocking pending learning when it cannot be resolved
    pub fn evaluate_token(&self, token: &AppToken, now: DateTime<Local>) -> BlockingDecision {
        match self.resolve_token(token) {
            Some(app) => self.evaluate(&app.id, now),
            None => {
                debug!(token = %token, "Unresolved token, applying fallback");
                fallback_decision(None, self.policy.goals.fallback_learning_minutes, now)
            }
        }
    }

    pub fn can_unlock(&self, app_id: &AppId, now: DateTime<Local>) -> bool {
        self.evaluate(app_id, now).can_unlock()
    }

    /// Delete the stored usage of an app that has been removed from the configuration
    pub fn forget_app(&mut self, app_id: &AppId) -> CoreResult<()> {
        if self.get_app(app_id).is_some() {
            return Err(CoreError::StillConfigured(app_id.clone()));
        }
        if !self.ledger.forget(app_id)? {
            return Err(CoreError::AppNotFound(app_id.clone()));
        }

        self.store.clear_block_reason(app_id)?;
        self.blocked.remove(app_id);
        self.last_credit_at.remove(app_id);
        self.last_event_at.remove(app_id);

        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::AppForgotten {
            app_id: app_id.clone(),
        }));
        Ok(())
    }

    /// Persisted reason for a blocked app
    pub fn block_reason(&self, app_id: &AppId) -> CoreResult<Option<BlockReason>> {
        Ok(self.store.get_block_reason(app_id)?)
    }

    /// Re-evaluate every app and bring shields and reasons in line
    pub async fn refresh(
        &mut self,
        now: DateTime<Local>,
        shield: &dyn ShieldController,
    ) -> Vec<CoreEvent> {
        let mut events = self.ensure_current_day(now);
        self.validator.prune(now);
        self.reconciler.prune(now);

        if !self.validator.is_running() {
            return events;
        }

        let view = match self.load_view() {
            Ok(view) => Some(view),
            Err(e) => {
                warn!(error = %e, "Ledger unavailable, blocking every app");
                None
            }
        };

        let mut desired = BTreeSet::new();
        let mut decisions = Vec::with_capacity(self.apps.len());
        for app in &self.apps {
            let decision = match &view {
                Some(view) => Evaluator::new(&self.apps, view, &self.policy.goals)
                    .evaluate(Some(&app.id), now),
                None => fallback_decision(
                    Some(app.id.clone()),
                    self.policy.goals.fallback_learning_minutes,
                    now,
                ),
            };
            if decision.should_block {
                desired.extend(app.tokens.iter().cloned());
            }
            decisions.push((app.id.clone(), decision));
        }

        let to_add: BTreeSet<AppToken> = desired.difference(&self.shielded).cloned().collect();
        let to_remove: BTreeSet<AppToken> = self.shielded.difference(&desired).cloned().collect();
        let mut updates = Vec::new();
        if !to_add.is_empty() {
            updates.push(ShieldUpdate::Union(to_add));
        }
        if !to_remove.is_empty() {
            updates.push(ShieldUpdate::Subtract(to_remove));
        }
        for update in updates {
            match shield.apply(update.clone()).await {
                Ok(()) => {
                    update.apply_to(&mut self.shielded);
                    debug!(shielded = self.shielded.len(), "Shield updated");
                    events.push(CoreEvent::ShieldChanged {
                        update,
                        shielded: self.shielded.clone(),
                    });
                }
                Err(e) => warn!(error = %e, "Shield update failed, retrying next refresh"),
            }
        }

        for (app_id, decision) in decisions {
            events.extend(self.sync_reason(app_id, &decision));
        }

        events
    }

    /// Persist or clear an app's reason, reporting changes
    fn sync_reason(&mut self, app_id: AppId, decision: &BlockingDecision) -> Option<CoreEvent> {
        match decision.to_block_reason() {
            Some(reason) => {
                if let Err(e) = self.store.set_block_reason(&app_id, &reason) {
                    warn!(app_id = %app_id, error = %e, "Failed to persist block reason");
                }

                let changed = self
                    .blocked
                    .get(&app_id)
                    .is_none_or(|prev| prev.kind != reason.kind || prev.message != reason.message);
                let newly_blocked = self
                    .blocked
                    .get(&app_id)
                    .is_none_or(|prev| prev.kind != reason.kind);
                self.blocked.insert(app_id.clone(), reason.clone());

                if newly_blocked {
                    info!(app_id = %app_id, reason = %reason.kind, "App blocked");
                    let _ = self.store.append_audit(AuditEvent::new(AuditEventType::AppBlocked {
                        app_id: app_id.clone(),
                        reason: reason.kind,
                    }));
                }

                changed.then_some(CoreEvent::ReasonUpdated {
                    app_id,
                    reason: Some(reason),
                })
            }
            None => {
                self.blocked.remove(&app_id)?;

                if let Err(e) = self.store.clear_block_reason(&app_id) {
                    warn!(app_id = %app_id, error = %e, "Failed to clear block reason");
                }
                info!(app_id = %app_id, "App unblocked");
                let _ = self.store.append_audit(AuditEvent::new(AuditEventType::AppUnblocked {
                    app_id: app_id.clone(),
                }));

                Some(CoreEvent::ReasonUpdated {
                    app_id,
                    reason: None,
                })
            }
        }
    }

    /// Apply a remote configuration command, newest `modified_at` winning
    pub fn apply_remote_command(
        &mut self,
        command: RemoteConfigCommand,
        now: DateTime<Local>,
    ) -> CoreResult<(CommandStatus, Vec<CoreEvent>)> {
        if self.store.find_remote_command(&command.command_id)?.is_some() {
            debug!(command_id = %command.command_id, "Remote command already processed");
            let _ = self.store.append_audit(AuditEvent::new(AuditEventType::RemoteCommand {
                command_id: command.command_id.clone(),
                app_id: command.logical_id.clone(),
                status: CommandStatus::Duplicate,
            }));
            return Ok((CommandStatus::Duplicate, Vec::new()));
        }

        let index = self
            .apps
            .iter()
            .position(|a| a.id == command.logical_id)
            .ok_or_else(|| CoreError::AppNotFound(command.logical_id.clone()))?;

        let status = remote::resolve(self.apps[index].schedule.as_ref(), &command);
        if status == CommandStatus::Applied {
            let over = AppOverride::from_command(&command);
            self.store.save_app_override(&over)?;
            remote::apply_override(&mut self.apps[index], &over);
            self.ledger.ensure_record(&self.apps[index], now)?;
        }

        self.store.record_remote_command(&RemoteCommandRecord {
            command: command.clone(),
            status,
            received_at: now,
        })?;
        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::RemoteCommand {
            command_id: command.command_id.clone(),
            app_id: command.logical_id.clone(),
            status,
        }));

        info!(
            command_id = %command.command_id,
            app_id = %command.logical_id,
            status = status.as_str(),
            "Remote command processed"
        );

        Ok((
            status,
            vec![CoreEvent::ScheduleChanged {
                app_id: command.logical_id,
                status,
            }],
        ))
    }

    /// Settle finished days and reset counters when the calendar day changes
    pub fn ensure_current_day(&mut self, now: DateTime<Local>) -> Vec<CoreEvent> {
        let today = now.date_naive();
        if self.current_day == Some(today) {
            return Vec::new();
        }

        match self.roll_day(today) {
            Ok(events) => {
                self.current_day = Some(today);
                events
            }
            Err(e) => {
                warn!(day = %today, error = %e, "Day rollover failed, will retry");
                Vec::new()
            }
        }
    }

    fn roll_day(&mut self, today: NaiveDate) -> CoreResult<Vec<CoreEvent>> {
        let mut events = Vec::new();
        let Some(yesterday) = today.pred_opt() else {
            return Ok(events);
        };

        let settled_through = self
            .store
            .kv_get(SETTLED_THROUGH_KEY)?
            .and_then(|s| s.parse::<NaiveDate>().ok());
        let earliest = today
            .checked_sub_days(Days::new(MAX_SETTLE_DAYS))
            .unwrap_or(yesterday);
        let first = settled_through
            .and_then(|d| d.succ_opt())
            .unwrap_or(yesterday)
            .max(earliest);

        if first <= yesterday {
            let view = self.load_view()?;
            let evaluator = Evaluator::new(&self.apps, &view, &self.policy.goals);

            for (app, schedule) in tracked_reward_apps(&self.apps) {
                let mut bank = self
                    .store
                    .load_bank(&app.id)?
                    .unwrap_or_else(|| RewardBank::empty(app.id.clone()));

                for day in first.iter_days().take_while(|d| *d <= yesterday) {
                    let progress = evaluator.goal_progress(schedule, day);
                    let result = DayResult {
                        day,
                        earned_minutes: progress.reward_minutes_earned,
                        used_minutes: view.minutes(&app.id, day),
                        goal_met: progress.is_goal_met,
                    };
                    let Some((next, settlement)) = settle(&bank, result, schedule.streak_settings)
                    else {
                        continue;
                    };

                    self.store.save_bank(&next)?;
                    bank = next;

                    let _ = self.store.append_audit(AuditEvent::new(AuditEventType::DaySettled {
                        app_id: app.id.clone(),
                        day,
                        leftover_minutes: settlement.leftover_minutes,
                        streak_days: settlement.streak_days,
                        bonus_minutes: settlement.bonus_minutes,
                    }));
                    info!(
                        app_id = %app.id,
                        day = %day,
                        leftover = settlement.leftover_minutes,
                        banked = bank.banked_minutes,
                        streak = settlement.streak_days,
                        "Day settled"
                    );
                    events.push(CoreEvent::DaySettled {
                        app_id: app.id.clone(),
                        settlement,
                    });
                }
            }

            self.store.kv_set(SETTLED_THROUGH_KEY, &yesterday.to_string())?;
        }

        self.ledger.reset_daily_counters(today)?;
        Ok(events)
    }

    /// Build a state snapshot for clients
    pub fn get_state(&self, now: DateTime<Local>) -> ServiceStateSnapshot {
        let today = now.date_naive();
        let view = self.load_view().ok();

        let apps = self
            .apps
            .iter()
            .map(|app| {
                let decision = self.evaluate(&app.id, now);
                AppStatusView {
                    app_id: app.id.clone(),
                    label: app.label.clone(),
                    category: app.category,
                    today_minutes: view.as_ref().map(|v| v.minutes(&app.id, today)).unwrap_or(0),
                    blocked: decision.should_block,
                    primary_reason: decision.primary_reason,
                }
            })
            .collect();

        ServiceStateSnapshot {
            api_version: API_VERSION,
            monitoring_active: self.validator.is_running(),
            shielded: self.shielded.clone(),
            apps,
        }
    }

    pub fn is_store_healthy(&self) -> bool {
        self.store.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use screentime_api::{
        AppCategory, DailyLimits, DayWindow, LinkedLearningApp, ReasonKind, ScheduleConfiguration,
        StreakSettings, UnlockMode, WeeklyWindows,
    };
    use screentime_host_api::{MockMonitor, MockShield};
    use screentime_store::SqliteStore;
    use screentime_util::{ClockWindow, CommandId, EventName, WallClock};

    fn t0() -> DateTime<Local> {
        // Monday afternoon
        Local.with_ymd_and_hms(2025, 12, 29, 15, 0, 0).unwrap()
    }

    fn app(id: &str, category: AppCategory, schedule: Option<ScheduleConfiguration>) -> AppEntry {
        AppEntry {
            id: AppId::new(id),
            label: id.to_string(),
            category,
            tokens: vec![AppToken::new(format!("tok-{}", id))],
            reward_points_per_minute: 1,
            schedule,
        }
    }

    fn game_schedule(limit: u32, required: u32) -> ScheduleConfiguration {
        let mut schedule = ScheduleConfiguration::unrestricted("game", t0() - ChronoDuration::days(30));
        schedule.daily_limits = DailyLimits::uniform(limit);
        schedule.linked_learning_apps = vec![LinkedLearningApp::new("khan", required)];
        schedule
    }

    fn make_test_policy(schedule: ScheduleConfiguration) -> Policy {
        Policy {
            apps: vec![
                app("khan", AppCategory::Learning, None),
                app("game", AppCategory::Reward, Some(schedule)),
            ],
            ..Default::default()
        }
    }

    fn event(app: &str, secs: u64, at: DateTime<Local>) -> UsageEvent {
        UsageEvent {
            event_name: EventName::for_threshold(&AppId::new(app), secs),
            app_token: AppToken::new(format!("tok-{}", app)),
            cumulative_threshold_seconds: secs,
            fired_at: at,
        }
    }

    async fn running_engine(policy: Policy) -> (CoreEngine, Arc<dyn Store>, MockMonitor) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let monitor = MockMonitor::new();
        let mut engine = CoreEngine::new(policy, store.clone(), t0());
        engine.start_monitoring(t0(), &monitor).await.unwrap();
        (engine, store, monitor)
    }

    /// Feed one event per minute starting after the grace period
    fn feed_minutes(engine: &mut CoreEngine, app: &str, minutes: u64) -> DateTime<Local> {
        let start = t0() + ChronoDuration::minutes(1);
        for m in 1..=minutes {
            let at = start + ChronoDuration::minutes(m as i64);
            let outcome = engine.ingest_event(&event(app, m * 60, at), at).unwrap();
            assert!(matches!(outcome, IngestOutcome::Credited { seconds: 60, .. }));
        }
        start + ChronoDuration::minutes(minutes as i64)
    }

    #[tokio::test]
    async fn test_duplicate_events_credit_once() {
        let (mut engine, store, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let at = t0() + ChronoDuration::minutes(2);
        let e = event("khan", 60, at);

        let first = engine.ingest_event(&e, at).unwrap();
        assert_eq!(
            first,
            IngestOutcome::Credited {
                app_id: AppId::new("khan"),
                seconds: 60
            }
        );
        for _ in 0..5 {
            let outcome = engine.ingest_event(&e, at).unwrap();
            assert!(matches!(outcome, IngestOutcome::Rejected(_)));
        }

        let record = store.load_record(&AppId::new("khan")).unwrap().unwrap();
        assert_eq!(record.today_seconds, 60);
        assert_eq!(store.kv_get("usage_khan_today").unwrap().as_deref(), Some("60"));
    }

    #[tokio::test]
    async fn test_grace_period_cascade_ignored() {
        let (mut engine, store, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;

        for i in 1..=60u64 {
            let at = t0() + ChronoDuration::milliseconds(i as i64 * 200);
            let outcome = engine.ingest_event(&event("khan", i * 60, at), at).unwrap();
            assert_eq!(outcome, IngestOutcome::Rejected(RejectReason::GracePeriod));
        }

        let record = store.load_record(&AppId::new("khan")).unwrap().unwrap();
        assert_eq!(record.today_seconds, 0);
    }

    #[tokio::test]
    async fn test_replayed_watermark_already_counted() {
        let (mut engine, _, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let end = feed_minutes(&mut engine, "khan", 3);

        // Monitor restart replays a higher rung than we've seen, but the ledger caught up via reconcile
        let snapshot = UsageSnapshot {
            captured_at: end + ChronoDuration::minutes(3),
            reported: BTreeMap::from([(AppToken::new("tok-khan"), 360)]),
        };
        let report = engine.reconcile(&snapshot, snapshot.captured_at).unwrap();
        assert_eq!(report.credited_seconds(), 180);

        let at = end + ChronoDuration::minutes(4);
        let outcome = engine.ingest_event(&event("khan", 360, at), at).unwrap();
        assert_eq!(outcome, IngestOutcome::AlreadyCounted);
    }

    #[tokio::test]
    async fn test_events_rejected_after_stop() {
        let (mut engine, store, monitor) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let shield = MockShield::new();

        engine.stop_monitoring(&monitor, &shield).await.unwrap();
        assert!(!engine.monitoring_active());
        assert_eq!(store.kv_get(MONITORING_ACTIVE_KEY).unwrap().as_deref(), Some("false"));

        let at = t0() + ChronoDuration::minutes(5);
        let outcome = engine.ingest_event(&event("khan", 60, at), at).unwrap();
        assert_eq!(outcome, IngestOutcome::Rejected(RejectReason::MonitoringStopped));
    }

    #[tokio::test]
    async fn test_unknown_token_resolved_by_event_name() {
        let (mut engine, store, monitor) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        engine.register_thresholds(&monitor).await;

        let at = t0() + ChronoDuration::minutes(2);
        let e = UsageEvent {
            app_token: AppToken::new("tok-rotated"),
            ..event("khan", 60, at)
        };
        let outcome = engine.ingest_event(&e, at).unwrap();
        assert!(matches!(outcome, IngestOutcome::Credited { .. }));
        assert_eq!(
            store.resolve_event(&EventName::new("usage.khan.60s")).unwrap(),
            Some(AppId::new("khan"))
        );

        let stranger = UsageEvent {
            event_name: EventName::new("usage.other.60s"),
            app_token: AppToken::new("tok-other"),
            cumulative_threshold_seconds: 60,
            fired_at: at,
        };
        assert_eq!(engine.ingest_event(&stranger, at).unwrap(), IngestOutcome::Unresolved);
    }

    #[tokio::test]
    async fn test_refresh_shields_and_reasons() {
        let (mut engine, store, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let shield = MockShield::new();

        // Goal not met: game shielded
        let events = engine.refresh(t0() + ChronoDuration::minutes(1), &shield).await;
        assert!(shield.is_shielded(&AppToken::new("tok-game")));
        assert!(!shield.is_shielded(&AppToken::new("tok-khan")));
        assert!(events.iter().any(|e| matches!(e, CoreEvent::ShieldChanged { .. })));
        let reason = store.get_block_reason(&AppId::new("game")).unwrap().unwrap();
        assert_eq!(reason.kind, ReasonKind::LearningGoalNotMet);

        // Meet the goal
        let end = feed_minutes(&mut engine, "khan", 15);
        let events = engine.refresh(end, &shield).await;
        assert!(!shield.is_shielded(&AppToken::new("tok-game")));
        assert!(store.get_block_reason(&AppId::new("game")).unwrap().is_none());
        assert!(events.iter().any(|e| matches!(
            e,
            CoreEvent::ReasonUpdated { reason: None, .. }
        )));
    }

    #[tokio::test]
    async fn test_shield_failure_retried() {
        let (mut engine, _, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let shield = MockShield::new();

        *shield.fail_apply.lock().unwrap() = true;
        engine.refresh(t0() + ChronoDuration::minutes(1), &shield).await;
        assert!(engine.shielded().is_empty());

        *shield.fail_apply.lock().unwrap() = false;
        engine.refresh(t0() + ChronoDuration::minutes(2), &shield).await;
        assert!(engine.shielded().contains(&AppToken::new("tok-game")));
    }

    #[tokio::test]
    async fn test_stop_clears_or_preserves_shields() {
        let (mut engine, _, monitor) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let shield = MockShield::new();
        engine.refresh(t0() + ChronoDuration::minutes(1), &shield).await;
        assert!(!shield.shielded().is_empty());

        engine.stop_monitoring(&monitor, &shield).await.unwrap();
        assert!(shield.shielded().is_empty());

        let mut policy = make_test_policy(game_schedule(60, 15));
        policy.service.on_stop = OnStop::Preserve;
        let (mut engine, _, monitor) = running_engine(policy).await;
        let shield = MockShield::new();
        engine.refresh(t0() + ChronoDuration::minutes(1), &shield).await;
        engine.stop_monitoring(&monitor, &shield).await.unwrap();
        assert!(shield.is_shielded(&AppToken::new("tok-game")));

        // Stopped: refresh leaves shields alone
        engine.refresh(t0() + ChronoDuration::minutes(2), &shield).await;
        assert!(shield.is_shielded(&AppToken::new("tok-game")));
    }

    #[tokio::test]
    async fn test_downtime_and_limit_priority() {
        let mut schedule = game_schedule(1, 0);
        schedule.linked_learning_apps.clear();
        schedule.allowed_windows = WeeklyWindows::uniform(DayWindow::Window(ClockWindow::new(
            WallClock::new(8, 0).unwrap(),
            WallClock::new(15, 0).unwrap(),
        )));
        let (mut engine, _, _) = running_engine(make_test_policy(schedule)).await;
        let end = feed_minutes(&mut engine, "game", 2);

        let decision = engine.evaluate(&AppId::new("game"), end);
        assert_eq!(decision.primary_reason, Some(ReasonKind::Downtime));
        assert!(decision.is_active(ReasonKind::DailyLimitReached));
        assert!(!engine.can_unlock(&AppId::new("game"), end));
    }

    #[tokio::test]
    async fn test_full_day_scenario() {
        let (mut engine, _, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let end = feed_minutes(&mut engine, "khan", 20);

        let at = Local.with_ymd_and_hms(2025, 12, 29, 15, 25, 0).unwrap();
        assert!(end <= at);
        let decision = engine.evaluate(&AppId::new("game"), at);
        assert!(!decision.should_block);
        let goal = decision.goal.unwrap();
        assert_eq!((goal.current_minutes, goal.target_minutes), (15, 15));
        assert_eq!(goal.reward_minutes_earned, 20);
    }

    #[tokio::test]
    async fn test_unresolved_token_blocked_pending_learning() {
        let (engine, _, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let decision = engine.evaluate_token(&AppToken::new("tok-mystery"), t0());
        assert!(decision.should_block);
        assert!(decision.app_id.is_none());
        assert_eq!(decision.goal.unwrap().target_minutes, 15);
    }

    #[tokio::test]
    async fn test_reconcile_credits_missing_usage() {
        let (mut engine, store, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let end = feed_minutes(&mut engine, "khan", 5);

        // Lower value: ignored
        let captured_at = end + ChronoDuration::minutes(5);
        let low = UsageSnapshot {
            captured_at,
            reported: BTreeMap::from([
                (AppToken::new("tok-khan"), 120),
                (AppToken::new("tok-unknown"), 600),
            ]),
        };
        let report = engine.reconcile(&low, captured_at).unwrap();
        assert_eq!(report.applied_count(), 0);
        assert_eq!(report.skipped_count(), 2);
        assert_eq!(store.load_record(&AppId::new("khan")).unwrap().unwrap().today_seconds, 300);

        let high = UsageSnapshot {
            captured_at,
            reported: BTreeMap::from([(AppToken::new("tok-khan"), 480)]),
        };
        let report = engine.reconcile(&high, captured_at).unwrap();
        assert_eq!(report.credited_seconds(), 180);

        // Same capture again
        let report = engine.reconcile(&high, captured_at).unwrap();
        assert_eq!(report.applied_count(), 0);
        assert_eq!(store.load_record(&AppId::new("khan")).unwrap().unwrap().today_seconds, 480);
    }

    #[tokio::test]
    async fn test_remote_command_newest_wins() {
        let (mut engine, store, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;

        let command = RemoteConfigCommand {
            command_id: CommandId::new(),
            logical_id: AppId::new("game"),
            category: AppCategory::Reward,
            linked_learning_apps: vec![LinkedLearningApp::new("khan", 30)],
            unlock_mode: UnlockMode::RequireAny,
            streak_settings: None,
            is_enabled: true,
            modified_at: t0(),
        };
        let (status, _) = engine.apply_remote_command(command.clone(), t0()).unwrap();
        assert_eq!(status, CommandStatus::Applied);
        let schedule = engine.get_app(&AppId::new("game")).unwrap().schedule.clone().unwrap();
        assert_eq!(schedule.linked_learning_apps[0].minutes_required, 30);
        assert_eq!(schedule.daily_limits, DailyLimits::uniform(60));

        let (status, _) = engine.apply_remote_command(command.clone(), t0()).unwrap();
        assert_eq!(status, CommandStatus::Duplicate);

        let stale = RemoteConfigCommand {
            command_id: CommandId::new(),
            modified_at: t0() - ChronoDuration::hours(1),
            linked_learning_apps: vec![],
            ..command
        };
        let (status, _) = engine.apply_remote_command(stale.clone(), t0()).unwrap();
        assert_eq!(status, CommandStatus::Superseded);
        let found = store.find_remote_command(&stale.command_id).unwrap().unwrap();
        assert_eq!(found.status, CommandStatus::Superseded);

        // Override survives a restart
        let engine = CoreEngine::new(make_test_policy(game_schedule(60, 15)), store, t0());
        let schedule = engine.get_app(&AppId::new("game")).unwrap().schedule.clone().unwrap();
        assert_eq!(schedule.unlock_mode, UnlockMode::RequireAny);
    }

    #[tokio::test]
    async fn test_reload_after_remote_command() {
        let (mut engine, _, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let game = AppId::new("game");

        let command = RemoteConfigCommand {
            command_id: CommandId::new(),
            logical_id: game.clone(),
            category: AppCategory::Reward,
            linked_learning_apps: vec![LinkedLearningApp::new("khan", 30)],
            unlock_mode: UnlockMode::RequireAll,
            streak_settings: None,
            is_enabled: true,
            modified_at: t0() - ChronoDuration::days(1),
        };
        let (status, _) = engine.apply_remote_command(command, t0()).unwrap();
        assert_eq!(status, CommandStatus::Applied);

        // Limits edited in an older config still apply under the remote goal
        engine.reload_policy(make_test_policy(game_schedule(90, 15)), t0());
        let schedule = engine.get_app(&game).unwrap().schedule.clone().unwrap();
        assert_eq!(schedule.daily_limits, DailyLimits::uniform(90));
        assert_eq!(schedule.linked_learning_apps[0].minutes_required, 30);

        // A config edited after the command replaces the goal too
        let mut newer = game_schedule(120, 15);
        newer.modified_at = t0();
        engine.reload_policy(make_test_policy(newer), t0());
        let schedule = engine.get_app(&game).unwrap().schedule.clone().unwrap();
        assert_eq!(schedule.daily_limits, DailyLimits::uniform(120));
        assert_eq!(schedule.linked_learning_apps[0].minutes_required, 15);
        assert_eq!(schedule.modified_at, t0());
    }

    #[tokio::test]
    async fn test_forget_removed_app() {
        let (mut engine, store, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let game = AppId::new("game");
        assert!(matches!(
            engine.forget_app(&game),
            Err(CoreError::StillConfigured(_))
        ));

        let reduced = Policy {
            apps: vec![app("khan", AppCategory::Learning, None)],
            ..Default::default()
        };
        engine.reload_policy(reduced, t0());

        engine.forget_app(&game).unwrap();
        assert!(store.load_record(&game).unwrap().is_none());
        assert!(store.load_record(&AppId::new("khan")).unwrap().is_some());
        assert!(matches!(engine.forget_app(&game), Err(CoreError::AppNotFound(_))));
    }

    #[tokio::test]
    async fn test_remote_command_unknown_app() {
        let (mut engine, _, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let command = RemoteConfigCommand {
            command_id: CommandId::new(),
            logical_id: AppId::new("nope"),
            category: AppCategory::Reward,
            linked_learning_apps: vec![],
            unlock_mode: UnlockMode::RequireAll,
            streak_settings: None,
            is_enabled: true,
            modified_at: t0(),
        };
        let result = engine.apply_remote_command(command, t0());
        assert!(matches!(result, Err(CoreError::AppNotFound(_))));
    }

    #[tokio::test]
    async fn test_day_rollover_settles_rewards_once() {
        let mut schedule = game_schedule(1440, 15);
        schedule.streak_settings = Some(StreakSettings {
            enabled: true,
            days_required: 1,
            bonus_minutes: 5,
        });
        let (mut engine, store, _) = running_engine(make_test_policy(schedule)).await;
        engine.ensure_current_day(t0());
        feed_minutes(&mut engine, "khan", 20);

        let tomorrow = t0() + ChronoDuration::days(1);
        let events = engine.ensure_current_day(tomorrow);
        assert_eq!(events.len(), 1);

        let bank = store.load_bank(&AppId::new("game")).unwrap().unwrap();
        // 20 earned, 0 used, plus the streak bonus
        assert_eq!(bank.banked_minutes, 25);
        assert_eq!(bank.streak_days, 1);

        let record = store.load_record(&AppId::new("khan")).unwrap().unwrap();
        assert_eq!(record.today_seconds, 0);
        assert_eq!(record.history_for(t0().date_naive()).unwrap().seconds, 1200);

        // A second engine on the same store does not settle again
        let mut other = CoreEngine::new(make_test_policy(game_schedule(1440, 15)), store.clone(), tomorrow);
        assert!(other.ensure_current_day(tomorrow).is_empty());
        assert_eq!(store.load_bank(&AppId::new("game")).unwrap().unwrap().banked_minutes, 25);

        // Banked minutes do not bypass today's goal
        let decision = engine.evaluate(&AppId::new("game"), tomorrow);
        assert_eq!(decision.primary_reason, Some(ReasonKind::LearningGoalNotMet));
    }

    #[tokio::test]
    async fn test_get_state() {
        let (mut engine, _, _) = running_engine(make_test_policy(game_schedule(60, 15))).await;
        let end = feed_minutes(&mut engine, "khan", 3);

        let state = engine.get_state(end);
        assert_eq!(state.api_version, API_VERSION);
        assert!(state.monitoring_active);
        let khan = state.apps.iter().find(|a| a.app_id.as_str() == "khan").unwrap();
        assert_eq!(khan.today_minutes, 3);
        let game = state.apps.iter().find(|a| a.app_id.as_str() == "game").unwrap();
        assert!(game.blocked);
    }
}
