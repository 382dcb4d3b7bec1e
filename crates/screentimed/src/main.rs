//! screentimed - The screentime background service
//!
//! This is the main entry point for the screentimed service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Core engine
//! - IPC-backed usage monitor and shield collaborators
//! - IPC server

mod bridge;

use anyhow::{Context, Result};
use clap::Parser;
use screentime_api::{
    ClientRole, Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus, Response,
    ResponsePayload,
};
use screentime_config::load_config;
use screentime_core::{CoreEngine, CoreError, CoreEvent, IngestOutcome, SkipReason};
use screentime_host_api::UsageMonitor;
use screentime_ipc::{IpcServer, ServerMessage};
use screentime_store::{AuditEvent, AuditEventType, SqliteStore, Store};
use screentime_util::{ClientId, default_config_path, format_datetime_full, is_mock_time_active};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use bridge::{IpcMonitor, IpcShield};

/// screentimed - Learning-goal and screen-time enforcement service
#[derive(Parser, Debug)]
#[command(name = "screentimed")]
#[command(about = "Learning-goal and screen-time enforcement service", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/screentime/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set SCREENTIME_SOCKET env var)
    #[arg(short, long, env = "SCREENTIME_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set SCREENTIME_DATA_DIR env var)
    #[arg(short, long, env = "SCREENTIME_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Main service state
struct Service {
    config_path: PathBuf,
    engine: Mutex<CoreEngine>,
    monitor: Arc<IpcMonitor>,
    shield: Arc<IpcShield>,
    ipc: Arc<IpcServer>,
    store: Arc<dyn Store>,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        // Load configuration
        let policy = load_config(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        info!(
            config_path = %args.config.display(),
            app_count = policy.apps.len(),
            "Configuration loaded"
        );

        // Determine paths
        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| policy.service.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| policy.service.data_dir.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        // Initialize store
        let db_path = data_dir.join("screentimed.db");
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );

        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        let engine = CoreEngine::new(policy, store.clone(), screentime_util::now());

        // Initialize IPC server
        let mut ipc = IpcServer::new(&socket_path);
        ipc.start().await?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            config_path: args.config.clone(),
            engine: Mutex::new(engine),
            monitor: Arc::new(IpcMonitor::new()),
            shield: Arc::new(IpcShield::new()),
            ipc: Arc::new(ipc),
            store,
        })
    }

    async fn run(self) -> Result<()> {
        let mut usage_events = self
            .monitor
            .subscribe()
            .context("Failed to take usage event stream")?;
        let mut ipc_messages = self
            .ipc
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        // Spawn IPC accept task
        let ipc_accept = self.ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        self.resume().await;

        // Set up signal handlers
        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        let refresh_interval = self.engine.lock().await.policy().service.refresh_interval;
        let mut refresh_timer = tokio::time::interval(refresh_interval);

        info!(refresh_secs = refresh_interval.as_secs(), "Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down gracefully");
                    break;
                }

                // Periodic refresh: day rollover, shields and reasons
                _ = refresh_timer.tick() => {
                    self.refresh().await;
                }

                // Threshold events from the monitor
                Some(event) = usage_events.recv() => {
                    let now = screentime_util::now();
                    let outcome = self.engine.lock().await.ingest_event(&event, now);
                    match outcome {
                        Ok(IngestOutcome::Credited { app_id, seconds }) => {
                            debug!(app_id = %app_id, seconds, "Usage credited");
                            self.refresh().await;
                        }
                        Ok(outcome) => {
                            debug!(token = %event.app_token, outcome = ?outcome, "Threshold event not credited");
                        }
                        Err(e) => {
                            warn!(token = %event.app_token, error = %e, "Failed to ingest threshold event");
                        }
                    }
                }

                // IPC messages
                Some(msg) = ipc_messages.recv() => {
                    self.handle_ipc_message(msg).await;
                }
            }
        }

        info!("Shutting down screentimed");

        self.ipc.broadcast_event(Event::new(EventPayload::Shutdown));

        if let Err(e) = self.store.append_audit(AuditEvent::new(AuditEventType::ServiceStopped)) {
            warn!(error = %e, "Failed to log service shutdown");
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Register ladders and pick monitoring back up if it was on before a restart
    async fn resume(&self) {
        let events = {
            let mut engine = self.engine.lock().await;
            let now = screentime_util::now();
            let mut events = engine.ensure_current_day(now);
            events.extend(engine.register_thresholds(self.monitor.as_ref()).await);

            if engine.monitoring_was_active() {
                info!("Monitoring was active before restart, resuming");
                match engine.start_monitoring(now, self.monitor.as_ref()).await {
                    Ok(started) => events.extend(started),
                    Err(e) => warn!(error = %e, "Failed to resume monitoring"),
                }
            }
            events
        };

        info!(tokens = self.monitor.registered_tokens(), "Usage monitor ready");
        self.publish(events).await;
    }

    async fn refresh(&self) {
        let events = {
            let mut engine = self.engine.lock().await;
            engine.refresh(screentime_util::now(), self.shield.as_ref()).await
        };
        self.publish(events).await;
    }

    /// Forward core events to subscribers, followed by a state snapshot if anything changed
    async fn publish(&self, events: Vec<CoreEvent>) {
        if events.is_empty() {
            return;
        }

        for event in events {
            let payload = match event {
                CoreEvent::ShieldChanged { update, shielded } => {
                    EventPayload::ShieldChanged { update, shielded }
                }
                CoreEvent::ReasonUpdated { app_id, reason } => {
                    EventPayload::ReasonUpdated { app_id, reason }
                }
                CoreEvent::MonitoringChanged { active } => EventPayload::MonitoringChanged { active },
                CoreEvent::ThresholdsRegistered { app_id, token, count } => {
                    EventPayload::ThresholdsRegistered {
                        app_id,
                        token,
                        thresholds: count,
                    }
                }
                CoreEvent::PolicyReloaded { app_count } => EventPayload::PolicyReloaded { app_count },
                CoreEvent::UsageCredited { app_id, seconds, source } => {
                    debug!(app_id = %app_id, seconds, source = ?source, "Usage credited");
                    continue;
                }
                CoreEvent::DaySettled { app_id, settlement } => {
                    debug!(app_id = %app_id, day = %settlement.day, "Day settled");
                    continue;
                }
                CoreEvent::ScheduleChanged { app_id, status } => {
                    debug!(app_id = %app_id, status = status.as_str(), "Schedule changed");
                    continue;
                }
            };
            self.ipc.broadcast_event(Event::new(payload));
        }

        let state = self.engine.lock().await.get_state(screentime_util::now());
        self.ipc.broadcast_event(Event::new(EventPayload::StateChanged(state)));
    }

    async fn handle_ipc_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let response = self
                    .handle_command(&client_id, request.request_id, request.command)
                    .await;

                if let Err(e) = self.ipc.send_response(&client_id, response).await {
                    debug!(client_id = %client_id, error = %e, "Failed to send response");
                }
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    "Client connected"
                );

                let _ = self.store.append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                    client_id: client_id.to_string(),
                    role: format!("{:?}", info.role),
                    uid: info.uid,
                }));
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::ClientDisconnected {
                        client_id: client_id.to_string(),
                    },
                ));
            }
        }
    }

    async fn role_of(&self, client_id: &ClientId) -> ClientRole {
        self.ipc
            .get_client_info(client_id)
            .await
            .map(|info| info.role)
            .unwrap_or(ClientRole::Observer)
    }

    async fn handle_command(&self, client_id: &ClientId, request_id: u64, command: Command) -> Response {
        let now = screentime_util::now();
        let role = self.role_of(client_id).await;

        match command {
            Command::GetState => {
                let state = self.engine.lock().await.get_state(now);
                Response::success(request_id, ResponsePayload::State(state))
            }

            Command::Evaluate { token } => {
                let decision = self.engine.lock().await.evaluate_token(&token, now);
                Response::success(request_id, ResponsePayload::Decision(decision))
            }

            Command::GetReason { app_id } => {
                match self.engine.lock().await.block_reason(&app_id) {
                    Ok(reason) => Response::success(request_id, ResponsePayload::Reason { reason }),
                    Err(e) => core_error(request_id, &e),
                }
            }

            Command::ReportUsage { event } => {
                if !role.can_report() {
                    return denied(request_id, "Reporter role required");
                }

                let accepted = self.monitor.push(event);
                Response::success(request_id, ResponsePayload::UsageReported { accepted })
            }

            Command::ReportSnapshot { snapshot } => {
                if !role.can_report() {
                    return denied(request_id, "Reporter role required");
                }

                let report = self.engine.lock().await.reconcile(&snapshot, now);
                match report {
                    Ok(report) if report.rejected == Some(SkipReason::MonitoringStopped) => {
                        Response::error(
                            request_id,
                            ErrorInfo::new(ErrorCode::MonitoringStopped, "Monitoring is stopped"),
                        )
                    }
                    Ok(report) => {
                        if let Some(reason) = report.rejected {
                            info!(captured_at = %report.captured_at, reason = %reason, "Snapshot rejected");
                        }
                        if report.applied_count() > 0 {
                            self.refresh().await;
                        }
                        Response::success(
                            request_id,
                            ResponsePayload::SnapshotReconciled {
                                applied: report.applied_count(),
                                skipped: report.skipped_count(),
                            },
                        )
                    }
                    Err(e) => core_error(request_id, &e),
                }
            }

            Command::StartMonitoring => {
                if !role.can_control_monitoring() {
                    return denied(request_id, "Reporter role required");
                }

                let started = self
                    .engine
                    .lock()
                    .await
                    .start_monitoring(now, self.monitor.as_ref())
                    .await;
                match started {
                    Ok(events) => {
                        self.publish(events).await;
                        self.refresh().await;
                        Response::success(request_id, ResponsePayload::MonitoringStarted)
                    }
                    Err(e) => core_error(request_id, &e),
                }
            }

            Command::StopMonitoring => {
                if !role.can_control_monitoring() {
                    return denied(request_id, "Reporter role required");
                }

                let stopped = self
                    .engine
                    .lock()
                    .await
                    .stop_monitoring(self.monitor.as_ref(), self.shield.as_ref())
                    .await;
                match stopped {
                    Ok(events) => {
                        self.publish(events).await;
                        Response::success(request_id, ResponsePayload::MonitoringStopped)
                    }
                    Err(e) => core_error(request_id, &e),
                }
            }

            Command::ApplyRemoteConfig { command } => {
                if !role.can_apply_remote_config() {
                    return denied(request_id, "Admin role required");
                }

                let applied = self.engine.lock().await.apply_remote_command(command, now);
                match applied {
                    Ok((status, events)) => {
                        self.publish(events).await;
                        self.refresh().await;
                        Response::success(request_id, ResponsePayload::RemoteConfig { status })
                    }
                    Err(e) => core_error(request_id, &e),
                }
            }

            Command::ReloadConfig => {
                if !role.can_reload_config() {
                    return denied(request_id, "Admin role required");
                }

                match load_config(&self.config_path) {
                    Ok(policy) => {
                        let events = {
                            let mut engine = self.engine.lock().await;
                            let mut events = vec![engine.reload_policy(policy, now)];
                            events.extend(engine.register_thresholds(self.monitor.as_ref()).await);
                            events
                        };
                        let _ = self
                            .store
                            .append_audit(AuditEvent::new(AuditEventType::ConfigReloaded { success: true }));
                        info!(config_path = %self.config_path.display(), "Configuration reloaded");

                        self.publish(events).await;
                        self.refresh().await;
                        Response::success(request_id, ResponsePayload::ConfigReloaded)
                    }
                    Err(e) => {
                        warn!(error = %e, "Configuration reload failed, keeping current policy");
                        let _ = self
                            .store
                            .append_audit(AuditEvent::new(AuditEventType::ConfigReloaded { success: false }));
                        Response::error(request_id, ErrorInfo::new(ErrorCode::ConfigError, e.to_string()))
                    }
                }
            }

            Command::ForgetApp { app_id } => {
                if !role.can_forget_apps() {
                    return denied(request_id, "Admin role required");
                }

                let forgotten = self.engine.lock().await.forget_app(&app_id);
                match forgotten {
                    Ok(()) => {
                        info!(app_id = %app_id, "Stored usage deleted");
                        Response::success(request_id, ResponsePayload::AppForgotten)
                    }
                    Err(e) => core_error(request_id, &e),
                }
            }

            Command::SubscribeEvents => Response::success(
                request_id,
                ResponsePayload::Subscribed {
                    client_id: client_id.clone(),
                },
            ),

            Command::UnsubscribeEvents => Response::success(request_id, ResponsePayload::Unsubscribed),

            Command::GetHealth => {
                let engine = self.engine.lock().await;
                let health = HealthStatus {
                    live: true,
                    ready: true,
                    store_ok: engine.is_store_healthy(),
                    monitoring_active: engine.monitoring_active(),
                };
                Response::success(request_id, ResponsePayload::Health(health))
            }

            Command::Ping => Response::success(request_id, ResponsePayload::Pong),
        }
    }
}

fn denied(request_id: u64, message: &str) -> Response {
    Response::error(request_id, ErrorInfo::new(ErrorCode::PermissionDenied, message))
}

fn core_error(request_id: u64, error: &CoreError) -> Response {
    let code = match error {
        CoreError::AppNotFound(_) => ErrorCode::AppNotFound,
        CoreError::StillConfigured(_) => ErrorCode::InvalidRequest,
        CoreError::Store(_) => ErrorCode::StoreError,
        CoreError::Host(_) => ErrorCode::InternalError,
    };
    Response::error(request_id, ErrorInfo::new(code, error.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "screentimed starting"
    );

    if is_mock_time_active() {
        warn!(
            now = %format_datetime_full(&screentime_util::now()),
            "Mock time active, schedules use the offset clock"
        );
    }

    let service = Service::new(&args).await?;
    service.run().await
}
