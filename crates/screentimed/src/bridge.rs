//! IPC-backed collaborators
//!
//! The OS-facing monitor extension and shield helper run as separate
//! processes. They report threshold events over IPC and apply shield updates
//! from the event stream, so inside the daemon both collaborators are thin
//! bridges onto the IPC server.

use async_trait::async_trait;
use screentime_api::{ShieldUpdate, UsageEvent};
use screentime_host_api::{
    EVENT_CHANNEL_CAPACITY, HostError, HostResult, ShieldController, ThresholdRegistration,
    UsageMonitor,
};
use screentime_util::AppToken;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Usage monitor whose events arrive as `ReportUsage` requests
pub struct IpcMonitor {
    event_tx: mpsc::Sender<UsageEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<UsageEvent>>>,
    registrations: Mutex<HashMap<AppToken, ThresholdRegistration>>,
    running: AtomicBool,
}

impl IpcMonitor {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            registrations: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Queue a reported event. Returns false when the channel is full.
    pub fn push(&self, event: UsageEvent) -> bool {
        match self.event_tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Usage event dropped");
                false
            }
        }
    }

    /// Number of tokens with a registered ladder
    pub fn registered_tokens(&self) -> usize {
        self.registrations.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for IpcMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageMonitor for IpcMonitor {
    async fn register_thresholds(&self, registration: ThresholdRegistration) -> HostResult<()> {
        let mut registrations = self
            .registrations
            .lock()
            .map_err(|_| HostError::Internal("registration table poisoned".into()))?;
        debug!(
            app_id = %registration.app_id,
            token = %registration.token,
            rungs = registration.thresholds.len(),
            "Threshold ladder recorded"
        );
        registrations.insert(registration.token.clone(), registration);
        Ok(())
    }

    async fn start(&self) -> HostResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> HostResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> HostResult<mpsc::Receiver<UsageEvent>> {
        self.event_rx
            .lock()
            .map_err(|_| HostError::Internal("event receiver poisoned".into()))?
            .take()
            .ok_or(HostError::AlreadySubscribed)
    }
}

/// Shield controller that tracks the set the helpers are told to enforce.
///
/// Updates reach helpers as `ShieldChanged` events.
#[derive(Default)]
pub struct IpcShield {
    shielded: Mutex<BTreeSet<AppToken>>,
}

impl IpcShield {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShieldController for IpcShield {
    async fn apply(&self, update: ShieldUpdate) -> HostResult<()> {
        let mut shielded = self
            .shielded
            .lock()
            .map_err(|_| HostError::ShieldFailed("shield set poisoned".into()))?;
        update.apply_to(&mut shielded);
        Ok(())
    }

    fn shielded(&self) -> BTreeSet<AppToken> {
        self.shielded.lock().map(|s| s.clone()).unwrap_or_default()
    }
}
