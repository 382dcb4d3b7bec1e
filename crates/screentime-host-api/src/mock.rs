//! Mock collaborators for testing

use async_trait::async_trait;
use screentime_api::{ShieldUpdate, UsageEvent};
use screentime_util::AppToken;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::{
    EVENT_CHANNEL_CAPACITY, HostError, HostResult, ShieldController, ThresholdRegistration,
    UsageMonitor,
};

/// Mock usage monitor for unit/integration testing
pub struct MockMonitor {
    event_tx: mpsc::Sender<UsageEvent>,
    event_rx: Arc<Mutex<Option<mpsc::Receiver<UsageEvent>>>>,

    /// Every registration received, in order
    pub registrations: Arc<Mutex<Vec<ThresholdRegistration>>>,

    pub running: Arc<Mutex<bool>>,

    /// Configure registration to fail
    pub fail_register: Arc<Mutex<bool>>,
}

impl MockMonitor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            event_tx: tx,
            event_rx: Arc::new(Mutex::new(Some(rx))),
            registrations: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(Mutex::new(false)),
            fail_register: Arc::new(Mutex::new(false)),
        }
    }

    /// Simulate the OS firing a threshold event. Returns false if the channel is full.
    pub fn emit(&self, event: UsageEvent) -> bool {
        self.event_tx.try_send(event).is_ok()
    }

    /// Latest registration for a token
    pub fn registration_for(&self, token: &AppToken) -> Option<ThresholdRegistration> {
        self.registrations
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| &r.token == token)
            .cloned()
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }
}

impl Default for MockMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageMonitor for MockMonitor {
    async fn register_thresholds(&self, registration: ThresholdRegistration) -> HostResult<()> {
        if *self.fail_register.lock().unwrap() {
            return Err(HostError::RegistrationFailed("Mock registration failure".into()));
        }
        self.registrations.lock().unwrap().push(registration);
        Ok(())
    }

    async fn start(&self) -> HostResult<()> {
        *self.running.lock().unwrap() = true;
        Ok(())
    }

    async fn stop(&self) -> HostResult<()> {
        *self.running.lock().unwrap() = false;
        Ok(())
    }

    fn subscribe(&self) -> HostResult<mpsc::Receiver<UsageEvent>> {
        self.event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(HostError::AlreadySubscribed)
    }
}

/// Mock shield controller that records every update
pub struct MockShield {
    shielded: Arc<Mutex<BTreeSet<AppToken>>>,

    /// Every update applied, in order
    pub updates: Arc<Mutex<Vec<ShieldUpdate>>>,

    /// Configure apply to fail
    pub fail_apply: Arc<Mutex<bool>>,
}

impl MockShield {
    pub fn new() -> Self {
        Self {
            shielded: Arc::new(Mutex::new(BTreeSet::new())),
            updates: Arc::new(Mutex::new(Vec::new())),
            fail_apply: Arc::new(Mutex::new(false)),
        }
    }

    pub fn is_shielded(&self, token: &AppToken) -> bool {
        self.shielded.lock().unwrap().contains(token)
    }
}

impl Default for MockShield {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShieldController for MockShield {
    async fn apply(&self, update: ShieldUpdate) -> HostResult<()> {
        if *self.fail_apply.lock().unwrap() {
            return Err(HostError::ShieldFailed("Mock shield failure".into()));
        }
        update.apply_to(&mut self.shielded.lock().unwrap());
        self.updates.lock().unwrap().push(update);
        Ok(())
    }

    fn shielded(&self) -> BTreeSet<AppToken> {
        self.shielded.lock().unwrap().clone()
    }
}
