//! Instance registration and heartbeating

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use lodestar_discovery::metrics;
use lodestar_types::{Error, Instance, Result, ServiceKey};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, warn};

use crate::manager::{Manager, ManagerInner};

#[derive(Debug)]
pub(crate) enum RegisterPhase {
    /// Register request (and first heartbeat) in flight
    Registering,
    /// Registered without heartbeating
    Registered,
    /// Waiting for the next heartbeat
    Idle,
    /// Heartbeat request in flight
    Beating,
    /// `deregister` took over
    Cancelling(Option<oneshot::Sender<()>>),
}

#[derive(Debug)]
pub(crate) struct RegisterEntry {
    key: ServiceKey,
    token: String,
    instance: Instance,
    phase: RegisterPhase,
    heartbeat_interval: Option<Duration>,
    last_heartbeat: Option<SystemTime>,
    last_error: Option<String>,
    wake: Arc<Notify>,
}

impl RegisterEntry {
    fn registering(key: ServiceKey, token: &str, instance: Instance) -> Self {
        Self {
            key,
            token: token.to_string(),
            instance,
            phase: RegisterPhase::Registering,
            heartbeat_interval: None,
            last_heartbeat: None,
            last_error: None,
            wake: Arc::new(Notify::new()),
        }
    }

    fn owned_by(&self, wake: &Arc<Notify>) -> bool {
        Arc::ptr_eq(&self.wake, wake)
    }
}

/// Snapshot of one registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterStatus {
    pub key: ServiceKey,
    /// `host:port`
    pub address: String,
    pub registering: bool,
    /// A heartbeat loop is running for this instance
    pub heartbeating: bool,
    pub heartbeat_interval: Option<Duration>,
    pub last_heartbeat: Option<SystemTime>,
    /// Error of the most recent heartbeat, cleared by the next successful one
    pub last_error: Option<String>,
}

impl ManagerInner {
    fn begin_heartbeat(&self, address: &str, wake: &Arc<Notify>) -> Option<(ServiceKey, String, Instance)> {
        let mut state = self.state.lock();
        let entry = state.registrations.get_mut(address).filter(|e| e.owned_by(wake))?;
        if !matches!(entry.phase, RegisterPhase::Idle) {
            return None;
        }
        entry.phase = RegisterPhase::Beating;
        Some((entry.key.clone(), entry.token.clone(), entry.instance.clone()))
    }

    /// Returns false when the loop must stop
    fn finish_heartbeat(&self, address: &str, wake: &Arc<Notify>, result: Result<()>) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.registrations.get_mut(address).filter(|e| e.owned_by(wake)) else {
            return false;
        };

        match result {
            Ok(()) => {
                entry.last_heartbeat = Some(SystemTime::now());
                entry.last_error = None;
            },
            Err(e) => entry.last_error = Some(e.to_string()),
        }

        if let RegisterPhase::Cancelling(done) = &mut entry.phase {
            if let Some(done) = done.take() {
                let _ = done.send(());
            }
            return false;
        }
        entry.phase = RegisterPhase::Idle;
        true
    }
}

async fn heartbeat_loop(inner: Arc<ManagerInner>, address: String, wake: Arc<Notify>, interval: Duration) {
    let mut shutdown = inner.shutdown_signal();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = wake.notified() => {},
            _ = shutdown.changed() => {},
        }

        if inner.is_exited() {
            break;
        }

        let Some((key, token, instance)) = inner.begin_heartbeat(&address, &wake) else {
            break;
        };

        let result = inner.client.heartbeat(&key, &token, &instance, inner.retry_max()).await;
        metrics::record_heartbeat(result.is_ok());
        if let Err(e) = &result {
            warn!(service = %key, address = %address, error = %e, "Heartbeat failed");
        }

        if !inner.finish_heartbeat(&address, &wake, result) {
            break;
        }
    }

    debug!(address = %address, "Heartbeat loop stopped");
}

impl Manager {
    /// Register a locally hosted instance
    ///
    /// When the instance has health checking enabled and `heartbeat_interval_ms`
    /// is positive, a first heartbeat is sent inline and a heartbeat loop keeps
    /// the instance alive. A control plane that rejects that first heartbeat
    /// because heartbeating is disabled leaves the instance registered
    /// without a loop; any other heartbeat failure is retried by the loop.
    ///
    /// # Errors
    ///
    /// Returns `Error::DoubleRegister` if the instance is already registered or
    /// being registered, otherwise the error of the register request.
    pub async fn register(
        &self,
        namespace: &str,
        name: &str,
        token: &str,
        heartbeat_interval_ms: u64,
        instance: Instance,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let key = ServiceKey::new(namespace, name);
        let address = instance.address();

        {
            let mut state = inner.state.lock();
            if state.registrations.contains_key(&address) {
                return Err(Error::DoubleRegister(address));
            }
            state
                .registrations
                .insert(address.clone(), RegisterEntry::registering(key.clone(), token, instance.clone()));
        }

        if let Err(e) = inner.client.register(&key, token, &instance, inner.retry_max()).await {
            inner.state.lock().registrations.remove(&address);
            warn!(service = %key, address = %address, error = %e, "Failed to register instance");
            return Err(e);
        }

        let mut heartbeating = false;
        let mut last_heartbeat = None;
        let mut last_error = None;

        if instance.enable_health_check && heartbeat_interval_ms > 0 {
            match inner.client.heartbeat(&key, token, &instance, inner.retry_max()).await {
                Ok(()) => {
                    metrics::record_heartbeat(true);
                    heartbeating = true;
                    last_heartbeat = Some(SystemTime::now());
                },
                Err(e) if e.is_heartbeat_disabled() => {
                    info!(
                        service = %key,
                        address = %address,
                        "Heartbeat disabled by the control plane, instance registered without heartbeat"
                    );
                },
                Err(e) => {
                    metrics::record_heartbeat(false);
                    warn!(service = %key, address = %address, error = %e, "First heartbeat failed");
                    heartbeating = true;
                    last_error = Some(e.to_string());
                },
            }
        }

        let interval = Duration::from_millis(heartbeat_interval_ms);
        let (wake, registered) = {
            let mut state = inner.state.lock();
            let registered = state.registrations.len();
            let Some(entry) = state.registrations.get_mut(&address) else {
                return Ok(());
            };
            entry.phase = if heartbeating { RegisterPhase::Idle } else { RegisterPhase::Registered };
            entry.heartbeat_interval = heartbeating.then_some(interval);
            entry.last_heartbeat = last_heartbeat;
            entry.last_error = last_error;
            (Arc::clone(&entry.wake), registered)
        };

        metrics::set_registered_instances(registered);
        if heartbeating {
            tokio::spawn(heartbeat_loop(Arc::clone(inner), address.clone(), wake, interval));
        }

        info!(service = %key, address = %address, heartbeat = heartbeating, "Instance registered");
        Ok(())
    }

    /// Deregister an instance
    ///
    /// A running heartbeat is stopped first, waiting for an in-flight heartbeat
    /// to finish. Instances this manager never registered are still
    /// deregistered on the control plane.
    ///
    /// # Errors
    ///
    /// Returns `Error::DoubleRegister` while the instance is still being
    /// registered or already being deregistered, otherwise the error of the
    /// deregister request.
    pub async fn deregister(&self, namespace: &str, name: &str, token: &str, instance: &Instance) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let key = ServiceKey::new(namespace, name);
        let address = instance.address();

        let (known, done) = {
            let mut state = inner.state.lock();
            match state.registrations.get_mut(&address) {
                None => (false, None),
                Some(entry) => {
                    let beating = match entry.phase {
                        RegisterPhase::Registering | RegisterPhase::Cancelling(_) => {
                            return Err(Error::DoubleRegister(address));
                        },
                        RegisterPhase::Registered | RegisterPhase::Idle => false,
                        RegisterPhase::Beating => true,
                    };
                    if beating {
                        let (tx, rx) = oneshot::channel();
                        entry.phase = RegisterPhase::Cancelling(Some(tx));
                        (true, Some(rx))
                    } else {
                        entry.phase = RegisterPhase::Cancelling(None);
                        entry.wake.notify_one();
                        (true, None)
                    }
                },
            }
        };

        if let Some(done) = done {
            debug!(address = %address, "Waiting for in-flight heartbeat");
            let _ = done.await;
        }

        let result = inner.client.deregister(&key, token, instance, inner.retry_max()).await;

        if known {
            let registered = {
                let mut state = inner.state.lock();
                state.registrations.remove(&address);
                state.registrations.len()
            };
            metrics::set_registered_instances(registered);
        }

        match &result {
            Ok(()) => info!(service = %key, address = %address, "Instance deregistered"),
            Err(e) => warn!(service = %key, address = %address, error = %e, "Failed to deregister instance"),
        }
        result
    }

    /// Addresses (`host:port`) of registered instances
    pub fn get_register_list(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut addresses: Vec<String> = state
            .registrations
            .iter()
            .filter(|(_, entry)| !matches!(entry.phase, RegisterPhase::Registering))
            .map(|(address, _)| address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    pub fn register_status(&self, address: &str) -> Option<RegisterStatus> {
        let state = self.inner.state.lock();
        let entry = state.registrations.get(address)?;

        Some(RegisterStatus {
            key: entry.key.clone(),
            address: address.to_string(),
            registering: matches!(entry.phase, RegisterPhase::Registering),
            heartbeating: matches!(entry.phase, RegisterPhase::Idle | RegisterPhase::Beating),
            heartbeat_interval: entry.heartbeat_interval,
            last_heartbeat: entry.last_heartbeat,
            last_error: entry.last_error.clone(),
        })
    }
}
