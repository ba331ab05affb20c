//! Service watches
//!
//! A watch resolves a service once, installs its [`RoutingPolicy`] and then
//! refreshes it on a timer. Refreshes of one service are strictly sequential.

use std::{
    sync::Arc,
    time::{Instant, SystemTime},
};

use lodestar_discovery::{DiscoverResult, Fetched, metrics, task::INITIAL_REVISION};
use lodestar_routing::RoutingPolicy;
use lodestar_types::{Error, Result, ServiceKey};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, warn};

use crate::manager::{Manager, ManagerInner, ManagerState};

#[derive(Debug)]
pub(crate) enum WatchPhase {
    /// First discover still running
    Establishing,
    /// Waiting for the next tick
    Idle,
    /// Refresh request in flight
    Refreshing,
    /// `unwatch` is waiting for the in-flight refresh
    Cancelling(Option<oneshot::Sender<()>>),
}

#[derive(Debug)]
pub(crate) struct WatchEntry {
    phase: WatchPhase,
    policy: Option<Arc<RoutingPolicy>>,
    routing_revision: String,
    last_refresh: Option<SystemTime>,
    last_error: Option<String>,
    /// Wakes the refresh loop; also identifies the loop owning this entry
    wake: Arc<Notify>,
}

impl WatchEntry {
    fn establishing() -> Self {
        Self {
            phase: WatchPhase::Establishing,
            policy: None,
            routing_revision: INITIAL_REVISION.to_string(),
            last_refresh: None,
            last_error: None,
            wake: Arc::new(Notify::new()),
        }
    }

    fn owned_by(&self, wake: &Arc<Notify>) -> bool {
        Arc::ptr_eq(&self.wake, wake)
    }

    /// Hand the in-flight refresh result over to a waiting `unwatch`
    fn signal_cancel(&mut self) -> bool {
        match &mut self.phase {
            WatchPhase::Cancelling(done) => {
                if let Some(done) = done.take() {
                    let _ = done.send(());
                }
                true
            },
            _ => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct UnwatchedPolicy {
    policy: Arc<RoutingPolicy>,
    routing_revision: String,
    cached_at: Instant,
}

impl UnwatchedPolicy {
    fn new(policy: Arc<RoutingPolicy>, routing_revision: String) -> Self {
        Self { policy, routing_revision, cached_at: Instant::now() }
    }
}

/// Snapshot of one watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    pub key: ServiceKey,
    /// First discover has not completed yet
    pub establishing: bool,
    /// A refresh request is in flight
    pub refreshing: bool,
    pub instance_revision: Option<String>,
    pub routing_revision: String,
    pub endpoint_count: usize,
    pub last_refresh: Option<SystemTime>,
    /// Error of the most recent refresh, cleared by the next successful one
    pub last_error: Option<String>,
}

/// Push modified data into the policy, returning the new routing revision
fn apply(policy: &RoutingPolicy, result: DiscoverResult) -> Option<String> {
    if let Fetched::Modified { value, .. } = result.instances {
        policy.update_instances(value);
    }
    match result.routing {
        Fetched::Modified { revision, value } => {
            policy.update_routing(&value);
            Some(revision)
        },
        Fetched::Unchanged => None,
    }
}

impl ManagerInner {
    fn take_cached_policy(&self, state: &mut ManagerState, key: &ServiceKey) -> Option<UnwatchedPolicy> {
        let expire = self.config.consumer.local_cache.service_expire_time();
        state.unwatched.retain(|_, cached| cached.cached_at.elapsed() < expire);
        state.unwatched.remove(key)
    }

    /// The next discover must return full data; whatever was recorded was not applied
    fn forget_instances(&self, key: &ServiceKey) {
        self.client.cluster().forget_revision(key);
    }

    /// Undo an establishing watch, handing a resumed policy back to the cache
    fn abandon_watch(&self, key: &ServiceKey, policy: Arc<RoutingPolicy>, routing_revision: String, resumed: bool) {
        self.forget_instances(key);
        let mut state = self.state.lock();
        state.watches.remove(key);
        if resumed {
            state.unwatched.insert(key.clone(), UnwatchedPolicy::new(policy, routing_revision));
        }
    }

    fn begin_refresh(&self, key: &ServiceKey, wake: &Arc<Notify>) -> Option<(Arc<RoutingPolicy>, String)> {
        let mut state = self.state.lock();
        let entry = state.watches.get_mut(key).filter(|e| e.owned_by(wake))?;
        if !matches!(entry.phase, WatchPhase::Idle) {
            return None;
        }
        let policy = entry.policy.clone()?;
        entry.phase = WatchPhase::Refreshing;
        Some((policy, entry.routing_revision.clone()))
    }

    /// Whether `unwatch` took over while the request was in flight
    fn refresh_cancelled(&self, key: &ServiceKey, wake: &Arc<Notify>) -> bool {
        let mut state = self.state.lock();
        match state.watches.get_mut(key).filter(|e| e.owned_by(wake)) {
            Some(entry) if matches!(entry.phase, WatchPhase::Cancelling(_)) => {
                self.forget_instances(key);
                entry.signal_cancel()
            },
            Some(_) => false,
            None => true,
        }
    }

    /// Returns false when the loop must stop
    fn finish_refresh(
        &self,
        key: &ServiceKey,
        wake: &Arc<Notify>,
        policy: &RoutingPolicy,
        result: Result<DiscoverResult>,
    ) -> bool {
        let outcome = match result {
            Ok(result) => {
                if self.refresh_cancelled(key, wake) {
                    debug!(service = %key, "Refresh result discarded, watch is being cancelled");
                    return false;
                }
                metrics::record_refresh(true);
                Ok(apply(policy, result))
            },
            Err(e) => {
                self.forget_instances(key);
                metrics::record_refresh(false);
                warn!(service = %key, error = %e, "Watch refresh failed");
                Err(e.to_string())
            },
        };

        let mut state = self.state.lock();
        let Some(entry) = state.watches.get_mut(key).filter(|e| e.owned_by(wake)) else {
            return false;
        };

        match outcome {
            Ok(revision) => {
                if let Some(revision) = revision {
                    entry.routing_revision = revision;
                }
                entry.last_refresh = Some(SystemTime::now());
                entry.last_error = None;
            },
            Err(message) => entry.last_error = Some(message),
        }

        if entry.signal_cancel() {
            return false;
        }
        entry.phase = WatchPhase::Idle;
        true
    }
}

async fn refresh_loop(inner: Arc<ManagerInner>, key: ServiceKey, wake: Arc<Notify>) {
    let interval = inner.config.consumer.local_cache.service_refresh_interval();
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

        let Some((policy, routing_revision)) = inner.begin_refresh(&key, &wake) else {
            break;
        };

        let result = inner.client.discover(&key, &routing_revision, inner.retry_max()).await;
        if !inner.finish_refresh(&key, &wake, &policy, result) {
            break;
        }
    }

    debug!(service = %key, "Refresh loop stopped");
}

impl Manager {
    /// Start watching a service
    ///
    /// Returns once the first discover has completed and the service's policy
    /// is installed in the registry. A policy cached by an earlier
    /// [`unwatch`](Self::unwatch) is resumed instead of starting cold.
    ///
    /// # Errors
    ///
    /// Returns `Error::DoubleWatch` if the service is already watched or being
    /// watched, otherwise the error of the first discover.
    pub async fn watch(&self, namespace: &str, name: &str) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let key = ServiceKey::new(namespace, name);

        let cached = {
            let mut state = inner.state.lock();
            if state.watches.contains_key(&key) {
                return Err(Error::DoubleWatch(key.to_string()));
            }
            state.watches.insert(key.clone(), WatchEntry::establishing());
            inner.take_cached_policy(&mut state, &key)
        };

        let resumed = cached.is_some();
        let (policy, routing_revision) = match cached {
            Some(cached) => {
                debug!(service = %key, "Resuming watch with cached policy");
                (cached.policy, cached.routing_revision)
            },
            None => {
                inner.forget_instances(&key);
                let policy = RoutingPolicy::new(key.clone(), inner.policy_config.clone());
                (Arc::new(policy), INITIAL_REVISION.to_string())
            },
        };

        let result = match inner.client.discover(&key, &routing_revision, inner.retry_max()).await {
            Ok(result) => result,
            Err(e) => {
                inner.abandon_watch(&key, policy, routing_revision, resumed);
                warn!(service = %key, error = %e, "Failed to establish watch");
                return Err(e);
            },
        };

        let routing_revision = apply(&policy, result).unwrap_or(routing_revision);

        if let Err(e) = inner.registry.add(key.clone(), Arc::clone(&policy)) {
            inner.abandon_watch(&key, policy, routing_revision, resumed);
            warn!(service = %key, error = %e, "Failed to install policy");
            return Err(e);
        }

        let (wake, watched) = {
            let mut state = inner.state.lock();
            let watched = state.watches.len();
            let Some(entry) = state.watches.get_mut(&key) else {
                inner.registry.remove(&key);
                return Err(Error::ServiceNotFound(key.to_string()));
            };
            entry.phase = WatchPhase::Idle;
            entry.policy = Some(Arc::clone(&policy));
            entry.routing_revision = routing_revision;
            entry.last_refresh = Some(SystemTime::now());
            (Arc::clone(&entry.wake), watched)
        };

        metrics::set_watched_services(watched);
        tokio::spawn(refresh_loop(Arc::clone(inner), key.clone(), wake));

        info!(
            service = %key,
            endpoints = policy.endpoint_count(),
            resumed = resumed,
            "Watch established"
        );
        Ok(())
    }

    /// Stop watching a service
    ///
    /// Waits for an in-flight refresh to finish, then removes the policy from
    /// the registry and keeps it for a later [`watch`](Self::watch).
    ///
    /// # Errors
    ///
    /// Returns `Error::ServiceNotFound` if the service is not watched, is still
    /// being established, or is already being unwatched.
    pub async fn unwatch(&self, namespace: &str, name: &str) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let key = ServiceKey::new(namespace, name);

        let done = {
            let mut state = inner.state.lock();
            let Some(entry) = state.watches.get_mut(&key) else {
                return Err(Error::ServiceNotFound(key.to_string()));
            };
            let refreshing = match entry.phase {
                WatchPhase::Establishing | WatchPhase::Cancelling(_) => {
                    return Err(Error::ServiceNotFound(key.to_string()));
                },
                WatchPhase::Idle => false,
                WatchPhase::Refreshing => true,
            };
            refreshing.then(|| {
                let (tx, rx) = oneshot::channel();
                entry.phase = WatchPhase::Cancelling(Some(tx));
                rx
            })
        };

        if let Some(done) = done {
            debug!(service = %key, "Waiting for in-flight refresh");
            let _ = done.await;
        }

        let watched = {
            let mut state = inner.state.lock();
            let Some(entry) = state.watches.remove(&key) else {
                return Err(Error::ServiceNotFound(key.to_string()));
            };
            entry.wake.notify_one();

            if let Some(policy) = inner.registry.remove(&key).or(entry.policy) {
                state.unwatched.insert(key.clone(), UnwatchedPolicy::new(policy, entry.routing_revision));
            }
            state.watches.len()
        };

        metrics::set_watched_services(watched);
        info!(service = %key, "Watch removed");
        Ok(())
    }

    /// Services with an established watch
    pub fn get_watching_list(&self) -> Vec<ServiceKey> {
        let state = self.inner.state.lock();
        let mut keys: Vec<ServiceKey> = state
            .watches
            .iter()
            .filter(|(_, entry)| !matches!(entry.phase, WatchPhase::Establishing))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_by_key(|key| key.to_string());
        keys
    }

    pub fn watch_status(&self, namespace: &str, name: &str) -> Option<WatchStatus> {
        let key = ServiceKey::new(namespace, name);
        let state = self.inner.state.lock();
        let entry = state.watches.get(&key)?;

        Some(WatchStatus {
            establishing: matches!(entry.phase, WatchPhase::Establishing),
            refreshing: matches!(entry.phase, WatchPhase::Refreshing | WatchPhase::Cancelling(_)),
            instance_revision: self.inner.client.cluster().revision(&key),
            routing_revision: entry.routing_revision.clone(),
            endpoint_count: entry.policy.as_ref().map_or(0, |p| p.endpoint_count()),
            last_refresh: entry.last_refresh,
            last_error: entry.last_error.clone(),
            key,
        })
    }
}
