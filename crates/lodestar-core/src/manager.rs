//! Lifecycle manager shared state
//!
//! A [`Manager`] owns every watch and registration of a process. Background
//! refresh and heartbeat loops hold an `Arc` of the shared state, so the state
//! outlives the handle until the last loop has observed the exit signal.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use lodestar_discovery::{DiscoveryClient, task::INITIAL_REVISION};
use lodestar_routing::{Endpoint, PolicyConfig, PolicyRegistry, RouteRequest};
use lodestar_types::{CircuitBreaker, Error, RateLimit, Result, ServiceKey};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    config::LodestarConfig,
    register::RegisterEntry,
    watch::{UnwatchedPolicy, WatchEntry},
};

#[derive(Debug, Default)]
pub(crate) struct ManagerState {
    pub(crate) watches: HashMap<ServiceKey, WatchEntry>,
    /// Policies of unwatched services, kept for a later watch
    pub(crate) unwatched: HashMap<ServiceKey, UnwatchedPolicy>,
    /// Keyed by `host:port`
    pub(crate) registrations: HashMap<String, RegisterEntry>,
}

#[derive(Debug)]
pub(crate) struct ManagerInner {
    pub(crate) client: DiscoveryClient,
    pub(crate) config: LodestarConfig,
    pub(crate) policy_config: PolicyConfig,
    pub(crate) registry: Arc<PolicyRegistry>,
    /// Never held across a network call
    pub(crate) state: Mutex<ManagerState>,
    exited: AtomicBool,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl ManagerInner {
    pub(crate) fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_exited() {
            return Err(Error::Exited);
        }
        Ok(())
    }

    pub(crate) fn retry_max(&self) -> u32 {
        self.config.global.api.retry_max
    }

    pub(crate) fn shutdown_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Watch and registration lifecycle manager
///
/// Policies of watched services are installed into the [`PolicyRegistry`]
/// passed at construction, where the outbound call path looks them up.
///
/// # Usage
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use lodestar_core::{LodestarConfig, Manager};
/// use lodestar_routing::{PolicyRegistry, RouteRequest};
///
/// # async fn example() -> lodestar_types::Result<()> {
/// let registry = Arc::new(PolicyRegistry::new());
/// let manager = Manager::new(LodestarConfig::default(), Arc::clone(&registry))?;
///
/// manager.watch("Test", "echo").await?;
/// let endpoint = manager.select("Test", "echo", &RouteRequest::parse("Test.caller")?)?;
/// println!("calling {}", endpoint.address());
///
/// manager.unwatch("Test", "echo").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Manager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl Manager {
    /// Create a manager talking HTTP to the configured control plane
    pub fn new(config: LodestarConfig, registry: Arc<PolicyRegistry>) -> Result<Self> {
        config.validate()?;
        let client = DiscoveryClient::new(config.global.clone())?;
        Self::with_client(config, client, registry)
    }

    /// Create a manager over an existing discovery client
    pub fn with_client(
        config: LodestarConfig,
        client: DiscoveryClient,
        registry: Arc<PolicyRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let policy_config = config.policy_config()?;
        let (shutdown, _) = tokio::sync::watch::channel(false);

        info!(
            seeds = ?client.config().server_connector.addresses,
            refresh_interval_ms = config.consumer.local_cache.service_refresh_interval_ms,
            "Lifecycle manager started"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                client,
                config,
                policy_config,
                registry,
                state: Mutex::new(ManagerState::default()),
                exited: AtomicBool::new(false),
                shutdown,
            }),
        })
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.inner.registry
    }

    pub fn client(&self) -> &DiscoveryClient {
        &self.inner.client
    }

    pub fn config(&self) -> &LodestarConfig {
        &self.inner.config
    }

    /// Select an endpoint of a watched service
    ///
    /// # Errors
    ///
    /// Returns `Error::ServiceNotFound` if the service is not watched, or the
    /// selection error of its policy.
    pub fn select(&self, namespace: &str, name: &str, request: &RouteRequest) -> Result<Arc<Endpoint>> {
        self.inner.registry.select(&ServiceKey::new(namespace, name), request)
    }

    /// Fetch the current rate-limit rules of a service
    pub async fn fetch_rate_limit_rules(&self, namespace: &str, name: &str) -> Result<RateLimit> {
        self.inner.ensure_running()?;
        let key = ServiceKey::new(namespace, name);
        let fetched =
            self.inner.client.fetch_rate_limit(&key, INITIAL_REVISION, self.inner.retry_max()).await?;
        debug!(service = %key, revision = ?fetched.revision(), "Fetched rate-limit rules");
        Ok(fetched.into_value().unwrap_or_default())
    }

    /// Fetch the current circuit-breaker rules of a service
    pub async fn fetch_circuit_breaker_rules(&self, namespace: &str, name: &str) -> Result<CircuitBreaker> {
        self.inner.ensure_running()?;
        let key = ServiceKey::new(namespace, name);
        let fetched = self
            .inner
            .client
            .fetch_circuit_breaker(&key, INITIAL_REVISION, self.inner.retry_max())
            .await?;
        debug!(service = %key, revision = ?fetched.revision(), "Fetched circuit-breaker rules");
        Ok(fetched.into_value().unwrap_or_default())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.inner.exited.store(true, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
        debug!("Lifecycle manager exited, stopping background loops");
    }
}
