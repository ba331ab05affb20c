//! Resolved control plane topology shared by every task of a client

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use lodestar_types::ServiceKey;
use parking_lot::Mutex;
use rand::Rng;

/// Initialization bits of [`ClusterState`]
pub mod status {
    pub const DISCOVER_READY: u8 = 1;
    pub const HEALTHCHECK_READY: u8 = 2;
}

/// Which control plane address pool an operation is sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterKind {
    /// Serves discover, rate-limit and circuit-breaker requests
    Discover,
    /// Serves register, deregister and heartbeat requests
    HealthCheck,
}

impl ClusterKind {
    pub fn ready_bit(self) -> u8 {
        match self {
            ClusterKind::Discover => status::DISCOVER_READY,
            ClusterKind::HealthCheck => status::HEALTHCHECK_READY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterKind::Discover => "discover",
            ClusterKind::HealthCheck => "healthcheck",
        }
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct AddressPool {
    addresses: Vec<String>,
    resolved_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct ClusterInner {
    discover: AddressPool,
    health_check: AddressPool,
    revisions: HashMap<ServiceKey, String>,
    status: u8,
}

impl ClusterInner {
    fn pool(&self, kind: ClusterKind) -> &AddressPool {
        match kind {
            ClusterKind::Discover => &self.discover,
            ClusterKind::HealthCheck => &self.health_check,
        }
    }

    fn pool_mut(&mut self, kind: ClusterKind) -> &mut AddressPool {
        match kind {
            ClusterKind::Discover => &mut self.discover,
            ClusterKind::HealthCheck => &mut self.health_check,
        }
    }
}

/// Control plane addresses, revision cache and initialization bitmask
///
/// One instance is created per client and shared through an `Arc` by every
/// task spawned from it. All state sits behind a single mutex that is only
/// held for a read or a bulk replace.
#[derive(Debug, Default)]
pub struct ClusterState {
    inner: Mutex<ClusterInner>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current initialization bitmask
    pub fn status(&self) -> u8 {
        self.inner.lock().status
    }

    pub fn is_ready(&self, kind: ClusterKind) -> bool {
        self.status() & kind.ready_bit() != 0
    }

    /// Whether the pool is unresolved or was resolved longer than `max_age` ago
    pub fn needs_bootstrap(&self, kind: ClusterKind, max_age: Duration) -> bool {
        let inner = self.inner.lock();
        if inner.status & kind.ready_bit() == 0 {
            return true;
        }
        match inner.pool(kind).resolved_at {
            Some(at) => at.elapsed() >= max_age,
            None => true,
        }
    }

    /// Replace a pool's addresses and mark it ready
    pub fn replace_addresses(&self, kind: ClusterKind, addresses: Vec<String>) {
        let mut inner = self.inner.lock();
        let pool = inner.pool_mut(kind);
        pool.addresses = addresses;
        pool.resolved_at = Some(Instant::now());
        inner.status |= kind.ready_bit();
    }

    /// Keep the current addresses after a "not modified" bootstrap response
    ///
    /// Returns false when there is nothing to keep.
    pub fn keep_addresses(&self, kind: ClusterKind) -> bool {
        let mut inner = self.inner.lock();
        let pool = inner.pool_mut(kind);
        if pool.addresses.is_empty() {
            return false;
        }
        pool.resolved_at = Some(Instant::now());
        inner.status |= kind.ready_bit();
        true
    }

    pub fn addresses(&self, kind: ClusterKind) -> Vec<String> {
        self.inner.lock().pool(kind).addresses.clone()
    }

    /// Pick a random address from a pool
    pub fn pick_address(&self, kind: ClusterKind) -> Option<String> {
        let inner = self.inner.lock();
        let addresses = &inner.pool(kind).addresses;
        if addresses.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..addresses.len());
        Some(addresses[index].clone())
    }

    /// Last instance revision seen for a service
    pub fn revision(&self, key: &ServiceKey) -> Option<String> {
        self.inner.lock().revisions.get(key).cloned()
    }

    pub fn set_revision(&self, key: &ServiceKey, revision: String) {
        self.inner.lock().revisions.insert(key.clone(), revision);
    }

    /// Drop the cached revision so the next request fetches a full payload
    pub fn forget_revision(&self, key: &ServiceKey) {
        self.inner.lock().revisions.remove(key);
    }
}
