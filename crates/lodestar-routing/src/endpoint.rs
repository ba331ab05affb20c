//! Routable endpoints with failure tracking

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use lodestar_types::{Instance, Location};
use parking_lot::Mutex;

/// One instance of the routed service
///
/// Endpoints are handed out as `Arc<Endpoint>`; a caller holding one keeps
/// it valid after the policy has swapped in a new endpoint set.
#[derive(Debug)]
pub struct Endpoint {
    instance: Instance,
    max_fails: u32,
    recovery_window: Duration,
    /// Consecutive failure count
    failures: AtomicU32,
    /// Last failure time
    last_failure: Mutex<Option<Instant>>,
}

impl Endpoint {
    pub fn new(instance: Instance, max_fails: u32, recovery_window: Duration) -> Self {
        Self {
            instance,
            max_fails,
            recovery_window,
            failures: AtomicU32::new(0),
            last_failure: Mutex::new(None),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// `host:port`
    pub fn address(&self) -> String {
        self.instance.address()
    }

    pub fn host(&self) -> &str {
        &self.instance.host
    }

    pub fn port(&self) -> u16 {
        self.instance.port
    }

    pub fn namespace(&self) -> &str {
        &self.instance.namespace
    }

    pub fn weight(&self) -> u32 {
        self.instance.weight
    }

    pub fn priority(&self) -> u32 {
        self.instance.priority
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.instance.metadata
    }

    pub fn location(&self) -> &Location {
        &self.instance.location
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Whether the failure count has reached the threshold
    pub fn is_fused(&self) -> bool {
        self.failures() >= self.max_fails
    }

    /// Whether the endpoint should receive traffic
    ///
    /// The control plane must report it healthy and not isolated. A fused
    /// endpoint becomes available again once the recovery window has passed
    /// since its last failure (half-open).
    pub fn is_available(&self) -> bool {
        if !self.instance.healthy || self.instance.isolate {
            return false;
        }

        if !self.is_fused() {
            return true;
        }

        match *self.last_failure.lock() {
            Some(at) => at.elapsed() >= self.recovery_window,
            None => true,
        }
    }

    /// Whether the control plane status alone allows traffic
    pub(crate) fn counts_as_available(&self) -> bool {
        self.instance.healthy && !self.instance.isolate && !self.is_fused()
    }

    /// Record a successful request
    ///
    /// Returns true if the endpoint recovered from a fused state.
    pub fn record_success(&self) -> bool {
        let previous = self.failures.swap(0, Ordering::AcqRel);
        previous >= self.max_fails
    }

    /// Record a failed request
    ///
    /// Returns true if this failure fused the endpoint.
    pub fn record_failure(&self) -> bool {
        *self.last_failure.lock() = Some(Instant::now());
        let current = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        current == self.max_fails
    }

    /// Take over the failure state of the endpoint this one replaces
    pub(crate) fn inherit_health(&self, previous: &Endpoint) {
        self.failures.store(previous.failures(), Ordering::Release);
        *self.last_failure.lock() = *previous.last_failure.lock();
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (failures: {})", self.address(), self.failures())
    }
}
