//! Metrics for discovery, watch and registration activity
//!
//! Recorded through the `metrics` facade; they are no-ops until the host
//! process installs a recorder.

use std::sync::Once;

use metrics::{counter, describe_counter, describe_gauge, gauge};

static METRICS_INIT: Once = Once::new();

/// Register metric names and descriptions
///
/// This should be called once during application startup.
pub fn init() {
    METRICS_INIT.call_once(|| {
        describe_counter!(
            "lodestar_discovery_operations_total",
            "Total number of discovery protocol operations"
        );
        describe_counter!(
            "lodestar_transport_retries_total",
            "Total number of control plane requests retried after a transport error"
        );
        describe_counter!(
            "lodestar_cluster_bootstraps_total",
            "Total number of control plane cluster bootstraps"
        );
        describe_counter!("lodestar_watch_refreshes_total", "Total number of watch refresh cycles");
        describe_counter!("lodestar_heartbeats_total", "Total number of heartbeats sent");

        describe_gauge!(
            "lodestar_cluster_addresses",
            "Number of resolved control plane addresses per cluster"
        );
        describe_gauge!("lodestar_watched_services", "Number of currently watched services");
        describe_gauge!("lodestar_registered_instances", "Number of currently registered instances");
    });
}

/// Record a completed discovery operation
///
/// # Arguments
///
/// * `operation` - Operation name (discover, register, heartbeat, ...)
/// * `success` - Whether the operation succeeded
pub fn record_operation(operation: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("lodestar_discovery_operations_total", "operation" => operation.to_string(), "status" => status)
        .increment(1);
}

/// Record a transport-level retry
pub fn record_retry(operation: &str) {
    counter!("lodestar_transport_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a cluster bootstrap attempt
pub fn record_bootstrap(cluster: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("lodestar_cluster_bootstraps_total", "cluster" => cluster.to_string(), "status" => status)
        .increment(1);
}

/// Set the number of resolved addresses of a cluster
pub fn set_cluster_addresses(cluster: &str, count: usize) {
    gauge!("lodestar_cluster_addresses", "cluster" => cluster.to_string()).set(count as f64);
}

/// Record a periodic watch refresh
pub fn record_refresh(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("lodestar_watch_refreshes_total", "status" => status).increment(1);
}

/// Record a heartbeat
pub fn record_heartbeat(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("lodestar_heartbeats_total", "status" => status).increment(1);
}

/// Set the number of watched services
pub fn set_watched_services(count: usize) {
    gauge!("lodestar_watched_services").set(count as f64);
}

/// Set the number of registered instances
pub fn set_registered_instances(count: usize) {
    gauge!("lodestar_registered_instances").set(count as f64);
}
