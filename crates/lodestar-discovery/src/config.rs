//! Configuration types for the discovery client

use std::time::Duration;

use lodestar_types::{Error, Location, Result, ServiceKey};
use serde::{Deserialize, Serialize};

/// Control plane seed addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConnectorConfig {
    /// Seed URLs used to bootstrap the control plane clusters (e.g., "http://127.0.0.1:8090")
    #[serde(default = "default_addresses")]
    pub addresses: Vec<String>,
}

impl Default for ServerConnectorConfig {
    fn default() -> Self {
        Self { addresses: default_addresses() }
    }
}

/// A control plane meta service resolved during bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaServiceConfig {
    #[serde(default = "default_meta_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub service: String,

    /// How long a resolved address list stays valid before it is bootstrapped again
    #[serde(default = "default_meta_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl MetaServiceConfig {
    pub fn new(service: &str) -> Self {
        Self {
            namespace: default_meta_namespace(),
            service: service.to_string(),
            refresh_interval_ms: default_meta_refresh_interval_ms(),
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.service.clone())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Meta services of the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_discover_cluster")]
    pub discover_cluster: MetaServiceConfig,

    #[serde(default = "default_health_check_cluster")]
    pub health_check_cluster: MetaServiceConfig,

    #[serde(default = "default_monitor_cluster")]
    pub monitor_cluster: MetaServiceConfig,

    #[serde(default = "default_metric_cluster")]
    pub metric_cluster: MetaServiceConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            discover_cluster: default_discover_cluster(),
            health_check_cluster: default_health_check_cluster(),
            monitor_cluster: default_monitor_cluster(),
            metric_cluster: default_metric_cluster(),
        }
    }
}

/// Per-request settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Request timeout (in milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries after the first attempt, transport failures only
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// Pause between retries (in milliseconds)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Location of this process, used by nearby routing
    #[serde(default)]
    pub location: Location,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry_max: default_retry_max(),
            retry_interval_ms: default_retry_interval_ms(),
            location: Location::default(),
        }
    }
}

/// Discovery client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub server_connector: ServerConnectorConfig,

    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

impl DiscoveryConfig {
    /// Create a configuration pointing at the given seed addresses
    pub fn with_addresses(addresses: Vec<String>) -> Self {
        Self { server_connector: ServerConnectorConfig { addresses }, ..Default::default() }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.api.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.api.retry_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_connector.addresses.is_empty() {
            return Err(Error::Config(
                "server_connector.addresses must contain at least one seed address".to_string(),
            ));
        }

        for address in &self.server_connector.addresses {
            let parsed = url::Url::parse(address).map_err(|e| {
                Error::Config(format!("Invalid seed address '{}': {}", address, e))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(Error::Config(format!(
                    "Seed address '{}' must start with http:// or https://",
                    address
                )));
            }
        }

        for (name, meta) in [
            ("discover_cluster", &self.system.discover_cluster),
            ("health_check_cluster", &self.system.health_check_cluster),
            ("monitor_cluster", &self.system.monitor_cluster),
            ("metric_cluster", &self.system.metric_cluster),
        ] {
            if meta.service.is_empty() || meta.namespace.is_empty() {
                return Err(Error::Config(format!(
                    "system.{} requires both service and namespace",
                    name
                )));
            }
            if meta.refresh_interval_ms == 0 {
                return Err(Error::Config(format!(
                    "system.{}.refresh_interval_ms must be greater than 0",
                    name
                )));
            }
        }

        if self.api.timeout_ms == 0 {
            return Err(Error::Config("api.timeout_ms must be greater than 0".to_string()));
        }

        if self.api.timeout_ms > 60000 {
            tracing::warn!(
                timeout_ms = self.api.timeout_ms,
                "api.timeout_ms is very high (>60s). Consider using a lower timeout."
            );
        }

        Ok(())
    }
}

fn default_addresses() -> Vec<String> {
    vec!["http://127.0.0.1:8090".to_string()]
}

fn default_meta_namespace() -> String {
    "Polaris".to_string()
}

fn default_meta_refresh_interval_ms() -> u64 {
    6_000_000 // 100 minutes
}

fn default_discover_cluster() -> MetaServiceConfig {
    MetaServiceConfig::new("polaris.discover")
}

fn default_health_check_cluster() -> MetaServiceConfig {
    MetaServiceConfig::new("polaris.healthcheck")
}

fn default_monitor_cluster() -> MetaServiceConfig {
    MetaServiceConfig::new("polaris.monitor")
}

fn default_metric_cluster() -> MetaServiceConfig {
    MetaServiceConfig::new("polaris.metric")
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retry_max() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    1000
}
