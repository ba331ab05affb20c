use std::{path::Path, time::Duration};

use lodestar_discovery::DiscoveryConfig;
use lodestar_routing::{
    DstMetaConfig, NearbyConfig, PolicyConfig,
    config::{NEARBY_ROUTER, RULE_BASED_ROUTER, default_max_fails, default_recovery_window_ms},
};
use lodestar_types::{Error, Result};
use serde::{Deserialize, Serialize};

pub const WEIGHTED_RANDOM: &str = "weightedRandom";

/// Agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LodestarConfig {
    /// Control plane connection settings
    #[serde(default)]
    pub global: DiscoveryConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings used when calling other services
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub local_cache: LocalCacheConfig,

    #[serde(default)]
    pub service_router: ServiceRouterConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    /// Interval between watch refreshes (in milliseconds)
    #[serde(default = "default_service_refresh_interval_ms")]
    pub service_refresh_interval_ms: u64,

    /// How long an unwatched policy is kept for a later watch (in milliseconds)
    #[serde(default = "default_service_expire_time_ms")]
    pub service_expire_time_ms: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            service_refresh_interval_ms: default_service_refresh_interval_ms(),
            service_expire_time_ms: default_service_expire_time_ms(),
        }
    }
}

impl LocalCacheConfig {
    pub fn service_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.service_refresh_interval_ms)
    }

    pub fn service_expire_time(&self) -> Duration {
        Duration::from_millis(self.service_expire_time_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRouterConfig {
    /// Routers applied on every selection, in order
    #[serde(default = "default_chain")]
    pub chain: Vec<String>,

    #[serde(default)]
    pub nearby: NearbyConfig,

    #[serde(default)]
    pub dst_meta: DstMetaConfig,
}

impl Default for ServiceRouterConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            nearby: NearbyConfig::default(),
            dst_meta: DstMetaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(rename = "type", default = "default_load_balancer")]
    pub kind: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self { kind: default_load_balancer() }
    }
}

/// Per-endpoint failure tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures after which an endpoint is skipped
    #[serde(default = "default_max_fails")]
    pub continuous_error_threshold: u32,

    /// How long a failing endpoint is skipped (in milliseconds)
    #[serde(default = "default_recovery_window_ms")]
    pub sleep_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            continuous_error_threshold: default_max_fails(),
            sleep_window_ms: default_recovery_window_ms(),
        }
    }
}

/// Settings used when hosting a service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// "local" or "global"
    #[serde(default = "default_rate_limit_mode")]
    pub mode: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { mode: default_rate_limit_mode() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of compact text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), json: false }
    }
}

fn default_service_refresh_interval_ms() -> u64 {
    2000
}

fn default_service_expire_time_ms() -> u64 {
    86_400_000 // 24 hours
}

fn default_chain() -> Vec<String> {
    vec![RULE_BASED_ROUTER.to_string(), NEARBY_ROUTER.to_string()]
}

fn default_load_balancer() -> String {
    WEIGHTED_RANDOM.to_string()
}

fn default_rate_limit_mode() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LodestarConfig {
    /// Load configuration from a file and environment variables
    ///
    /// Environment variables use the `LODESTAR` prefix with `__` between
    /// nesting levels, e.g. `LODESTAR__CONSUMER__LOCAL_CACHE__SERVICE_REFRESH_INTERVAL_MS`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("LODESTAR").separator("__").try_parsing(true),
            );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))
    }

    /// Load configuration, falling back to defaults when loading fails
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => {
                tracing::info!("Configuration loaded successfully from {:?}", path.as_ref());
                config
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = ?path.as_ref(),
                    "Failed to load configuration file, using defaults"
                );
                Self::default()
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.global.validate()?;
        self.policy_config()?;

        if self.consumer.local_cache.service_refresh_interval_ms == 0 {
            return Err(Error::Config(
                "consumer.local_cache.service_refresh_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.consumer.local_cache.service_expire_time_ms == 0 {
            return Err(Error::Config(
                "consumer.local_cache.service_expire_time_ms must be greater than 0".to_string(),
            ));
        }

        if self.consumer.load_balancer.kind != WEIGHTED_RANDOM {
            return Err(Error::Config(format!(
                "Unsupported load balancer '{}', only '{}' is available",
                self.consumer.load_balancer.kind, WEIGHTED_RANDOM
            )));
        }

        if self.consumer.circuit_breaker.sleep_window_ms == 0 {
            return Err(Error::Config(
                "consumer.circuit_breaker.sleep_window_ms must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.provider.rate_limit.mode.as_str(), "local" | "global") {
            return Err(Error::Config(format!(
                "Invalid provider.rate_limit.mode '{}', expected 'local' or 'global'",
                self.provider.rate_limit.mode
            )));
        }

        Ok(())
    }

    /// Routing settings handed to every policy the manager creates
    pub fn policy_config(&self) -> Result<PolicyConfig> {
        let router = &self.consumer.service_router;
        let mut policy = PolicyConfig::from_chain(&router.chain)?;
        policy.nearby_config = router.nearby.clone();
        policy.dst_meta_config = router.dst_meta.clone();
        policy.location = self.global.api.location.clone();
        policy.max_fails = self.consumer.circuit_breaker.continuous_error_threshold;
        policy.recovery_window = Duration::from_millis(self.consumer.circuit_breaker.sleep_window_ms);
        policy.validate()?;
        Ok(policy)
    }
}
