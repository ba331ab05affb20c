//! # Lodestar Core
//!
//! Watch and registration lifecycle manager, layered configuration and
//! logging setup for the lodestar agent.

// Re-export shared types
pub use lodestar_types::{Error, Instance, Result, ServiceKey};

pub mod config;
pub mod logging;
pub mod manager;
pub mod register;
pub mod watch;

pub use config::{
    CircuitBreakerConfig, ConsumerConfig, LoadBalancerConfig, LocalCacheConfig, LodestarConfig,
    LoggingConfig, ProviderConfig, RateLimitConfig, ServiceRouterConfig,
};
pub use manager::Manager;
pub use register::RegisterStatus;
pub use watch::WatchStatus;
