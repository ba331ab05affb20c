//! Rate-limit and circuit-breaker rule sets
//!
//! These are fetched and handed to the caller as-is; the decision
//! algorithms that consume them live outside this workspace.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::routing::MetaLabel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitAmount {
    #[serde(rename = "maxAmount")]
    pub max_amount: u32,
    /// Window length as sent by the control plane, e.g. `"1s"`
    #[serde(rename = "validDuration")]
    pub valid_duration: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(rename = "type", default)]
    pub limit_type: String,
    #[serde(default)]
    pub labels: HashMap<String, MetaLabel>,
    #[serde(default)]
    pub amounts: Vec<RateLimitAmount>,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub ctime: String,
    #[serde(default)]
    pub mtime: String,
    #[serde(default)]
    pub revision: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
    #[serde(default)]
    pub revision: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSource {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, MetaLabel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerDestination {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, MetaLabel>,
    #[serde(rename = "metricWindow", default)]
    pub metric_window: String,
    #[serde(rename = "metricPrecision", default)]
    pub metric_precision: u32,
    #[serde(rename = "updateInterval", default)]
    pub update_interval: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerRule {
    #[serde(default)]
    pub sources: Vec<CircuitBreakerSource>,
    #[serde(default)]
    pub destinations: Vec<CircuitBreakerDestination>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub service_namespace: String,
    #[serde(default)]
    pub inbounds: Vec<CircuitBreakerRule>,
    #[serde(default)]
    pub outbounds: Vec<CircuitBreakerRule>,
    #[serde(default)]
    pub revision: String,
}
