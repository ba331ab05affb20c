//! Router chain and selection settings

use std::time::Duration;

use lodestar_types::{Error, Location, Result};
use serde::{Deserialize, Serialize};

pub const RULE_BASED_ROUTER: &str = "ruleBasedRouter";
pub const DST_META_ROUTER: &str = "dstMetaRouter";
pub const NEARBY_ROUTER: &str = "nearbyBasedRouter";

/// What the metadata router returns when no endpoint carries the requested metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverType {
    /// Fail the selection
    #[default]
    #[serde(rename = "none")]
    None,
    /// Fall back to every endpoint
    #[serde(rename = "all")]
    All,
    /// Fall back to endpoints carrying none of the requested keys
    #[serde(rename = "notKey")]
    NotKey,
}

/// Location granularity, narrowest first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchLevel {
    Campus,
    #[default]
    Zone,
    Region,
    /// Any location
    None,
}

impl MatchLevel {
    pub const ALL: [MatchLevel; 4] =
        [MatchLevel::Campus, MatchLevel::Zone, MatchLevel::Region, MatchLevel::None];
}

/// Nearby router settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearbyConfig {
    /// Level tried first
    #[serde(default)]
    pub match_level: MatchLevel,

    /// Widest level the router may degrade to
    #[serde(default = "default_max_match_level")]
    pub max_match_level: MatchLevel,

    #[serde(default = "default_true")]
    pub enable_degrade_by_unhealthy_percent: bool,

    /// Unhealthy share (in percent) at which a level is skipped
    #[serde(default = "default_unhealthy_percent")]
    pub unhealthy_percent_to_degrade: u32,

    /// Use every candidate when even the widest level is fully unhealthy
    #[serde(default = "default_true")]
    pub enable_recover_all: bool,

    /// Fail instead of widening when a level has no endpoint
    #[serde(default)]
    pub strict_nearby: bool,
}

impl Default for NearbyConfig {
    fn default() -> Self {
        Self {
            match_level: MatchLevel::default(),
            max_match_level: default_max_match_level(),
            enable_degrade_by_unhealthy_percent: true,
            unhealthy_percent_to_degrade: default_unhealthy_percent(),
            enable_recover_all: true,
            strict_nearby: false,
        }
    }
}

/// Metadata router settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DstMetaConfig {
    #[serde(default)]
    pub failover_type: FailoverType,
}

/// Settings of one [`RoutingPolicy`](crate::RoutingPolicy)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Match callers against inbound/outbound rule tables
    pub rule_based: bool,
    /// Match request metadata directly against endpoint metadata
    pub dst_meta: bool,
    /// Prefer endpoints close to `location`
    pub nearby: bool,
    pub dst_meta_config: DstMetaConfig,
    pub nearby_config: NearbyConfig,
    /// Location of this process
    pub location: Location,
    /// Consecutive failures after which an endpoint is skipped
    pub max_fails: u32,
    /// How long a failing endpoint is skipped before it is tried again
    pub recovery_window: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rule_based: true,
            dst_meta: false,
            nearby: true,
            dst_meta_config: DstMetaConfig::default(),
            nearby_config: NearbyConfig::default(),
            location: Location::default(),
            max_fails: default_max_fails(),
            recovery_window: Duration::from_millis(default_recovery_window_ms()),
        }
    }
}

impl PolicyConfig {
    /// Build a configuration from a router chain such as `["ruleBasedRouter", "nearbyBasedRouter"]`
    pub fn from_chain(chain: &[String]) -> Result<Self> {
        let mut config =
            Self { rule_based: false, dst_meta: false, nearby: false, ..Default::default() };

        for router in chain {
            match router.as_str() {
                RULE_BASED_ROUTER => config.rule_based = true,
                DST_META_ROUTER => config.dst_meta = true,
                NEARBY_ROUTER => config.nearby = true,
                other => {
                    return Err(Error::Config(format!("Unknown router '{}' in router chain", other)));
                },
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Switch to the metadata router
    pub fn with_dst_meta(mut self, failover_type: FailoverType) -> Self {
        self.rule_based = false;
        self.dst_meta = true;
        self.dst_meta_config.failover_type = failover_type;
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rule_based && self.dst_meta {
            return Err(Error::Config(format!(
                "{} and {} cannot be enabled together",
                RULE_BASED_ROUTER, DST_META_ROUTER
            )));
        }

        if self.max_fails == 0 {
            return Err(Error::Config("continuous_error_threshold must be greater than 0".to_string()));
        }

        if self.nearby_config.max_match_level < self.nearby_config.match_level {
            return Err(Error::Config(
                "nearby.max_match_level must not be narrower than nearby.match_level".to_string(),
            ));
        }

        if self.nearby_config.unhealthy_percent_to_degrade > 100 {
            return Err(Error::Config(
                "nearby.unhealthy_percent_to_degrade must be between 0 and 100".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_match_level() -> MatchLevel {
    MatchLevel::None
}

fn default_unhealthy_percent() -> u32 {
    100
}

pub fn default_max_fails() -> u32 {
    5
}

pub fn default_recovery_window_ms() -> u64 {
    30_000
}
