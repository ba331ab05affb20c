//! Service instance as reported by, or registered with, the control plane

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const DEFAULT_INSTANCE_PORT: u16 = 80;
pub const DEFAULT_INSTANCE_WEIGHT: u32 = 100;
pub const DEFAULT_HEARTBEAT_TTL: u32 = 5;

fn default_port() -> u16 {
    DEFAULT_INSTANCE_PORT
}

fn default_weight() -> u32 {
    DEFAULT_INSTANCE_WEIGHT
}

fn default_true() -> bool {
    true
}

/// Physical location of an instance, used by nearby routing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub campus: String,
}

impl Location {
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        campus: impl Into<String>,
    ) -> Self {
        Self { region: region.into(), zone: zone.into(), campus: campus.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty() && self.zone.is_empty() && self.campus.is_empty()
    }
}

/// Health check mechanism. Encoded as an integer on the wire; decoding also
/// accepts the enum name since some control plane versions emit strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthCheckKind {
    #[default]
    Heartbeat,
    Unknown,
}

impl Serialize for HealthCheckKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            HealthCheckKind::Heartbeat => serializer.serialize_i32(1),
            HealthCheckKind::Unknown => serializer.serialize_i32(0),
        }
    }
}

impl<'de> Deserialize<'de> for HealthCheckKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(i64),
            Name(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Code(1) => HealthCheckKind::Heartbeat,
            Raw::Name(name) if name.eq_ignore_ascii_case("heartbeat") => {
                HealthCheckKind::Heartbeat
            },
            _ => HealthCheckKind::Unknown,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Seconds the control plane waits for a heartbeat before marking the instance unhealthy
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "type", default)]
    pub kind: HealthCheckKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatSettings>,
}

impl HealthCheck {
    pub fn heartbeat(ttl: u32) -> Self {
        Self { kind: HealthCheckKind::Heartbeat, heartbeat: Some(HeartbeatSettings { ttl }) }
    }

    pub fn ttl(&self) -> u32 {
        self.heartbeat.as_ref().map(|h| h.ttl).unwrap_or(DEFAULT_HEARTBEAT_TTL)
    }
}

/// One network-reachable instance of a service
///
/// Discovery responses decode straight into this type. The same type
/// describes a locally hosted instance passed to `register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub vpc_id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub version: String,
    /// Lower number means higher precedence
    #[serde(default)]
    pub priority: u32,
    /// Zero means "never picked by weighted random, usable as fallback"
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(rename = "enableHealthCheck", default)]
    pub enable_health_check: bool,
    #[serde(rename = "healthCheck", default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default)]
    pub isolate: bool,
    #[serde(default)]
    pub logic_set: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub mtime: String,
    #[serde(default)]
    pub revision: String,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            id: String::new(),
            service: String::new(),
            namespace: String::new(),
            vpc_id: String::new(),
            host: String::new(),
            port: DEFAULT_INSTANCE_PORT,
            protocol: String::new(),
            version: String::new(),
            priority: 0,
            weight: DEFAULT_INSTANCE_WEIGHT,
            enable_health_check: false,
            health_check: None,
            healthy: true,
            isolate: false,
            logic_set: String::new(),
            location: Location::default(),
            metadata: HashMap::new(),
            mtime: String::new(),
            revision: String::new(),
        }
    }
}

impl Instance {
    /// Create an instance with default weight and health
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, ..Default::default() }
    }

    /// `host:port`, the identity of an instance within one service
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Enable heartbeat health checking with the given TTL in seconds
    pub fn with_heartbeat(mut self, ttl: u32) -> Self {
        self.enable_health_check = true;
        self.health_check = Some(HealthCheck::heartbeat(ttl));
        self
    }
}
