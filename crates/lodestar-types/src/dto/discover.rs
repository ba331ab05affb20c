use serde::{Deserialize, Serialize, Serializer};

use crate::entities::{CircuitBreaker, Instance, RateLimit, Routing, ServiceKey};

/// Resource requested from the discover endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoverKind {
    Instance,
    Cluster,
    Routing,
    RateLimit,
    CircuitBreaker,
}

impl DiscoverKind {
    /// Integer code used on the wire
    pub fn code(self) -> i32 {
        match self {
            DiscoverKind::Instance => 1,
            DiscoverKind::Cluster => 2,
            DiscoverKind::Routing => 3,
            DiscoverKind::RateLimit => 4,
            DiscoverKind::CircuitBreaker => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiscoverKind::Instance => "instance",
            DiscoverKind::Cluster => "cluster",
            DiscoverKind::Routing => "routing",
            DiscoverKind::RateLimit => "ratelimit",
            DiscoverKind::CircuitBreaker => "circuitbreaker",
        }
    }
}

impl Serialize for DiscoverKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRevision {
    pub name: String,
    pub namespace: String,
    pub revision: String,
}

/// Body of a `/v1/Discover` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoverRequest {
    #[serde(rename = "type")]
    pub kind: DiscoverKind,
    pub service: ServiceRevision,
}

impl DiscoverRequest {
    pub fn new(kind: DiscoverKind, key: &ServiceKey, revision: impl Into<String>) -> Self {
        Self {
            kind,
            service: ServiceRevision {
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                revision: revision.into(),
            },
        }
    }
}

/// Service header echoed back in every discover response
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServiceInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub revision: String,
}

/// Body of a `/v1/Discover` response, whatever the requested kind
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoverResponse {
    pub code: u32,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub service: Option<ServiceInfo>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub routing: Option<Routing>,
    #[serde(rename = "rateLimit", alias = "ratelimit", default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(rename = "circuitBreaker", default)]
    pub circuit_breaker: Option<CircuitBreaker>,
}

impl DiscoverResponse {
    /// Revision from the service header, empty if absent
    pub fn service_revision(&self) -> &str {
        self.service.as_ref().map(|s| s.revision.as_str()).unwrap_or_default()
    }
}
