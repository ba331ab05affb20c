use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entities::{HealthCheck, Instance, Location, ServiceKey};

/// Body of a `/v1/RegisterInstance` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterRequest {
    pub service: String,
    pub namespace: String,
    pub host: String,
    pub port: u16,
    pub enable_health_check: bool,
    pub healthy: bool,
    pub isolate: bool,
    pub weight: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub logic_set: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl RegisterRequest {
    pub fn new(key: &ServiceKey, token: &str, instance: &Instance) -> Self {
        let health_check = instance.enable_health_check.then(|| {
            instance.health_check.clone().unwrap_or_else(|| {
                HealthCheck::heartbeat(crate::entities::instance::DEFAULT_HEARTBEAT_TTL)
            })
        });

        Self {
            service: key.name.clone(),
            namespace: key.namespace.clone(),
            host: instance.host.clone(),
            port: instance.port,
            enable_health_check: instance.enable_health_check,
            healthy: instance.healthy,
            isolate: instance.isolate,
            weight: instance.weight,
            service_token: token.to_string(),
            protocol: instance.protocol.clone(),
            version: instance.version.clone(),
            health_check,
            location: (!instance.location.is_empty()).then(|| instance.location.clone()),
            logic_set: instance.logic_set.clone(),
            metadata: instance.metadata.clone(),
        }
    }
}

/// Body of `/v1/DeregisterInstance` and `/v1/Heartbeat` requests
///
/// Carries the instance id when the caller knows it, otherwise the
/// service/namespace/host/port tuple that identifies the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_token: String,
}

impl InstanceRequest {
    pub fn new(key: &ServiceKey, token: &str, instance: &Instance) -> Self {
        if instance.id.is_empty() {
            Self {
                id: None,
                service: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                host: Some(instance.host.clone()),
                port: Some(instance.port),
                service_token: token.to_string(),
            }
        } else {
            Self {
                id: Some(instance.id.clone()),
                service: None,
                namespace: None,
                host: None,
                port: None,
                service_token: token.to_string(),
            }
        }
    }
}

/// Response body of register, deregister and heartbeat calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AckResponse {
    pub code: u32,
    #[serde(default)]
    pub info: String,
}
