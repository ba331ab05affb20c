//! Encoding of requests and classification of control plane responses

use lodestar_types::{
    CircuitBreaker, Error, Instance, RateLimit, Result, Routing, codes,
    dto::{AckResponse, DiscoverResponse},
};
use serde::Serialize;

/// Outcome of a revision-aware fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    /// Full payload with the revision it belongs to
    Modified { revision: String, value: T },
    /// The revision sent with the request is still current
    Unchanged,
}

impl<T> Fetched<T> {
    pub fn is_modified(&self) -> bool {
        matches!(self, Fetched::Modified { .. })
    }

    pub fn revision(&self) -> Option<&str> {
        match self {
            Fetched::Modified { revision, .. } => Some(revision),
            Fetched::Unchanged => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Fetched::Modified { value, .. } => Some(value),
            Fetched::Unchanged => None,
        }
    }
}

pub fn encode<T: Serialize>(request: &T) -> Result<String> {
    serde_json::to_string(request)
        .map_err(|e| Error::Other(anyhow::anyhow!("Failed to encode request: {}", e)))
}

/// Decode a discover response, surfacing non-success codes as application errors
pub fn decode_discover(body: &str) -> Result<DiscoverResponse> {
    let response: DiscoverResponse = serde_json::from_str(body)?;
    if !codes::is_success(response.code) {
        return Err(Error::application(response.code, response.info));
    }
    Ok(response)
}

/// Decode the instance list of a meta service into `http://host:port` addresses
pub fn decode_cluster(body: &str) -> Result<Fetched<Vec<String>>> {
    let response = decode_discover(body)?;
    if response.code == codes::DATA_NO_CHANGE {
        return Ok(Fetched::Unchanged);
    }

    if response.instances.is_empty() {
        return Err(Error::ServerParse("cluster response has no instances".to_string()));
    }

    let addresses: Vec<String> = response
        .instances
        .iter()
        .filter(|instance| instance.protocol == "http")
        .map(|instance| format!("http://{}:{}", instance.host, instance.port))
        .collect();

    if addresses.is_empty() {
        return Err(Error::ServerParse("cluster response has no http instances".to_string()));
    }

    Ok(Fetched::Modified { revision: response.service_revision().to_string(), value: addresses })
}

pub fn decode_instances(body: &str) -> Result<Fetched<Vec<Instance>>> {
    let response = decode_discover(body)?;
    if response.code == codes::DATA_NO_CHANGE {
        return Ok(Fetched::Unchanged);
    }

    let service = response
        .service
        .ok_or_else(|| Error::ServerParse("instances response has no service".to_string()))?;

    Ok(Fetched::Modified { revision: service.revision, value: response.instances })
}

/// A full response without a `routing` object means the service has no rules
pub fn decode_routing(body: &str) -> Result<Fetched<Routing>> {
    let response = decode_discover(body)?;
    if response.code == codes::DATA_NO_CHANGE {
        return Ok(Fetched::Unchanged);
    }

    let routing = response.routing.unwrap_or_default();
    Ok(Fetched::Modified { revision: routing.revision.clone(), value: routing })
}

pub fn decode_rate_limit(body: &str) -> Result<Fetched<RateLimit>> {
    let response = decode_discover(body)?;
    if response.code == codes::DATA_NO_CHANGE {
        return Ok(Fetched::Unchanged);
    }

    let rate_limit = response.rate_limit.unwrap_or_default();
    Ok(Fetched::Modified { revision: rate_limit.revision.clone(), value: rate_limit })
}

pub fn decode_circuit_breaker(body: &str) -> Result<Fetched<CircuitBreaker>> {
    let response = decode_discover(body)?;
    if response.code == codes::DATA_NO_CHANGE {
        return Ok(Fetched::Unchanged);
    }

    let breaker = response.circuit_breaker.unwrap_or_default();
    Ok(Fetched::Modified { revision: breaker.revision.clone(), value: breaker })
}

/// Decode a register, deregister or heartbeat acknowledgement
///
/// "Existing resource" counts as success so that registering twice is idempotent.
pub fn decode_ack(body: &str) -> Result<()> {
    let response: AckResponse = serde_json::from_str(body)?;
    if codes::is_success(response.code) || response.code == codes::EXISTED_RESOURCE {
        return Ok(());
    }
    Err(Error::application(response.code, response.info))
}
