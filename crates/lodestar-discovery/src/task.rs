//! Discovery protocol state machine
//!
//! A [`DiscoveryTask`] drives one logical operation through its network
//! round-trips:
//!
//! - **Bootstrap**: resolve the control plane address pools from the seed
//!   addresses when they are missing or stale
//! - **Dispatch**: send the operation to a random address of its pool
//! - **ChainedFetch**: after an instance fetch, fetch the routing rules; the
//!   new instance revision is recorded only when both fetches succeed
//! - **Done**: hand the merged result back to the caller

use std::{sync::Arc, time::Duration};

use lodestar_types::{
    CircuitBreaker, Error, Instance, RateLimit, Result, Routing, ServiceKey,
    dto::{DiscoverKind, DiscoverRequest, InstanceRequest, RegisterRequest},
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    client::ClientShared,
    cluster::ClusterKind,
    codec::{self, Fetched},
    metrics,
};

pub const DISCOVER_PATH: &str = "/v1/Discover";
pub const REGISTER_PATH: &str = "/v1/RegisterInstance";
pub const DEREGISTER_PATH: &str = "/v1/DeregisterInstance";
pub const HEARTBEAT_PATH: &str = "/v1/Heartbeat";

/// Retry budget for resolving the control plane clusters
pub const BOOTSTRAP_RETRY_MAX: u32 = 2;

/// Revision sent when nothing has been fetched yet
pub const INITIAL_REVISION: &str = "0";

/// An operation the state machine can execute
#[derive(Debug, Clone)]
pub enum Operation {
    /// Fetch instances, then routing rules
    Discover { routing_revision: String },
    Register { token: String, instance: Instance },
    Deregister { token: String, instance: Instance },
    Heartbeat { token: String, instance: Instance },
    RateLimit { revision: String },
    CircuitBreaker { revision: String },
}

impl Operation {
    /// Address pool this operation is sent to
    pub fn cluster(&self) -> ClusterKind {
        match self {
            Operation::Register { .. }
            | Operation::Deregister { .. }
            | Operation::Heartbeat { .. } => ClusterKind::HealthCheck,
            Operation::Discover { .. }
            | Operation::RateLimit { .. }
            | Operation::CircuitBreaker { .. } => ClusterKind::Discover,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Discover { .. } => "discover",
            Operation::Register { .. } => "register",
            Operation::Deregister { .. } => "deregister",
            Operation::Heartbeat { .. } => "heartbeat",
            Operation::RateLimit { .. } => "ratelimit",
            Operation::CircuitBreaker { .. } => "circuitbreaker",
        }
    }
}

/// Instances and routing rules fetched by one discover operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverResult {
    pub instances: Fetched<Vec<Instance>>,
    pub routing: Fetched<Routing>,
}

/// Terminal result of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Discover(DiscoverResult),
    Ack,
    RateLimit(Fetched<RateLimit>),
    CircuitBreaker(Fetched<CircuitBreaker>),
}

#[derive(Debug)]
enum Stage {
    Bootstrap,
    Dispatch,
    ChainedFetch { instances: Fetched<Vec<Instance>> },
    Done(TaskOutput),
}

/// One operation in flight against the control plane
#[derive(Debug)]
pub struct DiscoveryTask {
    shared: Arc<ClientShared>,
    key: ServiceKey,
    operation: Operation,
    retry_max: u32,
    stage: Stage,
}

impl DiscoveryTask {
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        key: ServiceKey,
        operation: Operation,
        retry_max: u32,
    ) -> Self {
        Self { shared, key, operation, retry_max, stage: Stage::Bootstrap }
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Run the task until it reaches a terminal state
    ///
    /// # Errors
    ///
    /// Returns the first error that ends the operation: a transport error once
    /// the retry budget is spent, an application error carrying the response
    /// code, or a server parse error.
    pub async fn run(mut self) -> Result<TaskOutput> {
        loop {
            let stage = std::mem::replace(&mut self.stage, Stage::Bootstrap);
            self.stage = match stage {
                Stage::Bootstrap => self.bootstrap().await?,
                Stage::Dispatch => self.dispatch().await?,
                Stage::ChainedFetch { instances } => self.fetch_routing(instances).await?,
                Stage::Done(output) => return Ok(output),
            };
        }
    }

    /// Resolve one missing pool, then re-enter; dispatch once nothing is missing
    async fn bootstrap(&self) -> Result<Stage> {
        let system = &self.shared.config.system;
        let mut required = vec![(ClusterKind::Discover, &system.discover_cluster)];
        if self.operation.cluster() == ClusterKind::HealthCheck {
            required.push((ClusterKind::HealthCheck, &system.health_check_cluster));
        }

        for (kind, meta) in required {
            if self.shared.cluster.needs_bootstrap(kind, meta.refresh_interval()) {
                let result = self.bootstrap_cluster(kind, &meta.key()).await;
                metrics::record_bootstrap(kind.as_str(), result.is_ok());
                result?;
                return Ok(Stage::Bootstrap);
            }
        }

        Ok(Stage::Dispatch)
    }

    async fn bootstrap_cluster(&self, kind: ClusterKind, meta_key: &ServiceKey) -> Result<()> {
        let cluster = &self.shared.cluster;
        let revision = cluster.revision(meta_key).unwrap_or_else(|| INITIAL_REVISION.to_string());
        let body = codec::encode(&DiscoverRequest::new(DiscoverKind::Instance, meta_key, revision))?;

        let seeds = &self.shared.config.server_connector.addresses;
        let response = self
            .post_with_retry(
                || pick_random(seeds),
                DISCOVER_PATH,
                &body,
                BOOTSTRAP_RETRY_MAX,
            )
            .await?;

        match codec::decode_cluster(&response)? {
            Fetched::Modified { revision, value: addresses } => {
                info!(
                    cluster = %kind,
                    service = %meta_key,
                    count = addresses.len(),
                    "Resolved control plane cluster"
                );
                metrics::set_cluster_addresses(kind.as_str(), addresses.len());
                cluster.replace_addresses(kind, addresses);
                cluster.set_revision(meta_key, revision);
            },
            Fetched::Unchanged => {
                if !cluster.keep_addresses(kind) {
                    return Err(Error::ServerParse(format!(
                        "{} cluster reported unchanged before it was resolved",
                        kind
                    )));
                }
                debug!(cluster = %kind, "Control plane cluster unchanged");
            },
        }

        Ok(())
    }

    async fn dispatch(&self) -> Result<Stage> {
        let key = &self.key;
        let cluster = &self.shared.cluster;

        match &self.operation {
            Operation::Discover { .. } => {
                let revision = cluster.revision(key).unwrap_or_else(|| INITIAL_REVISION.to_string());
                let body = codec::encode(&DiscoverRequest::new(DiscoverKind::Instance, key, revision))?;
                let response = self.send(DISCOVER_PATH, &body).await?;

                let instances = codec::decode_instances(&response)?;
                Ok(Stage::ChainedFetch { instances })
            },
            Operation::Register { token, instance } => {
                let body = codec::encode(&RegisterRequest::new(key, token, instance))?;
                let response = self.send(REGISTER_PATH, &body).await?;
                codec::decode_ack(&response)?;
                Ok(Stage::Done(TaskOutput::Ack))
            },
            Operation::Deregister { token, instance } => {
                let body = codec::encode(&InstanceRequest::new(key, token, instance))?;
                let response = self.send(DEREGISTER_PATH, &body).await?;
                codec::decode_ack(&response)?;
                Ok(Stage::Done(TaskOutput::Ack))
            },
            Operation::Heartbeat { token, instance } => {
                let body = codec::encode(&InstanceRequest::new(key, token, instance))?;
                let response = self.send(HEARTBEAT_PATH, &body).await?;
                codec::decode_ack(&response)?;
                Ok(Stage::Done(TaskOutput::Ack))
            },
            Operation::RateLimit { revision } => {
                let body = codec::encode(&DiscoverRequest::new(DiscoverKind::RateLimit, key, revision.clone()))?;
                let response = self.send(DISCOVER_PATH, &body).await?;
                Ok(Stage::Done(TaskOutput::RateLimit(codec::decode_rate_limit(&response)?)))
            },
            Operation::CircuitBreaker { revision } => {
                let body = codec::encode(&DiscoverRequest::new(
                    DiscoverKind::CircuitBreaker,
                    key,
                    revision.clone(),
                ))?;
                let response = self.send(DISCOVER_PATH, &body).await?;
                Ok(Stage::Done(TaskOutput::CircuitBreaker(codec::decode_circuit_breaker(&response)?)))
            },
        }
    }

    async fn fetch_routing(&self, instances: Fetched<Vec<Instance>>) -> Result<Stage> {
        let routing_revision = match &self.operation {
            Operation::Discover { routing_revision } => routing_revision.clone(),
            _ => INITIAL_REVISION.to_string(),
        };

        let body = codec::encode(&DiscoverRequest::new(DiscoverKind::Routing, &self.key, routing_revision))?;
        let response = self.send(DISCOVER_PATH, &body).await?;
        let routing = codec::decode_routing(&response)?;

        // Recorded only once the caller is certain to receive the instances
        if let Fetched::Modified { revision, .. } = &instances {
            self.shared.cluster.set_revision(&self.key, revision.clone());
        }

        Ok(Stage::Done(TaskOutput::Discover(DiscoverResult { instances, routing })))
    }

    /// Send to the operation's pool with the caller's retry budget
    async fn send(&self, path: &str, body: &str) -> Result<String> {
        let kind = self.operation.cluster();
        let cluster = &self.shared.cluster;
        self.post_with_retry(|| cluster.pick_address(kind), path, body, self.retry_max).await
    }

    /// POST with retries on transport errors, picking a fresh address per attempt
    async fn post_with_retry<F>(
        &self,
        pick: F,
        path: &str,
        body: &str,
        retry_max: u32,
    ) -> Result<String>
    where
        F: Fn() -> Option<String>,
    {
        let timeout = self.shared.config.timeout();
        let retry_interval = self.shared.config.retry_interval();
        let mut attempt: u32 = 0;

        loop {
            let address = pick().ok_or_else(|| {
                Error::NoEndpoints(format!(
                    "no {} address available for {}",
                    self.operation.cluster(),
                    self.operation.name()
                ))
            })?;
            let url = format!("{}{}", address.trim_end_matches('/'), path);

            debug!(
                attempt = attempt + 1,
                url = %url,
                service = %self.key,
                operation = self.operation.name(),
                "Attempting request"
            );

            match self.shared.transport.post(&url, body.to_string(), timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < retry_max => {
                    warn!(
                        attempt = attempt + 1,
                        url = %url,
                        error = %e,
                        operation = self.operation.name(),
                        "Request failed, retrying"
                    );
                    metrics::record_retry(self.operation.name());
                    attempt += 1;
                    if retry_interval > Duration::ZERO {
                        tokio::time::sleep(retry_interval).await;
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

fn pick_random(addresses: &[String]) -> Option<String> {
    if addresses.is_empty() {
        return None;
    }
    let index = rand::rng().random_range(0..addresses.len());
    Some(addresses[index].clone())
}
