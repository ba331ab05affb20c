//! Discovery client facade
//!
//! Owns the shared cluster state and transport, and turns each API call into
//! a [`DiscoveryTask`].

use std::sync::Arc;

use lodestar_types::{CircuitBreaker, Error, Instance, RateLimit, Result, ServiceKey};

use crate::{
    cluster::ClusterState,
    codec::Fetched,
    config::DiscoveryConfig,
    metrics,
    task::{DiscoverResult, DiscoveryTask, Operation, TaskOutput},
    transport::{HttpTransport, Transport},
};

#[derive(Debug)]
pub(crate) struct ClientShared {
    pub(crate) config: DiscoveryConfig,
    pub(crate) cluster: Arc<ClusterState>,
    pub(crate) transport: Arc<dyn Transport>,
}

/// Client for the control plane discovery protocol
///
/// Cloning is cheap; clones share the resolved cluster addresses and the
/// revision cache.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    shared: Arc<ClientShared>,
}

impl DiscoveryClient {
    /// Create a client that talks HTTP to the configured seed addresses
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let transport = HttpTransport::new()?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over a custom transport
    pub fn with_transport(config: DiscoveryConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        metrics::init();

        Ok(Self {
            shared: Arc::new(ClientShared {
                config,
                cluster: Arc::new(ClusterState::new()),
                transport,
            }),
        })
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.shared.cluster
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.shared.config
    }

    /// Build a task without running it
    pub fn task(&self, key: &ServiceKey, operation: Operation, retry_max: u32) -> DiscoveryTask {
        DiscoveryTask::new(Arc::clone(&self.shared), key.clone(), operation, retry_max)
    }

    async fn execute(&self, key: &ServiceKey, operation: Operation, retry_max: u32) -> Result<TaskOutput> {
        let name = operation.name();
        let result = self.task(key, operation, retry_max).run().await;
        metrics::record_operation(name, result.is_ok());
        result
    }

    /// Fetch the instances and routing rules of a service
    ///
    /// The instance revision comes from the client's revision cache;
    /// `routing_revision` is whatever the caller last applied.
    pub async fn discover(
        &self,
        key: &ServiceKey,
        routing_revision: &str,
        retry_max: u32,
    ) -> Result<DiscoverResult> {
        let operation = Operation::Discover { routing_revision: routing_revision.to_string() };
        match self.execute(key, operation, retry_max).await? {
            TaskOutput::Discover(result) => Ok(result),
            other => Err(unexpected("discover", &other)),
        }
    }

    pub async fn register(
        &self,
        key: &ServiceKey,
        token: &str,
        instance: &Instance,
        retry_max: u32,
    ) -> Result<()> {
        let operation = Operation::Register { token: token.to_string(), instance: instance.clone() };
        self.expect_ack("register", self.execute(key, operation, retry_max).await?)
    }

    pub async fn deregister(
        &self,
        key: &ServiceKey,
        token: &str,
        instance: &Instance,
        retry_max: u32,
    ) -> Result<()> {
        let operation = Operation::Deregister { token: token.to_string(), instance: instance.clone() };
        self.expect_ack("deregister", self.execute(key, operation, retry_max).await?)
    }

    pub async fn heartbeat(
        &self,
        key: &ServiceKey,
        token: &str,
        instance: &Instance,
        retry_max: u32,
    ) -> Result<()> {
        let operation = Operation::Heartbeat { token: token.to_string(), instance: instance.clone() };
        self.expect_ack("heartbeat", self.execute(key, operation, retry_max).await?)
    }

    pub async fn fetch_rate_limit(
        &self,
        key: &ServiceKey,
        revision: &str,
        retry_max: u32,
    ) -> Result<Fetched<RateLimit>> {
        let operation = Operation::RateLimit { revision: revision.to_string() };
        match self.execute(key, operation, retry_max).await? {
            TaskOutput::RateLimit(fetched) => Ok(fetched),
            other => Err(unexpected("ratelimit", &other)),
        }
    }

    pub async fn fetch_circuit_breaker(
        &self,
        key: &ServiceKey,
        revision: &str,
        retry_max: u32,
    ) -> Result<Fetched<CircuitBreaker>> {
        let operation = Operation::CircuitBreaker { revision: revision.to_string() };
        match self.execute(key, operation, retry_max).await? {
            TaskOutput::CircuitBreaker(fetched) => Ok(fetched),
            other => Err(unexpected("circuitbreaker", &other)),
        }
    }

    fn expect_ack(&self, operation: &str, output: TaskOutput) -> Result<()> {
        match output {
            TaskOutput::Ack => Ok(()),
            other => Err(unexpected(operation, &other)),
        }
    }
}

fn unexpected(operation: &str, output: &TaskOutput) -> Error {
    Error::Other(anyhow::anyhow!("{} finished with unexpected output: {:?}", operation, output))
}
