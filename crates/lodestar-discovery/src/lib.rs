//! # Lodestar Discovery
//!
//! Client side of the control plane discovery protocol.
//!
//! Every request goes through a [`DiscoveryTask`], which resolves the control
//! plane address pools from the seed addresses when needed, dispatches the
//! operation with bounded retries on transport errors and, for instance
//! fetches, chains a routing rule fetch before completing.

pub mod client;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod task;
pub mod transport;

pub use client::DiscoveryClient;
pub use cluster::{ClusterKind, ClusterState};
pub use codec::Fetched;
pub use config::{ApiConfig, DiscoveryConfig, MetaServiceConfig, ServerConnectorConfig, SystemConfig};
pub use task::{DiscoverResult, DiscoveryTask, Operation, TaskOutput};
pub use transport::{HttpTransport, Transport};
