//! # Lodestar Routing
//!
//! Routing policy engine: per-service endpoint sets and rule tables, and the
//! selection algorithm that maps a caller and its request metadata to one
//! endpoint.

pub mod config;
pub mod endpoint;
pub mod nearby;
pub mod policy;
pub mod registry;
pub mod request;

pub use config::{DstMetaConfig, FailoverType, MatchLevel, NearbyConfig, PolicyConfig};
pub use endpoint::Endpoint;
pub use policy::RoutingPolicy;
pub use registry::PolicyRegistry;
pub use request::{Caller, RouteRequest};
