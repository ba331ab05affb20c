//! Request and response bodies exchanged with the control plane

pub mod discover;
pub mod register;

pub use discover::{DiscoverKind, DiscoverRequest, DiscoverResponse, ServiceInfo, ServiceRevision};
pub use register::{AckResponse, InstanceRequest, RegisterRequest};
