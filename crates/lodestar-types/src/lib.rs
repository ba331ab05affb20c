//! # Lodestar Types
//!
//! Shared type definitions for the lodestar discovery agent.
//!
//! Every other crate in the workspace builds on these types, so they are
//! kept free of runtime dependencies.

// ============================================================================
// Error Types
// ============================================================================

pub mod error;

pub use error::{Error, Result, TransportErrorKind, codes};

// ============================================================================
// Data Model
// ============================================================================

pub mod entities;

pub use entities::{
    CircuitBreaker, DestinationBound, HealthCheck, HealthCheckKind, Instance, Location, MetaLabel,
    RateLimit, RateLimitRule, Routing, RoutingBound, ServiceKey, SourceBound,
};

// ============================================================================
// Wire Types
// ============================================================================

pub mod dto;
