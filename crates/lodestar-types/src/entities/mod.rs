pub mod instance;
pub mod routing;
pub mod rules;
pub mod service_key;

pub use instance::{HealthCheck, HealthCheckKind, Instance, Location};
pub use routing::{DestinationBound, MetaLabel, Routing, RoutingBound, SourceBound};
pub use rules::{CircuitBreaker, RateLimit, RateLimitRule};
pub use service_key::ServiceKey;
