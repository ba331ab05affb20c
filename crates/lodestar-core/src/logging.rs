//! Log output for processes embedding the agent

use lodestar_types::{Error, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Crates whose events a bare level applies to
const LODESTAR_TARGETS: [&str; 4] = ["lodestar_types", "lodestar_discovery", "lodestar_routing", "lodestar_core"];

/// Level for every other target when only a bare level is configured
const DEPENDENCY_LEVEL: &str = "warn";

/// Expand the configured level into filter directives
///
/// A bare level (`debug`) applies to the lodestar crates only and keeps
/// dependencies at `warn`. Anything containing a target or several
/// directives (`lodestar_core=trace,reqwest=debug`) is used verbatim.
fn directives(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }

    let mut directives = vec![DEPENDENCY_LEVEL.to_string()];
    directives.extend(LODESTAR_TARGETS.iter().map(|target| format!("{}={}", target, level)));
    directives.join(",")
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides `config.level` when set.
///
/// # Errors
///
/// Returns `Error::Config` if the level is not a valid filter or a global
/// subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use lodestar_core::{LoggingConfig, logging};
///
/// let config = LoggingConfig { level: "debug".to_string(), json: true };
/// logging::init(&config)?;
/// # Ok::<(), lodestar_types::Error>(())
/// ```
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(&config.level))
            .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", config.level, e)))?,
    };

    let json_layer = config.json.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
    });
    let text_layer = (!config.json).then(|| fmt::layer().compact().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Logging already initialized: {}", e)))
}
