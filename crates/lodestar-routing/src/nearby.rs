//! Location-aware candidate filtering

use std::sync::Arc;

use lodestar_types::{Error, Location, Result};
use tracing::debug;

use crate::{
    config::{MatchLevel, NearbyConfig},
    endpoint::Endpoint,
};

fn same_location(level: MatchLevel, local: &Location, remote: &Location) -> bool {
    match level {
        MatchLevel::Campus => {
            remote.region == local.region && remote.zone == local.zone && remote.campus == local.campus
        },
        MatchLevel::Zone => remote.region == local.region && remote.zone == local.zone,
        MatchLevel::Region => remote.region == local.region,
        MatchLevel::None => true,
    }
}

fn unhealthy_percent(endpoints: &[Arc<Endpoint>]) -> u32 {
    if endpoints.is_empty() {
        return 0;
    }
    let unhealthy = endpoints.iter().filter(|e| !e.is_available()).count();
    (unhealthy * 100 / endpoints.len()) as u32
}

/// Keep the candidates closest to `local`
///
/// Levels are walked from `match_level` out to `max_match_level`. A level is
/// skipped when it has no endpoint, or when its unhealthy share reaches the
/// degrade threshold. A location-less process keeps every candidate.
///
/// # Errors
///
/// Returns `Error::NoMatchedInstance` when `strict_nearby` is set and the
/// first level is empty, or when no allowed level has any endpoint.
pub fn filter(
    candidates: Vec<Arc<Endpoint>>,
    local: &Location,
    config: &NearbyConfig,
) -> Result<Vec<Arc<Endpoint>>> {
    if local.is_empty() || config.match_level == MatchLevel::None {
        return Ok(candidates);
    }

    let mut degraded: Option<Vec<Arc<Endpoint>>> = None;

    for level in MatchLevel::ALL
        .into_iter()
        .filter(|level| *level >= config.match_level && *level <= config.max_match_level)
    {
        let matched: Vec<Arc<Endpoint>> = candidates
            .iter()
            .filter(|e| same_location(level, local, e.location()))
            .cloned()
            .collect();

        if matched.is_empty() {
            if config.strict_nearby {
                return Err(Error::NoMatchedInstance(format!(
                    "no endpoint in the same {:?} as the local process",
                    level
                )));
            }
            continue;
        }

        let unhealthy = unhealthy_percent(&matched);
        if config.enable_degrade_by_unhealthy_percent
            && unhealthy > 0
            && unhealthy >= config.unhealthy_percent_to_degrade
        {
            debug!(level = ?level, unhealthy_percent = unhealthy, "Degrading nearby match level");
            degraded = Some(matched);
            continue;
        }

        return Ok(matched);
    }

    if config.enable_recover_all && !candidates.is_empty() {
        return Ok(candidates);
    }

    degraded.ok_or_else(|| {
        Error::NoMatchedInstance(format!(
            "no endpoint within {:?} of the local process",
            config.max_match_level
        ))
    })
}
