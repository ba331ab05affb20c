//! Routing policy for one service
//!
//! A [`RoutingPolicy`] owns the endpoint set of a service and its inbound and
//! outbound rule tables. Selection narrows the endpoint set in stages:
//!
//! 1. **Rules** (or the metadata router): caller identity and request
//!    metadata pick a weighted, prioritized destination subset
//! 2. **Nearby**: prefer endpoints close to this process
//! 3. **Pick**: weighted random among the available endpoints of the lowest
//!    instance priority, or any candidate when none is available

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use lodestar_types::{
    DestinationBound, Error, Instance, Result, Routing, RoutingBound, ServiceKey, SourceBound,
    entities::routing::{MATCH_ALL, labels_match, name_matches},
};
use metrics::counter;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    config::{FailoverType, PolicyConfig},
    endpoint::Endpoint,
    nearby,
    request::RouteRequest,
};

type BoundTable = HashMap<String, Vec<RoutingBound>>;

#[derive(Debug, Default)]
struct EndpointSet {
    endpoints: Vec<Arc<Endpoint>>,
    total_weight: u64,
}

/// Rule tables and endpoint set of one service
#[derive(Debug)]
pub struct RoutingPolicy {
    key: ServiceKey,
    config: PolicyConfig,
    endpoints: RwLock<Arc<EndpointSet>>,
    available_weight: AtomicU64,
    inbound_rules: RwLock<BoundTable>,
    outbound_rules: RwLock<BoundTable>,
}

impl RoutingPolicy {
    pub fn new(key: ServiceKey, config: PolicyConfig) -> Self {
        Self {
            key,
            config,
            endpoints: RwLock::new(Arc::new(EndpointSet::default())),
            available_weight: AtomicU64::new(0),
            inbound_rules: RwLock::new(BoundTable::new()),
            outbound_rules: RwLock::new(BoundTable::new()),
        }
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Replace the endpoint set
    ///
    /// An instance identical to one already present keeps its endpoint. A
    /// changed instance at the same `host:port` gets a new endpoint that
    /// inherits the failure state of the old one.
    pub fn update_instances(&self, instances: Vec<Instance>) {
        let mut current = self.endpoints.write();

        let previous: HashMap<String, &Arc<Endpoint>> =
            current.endpoints.iter().map(|e| (e.address(), e)).collect();

        let mut reused = 0usize;
        let endpoints: Vec<Arc<Endpoint>> = instances
            .into_iter()
            .map(|instance| match previous.get(&instance.address()) {
                Some(existing) if existing.instance() == &instance => {
                    reused += 1;
                    Arc::clone(existing)
                },
                Some(existing) => {
                    let endpoint = self.new_endpoint(instance);
                    endpoint.inherit_health(existing);
                    Arc::new(endpoint)
                },
                None => Arc::new(self.new_endpoint(instance)),
            })
            .collect();

        let total_weight: u64 = endpoints.iter().map(|e| u64::from(e.weight())).sum();
        let available_weight = available_weight_of(&endpoints);

        info!(
            service = %self.key,
            old_count = current.endpoints.len(),
            new_count = endpoints.len(),
            reused,
            total_weight,
            "Updated endpoints"
        );

        *current = Arc::new(EndpointSet { endpoints, total_weight });
        self.available_weight.store(available_weight, Ordering::Release);
    }

    /// Replace inbound rules, per source service name
    pub fn update_inbounds(&self, bounds: Vec<RoutingBound>) {
        let grouped = group_by_source(bounds);
        let mut table = self.inbound_rules.write();
        for (name, bounds) in grouped {
            table.insert(name, bounds);
        }
    }

    /// Replace outbound rules, per source service name
    pub fn update_outbounds(&self, bounds: Vec<RoutingBound>) {
        let grouped = group_by_source(bounds);
        let mut table = self.outbound_rules.write();
        for (name, bounds) in grouped {
            table.insert(name, bounds);
        }
    }

    /// Replace both rule tables with a complete rule set
    pub fn update_routing(&self, routing: &Routing) {
        *self.inbound_rules.write() = group_by_source(routing.inbounds.clone());
        *self.outbound_rules.write() = group_by_source(routing.outbounds.clone());
        debug!(
            service = %self.key,
            revision = %routing.revision,
            inbounds = routing.inbounds.len(),
            outbounds = routing.outbounds.len(),
            "Updated routing rules"
        );
    }

    fn new_endpoint(&self, instance: Instance) -> Endpoint {
        Endpoint::new(instance, self.config.max_fails, self.config.recovery_window)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().endpoints.clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().endpoints.len()
    }

    pub fn total_weight(&self) -> u64 {
        self.endpoints.read().total_weight
    }

    /// Weight of endpoints that are healthy, not isolated and not fused
    pub fn available_weight(&self) -> u64 {
        self.available_weight.load(Ordering::Acquire)
    }

    pub fn inbound_rules(&self, source: &str) -> Option<Vec<RoutingBound>> {
        self.inbound_rules.read().get(source).cloned()
    }

    pub fn outbound_rules(&self, source: &str) -> Option<Vec<RoutingBound>> {
        self.outbound_rules.read().get(source).cloned()
    }

    // ========================================================================
    // Health feedback
    // ========================================================================

    /// Record a successful call to an endpoint
    pub fn record_success(&self, endpoint: &Arc<Endpoint>) {
        if endpoint.record_success() {
            info!(service = %self.key, endpoint = %endpoint.address(), "Endpoint recovered");
            self.refresh_available(endpoint);
        }
    }

    /// Record a failed call to an endpoint
    ///
    /// Returns true if the endpoint was fused by this failure.
    pub fn record_failure(&self, endpoint: &Arc<Endpoint>) -> bool {
        let fused = endpoint.record_failure();
        if fused {
            warn!(
                service = %self.key,
                endpoint = %endpoint.address(),
                failure_count = endpoint.failures(),
                "Endpoint fused after consecutive failures"
            );
            self.refresh_available(endpoint);
        } else {
            debug!(
                service = %self.key,
                endpoint = %endpoint.address(),
                failure_count = endpoint.failures(),
                "Request failed"
            );
        }
        fused
    }

    /// Recompute the available weight from the current endpoint states
    ///
    /// Runs under an upgradable read so recomputations and endpoint set
    /// replacements never interleave, while selection keeps reading.
    fn refresh_available(&self, endpoint: &Arc<Endpoint>) {
        let current = self.endpoints.upgradable_read();
        if !current.endpoints.iter().any(|e| Arc::ptr_eq(e, endpoint)) {
            return;
        }
        self.available_weight.store(available_weight_of(&current.endpoints), Ordering::Release);
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Select one endpoint for a call
    ///
    /// # Errors
    ///
    /// - `Error::NoEndpoints` if the endpoint set is empty
    /// - `Error::NoMatchedInstance` if the metadata router (failover `none`)
    ///   or a strict nearby filter leaves no candidate
    pub fn select(&self, request: &RouteRequest) -> Result<Arc<Endpoint>> {
        let set = Arc::clone(&*self.endpoints.read());

        let result = if set.endpoints.is_empty() {
            Err(Error::NoEndpoints(format!("service {} has no endpoints", self.key)))
        } else {
            self.candidates(&set, request).and_then(|candidates| {
                pick_one(&candidates).ok_or_else(|| {
                    Error::NoMatchedInstance(format!("no candidate endpoint for {}", self.key))
                })
            })
        };

        let status = if result.is_ok() { "success" } else { "error" };
        counter!("lodestar_endpoint_selections_total", "service" => self.key.to_string(), "status" => status)
            .increment(1);

        result
    }

    /// Parse a request fragment and select an endpoint for it
    pub fn select_fragment(&self, fragment: &str) -> Result<Arc<Endpoint>> {
        self.select(&RouteRequest::parse(fragment)?)
    }

    fn candidates(&self, set: &EndpointSet, request: &RouteRequest) -> Result<Vec<Arc<Endpoint>>> {
        let mut candidates = if self.config.dst_meta {
            self.match_dst_meta(set, request)?
        } else if self.config.rule_based {
            self.match_rules(set, request).unwrap_or_else(|| set.endpoints.clone())
        } else {
            set.endpoints.clone()
        };

        if self.config.nearby {
            candidates = nearby::filter(candidates, &self.config.location, &self.config.nearby_config)?;
        }

        Ok(candidates)
    }

    /// Destination bounds of the first rule whose source matches the request
    ///
    /// Looks in the inbound table, then the outbound table, under the caller's
    /// name and then under the wildcard name.
    pub fn matching_destinations(&self, request: &RouteRequest) -> Option<Vec<DestinationBound>> {
        let caller = request.caller_name();
        let lookups = [
            (&self.inbound_rules, caller),
            (&self.outbound_rules, caller),
            (&self.inbound_rules, MATCH_ALL),
            (&self.outbound_rules, MATCH_ALL),
        ];

        for (table, name) in lookups {
            if name.is_empty() {
                continue;
            }
            let table = table.read();
            let Some(bounds) = table.get(name) else {
                continue;
            };
            for bound in bounds {
                if bound.sources.is_empty() || bound.sources.iter().any(|s| source_matches(s, request)) {
                    return Some(bound.destinations.clone());
                }
            }
        }

        None
    }

    fn match_rules(&self, set: &EndpointSet, request: &RouteRequest) -> Option<Vec<Arc<Endpoint>>> {
        let destinations = self.matching_destinations(request)?;

        let mut tiers: BTreeMap<u32, Vec<(u32, Vec<Arc<Endpoint>>)>> = BTreeMap::new();
        for destination in &destinations {
            let subset: Vec<Arc<Endpoint>> = set
                .endpoints
                .iter()
                .filter(|e| destination_matches(destination, e))
                .cloned()
                .collect();
            tiers.entry(destination.priority).or_default().push((destination.weight, subset));
        }

        for (priority, subsets) in tiers {
            let mut matched: Vec<(u32, Vec<Arc<Endpoint>>)> =
                subsets.into_iter().filter(|(_, subset)| !subset.is_empty()).collect();
            if matched.is_empty() {
                continue;
            }

            let index =
                if matched.len() == 1 { 0 } else { weighted_index(matched.iter().map(|(w, _)| *w))? };
            debug!(
                service = %self.key,
                caller = request.caller_name(),
                priority,
                subsets = matched.len(),
                "Matched routing rule"
            );
            return Some(matched.swap_remove(index).1);
        }

        None
    }

    fn match_dst_meta(&self, set: &EndpointSet, request: &RouteRequest) -> Result<Vec<Arc<Endpoint>>> {
        if request.dst_metadata.is_empty() {
            return Ok(set.endpoints.clone());
        }

        let matched: Vec<Arc<Endpoint>> = set
            .endpoints
            .iter()
            .filter(|e| request.dst_metadata.iter().all(|(k, v)| e.metadata().get(k) == Some(v)))
            .cloned()
            .collect();
        if !matched.is_empty() {
            return Ok(matched);
        }

        match self.config.dst_meta_config.failover_type {
            FailoverType::None => Err(Error::NoMatchedInstance(format!(
                "no endpoint of {} carries metadata {:?}",
                self.key, request.dst_metadata
            ))),
            FailoverType::All => Ok(set.endpoints.clone()),
            FailoverType::NotKey => {
                let without: Vec<Arc<Endpoint>> = set
                    .endpoints
                    .iter()
                    .filter(|e| !request.dst_metadata.keys().any(|k| e.metadata().contains_key(k)))
                    .cloned()
                    .collect();
                if without.is_empty() { Ok(set.endpoints.clone()) } else { Ok(without) }
            },
        }
    }
}

fn available_weight_of(endpoints: &[Arc<Endpoint>]) -> u64 {
    endpoints.iter().filter(|e| e.counts_as_available()).map(|e| u64::from(e.weight())).sum()
}

fn group_by_source(bounds: Vec<RoutingBound>) -> BoundTable {
    let mut table = BoundTable::new();
    for bound in bounds {
        let name = bound.source_name().to_string();
        table.entry(name).or_default().push(bound);
    }
    table
}

fn source_matches(source: &SourceBound, request: &RouteRequest) -> bool {
    name_matches(&source.service, request.caller_name())
        && name_matches(&source.namespace, request.caller_namespace())
        && labels_match(&source.metadata, &request.metadata)
}

fn destination_matches(destination: &DestinationBound, endpoint: &Endpoint) -> bool {
    name_matches(&destination.namespace, endpoint.namespace())
        && labels_match(&destination.metadata, endpoint.metadata())
}

/// Weighted random index; uniform when every weight is zero
fn weighted_index<I: IntoIterator<Item = u32>>(weights: I) -> Option<usize> {
    let weights: Vec<u64> = weights.into_iter().map(u64::from).collect();
    if weights.is_empty() {
        return None;
    }

    let mut rng = rand::rng();
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return Some(rng.random_range(0..weights.len()));
    }

    let mut point = rng.random_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        if point < *weight {
            return Some(index);
        }
        point -= weight;
    }
    Some(weights.len() - 1)
}

/// Final pick among the candidates
fn pick_one(candidates: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
    let available: Vec<&Arc<Endpoint>> = candidates.iter().filter(|e| e.is_available()).collect();

    if available.is_empty() {
        if candidates.is_empty() {
            return None;
        }
        // All down still returns something
        warn!(count = candidates.len(), "No available endpoint, picking any candidate");
        let index = rand::rng().random_range(0..candidates.len());
        return Some(Arc::clone(&candidates[index]));
    }

    let top_priority = available.iter().map(|e| e.priority()).min()?;
    let tier: Vec<&Arc<Endpoint>> =
        available.into_iter().filter(|e| e.priority() == top_priority).collect();
    let index = weighted_index(tier.iter().map(|e| e.weight()))?;
    Some(Arc::clone(tier[index]))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn key() -> ServiceKey {
        ServiceKey::new("b_namespace", "b")
    }

    fn grey(port: u16, weight: u32) -> Instance {
        Instance::new("b", port).with_namespace("b_namespace").with_weight(weight).with_metadata("k", "grey")
    }

    fn base(port: u16, weight: u32) -> Instance {
        Instance::new("b", port).with_namespace("b_namespace").with_weight(weight).with_metadata("k", "base")
    }

    fn rule(destinations: Vec<DestinationBound>) -> RoutingBound {
        RoutingBound::new(vec![SourceBound::new("a", "a_namespace")], destinations)
    }

    fn caller_a() -> RouteRequest {
        RouteRequest::new().with_caller("a_namespace", "a")
    }

    #[test]
    fn test_select_empty_set() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        assert!(matches!(policy.select(&RouteRequest::new()), Err(Error::NoEndpoints(_))));
    }

    #[test]
    fn test_update_instances_is_idempotent() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        let instances = vec![base(8000, 10), grey(8001, 1), grey(8002, 10000)];

        policy.update_instances(instances.clone());
        let first = policy.endpoints();
        let (total, available) = (policy.total_weight(), policy.available_weight());

        policy.update_instances(instances);
        let second = policy.endpoints();

        assert_eq!(total, 10011);
        assert_eq!(policy.total_weight(), total);
        assert_eq!(policy.available_weight(), available);
        assert!(first.iter().zip(&second).all(|(a, b)| Arc::ptr_eq(a, b)));
    }

    #[test]
    fn test_changed_instance_keeps_failures() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_instances(vec![base(8000, 10)]);
        let endpoint = policy.endpoints().remove(0);
        for _ in 0..5 {
            policy.record_failure(&endpoint);
        }
        assert_eq!(policy.available_weight(), 0);

        policy.update_instances(vec![base(8000, 20)]);
        let replaced = policy.endpoints().remove(0);
        assert!(!Arc::ptr_eq(&endpoint, &replaced));
        assert_eq!(replaced.failures(), 5);
        assert_eq!(policy.available_weight(), 0);

        policy.record_success(&replaced);
        assert_eq!(policy.available_weight(), 20);
    }

    #[test]
    fn test_unhealthy_instances_are_not_available_weight() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_instances(vec![base(8000, 10), grey(8001, 5).with_healthy(false)]);
        assert_eq!(policy.total_weight(), 15);
        assert_eq!(policy.available_weight(), 10);
    }

    #[test]
    fn test_available_weight_consistent_with_concurrent_updates() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        let instances = vec![base(8000, 10), base(8001, 20)];
        policy.update_instances(instances.clone());
        let endpoint = policy.endpoints().remove(0);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..200 {
                    for _ in 0..5 {
                        policy.record_failure(&endpoint);
                    }
                    policy.record_success(&endpoint);
                }
                for _ in 0..5 {
                    policy.record_failure(&endpoint);
                }
            });
            scope.spawn(|| {
                for _ in 0..200 {
                    policy.update_instances(instances.clone());
                }
            });
        });

        assert!(endpoint.is_fused());
        assert!(Arc::ptr_eq(&policy.endpoints()[0], &endpoint));
        assert_eq!(policy.available_weight(), 20);

        policy.record_success(&endpoint);
        assert_eq!(policy.available_weight(), 30);
    }

    #[test]
    fn test_update_inbounds_replaces_per_source() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        let c_rule = RoutingBound::new(
            vec![SourceBound::new("c", "")],
            vec![DestinationBound::new("b", "").with_label("k", "base")],
        );
        policy.update_inbounds(vec![rule(vec![DestinationBound::new("b", "b_namespace")]), c_rule]);
        policy.update_inbounds(vec![rule(vec![
            DestinationBound::new("b", "b_namespace").with_label("k", "grey"),
            DestinationBound::new("b", "b_namespace").with_label("k", "base"),
        ])]);

        assert_eq!(policy.inbound_rules("a").unwrap()[0].destinations.len(), 2);
        assert_eq!(policy.inbound_rules("c").unwrap().len(), 1);
        assert!(policy.outbound_rules("a").is_none());
    }

    #[test]
    fn test_update_routing_replaces_tables() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_inbounds(vec![rule(vec![DestinationBound::new("b", "")])]);

        let routing = Routing {
            outbounds: vec![RoutingBound::new(
                vec![SourceBound::new("c", "")],
                vec![DestinationBound::new("b", "")],
            )],
            revision: "rt2".to_string(),
            ..Default::default()
        };
        policy.update_routing(&routing);

        assert!(policy.inbound_rules("a").is_none());
        assert!(policy.outbound_rules("c").is_some());
    }

    #[test]
    fn test_matching_destinations() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        let source = SourceBound::new("a", "a_namespace")
            .with_label("k1_env", "v1_base")
            .with_label("k2_number", "v2_prime");
        policy.update_inbounds(vec![RoutingBound::new(
            vec![source],
            vec![
                DestinationBound::new("b", "b_namespace").with_label("k", "base"),
                DestinationBound::new("b", "b_namespace").with_label("k", "grey"),
                DestinationBound::new("b", "b_namespace").with_label("k1", "v1"),
            ],
        )]);

        let request = RouteRequest::new()
            .with_caller("a_namespace", "a")
            .with_meta("k1_env", "v1_base")
            .with_meta("k2_number", "v2_prime");
        assert_eq!(policy.matching_destinations(&request).unwrap().len(), 3);

        let other_caller = RouteRequest { caller: None, ..request.clone() }.with_caller("a_namespace", "c");
        assert!(policy.matching_destinations(&other_caller).is_none());

        let other_namespace = request.clone().with_caller("not_a_namespace", "a");
        assert!(policy.matching_destinations(&other_namespace).is_none());

        let missing_label = RouteRequest::new().with_caller("a_namespace", "a").with_meta("k1_env", "v1_base");
        assert!(policy.matching_destinations(&missing_label).is_none());
    }

    #[test]
    fn test_wildcard_source_label() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_outbounds(vec![RoutingBound::new(
            vec![SourceBound::new("*", "*").with_label("env", "*")],
            vec![DestinationBound::new("b", "").with_label("k", "grey")],
        )]);

        let anonymous = RouteRequest::new();
        assert_eq!(policy.matching_destinations(&anonymous).unwrap().len(), 1);
    }

    #[test]
    fn test_priority_failover() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_instances(vec![base(8000, 100), grey(8001, 100), grey(8002, 100)]);
        policy.update_inbounds(vec![rule(vec![
            DestinationBound::new("b", "b_namespace").with_label("k", "missing").with_priority(1),
            DestinationBound::new("b", "b_namespace").with_label("k", "grey").with_priority(2),
            DestinationBound::new("b", "b_namespace").with_label("k", "base").with_priority(3),
        ])]);

        for _ in 0..200 {
            let endpoint = policy.select(&caller_a()).unwrap();
            assert!(endpoint.port() == 8001 || endpoint.port() == 8002);
        }
    }

    #[test]
    fn test_weighted_destinations() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_instances(vec![base(8000, 100), grey(8001, 100)]);
        policy.update_inbounds(vec![rule(vec![
            DestinationBound::new("b", "b_namespace").with_label("k", "base").with_weight(1),
            DestinationBound::new("b", "b_namespace").with_label("k", "grey").with_weight(99),
        ])]);

        let trials = 10_000;
        let grey_hits =
            (0..trials).filter(|_| policy.select(&caller_a()).map(|e| e.port() == 8001).unwrap_or(false)).count();
        let ratio = grey_hits as f64 / trials as f64;
        assert!(ratio > 0.97 && ratio < 1.0, "grey ratio {}", ratio);
    }

    #[test]
    fn test_zero_weight_destinations_are_uniform() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_instances(vec![base(8000, 100), grey(8001, 100)]);
        policy.update_inbounds(vec![rule(vec![
            DestinationBound::new("b", "b_namespace").with_label("k", "base").with_weight(0),
            DestinationBound::new("b", "b_namespace").with_label("k", "grey").with_weight(0),
        ])]);

        let ports: HashSet<u16> = (0..200).filter_map(|_| policy.select(&caller_a()).ok()).map(|e| e.port()).collect();
        assert_eq!(ports.len(), 2);
    }

    #[test]
    fn test_no_rule_falls_back_to_all_endpoints() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_instances(vec![base(8000, 100), grey(8001, 100)]);
        policy.update_inbounds(vec![rule(vec![DestinationBound::new("b", "b_namespace").with_label("k", "grey")])]);

        let ports: HashSet<u16> =
            (0..200).filter_map(|_| policy.select(&RouteRequest::new()).ok()).map(|e| e.port()).collect();
        assert_eq!(ports.len(), 2);
    }

    #[test]
    fn test_lowest_instance_priority_wins() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_instances(vec![base(8000, 100).with_priority(1), base(8001, 100).with_priority(0)]);
        for _ in 0..50 {
            assert_eq!(policy.select(&RouteRequest::new()).unwrap().port(), 8001);
        }
    }

    #[test]
    fn test_fused_endpoint_is_skipped() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_instances(vec![base(8000, 100), base(8001, 100)]);
        let fused = policy.endpoints().into_iter().find(|e| e.port() == 8000).unwrap();
        for _ in 0..5 {
            policy.record_failure(&fused);
        }
        assert_eq!(policy.available_weight(), 100);

        for _ in 0..50 {
            assert_eq!(policy.select(&RouteRequest::new()).unwrap().port(), 8001);
        }
    }

    #[test]
    fn test_all_unavailable_still_returns_endpoint() {
        let policy = RoutingPolicy::new(key(), PolicyConfig::default());
        policy.update_instances(vec![base(8000, 100).with_healthy(false), grey(8001, 100).with_healthy(false)]);
        assert!(policy.select(&RouteRequest::new()).is_ok());
    }

    #[test]
    fn test_meta_router_failover() {
        let all = PolicyConfig::default().with_dst_meta(FailoverType::All);
        let policy = RoutingPolicy::new(key(), all);
        policy.update_instances(vec![base(8000, 100), grey(8001, 100)]);
        let request = RouteRequest::new().with_dst_meta("k", "canary");
        assert!(policy.select(&request).is_ok());

        let none = PolicyConfig::default().with_dst_meta(FailoverType::None);
        let policy = RoutingPolicy::new(key(), none);
        policy.update_instances(vec![base(8000, 100), grey(8001, 100)]);
        assert!(matches!(policy.select(&request), Err(Error::NoMatchedInstance(_))));

        let not_key = PolicyConfig::default().with_dst_meta(FailoverType::NotKey);
        let policy = RoutingPolicy::new(key(), not_key);
        policy.update_instances(vec![base(8000, 100), Instance::new("b", 8009)]);
        for _ in 0..50 {
            assert_eq!(policy.select(&request).unwrap().port(), 8009);
        }
    }

    #[test]
    fn test_weighted_index() {
        assert_eq!(weighted_index(Vec::<u32>::new()), None);
        assert_eq!(weighted_index(vec![0, 5, 0]), Some(1));
        assert!(weighted_index(vec![0, 0]).is_some());
    }
}
