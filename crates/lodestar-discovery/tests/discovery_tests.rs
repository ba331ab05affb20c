use std::{sync::Arc, time::Duration};

use lodestar_discovery::{ClusterKind, DiscoveryClient, Fetched, Transport};
use lodestar_test_fixtures::{
    DEREGISTER_PATH, DISCOVER_PATH, FakeControlPlane, HEARTBEAT_PATH, NOT_FOUND_SERVICE,
    REGISTER_PATH, fake_client, serve, test_config, test_instances, test_service,
};
use lodestar_types::{
    CircuitBreaker, DestinationBound, Error, Instance, RateLimit, RateLimitRule, Routing,
    RoutingBound, ServiceKey, SourceBound,
};

fn test_routing(revision: &str) -> Routing {
    Routing {
        service: "echo".to_string(),
        namespace: "Test".to_string(),
        inbounds: vec![RoutingBound::new(
            vec![SourceBound::new("a", "a_namespace")],
            vec![DestinationBound::new("echo", "b_namespace").with_label("k1_for_inst_env", "v1_for_inst_grey")],
        )],
        revision: revision.to_string(),
        ..Default::default()
    }
}

fn setup() -> (Arc<FakeControlPlane>, DiscoveryClient, ServiceKey) {
    let plane = Arc::new(FakeControlPlane::new());
    let key = test_service();
    plane.set_instances(&key, "r1", test_instances());
    plane.set_routing(&key, test_routing("rt1"));
    let client = fake_client(&plane);
    (plane, client, key)
}

#[tokio::test]
async fn test_bootstrap_then_discover() {
    let (plane, client, key) = setup();

    let result = client.discover(&key, "0", 1).await.unwrap();

    assert_eq!(result.instances.revision(), Some("r1"));
    assert_eq!(result.instances.clone().into_value().unwrap().len(), 4);
    assert_eq!(result.routing.revision(), Some("rt1"));
    assert_eq!(result.routing.into_value().unwrap().inbounds.len(), 1);

    // Only the discover pool is needed for a discover operation
    assert_eq!(plane.bootstrap_count(), 1);
    assert!(client.cluster().is_ready(ClusterKind::Discover));
    assert!(!client.cluster().is_ready(ClusterKind::HealthCheck));
    assert_eq!(client.cluster().addresses(ClusterKind::Discover), vec!["http://127.0.0.1:8090"]);

    let requests = plane.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].is_bootstrap());
    assert_eq!(requests[1].discover_kind(), Some(1));
    assert_eq!(requests[1].revision(), Some("0"));
    assert_eq!(requests[2].discover_kind(), Some(3));
    assert_eq!(requests[2].url, "http://127.0.0.1:8090/v1/Discover");
}

#[tokio::test]
async fn test_second_discover_reuses_revisions() {
    let (plane, client, key) = setup();
    client.discover(&key, "0", 1).await.unwrap();
    assert_eq!(client.cluster().revision(&key).as_deref(), Some("r1"));

    plane.clear_requests();
    let result = client.discover(&key, "rt1", 1).await.unwrap();

    assert_eq!(result.instances, Fetched::Unchanged);
    assert_eq!(result.routing, Fetched::Unchanged);

    let requests = plane.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].revision(), Some("r1"));
    assert_eq!(requests[1].revision(), Some("rt1"));
}

#[tokio::test]
async fn test_changed_instances_are_fetched_again() {
    let (plane, client, key) = setup();
    client.discover(&key, "rt1", 1).await.unwrap();

    plane.set_instances(&key, "r2", vec![Instance::new("10.0.0.9", 9000)]);
    let result = client.discover(&key, "rt1", 1).await.unwrap();

    let instances = result.instances.into_value().unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].port, 9000);
    assert_eq!(result.routing, Fetched::Unchanged);
    assert_eq!(client.cluster().revision(&key).as_deref(), Some("r2"));
}

#[tokio::test]
async fn test_register_bootstraps_health_check_cluster() {
    let (plane, client, key) = setup();
    let instance = Instance::new("10.0.0.1", 8080);

    client.register(&key, "token", &instance, 1).await.unwrap();

    assert_eq!(plane.bootstrap_count(), 2);
    assert!(client.cluster().is_ready(ClusterKind::Discover));
    assert!(client.cluster().is_ready(ClusterKind::HealthCheck));
    assert_eq!(plane.count(REGISTER_PATH), 1);

    let register = plane.requests().into_iter().find(|r| r.path == REGISTER_PATH).unwrap();
    assert_eq!(register.body["host"], "10.0.0.1");
    assert_eq!(register.body["port"], 8080);
    assert_eq!(register.body["service"], "echo");
    assert_eq!(register.body["service_token"], "token");
}

#[tokio::test]
async fn test_transport_errors_are_retried() {
    let (plane, client, key) = setup();
    client.discover(&key, "0", 1).await.unwrap();
    plane.clear_requests();

    plane.fail_next(2);
    let result = client.discover(&key, "0", 3).await;

    assert!(result.is_ok(), "unexpected error: {:?}", result.err());
    // Two failed attempts, then the instance fetch and the chained routing fetch
    assert_eq!(plane.count(DISCOVER_PATH), 4);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let (plane, client, key) = setup();
    client.discover(&key, "0", 1).await.unwrap();
    plane.clear_requests();

    plane.fail_next(10);
    let err = client.discover(&key, "0", 1).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(plane.count(DISCOVER_PATH), 2);
}

#[tokio::test]
async fn test_failed_routing_fetch_keeps_instance_revision_unset() {
    let (plane, client, key) = setup();
    plane.fail_discover_kind(3, 1);

    let err = client.discover(&key, "0", 0).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(client.cluster().revision(&key), None);

    let result = client.discover(&key, "0", 0).await.unwrap();
    assert!(result.instances.is_modified());
    assert_eq!(result.instances.into_value().unwrap().len(), 4);
    assert_eq!(client.cluster().revision(&key).as_deref(), Some("r1"));

    let instance_fetches: Vec<_> =
        plane.requests().into_iter().filter(|r| r.discover_kind() == Some(1) && !r.is_bootstrap()).collect();
    assert_eq!(instance_fetches.len(), 2);
    assert_eq!(instance_fetches[1].revision(), Some("0"));
}

#[tokio::test]
async fn test_application_errors_are_not_retried() {
    let (plane, client, _) = setup();
    let unknown = ServiceKey::new("Test", "missing");

    let err = client.discover(&unknown, "0", 3).await.unwrap_err();

    assert_eq!(err.response_code(), Some(NOT_FOUND_SERVICE));
    assert_eq!(plane.count(DISCOVER_PATH), 1);
}

#[tokio::test]
async fn test_bootstrap_failure_uses_fixed_budget() {
    let (plane, client, key) = setup();
    plane.fail_next(10);

    let err = client.discover(&key, "0", 5).await.unwrap_err();

    assert!(matches!(err, Error::Transport { .. }));
    // First attempt plus two retries, all against the seed
    assert_eq!(plane.bootstrap_count(), 3);
    assert!(!client.cluster().is_ready(ClusterKind::Discover));
}

#[tokio::test]
async fn test_empty_cluster_is_parse_error() {
    let (plane, client, key) = setup();
    plane.set_cluster_instances("c-empty", vec![]);

    let err = client.discover(&key, "0", 1).await.unwrap_err();

    assert!(matches!(err, Error::ServerParse(_)));
    assert_eq!(plane.count(DISCOVER_PATH), 0);
}

#[tokio::test]
async fn test_stale_pool_is_bootstrapped_again() {
    let plane = Arc::new(FakeControlPlane::new());
    let key = test_service();
    plane.set_instances(&key, "r1", test_instances());

    let mut config = test_config(vec!["http://127.0.0.1:8090".to_string()]);
    config.system.discover_cluster.refresh_interval_ms = 50;
    let client = DiscoveryClient::with_transport(config, Arc::clone(&plane) as Arc<dyn Transport>).unwrap();

    client.discover(&key, "0", 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    client.discover(&key, "0", 1).await.unwrap();

    let bootstraps: Vec<_> = plane.requests().into_iter().filter(|r| r.is_bootstrap()).collect();
    assert_eq!(bootstraps.len(), 2);
    // The second bootstrap sends the stored cluster revision and keeps the pool
    assert_eq!(bootstraps[1].revision(), Some("cluster-8090"));
    assert_eq!(client.cluster().addresses(ClusterKind::Discover), vec!["http://127.0.0.1:8090"]);
}

#[tokio::test]
async fn test_register_ack_codes() {
    let (plane, client, key) = setup();
    let instance = Instance::new("10.0.0.1", 8080);

    assert!(client.register(&key, "", &instance, 0).await.is_ok());

    plane.set_ack_code(REGISTER_PATH, 400201);
    assert!(client.register(&key, "", &instance, 0).await.is_ok());

    plane.set_ack_code(REGISTER_PATH, 500000);
    let err = client.register(&key, "", &instance, 0).await.unwrap_err();
    assert!(matches!(err, Error::Application { code: 500000, .. }));
}

#[tokio::test]
async fn test_heartbeat_and_deregister() {
    let (plane, client, key) = setup();
    let mut instance = Instance::new("10.0.0.1", 8080).with_heartbeat(5);
    instance.id = "ins-1".to_string();

    client.heartbeat(&key, "", &instance, 0).await.unwrap();
    client.deregister(&key, "", &instance, 0).await.unwrap();

    let heartbeat = plane.requests().into_iter().find(|r| r.path == HEARTBEAT_PATH).unwrap();
    assert_eq!(heartbeat.body["id"], "ins-1");
    assert_eq!(plane.count(DEREGISTER_PATH), 1);

    plane.set_ack_code(HEARTBEAT_PATH, 400141);
    let err = client.heartbeat(&key, "", &instance, 0).await.unwrap_err();
    assert!(err.is_heartbeat_disabled());
}

#[tokio::test]
async fn test_fetch_rate_limit_and_circuit_breaker() {
    let (plane, client, key) = setup();
    let rule = RateLimitRule { id: "rl-1".to_string(), ..Default::default() };
    plane.set_rate_limit(&key, RateLimit { rules: vec![rule], revision: "rl".to_string() });
    plane.set_circuit_breaker(
        &key,
        CircuitBreaker { id: "cb-1".to_string(), revision: "cb".to_string(), ..Default::default() },
    );

    let limits = client.fetch_rate_limit(&key, "0", 1).await.unwrap();
    assert_eq!(limits.revision(), Some("rl"));
    assert_eq!(limits.into_value().unwrap().rules[0].id, "rl-1");

    let unchanged = client.fetch_rate_limit(&key, "rl", 1).await.unwrap();
    assert_eq!(unchanged, Fetched::Unchanged);

    let breaker = client.fetch_circuit_breaker(&key, "0", 1).await.unwrap();
    assert_eq!(breaker.into_value().unwrap().id, "cb-1");
}

#[tokio::test]
async fn test_discover_over_http() {
    let plane = Arc::new(FakeControlPlane::new());
    let key = test_service();
    plane.set_instances(&key, "r1", test_instances());
    let (base_url, server) = serve(Arc::clone(&plane)).await.unwrap();

    let client = DiscoveryClient::new(test_config(vec![base_url.clone()])).unwrap();
    let result = client.discover(&key, "0", 1).await.unwrap();

    assert_eq!(result.instances.into_value().unwrap().len(), 4);
    assert_eq!(client.cluster().addresses(ClusterKind::Discover), vec![base_url]);

    client.register(&key, "", &Instance::new("10.0.0.1", 8080), 1).await.unwrap();
    assert_eq!(plane.count(REGISTER_PATH), 1);

    server.abort();
}

#[tokio::test]
async fn test_http_error_status_is_retried() {
    let plane = Arc::new(FakeControlPlane::new());
    let key = test_service();
    plane.set_instances(&key, "r1", test_instances());
    let (base_url, server) = serve(Arc::clone(&plane)).await.unwrap();

    let client = DiscoveryClient::new(test_config(vec![base_url])).unwrap();
    client.discover(&key, "0", 1).await.unwrap();
    plane.clear_requests();

    plane.fail_next(1);
    client.discover(&key, "0", 2).await.unwrap();
    assert_eq!(plane.count(DISCOVER_PATH), 3);

    server.abort();
}
