use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use lodestar_core::{LodestarConfig, Manager};
use lodestar_routing::{PolicyConfig, PolicyRegistry, RouteRequest, RoutingPolicy};
use lodestar_test_fixtures::{
    DEREGISTER_PATH, DISCOVER_PATH, FakeControlPlane, HEARTBEAT_PATH, NOT_FOUND_SERVICE,
    REGISTER_PATH, fake_client, test_config, test_instances, test_service,
};
use lodestar_types::{
    CircuitBreaker, DestinationBound, Error, Instance, RateLimit, RateLimitRule, Routing,
    RoutingBound, SourceBound, codes,
};

const NEVER_MS: u64 = 60_000;

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

fn manager_config(refresh_interval_ms: u64) -> LodestarConfig {
    let mut config = LodestarConfig::default();
    config.global = test_config(vec!["http://127.0.0.1:8090".to_string()]);
    config.consumer.local_cache.service_refresh_interval_ms = refresh_interval_ms;
    config
}

fn setup_with(config: LodestarConfig) -> (Arc<FakeControlPlane>, Manager, Arc<PolicyRegistry>) {
    let plane = Arc::new(FakeControlPlane::new());
    let key = test_service();
    plane.set_instances(&key, "r1", test_instances());
    plane.set_routing(&key, test_routing("rt1"));

    let registry = Arc::new(PolicyRegistry::new());
    let manager = Manager::with_client(config, fake_client(&plane), Arc::clone(&registry)).unwrap();
    (plane, manager, registry)
}

fn setup(refresh_interval_ms: u64) -> (Arc<FakeControlPlane>, Manager, Arc<PolicyRegistry>) {
    setup_with(manager_config(refresh_interval_ms))
}

fn local_instance() -> Instance {
    Instance::new("10.0.0.5", 8080).with_heartbeat(5)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

// ============================================================================
// Watch
// ============================================================================

#[tokio::test]
async fn test_watch_installs_policy() {
    let (plane, manager, registry) = setup(NEVER_MS);

    manager.watch("Test", "echo").await.unwrap();

    let policy = registry.get(&test_service()).unwrap();
    assert_eq!(policy.endpoint_count(), 4);
    assert_eq!(manager.get_watching_list(), vec![test_service()]);
    assert_eq!(plane.count(DISCOVER_PATH), 2);

    let status = manager.watch_status("Test", "echo").unwrap();
    assert!(!status.establishing);
    assert!(!status.refreshing);
    assert_eq!(status.instance_revision.as_deref(), Some("r1"));
    assert_eq!(status.routing_revision, "rt1");
    assert_eq!(status.endpoint_count, 4);
    assert!(status.last_refresh.is_some());
    assert!(status.last_error.is_none());

    let request = RouteRequest::new().with_caller("a_namespace", "a");
    for _ in 0..50 {
        let port = manager.select("Test", "echo", &request).unwrap().port();
        assert!(port == 8001 || port == 8002, "port {}", port);
    }
}

#[tokio::test]
async fn test_double_watch_while_establishing() {
    let (plane, manager, registry) = setup(NEVER_MS);
    plane.hold(DISCOVER_PATH);

    let (first, (second, unwatch, establishing)) = tokio::join!(manager.watch("Test", "echo"), async {
        plane.wait_held().await;
        let establishing = manager.watch_status("Test", "echo").map(|s| s.establishing);
        let second = manager.watch("Test", "echo").await;
        let unwatch = manager.unwatch("Test", "echo").await;
        plane.release();
        (second, unwatch, establishing)
    });

    first.unwrap();
    assert!(matches!(second, Err(Error::DoubleWatch(_))));
    assert!(matches!(unwatch, Err(Error::ServiceNotFound(_))));
    assert_eq!(establishing, Some(true));
    assert!(registry.contains(&test_service()));
}

#[tokio::test]
async fn test_double_watch_after_established() {
    let (_plane, manager, _registry) = setup(NEVER_MS);
    manager.watch("Test", "echo").await.unwrap();

    let err = manager.watch("Test", "echo").await.unwrap_err();
    assert!(matches!(err, Error::DoubleWatch(_)));
    assert_eq!(err.error_code(), "DOUBLE_WATCH");
}

#[tokio::test]
async fn test_watch_failure_leaves_no_state() {
    let (_plane, manager, registry) = setup(NEVER_MS);

    for _ in 0..2 {
        let err = manager.watch("Test", "missing").await.unwrap_err();
        assert_eq!(err.response_code(), Some(NOT_FOUND_SERVICE));
    }

    assert!(manager.get_watching_list().is_empty());
    assert!(manager.watch_status("Test", "missing").is_none());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_unwatch_unknown_service() {
    let (_plane, manager, _registry) = setup(NEVER_MS);
    let err = manager.unwatch("Test", "echo").await.unwrap_err();
    assert!(matches!(err, Error::ServiceNotFound(_)));
}

#[tokio::test]
async fn test_refresh_applies_new_instances() {
    let (plane, manager, registry) = setup(20);
    manager.watch("Test", "echo").await.unwrap();
    let policy = registry.get(&test_service()).unwrap();

    plane.set_instances(
        &test_service(),
        "r2",
        vec![Instance::new("10.0.0.9", 9000).with_namespace("b_namespace")],
    );
    plane.set_routing(&test_service(), test_routing("rt2"));

    eventually(|| policy.endpoint_count() == 1).await;
    eventually(|| {
        manager
            .watch_status("Test", "echo")
            .is_some_and(|s| s.routing_revision == "rt2" && s.instance_revision.as_deref() == Some("r2"))
    })
    .await;

    let endpoint = manager.select("Test", "echo", &RouteRequest::new()).unwrap();
    assert_eq!(endpoint.address(), "10.0.0.9:9000");
}

#[tokio::test]
async fn test_refresh_sends_cached_revisions() {
    let (plane, manager, registry) = setup(20);
    manager.watch("Test", "echo").await.unwrap();
    let before = registry.get(&test_service()).unwrap().endpoints();
    plane.clear_requests();

    eventually(|| plane.count(DISCOVER_PATH) >= 4).await;

    for request in plane.requests().iter().filter(|r| !r.is_bootstrap()) {
        match request.discover_kind() {
            Some(1) => assert_eq!(request.revision(), Some("r1")),
            Some(3) => assert_eq!(request.revision(), Some("rt1")),
            other => panic!("unexpected discover type {:?}", other),
        }
    }

    let after = registry.get(&test_service()).unwrap().endpoints();
    assert_eq!(before.len(), after.len());
    assert!(before.iter().zip(after.iter()).all(|(a, b)| Arc::ptr_eq(a, b)));
}

#[tokio::test]
async fn test_refresh_failure_keeps_watch() {
    let (plane, manager, registry) = setup(20);
    manager.watch("Test", "echo").await.unwrap();

    plane.remove_service(&test_service());
    eventually(|| manager.watch_status("Test", "echo").is_some_and(|s| s.last_error.is_some())).await;

    let policy = registry.get(&test_service()).unwrap();
    assert_eq!(policy.endpoint_count(), 4);
    assert_eq!(manager.get_watching_list(), vec![test_service()]);

    plane.set_instances(&test_service(), "r3", test_instances());
    eventually(|| {
        manager.watch_status("Test", "echo").is_some_and(|s| {
            s.last_error.is_none() && s.instance_revision.as_deref() == Some("r3")
        })
    })
    .await;
}

#[tokio::test]
async fn test_unwatch_waits_for_inflight_refresh() {
    let (plane, manager, registry) = setup(20);
    manager.watch("Test", "echo").await.unwrap();

    plane.hold(DISCOVER_PATH);
    plane.wait_held().await;
    assert!(manager.watch_status("Test", "echo").unwrap().refreshing);

    let started = Instant::now();
    let (unwatched, still_watched) = tokio::join!(manager.unwatch("Test", "echo"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let still_watched = manager.watch_status("Test", "echo").is_some();
        plane.release();
        still_watched
    });

    unwatched.unwrap();
    assert!(still_watched);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(manager.watch_status("Test", "echo").is_none());
    assert!(manager.get_watching_list().is_empty());
    assert!(!registry.contains(&test_service()));

    plane.clear_requests();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(plane.count(DISCOVER_PATH), 0);
}

#[tokio::test]
async fn test_rewatch_resumes_cached_policy() {
    let (plane, manager, registry) = setup(NEVER_MS);
    manager.watch("Test", "echo").await.unwrap();
    let first = registry.get(&test_service()).unwrap();

    manager.unwatch("Test", "echo").await.unwrap();
    assert!(registry.get(&test_service()).is_none());

    plane.clear_requests();
    manager.watch("Test", "echo").await.unwrap();
    let second = registry.get(&test_service()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.endpoint_count(), 4);

    let requests = plane.requests();
    let routing = requests.iter().find(|r| r.discover_kind() == Some(3)).unwrap();
    assert_eq!(routing.revision(), Some("rt1"));
    let instances = requests.iter().find(|r| r.discover_kind() == Some(1)).unwrap();
    assert_eq!(instances.revision(), Some("r1"));
}

#[tokio::test]
async fn test_expired_cache_starts_cold() {
    let mut config = manager_config(NEVER_MS);
    config.consumer.local_cache.service_expire_time_ms = 1;
    let (plane, manager, registry) = setup_with(config);

    manager.watch("Test", "echo").await.unwrap();
    let first = registry.get(&test_service()).unwrap();
    manager.unwatch("Test", "echo").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    plane.clear_requests();
    manager.watch("Test", "echo").await.unwrap();
    let second = registry.get(&test_service()).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.endpoint_count(), 4);

    let instances = plane.requests().into_iter().find(|r| r.discover_kind() == Some(1)).unwrap();
    assert_eq!(instances.revision(), Some("0"));
}

#[tokio::test]
async fn test_policy_conflict_keeps_cached_policy() {
    let (plane, manager, registry) = setup(NEVER_MS);
    manager.watch("Test", "echo").await.unwrap();
    let cached = registry.get(&test_service()).unwrap();
    manager.unwatch("Test", "echo").await.unwrap();

    let foreign = Arc::new(RoutingPolicy::new(test_service(), PolicyConfig::default()));
    registry.add(test_service(), Arc::clone(&foreign)).unwrap();

    let err = manager.watch("Test", "echo").await.unwrap_err();
    assert!(matches!(err, Error::PolicyExists(_)));
    assert!(manager.watch_status("Test", "echo").is_none());
    assert!(manager.get_watching_list().is_empty());
    assert!(Arc::ptr_eq(&registry.get(&test_service()).unwrap(), &foreign));

    registry.remove(&test_service());
    plane.clear_requests();
    manager.watch("Test", "echo").await.unwrap();

    let resumed = registry.get(&test_service()).unwrap();
    assert!(Arc::ptr_eq(&resumed, &cached));
    assert_eq!(resumed.endpoint_count(), 4);
    // The instance revision was forgotten, so the resumed watch fetches full data
    let instances = plane.requests().into_iter().find(|r| r.discover_kind() == Some(1)).unwrap();
    assert_eq!(instances.revision(), Some("0"));
}

#[tokio::test]
async fn test_policy_conflict_on_cold_watch_forgets_revision() {
    let (plane, manager, registry) = setup(NEVER_MS);
    let foreign = Arc::new(RoutingPolicy::new(test_service(), PolicyConfig::default()));
    registry.add(test_service(), foreign).unwrap();

    let err = manager.watch("Test", "echo").await.unwrap_err();
    assert!(matches!(err, Error::PolicyExists(_)));
    assert_eq!(manager.client().cluster().revision(&test_service()), None);

    registry.remove(&test_service());
    plane.clear_requests();
    manager.watch("Test", "echo").await.unwrap();
    assert_eq!(registry.get(&test_service()).unwrap().endpoint_count(), 4);

    let instances = plane.requests().into_iter().find(|r| r.discover_kind() == Some(1)).unwrap();
    assert_eq!(instances.revision(), Some("0"));
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_with_heartbeat() {
    let (plane, manager, _registry) = setup(NEVER_MS);
    let instance = local_instance();

    manager.register("Test", "echo", "token", 20, instance.clone()).await.unwrap();
    assert_eq!(plane.count(REGISTER_PATH), 1);
    assert_eq!(manager.get_register_list(), vec!["10.0.0.5:8080".to_string()]);

    let status = manager.register_status("10.0.0.5:8080").unwrap();
    assert_eq!(status.key, test_service());
    assert!(status.heartbeating);
    assert_eq!(status.heartbeat_interval, Some(Duration::from_millis(20)));
    assert!(status.last_heartbeat.is_some());

    eventually(|| plane.count(HEARTBEAT_PATH) >= 3).await;

    manager.deregister("Test", "echo", "token", &instance).await.unwrap();
    assert_eq!(plane.count(DEREGISTER_PATH), 1);
    assert!(manager.get_register_list().is_empty());
    assert!(manager.register_status("10.0.0.5:8080").is_none());

    let beats = plane.count(HEARTBEAT_PATH);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(plane.count(HEARTBEAT_PATH), beats);
}

#[tokio::test]
async fn test_register_without_health_check() {
    let (plane, manager, _registry) = setup(NEVER_MS);

    manager.register("Test", "echo", "", 20, Instance::new("10.0.0.5", 8080)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(plane.count(HEARTBEAT_PATH), 0);
    let status = manager.register_status("10.0.0.5:8080").unwrap();
    assert!(!status.heartbeating);
    assert!(status.heartbeat_interval.is_none());
}

#[tokio::test]
async fn test_heartbeat_disabled_on_first_attempt() {
    let (plane, manager, _registry) = setup(NEVER_MS);
    plane.set_ack_code(HEARTBEAT_PATH, codes::HEARTBEAT_ON_DISABLED_INSTANCE);

    manager.register("Test", "echo", "token", 20, local_instance()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(plane.count(HEARTBEAT_PATH), 1);
    let status = manager.register_status("10.0.0.5:8080").unwrap();
    assert!(!status.heartbeating);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_heartbeat_failures_are_retried() {
    let (plane, manager, _registry) = setup(NEVER_MS);
    plane.set_ack_code(HEARTBEAT_PATH, 500000);

    manager.register("Test", "echo", "token", 20, local_instance()).await.unwrap();
    let status = manager.register_status("10.0.0.5:8080").unwrap();
    assert!(status.heartbeating);
    assert!(status.last_error.unwrap().contains("500000"));

    eventually(|| plane.count(HEARTBEAT_PATH) >= 3).await;

    plane.set_ack_code(HEARTBEAT_PATH, codes::EXECUTE_SUCCESS);
    eventually(|| {
        manager.register_status("10.0.0.5:8080").is_some_and(|s| s.last_error.is_none())
    })
    .await;
}

#[tokio::test]
async fn test_register_ack_codes() {
    let (plane, manager, _registry) = setup(NEVER_MS);

    plane.set_ack_code(REGISTER_PATH, codes::EXISTED_RESOURCE);
    manager.register("Test", "echo", "", 0, Instance::new("10.0.0.5", 8080)).await.unwrap();

    plane.set_ack_code(REGISTER_PATH, 500000);
    let err = manager.register("Test", "echo", "", 0, Instance::new("10.0.0.6", 8080)).await.unwrap_err();
    assert_eq!(err.response_code(), Some(500000));
    assert_eq!(manager.get_register_list(), vec!["10.0.0.5:8080".to_string()]);

    plane.set_ack_code(REGISTER_PATH, codes::EXECUTE_SUCCESS);
    manager.register("Test", "echo", "", 0, Instance::new("10.0.0.6", 8080)).await.unwrap();
    assert_eq!(manager.get_register_list().len(), 2);
}

#[tokio::test]
async fn test_double_register() {
    let (_plane, manager, _registry) = setup(NEVER_MS);
    manager.register("Test", "echo", "", 0, Instance::new("10.0.0.5", 8080)).await.unwrap();

    let err = manager.register("Test", "echo", "", 0, Instance::new("10.0.0.5", 8080)).await.unwrap_err();
    assert!(matches!(err, Error::DoubleRegister(_)));
}

#[tokio::test]
async fn test_deregister_while_registering() {
    let (plane, manager, _registry) = setup(NEVER_MS);
    let instance = Instance::new("10.0.0.5", 8080);
    plane.hold(REGISTER_PATH);

    let (registered, (deregistered, registering)) =
        tokio::join!(manager.register("Test", "echo", "", 0, instance.clone()), async {
            plane.wait_held().await;
            let registering = manager.register_status("10.0.0.5:8080").map(|s| s.registering);
            let deregistered = manager.deregister("Test", "echo", "", &instance).await;
            plane.release();
            (deregistered, registering)
        });

    registered.unwrap();
    assert!(matches!(deregistered, Err(Error::DoubleRegister(_))));
    assert_eq!(registering, Some(true));
    assert_eq!(plane.count(DEREGISTER_PATH), 0);
}

#[tokio::test]
async fn test_deregister_unknown_instance_still_sends_request() {
    let (plane, manager, _registry) = setup(NEVER_MS);

    manager.deregister("Test", "echo", "token", &Instance::new("10.0.0.7", 8080)).await.unwrap();
    assert_eq!(plane.count(DEREGISTER_PATH), 1);
    assert_eq!(plane.requests().last().unwrap().body["host"], "10.0.0.7");
}

#[tokio::test]
async fn test_deregister_waits_for_inflight_heartbeat() {
    let (plane, manager, _registry) = setup(NEVER_MS);
    let instance = local_instance();
    manager.register("Test", "echo", "token", 20, instance.clone()).await.unwrap();

    plane.hold(HEARTBEAT_PATH);
    plane.wait_held().await;

    let started = Instant::now();
    let (deregistered, still_registered) =
        tokio::join!(manager.deregister("Test", "echo", "token", &instance), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let still_registered = manager.register_status("10.0.0.5:8080").is_some();
            plane.release();
            still_registered
        });

    deregistered.unwrap();
    assert!(still_registered);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(manager.get_register_list().is_empty());
    assert_eq!(plane.count(DEREGISTER_PATH), 1);
}

// ============================================================================
// Rules and shutdown
// ============================================================================

#[tokio::test]
async fn test_fetch_rules() {
    let (plane, manager, _registry) = setup(NEVER_MS);
    let rule = RateLimitRule { id: "rl-1".to_string(), ..Default::default() };
    plane.set_rate_limit(&test_service(), RateLimit { rules: vec![rule], revision: "rl".to_string() });
    plane.set_circuit_breaker(
        &test_service(),
        CircuitBreaker { id: "cb-1".to_string(), revision: "cb".to_string(), ..Default::default() },
    );

    let limits = manager.fetch_rate_limit_rules("Test", "echo").await.unwrap();
    assert_eq!(limits.revision, "rl");
    assert_eq!(limits.rules[0].id, "rl-1");

    let breaker = manager.fetch_circuit_breaker_rules("Test", "echo").await.unwrap();
    assert_eq!(breaker.id, "cb-1");
}

#[tokio::test]
async fn test_drop_stops_background_loops() {
    let (plane, manager, registry) = setup(20);
    manager.watch("Test", "echo").await.unwrap();
    manager.register("Test", "echo", "token", 20, local_instance()).await.unwrap();
    eventually(|| plane.count(HEARTBEAT_PATH) >= 2 && plane.count(DISCOVER_PATH) >= 4).await;

    drop(manager);
    tokio::time::sleep(Duration::from_millis(50)).await;
    plane.clear_requests();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(plane.requests().is_empty());
    // The registry outlives the manager
    assert!(registry.contains(&test_service()));
}
