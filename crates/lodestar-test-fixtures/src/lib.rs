//! Test fixtures for lodestar integration tests.
//!
//! The centrepiece is [`FakeControlPlane`], a scripted in-memory control plane.
//! It implements [`Transport`] so a [`DiscoveryClient`] can talk to it without
//! a socket, and [`serve`] exposes the same state over real HTTP with axum.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lodestar_test_fixtures::{FakeControlPlane, fake_client, test_instances, test_service};
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let plane = Arc::new(FakeControlPlane::new());
//!     plane.set_instances(&test_service(), "r1", test_instances());
//!
//!     let client = fake_client(&plane);
//!     let result = client.discover(&test_service(), "0", 1).await.unwrap();
//!     assert!(result.instances.is_modified());
//! }
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use lodestar_discovery::{DiscoveryClient, DiscoveryConfig, Transport};
use lodestar_types::{
    CircuitBreaker, Error, Instance, RateLimit, Result, Routing, ServiceKey, TransportErrorKind,
    codes,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    net::TcpListener,
    sync::{Notify, watch},
    task::JoinHandle,
};

pub const DISCOVER_PATH: &str = "/v1/Discover";
pub const REGISTER_PATH: &str = "/v1/RegisterInstance";
pub const DEREGISTER_PATH: &str = "/v1/DeregisterInstance";
pub const HEARTBEAT_PATH: &str = "/v1/Heartbeat";

/// Namespace of the control plane's own meta services
pub const META_NAMESPACE: &str = "Polaris";

/// Code the fake returns for an unknown service
pub const NOT_FOUND_SERVICE: u32 = 400202;

/// One request seen by the fake control plane
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub path: String,
    pub body: Value,
}

impl RecordedRequest {
    /// Integer `type` of a discover request
    pub fn discover_kind(&self) -> Option<i64> {
        self.body.get("type").and_then(Value::as_i64)
    }

    pub fn service_name(&self) -> Option<&str> {
        self.body.pointer("/service/name").and_then(Value::as_str)
    }

    pub fn service_namespace(&self) -> Option<&str> {
        self.body.pointer("/service/namespace").and_then(Value::as_str)
    }

    pub fn revision(&self) -> Option<&str> {
        self.body.pointer("/service/revision").and_then(Value::as_str)
    }

    /// Whether this is a cluster bootstrap request for a meta service
    pub fn is_bootstrap(&self) -> bool {
        self.path == DISCOVER_PATH && self.service_namespace() == Some(META_NAMESPACE)
    }
}

#[derive(Debug, Default, Clone)]
struct ServiceData {
    instance_revision: String,
    instances: Vec<Instance>,
    routing: Option<Routing>,
    rate_limit: Option<RateLimit>,
    circuit_breaker: Option<CircuitBreaker>,
}

#[derive(Debug, Default)]
struct PlaneState {
    cluster_revision: String,
    cluster_instances: Vec<Instance>,
    services: HashMap<ServiceKey, ServiceData>,
    ack_codes: HashMap<String, u32>,
    transport_failures: u32,
    /// Discover type -> remaining injected failures
    kind_failures: HashMap<i64, u32>,
    held_path: Option<String>,
    requests: Vec<RecordedRequest>,
}

/// Scripted control plane
///
/// Cluster bootstrap requests for any meta service resolve to the same
/// address list, which defaults to `127.0.0.1:8090`.
#[derive(Debug)]
pub struct FakeControlPlane {
    state: Mutex<PlaneState>,
    gate: watch::Sender<bool>,
    held: Notify,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeControlPlane {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        let plane = Self { state: Mutex::new(PlaneState::default()), gate, held: Notify::new() };
        plane.set_cluster_address("127.0.0.1", 8090);
        plane
    }

    /// Point every meta service at `host:port`, bumping the cluster revision
    pub fn set_cluster_address(&self, host: &str, port: u16) {
        let mut state = self.state.lock();
        let mut instance = Instance::new(host, port);
        instance.protocol = "http".to_string();
        state.cluster_instances = vec![instance];
        state.cluster_revision = format!("cluster-{}", port);
    }

    /// Replace the raw instance list returned for bootstrap requests
    pub fn set_cluster_instances(&self, revision: &str, instances: Vec<Instance>) {
        let mut state = self.state.lock();
        state.cluster_instances = instances;
        state.cluster_revision = revision.to_string();
    }

    pub fn set_instances(&self, key: &ServiceKey, revision: &str, instances: Vec<Instance>) {
        let mut state = self.state.lock();
        let data = state.services.entry(key.clone()).or_default();
        data.instance_revision = revision.to_string();
        data.instances = instances;
    }

    /// Set routing rules; `routing.revision` is what the fake compares against
    pub fn set_routing(&self, key: &ServiceKey, routing: Routing) {
        self.state.lock().services.entry(key.clone()).or_default().routing = Some(routing);
    }

    pub fn set_rate_limit(&self, key: &ServiceKey, rate_limit: RateLimit) {
        self.state.lock().services.entry(key.clone()).or_default().rate_limit = Some(rate_limit);
    }

    pub fn set_circuit_breaker(&self, key: &ServiceKey, breaker: CircuitBreaker) {
        self.state.lock().services.entry(key.clone()).or_default().circuit_breaker = Some(breaker);
    }

    pub fn remove_service(&self, key: &ServiceKey) {
        self.state.lock().services.remove(key);
    }

    /// Answer requests on `path` with `code`
    pub fn set_ack_code(&self, path: &str, code: u32) {
        self.state.lock().ack_codes.insert(path.to_string(), code);
    }

    /// Fail the next `count` requests with a connection error
    pub fn fail_next(&self, count: u32) {
        self.state.lock().transport_failures = count;
    }

    /// Fail the next `count` discover requests of type `kind` with a connection error
    ///
    /// Bootstrap requests are never failed this way.
    pub fn fail_discover_kind(&self, kind: i64, count: u32) {
        self.state.lock().kind_failures.insert(kind, count);
    }

    /// Park requests on `path` until [`release`](Self::release) is called
    ///
    /// Bootstrap requests are never held.
    pub fn hold(&self, path: &str) {
        self.state.lock().held_path = Some(path.to_string());
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.state.lock().held_path = None;
        self.gate.send_replace(true);
    }

    /// Wait until a request is parked by [`hold`](Self::hold)
    pub async fn wait_held(&self) {
        self.held.notified().await;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of requests sent to `path`, bootstrap requests excluded
    pub fn count(&self, path: &str) -> usize {
        self.state.lock().requests.iter().filter(|r| r.path == path && !r.is_bootstrap()).count()
    }

    pub fn bootstrap_count(&self) -> usize {
        self.state.lock().requests.iter().filter(|r| r.is_bootstrap()).count()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Record, apply failure injection and holds, then answer
    async fn handle(&self, url: &str, body: &str) -> Result<String> {
        let path = url.find("/v1/").map(|i| &url[i..]).unwrap_or(url).to_string();
        let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        let request = RecordedRequest { url: url.to_string(), path: path.clone(), body: value };
        let bootstrap = request.is_bootstrap();

        let (fail, held) = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            let mut fail = state.transport_failures > 0;
            if fail {
                state.transport_failures -= 1;
            } else if let Some(remaining) = request
                .discover_kind()
                .filter(|_| !bootstrap)
                .and_then(|kind| state.kind_failures.get_mut(&kind))
                .filter(|remaining| **remaining > 0)
            {
                *remaining -= 1;
                fail = true;
            }
            let held = !bootstrap && state.held_path.as_deref() == Some(path.as_str());
            (fail, held)
        };

        if fail {
            return Err(Error::transport(TransportErrorKind::Connect, "injected connection failure"));
        }

        if held {
            self.held.notify_one();
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }

        Ok(self.respond(&request))
    }

    fn respond(&self, request: &RecordedRequest) -> String {
        let state = self.state.lock();
        let response = match request.path.as_str() {
            DISCOVER_PATH => discover_response(&state, request),
            REGISTER_PATH | DEREGISTER_PATH | HEARTBEAT_PATH => {
                let code = state.ack_codes.get(&request.path).copied().unwrap_or(codes::EXECUTE_SUCCESS);
                json!({"code": code, "info": info_for(code)})
            },
            _ => json!({"code": 400000, "info": "invalid request"}),
        };
        response.to_string()
    }
}

fn info_for(code: u32) -> &'static str {
    match code {
        codes::EXECUTE_SUCCESS => "execute success",
        codes::DATA_NO_CHANGE => "discover data is no change",
        codes::EXISTED_RESOURCE => "existed resource",
        codes::HEARTBEAT_ON_DISABLED_INSTANCE => "heartbeat on disabled instance",
        NOT_FOUND_SERVICE => "not found service",
        _ => "error",
    }
}

fn unchanged(name: &str, namespace: &str, revision: &str) -> Value {
    json!({
        "code": codes::DATA_NO_CHANGE,
        "info": info_for(codes::DATA_NO_CHANGE),
        "service": {"name": name, "namespace": namespace, "revision": revision}
    })
}

fn discover_response(state: &PlaneState, request: &RecordedRequest) -> Value {
    let name = request.service_name().unwrap_or_default();
    let namespace = request.service_namespace().unwrap_or_default();
    let revision = request.revision().unwrap_or_default();

    if namespace == META_NAMESPACE {
        if revision == state.cluster_revision {
            return unchanged(name, namespace, &state.cluster_revision);
        }
        return json!({
            "code": codes::EXECUTE_SUCCESS,
            "info": info_for(codes::EXECUTE_SUCCESS),
            "service": {"name": name, "namespace": namespace, "revision": state.cluster_revision},
            "instances": state.cluster_instances,
        });
    }

    let key = ServiceKey::new(namespace, name);
    let Some(data) = state.services.get(&key) else {
        return json!({"code": NOT_FOUND_SERVICE, "info": info_for(NOT_FOUND_SERVICE)});
    };

    let header = |rev: &str| json!({"name": name, "namespace": namespace, "revision": rev});
    let success = codes::EXECUTE_SUCCESS;

    match request.discover_kind() {
        Some(1) => {
            if revision == data.instance_revision {
                return unchanged(name, namespace, revision);
            }
            json!({
                "code": success,
                "service": header(&data.instance_revision),
                "instances": data.instances,
            })
        },
        Some(3) => match &data.routing {
            Some(routing) if routing.revision == revision => unchanged(name, namespace, revision),
            Some(routing) => json!({"code": success, "service": header(""), "routing": routing}),
            None => json!({"code": success, "service": header("")}),
        },
        Some(4) => match &data.rate_limit {
            Some(rules) if rules.revision == revision => unchanged(name, namespace, revision),
            Some(rules) => json!({"code": success, "service": header(""), "rateLimit": rules}),
            None => json!({"code": success, "service": header("")}),
        },
        Some(5) => match &data.circuit_breaker {
            Some(breaker) if breaker.revision == revision => unchanged(name, namespace, revision),
            Some(breaker) => json!({"code": success, "service": header(""), "circuitBreaker": breaker}),
            None => json!({"code": success, "service": header("")}),
        },
        _ => json!({"code": 400000, "info": "invalid discover type"}),
    }
}

#[async_trait]
impl Transport for FakeControlPlane {
    async fn post(&self, url: &str, body: String, _timeout: Duration) -> Result<String> {
        self.handle(url, &body).await
    }
}

async fn http_handler(
    State(plane): State<Arc<FakeControlPlane>>,
    Path(action): Path<String>,
    body: String,
) -> Response {
    let url = format!("/v1/{}", action);
    match plane.handle(&url, &body).await {
        Ok(text) => ([(header::CONTENT_TYPE, "application/json")], text).into_response(),
        // A bodiless error status reads as a transport failure on the client
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Serve the fake control plane over HTTP on an ephemeral local port
///
/// The plane's cluster address is pointed at the listener, so clients
/// seeded with the returned base URL bootstrap onto the same server.
///
/// # Returns
///
/// The base URL (e.g., `http://127.0.0.1:41234`) and the server task.
pub async fn serve(plane: Arc<FakeControlPlane>) -> std::io::Result<(String, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    plane.set_cluster_address("127.0.0.1", address.port());

    let app = Router::new().route("/v1/{action}", post(http_handler)).with_state(plane);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok((format!("http://{}", address), handle))
}

/// Key used by most fixture-based tests
pub fn test_service() -> ServiceKey {
    ServiceKey::new("Test", "echo")
}

/// Discovery config with fast retries, seeded with `addresses`
pub fn test_config(addresses: Vec<String>) -> DiscoveryConfig {
    let mut config = DiscoveryConfig::with_addresses(addresses);
    config.api.retry_interval_ms = 5;
    config.api.timeout_ms = 2000;
    config
}

/// Discovery client wired straight to `plane`
pub fn fake_client(plane: &Arc<FakeControlPlane>) -> DiscoveryClient {
    DiscoveryClient::with_transport(
        test_config(vec!["http://127.0.0.1:8090".to_string()]),
        Arc::clone(plane) as Arc<dyn Transport>,
    )
    .expect("fixture config is valid")
}

/// Four instances of service `b`
///
/// - `b:8000` weight 10, env `base`
/// - `b:8001` weight 1, env `grey`
/// - `b:8002` weight 10000, env `grey`, `k1=v1`
/// - `b:8003` priority 9, `k1=v1`, `k2=v2`, no namespace
pub fn test_instances() -> Vec<Instance> {
    let mut base = Instance::new("b", 8000)
        .with_namespace("b_namespace")
        .with_weight(10)
        .with_metadata("k1_for_inst_env", "v1_for_inst_base");
    base.id = "instance_0".to_string();

    let mut grey = Instance::new("b", 8001)
        .with_namespace("b_namespace")
        .with_weight(1)
        .with_metadata("k1_for_inst_env", "v1_for_inst_grey");
    grey.id = "instance_1".to_string();

    let mut heavy_grey = Instance::new("b", 8002)
        .with_namespace("b_namespace")
        .with_weight(10000)
        .with_metadata("k1_for_inst_env", "v1_for_inst_grey")
        .with_metadata("k1", "v1");
    heavy_grey.id = "instance_2".to_string();

    let mut low_priority = Instance::new("b", 8003)
        .with_priority(9)
        .with_metadata("k1", "v1")
        .with_metadata("k2", "v2");
    low_priority.id = "instance_3".to_string();

    vec![base, grey, heavy_grey, low_priority]
}
