use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Method, Request, StatusCode},
    middleware,
    response::Response,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::ServiceExt;

use storefront_ratelimit::{
    access::{AccessEntry, AccessList, ListKind},
    admin,
    config::load_config_from_yaml,
    engine::{AdmissionEngine, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_WINDOW},
    error::{RateLimitError, Result},
    gate::{rate_limit_middleware, GateConfig, RateLimitGate},
    identity::{AuthenticatedCaller, ClientIdentity, IdentityConfig, IdentityResolver},
    metrics::Metrics,
    policy::{CallerClass, PolicySelector},
    redis::{RedisConfig, RedisCounterStore},
    rules::{RateLimitRule, RuleRegistry},
    service::RateLimitService,
    store::{CounterSnapshot, CounterStore, MemoryCounterStore},
    utils::{Clock, ManualClock},
};

const POLICY: &str = r#"
default_rule:
  requests_per_unit: 3
  unit: minute
  message: Slow down
tiers:
  anonymous:
    requests_per_unit: 3
    unit: minute
  authenticated:
    requests_per_unit: 5
    unit: minute
  elevated:
    requests_per_unit: 20
    unit: minute
routes:
  - path: /api/auth/login
    methods: [POST]
    policies:
      - type: static
        rule:
          name: login
          requests_per_unit: 2
          unit: minute
          message: Too many login attempts
exempt_paths: [/api/status]
"#;

struct Harness {
    app: Router,
    service: Arc<RateLimitService>,
    metrics: Arc<Metrics>,
}

fn harness_with(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Harness {
    let policy = load_config_from_yaml(POLICY)
        .unwrap()
        .compile(clock.clone())
        .unwrap();
    let metrics = Arc::new(Metrics::new().unwrap());
    let gate = Arc::new(RateLimitGate::new(GateConfig {
        resolver: IdentityResolver::new(IdentityConfig::default()),
        access: policy.access,
        selector: policy.selector,
        engine: AdmissionEngine::with_clock(store, metrics.clone(), clock),
        metrics: metrics.clone(),
    }));
    let service = Arc::new(RateLimitService::new(gate.clone()));

    let app = Router::new()
        .route("/api/products", get(|| async { "products" }))
        .route("/api/status", get(|| async { "ok" }))
        .route("/api/auth/login", post(|| async { "welcome" }))
        .layer(middleware::from_fn_with_state(gate, rate_limit_middleware))
        .nest("/admin", admin::router(service.clone()));

    Harness { app, service, metrics }
}

fn harness() -> (Harness, ManualClock) {
    let clock = ManualClock::new(Utc::now());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(MemoryCounterStore::with_clock(shared.clone()));
    (harness_with(store, shared), clock)
}

fn request(method: Method, path: &str, ip: &str) -> Request<Body> {
    let addr: SocketAddr = format!("{}:51000", ip).parse().unwrap();
    Request::builder()
        .method(method)
        .uri(path)
        .extension(ConnectInfo(addr))
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_three_per_minute_scenario() {
    let (h, _) = harness();

    for expected in ["2", "1", "0"] {
        let response = send(&h.app, request(Method::GET, "/api/products", "203.0.113.5")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, HEADER_LIMIT), Some("3"));
        assert_eq!(header(&response, HEADER_REMAINING), Some(expected));
        assert_eq!(header(&response, HEADER_WINDOW), Some("60"));
        assert!(header(&response, HEADER_RESET).is_some());
    }

    let response = send(&h.app, request(Method::GET, "/api/products", "203.0.113.5")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, HEADER_REMAINING), Some("0"));
    let retry_after: u64 = header(&response, "retry-after").unwrap().parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    let body = json_body(response).await;
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["limit"], 3);
    assert_eq!(body["remaining"], 0);
    assert_eq!(body["window"], 60);

    // a different caller has its own window
    let response = send(&h.app, request(Method::GET, "/api/products", "203.0.113.6")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_window_resets_after_expiry() {
    let (h, clock) = harness();
    for _ in 0..3 {
        send(&h.app, request(Method::GET, "/api/products", "198.51.100.1")).await;
    }
    let response = send(&h.app, request(Method::GET, "/api/products", "198.51.100.1")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(Duration::from_secs(61));

    let response = send(&h.app, request(Method::GET, "/api/products", "198.51.100.1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, HEADER_REMAINING), Some("2"));
}

#[tokio::test]
async fn test_route_rule_and_violation_message() {
    let (h, _) = harness();
    for _ in 0..2 {
        let response = send(&h.app, request(Method::POST, "/api/auth/login", "192.0.2.10")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = send(&h.app, request(Method::POST, "/api/auth/login", "192.0.2.10")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["violation_message"], "Too many login attempts");
    assert_eq!(body["limit"], 2);
}

#[tokio::test]
async fn test_tiered_quotas_by_caller_class() {
    let (h, _) = harness();

    let mut admitted = 0;
    for _ in 0..8 {
        let mut req = request(Method::GET, "/api/products", "192.0.2.20");
        req.extensions_mut()
            .insert(AuthenticatedCaller::new("42", CallerClass::Authenticated));
        if send(&h.app, req).await.status() == StatusCode::OK {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);

    // the anonymous caller on the same address has a separate, smaller quota
    let response = send(&h.app, request(Method::GET, "/api/products", "192.0.2.20")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, HEADER_LIMIT), Some("3"));
}

#[tokio::test]
async fn test_denied_caller_consumes_no_quota() {
    let (h, _) = harness();
    h.service.add_access_entry(
        ListKind::Deny,
        AccessEntry::new("ip:192.0.2.0/24").unwrap().with_reason("card testing"),
    );

    let response = send(&h.app, request(Method::GET, "/api/products", "192.0.2.99")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(header(&response, HEADER_LIMIT).is_none());
    let body = json_body(response).await;
    assert_eq!(body["reason"], "card testing");

    let status = h
        .service
        .query("tier_anonymous", &ClientIdentity::ip("192.0.2.99"), None)
        .await
        .unwrap();
    assert_eq!(status.info.remaining, 3);
}

#[tokio::test]
async fn test_allow_list_and_exempt_paths_bypass() {
    let (h, _) = harness();
    h.service
        .add_access_entry(ListKind::Allow, AccessEntry::new("ip:10.1.1.1").unwrap());

    for _ in 0..10 {
        let response = send(&h.app, request(Method::GET, "/api/products", "10.1.1.1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, HEADER_LIMIT).is_none());

        let response = send(&h.app, request(Method::GET, "/api/status", "10.2.2.2")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(h.metrics.gate_decision_count("bypassed"), 20);
}

#[tokio::test]
async fn test_expired_deny_entry_is_ignored() {
    let (h, clock) = harness();
    let until = clock.now() + chrono::Duration::seconds(10);
    h.service.add_access_entry(
        ListKind::Deny,
        AccessEntry::new("ip:192.0.2.50").unwrap().expires_at(until),
    );
    let response = send(&h.app, request(Method::GET, "/api/products", "192.0.2.50")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    clock.advance(Duration::from_secs(11));
    let response = send(&h.app, request(Method::GET, "/api/products", "192.0.2.50")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

struct UnavailableStore;

fn unavailable<T>() -> Result<T> {
    Err(RateLimitError::StoreUnavailable("connection refused".to_string()))
}

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn increment(&self, _key: &str) -> Result<u64> {
        unavailable()
    }
    async fn set_with_expiry_if_absent(&self, _key: &str, _value: u64, _ttl: Duration) -> Result<bool> {
        unavailable()
    }
    async fn ttl(&self, _key: &str) -> Result<Option<Duration>> {
        unavailable()
    }
    async fn get(&self, _key: &str) -> Result<Option<u64>> {
        unavailable()
    }
    async fn delete(&self, _key: &str) -> Result<()> {
        unavailable()
    }
    async fn health_check(&self) -> Result<()> {
        unavailable()
    }
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
    let h = harness_with(Arc::new(UnavailableStore), clock);

    for _ in 0..10 {
        let response = send(&h.app, request(Method::GET, "/api/products", "203.0.113.77")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, HEADER_REMAINING).is_none());
    }
    assert_eq!(h.metrics.store_failure_count("increment"), 10);
    assert_eq!(h.metrics.check_count("tier_anonymous", "fail_open"), 10);

    let result = h
        .service
        .query("default", &ClientIdentity::ip("203.0.113.77"), None)
        .await;
    assert!(matches!(result, Err(RateLimitError::StoreUnavailable(_))));
    assert!(h.service.health_check().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_admit_exactly_limit() {
    const LIMIT: u64 = 25;
    let store = Arc::new(MemoryCounterStore::new());
    let engine = AdmissionEngine::new(store, Arc::new(Metrics::new().unwrap()));
    let rule = Arc::new(RateLimitRule::new("flash_sale", LIMIT, Duration::from_secs(60)).unwrap());
    let key = rule.key_for(&ClientIdentity::user("buyer-1"), None);

    let mut handles = Vec::new();
    for _ in 0..(2 * LIMIT) {
        let engine = engine.clone();
        let rule = rule.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move { engine.check_rule(&rule, &key).await }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().admitted {
            admitted += 1;
        }
    }
    assert_eq!(admitted, LIMIT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_http_requests_admit_exactly_limit() {
    let (h, _) = harness();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let app = h.app.clone();
        handles.push(tokio::spawn(async move {
            app.oneshot(request(Method::GET, "/api/products", "198.51.100.200"))
                .await
                .unwrap()
                .status()
        }));
    }

    let mut ok = 0;
    let mut limited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => ok += 1,
            StatusCode::TOO_MANY_REQUESTS => limited += 1,
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!((ok, limited), (3, 3));
}

#[tokio::test]
async fn test_rule_replacement_keeps_existing_window() {
    let clock = ManualClock::new(Utc::now());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(MemoryCounterStore::with_clock(shared.clone()));
    let engine = AdmissionEngine::with_clock(store.clone(), Arc::new(Metrics::new().unwrap()), shared);
    let registry = RuleRegistry::new(RateLimitRule::new("default", 10, Duration::from_secs(60)).unwrap());
    registry.upsert(RateLimitRule::new("search", 2, Duration::from_secs(60)).unwrap()).unwrap();

    let identity = ClientIdentity::api_key("partner-1");
    let rule = registry.get("search").unwrap();
    let key = rule.key_for(&identity, None);
    engine.check_rule(&rule, &key).await;

    clock.advance(Duration::from_secs(20));
    registry.upsert(RateLimitRule::new("search", 5, Duration::from_secs(3600)).unwrap()).unwrap();
    let rule = registry.get("search").unwrap();
    let admission = engine.check_rule(&rule, &rule.key_for(&identity, None)).await;

    assert!(admission.admitted);
    assert_eq!(admission.info.limit, 5);
    assert_eq!(admission.info.remaining, 3);
    assert_eq!(admission.info.reset_after, Duration::from_secs(40));
}

#[tokio::test]
async fn test_admin_routes() {
    let (h, _) = harness();

    let create = Request::builder()
        .method(Method::POST)
        .uri("/admin/rules")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"name":"coupons","requests_per_unit":4,"unit":"minute"}"#,
        ))
        .unwrap();
    let response = send(&h.app, create).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["name"], "coupons");
    assert_eq!(body["requests_allowed"], 4);

    let response = send(&h.app, Request::get("/admin/rules/coupons").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&h.app, Request::get("/admin/rules/missing").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "unknown_rule");

    let invalid = Request::builder()
        .method(Method::POST)
        .uri("/admin/rules")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"name":"broken","requests_per_unit":0,"unit":"second"}"#))
        .unwrap();
    assert_eq!(send(&h.app, invalid).await.status(), StatusCode::BAD_REQUEST);

    // a rule may not share the counter keys of the inline login rule
    let shared_prefix = Request::builder()
        .method(Method::POST)
        .uri("/admin/rules")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"name":"search","requests_per_unit":50,"unit":"minute","key_prefix":"login"}"#,
        ))
        .unwrap();
    let response = send(&h.app, shared_prefix).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_rule");

    // consume quota, inspect it, then clear it
    send(&h.app, request(Method::GET, "/api/products", "192.0.2.77")).await;
    let response = send(
        &h.app,
        Request::get("/admin/quota/tier_anonymous?identity=ip:192.0.2.77")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["key"], "tier_anonymous:ip:192.0.2.77");
    assert_eq!(body["info"]["remaining"], 2);

    let clear = Request::delete("/admin/quota/tier_anonymous?identity=ip:192.0.2.77")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, clear).await.status(), StatusCode::NO_CONTENT);

    let bad_identity = Request::get("/admin/quota/default?identity=nobody")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, bad_identity).await.status(), StatusCode::BAD_REQUEST);

    let deny = Request::builder()
        .method(Method::POST)
        .uri("/admin/access/deny")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"pattern":"ip:192.0.2.77","reason":"scraping"}"#))
        .unwrap();
    assert_eq!(send(&h.app, deny).await.status(), StatusCode::CREATED);
    let response = send(&h.app, request(Method::GET, "/api/products", "192.0.2.77")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let entries = json_body(
        send(&h.app, Request::get("/admin/access/deny").body(Body::empty()).unwrap()).await,
    )
    .await;
    assert_eq!(entries.as_array().map(Vec::len), Some(1));

    let remove = Request::delete("/admin/access/deny?pattern=ip:192.0.2.77")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, remove).await.status(), StatusCode::NO_CONTENT);
    let response = send(&h.app, request(Method::GET, "/api/products", "192.0.2.77")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[test]
fn test_service_is_reachable_without_policy_file() {
    let registry = Arc::new(RuleRegistry::new(
        RateLimitRule::new("default", 1, Duration::from_secs(1)).unwrap(),
    ));
    let metrics = Arc::new(Metrics::new().unwrap());
    let gate = RateLimitGate::new(GateConfig {
        resolver: IdentityResolver::default(),
        access: Arc::new(AccessList::new()),
        selector: PolicySelector::new(registry),
        engine: AdmissionEngine::new(Arc::new(MemoryCounterStore::new()), metrics.clone()),
        metrics,
    });
    let service = RateLimitService::new(Arc::new(gate));
    assert_eq!(service.default_rule().name(), "default");
    assert!(service.list_rules().is_empty());
}

// Redis-backed tests run only when REDIS_URL points at a live server.

async fn redis_store() -> Option<RedisCounterStore> {
    let url = std::env::var("REDIS_URL").ok()?;
    let config = RedisConfig {
        url,
        key_prefix: format!("ratelimit-test-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
        ..Default::default()
    };
    Some(RedisCounterStore::new(config).await.unwrap())
}

#[tokio::test]
async fn test_redis_increment_with_expiry() {
    let Some(store) = redis_store().await else {
        return;
    };

    let first = store.increment_with_expiry("cart:ip:1.1.1.1", Duration::from_secs(30)).await.unwrap();
    assert_eq!(first.count, 1);
    assert!(first.ttl.map(|t| t <= Duration::from_secs(30)).unwrap_or(false));

    let second: CounterSnapshot = store.increment_with_expiry("cart:ip:1.1.1.1", Duration::from_secs(30)).await.unwrap();
    assert_eq!(second.count, 2);
    tokio_test::assert_ok!(store.delete("cart:ip:1.1.1.1").await);
    assert_eq!(store.get("cart:ip:1.1.1.1").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_concurrent_checks_admit_exactly_limit() {
    let Some(store) = redis_store().await else {
        return;
    };
    let engine = AdmissionEngine::new(Arc::new(store), Arc::new(Metrics::new().unwrap()));
    let rule = Arc::new(RateLimitRule::new("checkout", 20, Duration::from_secs(60)).unwrap());
    let key = rule.key_for(&ClientIdentity::user("race"), None);

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let (engine, rule, key) = (engine.clone(), rule.clone(), key.clone());
            tokio::spawn(async move { engine.check_rule(&rule, &key).await.admitted })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 20);
    engine.clear(&key).await.unwrap();
}
