use anyhow::Result;
use axum::{
    extract::State, http::StatusCode, middleware, response::Json, routing::get, Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storefront_ratelimit::{
    access::AccessList,
    admin,
    config::{load_config_from_file, CompiledPolicy, Settings, StoreKind},
    engine::AdmissionEngine,
    gate::{rate_limit_middleware, GateConfig, RateLimitGate},
    identity::IdentityResolver,
    metrics::Metrics,
    policy::PolicySelector,
    redis::RedisCounterStore,
    rules::{RateLimitRule, RuleRegistry},
    service::RateLimitService,
    store::{CounterStore, MemoryCounterStore},
    utils::{Clock, SystemClock},
};

#[derive(Clone)]
struct AppState {
    service: Arc<RateLimitService>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storefront_ratelimit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting storefront rate limit service");

    let settings_file =
        std::env::var("RATELIMIT_CONFIG").unwrap_or_else(|_| "ratelimit.yaml".to_string());
    let settings = Settings::load(&settings_file)?;

    let metrics = Arc::new(Metrics::new()?);
    let service = create_service(&settings, metrics.clone()).await?;
    let state = AppState {
        service: service.clone(),
        metrics,
    };

    if settings.purge_interval_secs > 0 {
        spawn_purge_task(service.clone(), Duration::from_secs(settings.purge_interval_secs));
    }

    let http_addr = settings.http_addr.parse::<SocketAddr>()?;
    let admin_addr = settings.admin_addr.parse::<SocketAddr>()?;
    if admin_addr == http_addr {
        anyhow::bail!("admin_addr must differ from http_addr");
    }
    if !admin_addr.ip().is_loopback() {
        warn!("Admin server bound to non-loopback address {}; /admin has no authentication", admin_addr);
    }

    let http_server = start_http_server(state.clone(), http_addr);
    let admin_server = start_admin_server(state, admin_addr);

    info!("HTTP server listening on {}", http_addr);
    info!("Admin server listening on {}", admin_addr);

    // Wait for shutdown signal
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        result = admin_server => {
            if let Err(e) = result {
                warn!("Admin server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

async fn create_store(settings: &Settings) -> Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match settings.store {
        StoreKind::Memory => {
            warn!("Using the in-memory counter store; limits are not shared between processes");
            Arc::new(MemoryCounterStore::new())
        }
        StoreKind::Redis => Arc::new(RedisCounterStore::new(settings.redis.clone().into()).await?),
    };
    Ok(store)
}

fn load_policy(settings: &Settings, clock: Arc<dyn Clock>) -> Result<CompiledPolicy> {
    match &settings.policy_file {
        Some(path) => {
            info!("Loading rate limit policy from: {}", path);
            let policy = load_config_from_file(path)?.compile(clock)?;
            info!(
                rules = policy.registry.len(),
                "Rate limit policy loaded successfully"
            );
            Ok(policy)
        }
        None => {
            warn!("No policy file configured, applying the built-in default rule to every route");
            let registry = Arc::new(RuleRegistry::new(RateLimitRule::new(
                "default",
                100,
                Duration::from_secs(60),
            )?));
            Ok(CompiledPolicy {
                selector: PolicySelector::new(registry.clone()),
                registry,
                access: Arc::new(AccessList::with_clock(clock)),
            })
        }
    }
}

async fn create_service(settings: &Settings, metrics: Arc<Metrics>) -> Result<Arc<RateLimitService>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store = create_store(settings).await?;
    let policy = load_policy(settings, clock.clone())?;

    let gate = RateLimitGate::new(GateConfig {
        resolver: IdentityResolver::new(settings.identity.clone()),
        access: policy.access,
        selector: policy.selector,
        engine: AdmissionEngine::with_clock(store, metrics.clone(), clock),
        metrics,
    });

    Ok(Arc::new(RateLimitService::new(Arc::new(gate))))
}

fn spawn_purge_task(service: Arc<RateLimitService>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match service.purge_expired().await {
                Ok(report) if report.access_entries > 0 || report.counters > 0 => info!(
                    access_entries = report.access_entries,
                    counters = report.counters,
                    "Purged expired entries"
                ),
                Ok(_) => {}
                Err(e) => warn!("Purge failed: {}", e),
            }
        }
    });
}

/// Gated storefront routes; nothing operator-facing
fn public_router(state: &AppState) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .layer(middleware::from_fn_with_state(
            state.service.gate().clone(),
            rate_limit_middleware,
        ))
}

/// Health, metrics and the admin API
fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone())
        .nest("/admin", admin::router(state.service))
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let app = public_router(&state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn start_admin_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, admin_router(state)).await?;

    Ok(())
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "pong": true }))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.service.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
