use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::{fmt, net::SocketAddr, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    access::{AccessList, Verdict},
    engine::{AdmissionEngine, RateLimitInfo},
    error::RateLimitError,
    identity::{AuthenticatedCaller, ClientIdentity, IdentityResolver, RequestMeta},
    metrics::Metrics,
    policy::{PolicySelector, RouteId},
    rules::RateLimitRule,
};

/// Gate progress, used for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Start,
    IdentityResolved,
    Filtered,
    PolicySelected,
    Checked,
    Completed,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateState::Start => "start",
            GateState::IdentityResolved => "identity_resolved",
            GateState::Filtered => "filtered",
            GateState::PolicySelected => "policy_selected",
            GateState::Checked => "checked",
            GateState::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    /// Deny-listed; no quota was checked or consumed
    Denied {
        identity: ClientIdentity,
        reason: Option<String>,
    },
    /// Allow-listed or exempt path; passes without quota checks
    Bypassed { identity: ClientIdentity },
    /// Within quota for every applicable rule. `info` is the most restrictive
    /// non-degraded result, absent when every check failed open.
    Admitted {
        identity: ClientIdentity,
        info: Option<RateLimitInfo>,
    },
    /// Over quota for `rule`
    Rejected {
        identity: ClientIdentity,
        rule: Arc<RateLimitRule>,
        info: RateLimitInfo,
    },
}

impl GateDecision {
    pub fn identity(&self) -> &ClientIdentity {
        match self {
            GateDecision::Denied { identity, .. }
            | GateDecision::Bypassed { identity }
            | GateDecision::Admitted { identity, .. }
            | GateDecision::Rejected { identity, .. } => identity,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, GateDecision::Admitted { .. } | GateDecision::Bypassed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            GateDecision::Denied { .. } => "denied",
            GateDecision::Bypassed { .. } => "bypassed",
            GateDecision::Admitted { .. } => "admitted",
            GateDecision::Rejected { .. } => "rejected",
        }
    }
}

/// Everything the gate depends on, injected at construction
pub struct GateConfig {
    pub resolver: IdentityResolver,
    pub access: Arc<AccessList>,
    pub selector: PolicySelector,
    pub engine: AdmissionEngine,
    pub metrics: Arc<Metrics>,
}

/// Per-request admission gate. A request moves through identity resolution,
/// the allow/deny check, policy selection and the engine, and ends in exactly
/// one [`GateDecision`].
pub struct RateLimitGate {
    resolver: IdentityResolver,
    access: Arc<AccessList>,
    selector: PolicySelector,
    engine: AdmissionEngine,
    metrics: Arc<Metrics>,
}

impl RateLimitGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            resolver: config.resolver,
            access: config.access,
            selector: config.selector,
            engine: config.engine,
            metrics: config.metrics,
        }
    }

    pub fn access(&self) -> &Arc<AccessList> {
        &self.access
    }

    pub fn selector(&self) -> &PolicySelector {
        &self.selector
    }

    pub fn engine(&self) -> &AdmissionEngine {
        &self.engine
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run one request through the gate
    pub async fn evaluate(&self, request: &RequestMeta) -> GateDecision {
        let _timer = self.metrics.start_gate_timer();
        let decision = self.run(request).await;
        self.metrics.record_gate_decision(decision.label());
        debug!(
            state = %GateState::Completed,
            identity = %decision.identity(),
            decision = decision.label(),
            "Gate completed"
        );
        decision
    }

    async fn run(&self, request: &RequestMeta) -> GateDecision {
        debug!(state = %GateState::Start, path = %request.path, "Gate started");

        let identity = self.resolver.resolve(request);
        debug!(state = %GateState::IdentityResolved, identity = %identity, "Identity resolved");

        match self.access.verdict(&identity) {
            Verdict::Deny { reason } => {
                info!(identity = %identity, reason = ?reason, "Request rejected by deny list");
                return GateDecision::Denied { identity, reason };
            }
            Verdict::Allow => {
                debug!(state = %GateState::Filtered, identity = %identity, "Allow-listed, skipping quota");
                return GateDecision::Bypassed { identity };
            }
            Verdict::Neutral => {
                debug!(state = %GateState::Filtered, identity = %identity, "Not on any access list");
            }
        }

        let class = request.caller_class();
        let route = RouteId {
            method: request.method.as_ref(),
            path: &request.path,
        };
        let rules = self.selector.select(class, route);
        debug!(
            state = %GateState::PolicySelected,
            class = %class,
            rules = rules.len(),
            "Policies selected"
        );
        if rules.is_empty() {
            return GateDecision::Bypassed { identity };
        }

        let method = request.method.as_ref().map(|m| m.as_str());
        let mut tightest: Option<RateLimitInfo> = None;
        for rule in rules {
            let key = rule.key_for(&identity, method);
            let admission = self.engine.check_rule(&rule, &key).await;
            debug!(
                state = %GateState::Checked,
                rule = %rule.name(),
                admitted = admission.admitted,
                remaining = admission.info.remaining,
                "Rule checked"
            );

            if !admission.admitted {
                warn!(
                    identity = %identity,
                    rule = %rule.name(),
                    limit = admission.info.limit,
                    "Rate limit exceeded"
                );
                return GateDecision::Rejected {
                    identity,
                    rule,
                    info: admission.info,
                };
            }

            if !admission.info.degraded {
                let tighter = tightest
                    .as_ref()
                    .map(|t| admission.info.remaining < t.remaining)
                    .unwrap_or(true);
                if tighter {
                    tightest = Some(admission.info);
                }
            }
        }

        GateDecision::Admitted {
            identity,
            info: tightest,
        }
    }
}

/// Extract the gate's view of an axum request
pub fn request_meta(request: &Request) -> RequestMeta {
    RequestMeta {
        method: Some(request.method().clone()),
        path: request.uri().path().to_string(),
        headers: request.headers().clone(),
        remote_addr: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr),
        caller: request.extensions().get::<AuthenticatedCaller>().cloned(),
    }
}

fn denied_response(reason: Option<String>) -> Response {
    let body = json!({
        "error": "access_denied",
        "message": "Access denied",
        "reason": reason,
    });
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

/// axum middleware running every request through the gate.
///
/// ```ignore
/// let app = Router::new()
///     .route("/api/orders", get(list_orders))
///     .layer(axum::middleware::from_fn_with_state(gate, rate_limit_middleware));
/// ```
pub async fn rate_limit_middleware(
    State(gate): State<Arc<RateLimitGate>>,
    request: Request,
    next: Next,
) -> Response {
    let meta = request_meta(&request);

    match gate.evaluate(&meta).await {
        GateDecision::Denied { reason, .. } => denied_response(reason),
        GateDecision::Rejected { rule, info, .. } => RateLimitError::QuotaExceeded {
            rule: rule.name().to_string(),
            message: rule.violation_message().map(str::to_string),
            info,
        }
        .into_response(),
        GateDecision::Bypassed { .. } => next.run(request).await,
        GateDecision::Admitted { info, .. } => {
            let mut response = next.run(request).await;
            if let Some(info) = info {
                info.apply_headers(response.headers_mut());
            }
            response
        }
    }
}
