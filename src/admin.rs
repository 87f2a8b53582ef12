use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::{
    access::ListKind,
    config::{AccessEntryConfig, RuleConfig},
    error::{RateLimitError, Result},
    identity::ClientIdentity,
    service::RateLimitService,
};

type AdminState = State<Arc<RateLimitService>>;

#[derive(Debug, Deserialize)]
pub struct TargetQuery {
    /// Identity tag such as `ip:1.2.3.4` or `user:42`
    pub identity: String,
    pub method: Option<String>,
}

impl TargetQuery {
    fn identity(&self) -> Result<ClientIdentity> {
        self.identity.parse().map_err(RateLimitError::Config)
    }
}

#[derive(Debug, Deserialize)]
pub struct PatternQuery {
    pub pattern: String,
}

/// JSON operator routes over [`RateLimitService`], nested under `/admin`
pub fn router(service: Arc<RateLimitService>) -> Router {
    Router::new()
        .route("/rules", get(list_rules).post(upsert_rule))
        .route("/rules/:name", get(get_rule).delete(delete_rule))
        .route("/default_rule", get(get_default_rule).put(set_default_rule))
        .route(
            "/access/:list",
            get(list_entries).post(add_entry).delete(remove_entry),
        )
        .route("/access/purge", post(purge_expired))
        .route("/quota/:rule", get(query_quota).delete(clear_quota))
        .with_state(service)
}

async fn list_rules(State(service): AdminState) -> Response {
    let rules = service.list_rules();
    Json(json!({
        "default_rule": service.default_rule(),
        "rules": rules,
    }))
    .into_response()
}

async fn upsert_rule(State(service): AdminState, Json(body): Json<RuleConfig>) -> Result<Response> {
    let name = body
        .name
        .clone()
        .ok_or_else(|| RateLimitError::InvalidRule("rule name is required".to_string()))?;
    let rule = body.compile(&name)?;
    let status = match service.upsert_rule(rule)? {
        Some(_) => StatusCode::OK,
        None => StatusCode::CREATED,
    };
    let rule = service.get_rule(&name)?;
    Ok((status, Json(rule)).into_response())
}

async fn get_rule(State(service): AdminState, Path(name): Path<String>) -> Result<Response> {
    Ok(Json(service.get_rule(&name)?).into_response())
}

async fn delete_rule(State(service): AdminState, Path(name): Path<String>) -> Result<Response> {
    service.delete_rule(&name)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn get_default_rule(State(service): AdminState) -> Response {
    Json(service.default_rule()).into_response()
}

async fn set_default_rule(State(service): AdminState, Json(body): Json<RuleConfig>) -> Result<Response> {
    service.set_default_rule(body.compile("default")?)?;
    Ok(Json(service.default_rule()).into_response())
}

fn list_kind(list: &str) -> Result<ListKind> {
    match list {
        "allow" => Ok(ListKind::Allow),
        "deny" => Ok(ListKind::Deny),
        other => Err(RateLimitError::Config(format!("unknown access list {:?}", other))),
    }
}

async fn list_entries(State(service): AdminState, Path(list): Path<String>) -> Result<Response> {
    let kind = list_kind(&list)?;
    Ok(Json(service.list_access_entries(kind)).into_response())
}

async fn add_entry(
    State(service): AdminState,
    Path(list): Path<String>,
    Json(body): Json<AccessEntryConfig>,
) -> Result<Response> {
    let kind = list_kind(&list)?;
    let entry = body.compile()?;
    service.add_access_entry(kind, entry.clone());
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

async fn remove_entry(
    State(service): AdminState,
    Path(list): Path<String>,
    Query(query): Query<PatternQuery>,
) -> Result<Response> {
    let kind = list_kind(&list)?;
    let status = if service.remove_access_entry(kind, &query.pattern) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    };
    Ok(status.into_response())
}

async fn purge_expired(State(service): AdminState) -> Result<Response> {
    Ok(Json(service.purge_expired().await?).into_response())
}

async fn query_quota(
    State(service): AdminState,
    Path(rule): Path<String>,
    Query(target): Query<TargetQuery>,
) -> Result<Response> {
    let identity = target.identity()?;
    let status = service
        .query(&rule, &identity, target.method.as_deref())
        .await?;
    Ok(Json(status).into_response())
}

async fn clear_quota(
    State(service): AdminState,
    Path(rule): Path<String>,
    Query(target): Query<TargetQuery>,
) -> Result<Response> {
    let identity = target.identity()?;
    service
        .clear(&rule, &identity, target.method.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
