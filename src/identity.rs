use axum::http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, str::FromStr};

use crate::policy::CallerClass;

/// Caller identity supplied by the external auth layer as a request extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedCaller {
    pub user_id: String,
    pub class: CallerClass,
}

impl AuthenticatedCaller {
    pub fn new(user_id: impl Into<String>, class: CallerClass) -> Self {
        Self {
            user_id: user_id.into(),
            class,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    User,
    ApiKey,
    Ip,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityKind::User => "user",
            IdentityKind::ApiKey => "api_key",
            IdentityKind::Ip => "ip",
        }
    }
}

/// Tagged caller identity, rendered as `kind:value`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    kind: IdentityKind,
    value: String,
}

impl ClientIdentity {
    pub fn user(id: impl Into<String>) -> Self {
        Self { kind: IdentityKind::User, value: id.into() }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self { kind: IdentityKind::ApiKey, value: key.into() }
    }

    pub fn ip(addr: impl Into<String>) -> Self {
        Self { kind: IdentityKind::Ip, value: addr.into() }
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.value)
    }
}

impl FromStr for ClientIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("identity {:?} is missing a kind prefix", s))?;
        if value.is_empty() {
            return Err(format!("identity {:?} has an empty value", s));
        }
        match kind {
            "user" => Ok(Self::user(value)),
            "api_key" => Ok(Self::api_key(value)),
            "ip" => Ok(Self::ip(value)),
            other => Err(format!("unknown identity kind {:?}", other)),
        }
    }
}

/// Request metadata the gate needs, detached from the HTTP body
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub method: Option<Method>,
    pub path: String,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub caller: Option<AuthenticatedCaller>,
}

impl RequestMeta {
    pub fn caller_class(&self) -> CallerClass {
        self.caller
            .as_ref()
            .map(|c| c.class)
            .unwrap_or(CallerClass::Anonymous)
    }
}

/// Resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub api_key_header: String,
    /// Prefer `x-forwarded-for` / `x-real-ip` over the socket peer
    pub trust_forwarded_headers: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            api_key_header: "x-api-key".to_string(),
            trust_forwarded_headers: false,
        }
    }
}

/// Picks the counter partition key: authenticated user id, then API key,
/// then network address.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    config: IdentityConfig,
}

impl IdentityResolver {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    /// Resolve the caller's identity. Never returns an empty value.
    pub fn resolve(&self, request: &RequestMeta) -> ClientIdentity {
        if let Some(caller) = &request.caller {
            let id = caller.user_id.trim();
            if !id.is_empty() {
                return ClientIdentity::user(id);
            }
        }

        if let Some(key) = header_str(&request.headers, &self.config.api_key_header) {
            return ClientIdentity::api_key(key);
        }

        if self.config.trust_forwarded_headers {
            let forwarded = header_str(&request.headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded.or_else(|| header_str(&request.headers, "x-real-ip")) {
                return ClientIdentity::ip(ip);
            }
        }

        match request.remote_addr {
            Some(addr) => ClientIdentity::ip(addr.ip().to_string()),
            None => ClientIdentity::ip("unknown"),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
