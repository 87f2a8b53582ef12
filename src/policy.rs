use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};
use tracing::warn;

use crate::{
    error::{RateLimitError, Result},
    rules::{self, RateLimitRule, RuleRegistry},
};

/// Caller tier label issued by the auth layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerClass {
    Anonymous,
    Authenticated,
    Elevated,
}

impl CallerClass {
    pub fn as_str(self) -> &'static str {
        match self {
            CallerClass::Anonymous => "anonymous",
            CallerClass::Authenticated => "authenticated",
            CallerClass::Elevated => "elevated",
        }
    }
}

impl fmt::Display for CallerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallerClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymous" => Ok(CallerClass::Anonymous),
            "authenticated" => Ok(CallerClass::Authenticated),
            "elevated" => Ok(CallerClass::Elevated),
            other => Err(format!("unknown caller class {:?}", other)),
        }
    }
}

/// Per-class rules; classes without a tier use the registry default
#[derive(Debug, Clone, Default)]
pub struct TieredPolicy {
    tiers: HashMap<CallerClass, Arc<RateLimitRule>>,
}

impl TieredPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tier(mut self, class: CallerClass, rule: RateLimitRule) -> Self {
        self.tiers.insert(class, Arc::new(rule));
        self
    }

    pub fn rule_for(&self, class: CallerClass) -> Option<Arc<RateLimitRule>> {
        self.tiers.get(&class).cloned()
    }

    fn rules(&self) -> impl Iterator<Item = &Arc<RateLimitRule>> {
        self.tiers.values()
    }
}

#[derive(Debug, Clone)]
pub enum Policy {
    /// One rule for every caller of the route
    Static(Arc<RateLimitRule>),
    /// Rule chosen by caller class
    Tiered(TieredPolicy),
    /// Rule looked up by name in the registry at request time
    Named(String),
}

impl Policy {
    pub fn fixed(rule: RateLimitRule) -> Self {
        Policy::Static(Arc::new(rule))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Policy::Named(name.into())
    }
}

/// Policies attached to a path prefix and optional method set
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    path_prefix: String,
    methods: Vec<Method>,
    policies: Vec<Policy>,
}

impl RoutePolicy {
    pub fn new(path_prefix: impl Into<String>, policies: Vec<Policy>) -> Result<Self> {
        let path_prefix = path_prefix.into();
        if !path_prefix.starts_with('/') {
            return Err(RateLimitError::Config(format!(
                "route prefix {:?} must start with '/'",
                path_prefix
            )));
        }
        Ok(Self {
            path_prefix,
            methods: Vec::new(),
            policies,
        })
    }

    /// Restrict the route to these methods; empty means any method
    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    fn matches(&self, method: Option<&Method>, path: &str) -> bool {
        let method_ok = self.methods.is_empty()
            || method.map(|m| self.methods.contains(m)).unwrap_or(false);
        method_ok && path_has_prefix(path, &self.path_prefix)
    }
}

/// Prefix match on path segment boundaries: `/api/orders` matches
/// `/api/orders/7` but not `/api/ordersx`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// Route being gated
#[derive(Debug, Clone, Copy)]
pub struct RouteId<'a> {
    pub method: Option<&'a Method>,
    pub path: &'a str,
}

/// Maps a caller class and route to the rules that apply to the request
pub struct PolicySelector {
    registry: Arc<RuleRegistry>,
    routes: Vec<RoutePolicy>,
    fallback: Option<TieredPolicy>,
    exempt_paths: Vec<String>,
}

impl PolicySelector {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            routes: Vec::new(),
            fallback: None,
            exempt_paths: Vec::new(),
        }
    }

    /// Add a route; longer prefixes are matched first
    pub fn with_route(mut self, route: RoutePolicy) -> Self {
        self.routes.push(route);
        self.routes
            .sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        self
    }

    /// Tiered policy for requests that match no route
    pub fn with_fallback_tiers(mut self, tiers: TieredPolicy) -> Self {
        self.fallback = Some(tiers);
        self
    }

    /// Paths that are never rate limited
    pub fn with_exempt_path(mut self, prefix: impl Into<String>) -> Self {
        self.exempt_paths.push(prefix.into());
        self
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| path_has_prefix(path, p))
    }

    /// Rules that apply to this caller on this route, in check order.
    /// Empty for exempt paths. Policies that resolve to the same key prefix
    /// (e.g. two falling back to the default rule) yield that rule once.
    pub fn select(&self, class: CallerClass, route: RouteId<'_>) -> Vec<Arc<RateLimitRule>> {
        if self.is_exempt(route.path) {
            return Vec::new();
        }

        match self.routes.iter().find(|r| r.matches(route.method, route.path)) {
            Some(matched) => {
                let mut selected: Vec<Arc<RateLimitRule>> = Vec::with_capacity(matched.policies.len());
                for rule in matched.policies.iter().map(|policy| self.resolve(policy, class)) {
                    if !selected.iter().any(|r| r.key_prefix() == rule.key_prefix()) {
                        selected.push(rule);
                    }
                }
                selected
            }
            None => match &self.fallback {
                Some(tiers) => vec![tiers
                    .rule_for(class)
                    .unwrap_or_else(|| self.registry.default_rule())],
                None => vec![self.registry.default_rule()],
            },
        }
    }

    fn resolve(&self, policy: &Policy, class: CallerClass) -> Arc<RateLimitRule> {
        match policy {
            Policy::Static(rule) => rule.clone(),
            Policy::Tiered(tiers) => tiers
                .rule_for(class)
                .unwrap_or_else(|| self.registry.default_rule()),
            Policy::Named(name) => self.registry.get(name).unwrap_or_else(|_| {
                warn!(rule = %name, "Named rate limit rule not registered, using default rule");
                self.registry.default_rule()
            }),
        }
    }

    /// Look up any rule the selector can apply: registry rules, the default
    /// rule, and rules defined inline on routes or tiers.
    pub fn find_rule(&self, name: &str) -> Result<Arc<RateLimitRule>> {
        if let Ok(rule) = self.registry.get(name) {
            return Ok(rule);
        }
        let default_rule = self.registry.default_rule();
        if default_rule.name() == name {
            return Ok(default_rule);
        }

        self.inline_rules()
            .find(|r| r.name() == name)
            .cloned()
            .ok_or_else(|| RateLimitError::UnknownRule(name.to_string()))
    }

    /// Rules defined inline on routes and fallback tiers
    pub fn inline_rules(&self) -> impl Iterator<Item = &Arc<RateLimitRule>> + '_ {
        self.routes
            .iter()
            .flat_map(|r| r.policies.iter())
            .flat_map(|p| -> Vec<&Arc<RateLimitRule>> {
                match p {
                    Policy::Static(rule) => vec![rule],
                    Policy::Tiered(tiers) => tiers.rules().collect(),
                    Policy::Named(_) => Vec::new(),
                }
            })
            .chain(self.fallback.iter().flat_map(|t| t.rules()))
    }

    /// Fails when `rule` reuses the name or key prefix of an inline rule
    pub fn ensure_unclaimed_inline(&self, rule: &RateLimitRule) -> Result<()> {
        rules::ensure_unclaimed(rule, self.inline_rules().map(|r| &**r))
    }
}
