use axum::http::Method;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, iter, str::FromStr, sync::Arc, time::Duration};

use crate::{
    access::{AccessEntry, AccessList, ListKind},
    error::{RateLimitError, Result},
    identity::IdentityConfig,
    policy::{CallerClass, Policy, PolicySelector, RoutePolicy, TieredPolicy},
    redis::RedisConfig,
    rules::{self, RateLimitRule, RuleRegistry},
    utils::{Clock, Unit},
};

/// Time units for rate limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl From<RateLimitUnit> for Unit {
    fn from(unit: RateLimitUnit) -> Self {
        match unit {
            RateLimitUnit::Second => Unit::Second,
            RateLimitUnit::Minute => Unit::Minute,
            RateLimitUnit::Hour => Unit::Hour,
            RateLimitUnit::Day => Unit::Day,
        }
    }
}

fn one() -> u32 {
    1
}

/// A rule as written in the policy file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: Option<String>,
    pub requests_per_unit: u64,
    pub unit: RateLimitUnit,
    /// Window length in `unit`s
    #[serde(default = "one")]
    pub units: u32,
    pub key_prefix: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub per_method: bool,
}

impl RuleConfig {
    /// Build the rule, naming it `fallback_name` when the file gives no name
    pub fn compile(&self, fallback_name: &str) -> Result<RateLimitRule> {
        let name = self.name.clone().unwrap_or_else(|| fallback_name.to_string());
        let window = Unit::from(self.unit).window(self.units);
        let mut rule = RateLimitRule::new(name, self.requests_per_unit, window)?;
        if let Some(prefix) = &self.key_prefix {
            rule = rule.with_key_prefix(prefix.clone())?;
        }
        if let Some(message) = &self.message {
            rule = rule.with_violation_message(message.clone());
        }
        Ok(rule.per_method(self.per_method))
    }
}

/// One policy attached to a route
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyEntry {
    Static { rule: RuleConfig },
    Tiered { tiers: HashMap<CallerClass, RuleConfig> },
    Named { rule: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<String>,
    pub policies: Vec<PolicyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEntryConfig {
    pub pattern: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl AccessEntryConfig {
    pub fn compile(&self) -> Result<AccessEntry> {
        let mut entry = AccessEntry::new(self.pattern.clone())?;
        if let Some(at) = self.expires_at {
            entry = entry.expires_at(at);
        }
        if let Some(reason) = &self.reason {
            entry = entry.with_reason(reason.clone());
        }
        Ok(entry)
    }
}

/// Policy file: rules, routes and access overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub default_rule: RuleConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Class-based quotas for requests that match no route
    pub tiers: Option<HashMap<CallerClass, RuleConfig>>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub allow: Vec<AccessEntryConfig>,
    #[serde(default)]
    pub deny: Vec<AccessEntryConfig>,
    #[serde(default)]
    pub exempt_paths: Vec<String>,
}

/// Runtime state built from a [`PolicyConfig`]
pub struct CompiledPolicy {
    pub registry: Arc<RuleRegistry>,
    pub access: Arc<AccessList>,
    pub selector: PolicySelector,
}

fn compile_tiers(tiers: &HashMap<CallerClass, RuleConfig>, scope: &str) -> Result<TieredPolicy> {
    let mut policy = TieredPolicy::new();
    for (class, rule) in tiers {
        let rule = rule.compile(&format!("{}_{}", scope, class))?;
        policy = policy.with_tier(*class, rule);
    }
    Ok(policy)
}

fn parse_methods(methods: &[String]) -> Result<Vec<Method>> {
    methods
        .iter()
        .map(|m| {
            Method::from_str(&m.to_ascii_uppercase())
                .map_err(|_| RateLimitError::Config(format!("invalid HTTP method {:?}", m)))
        })
        .collect()
}

/// Route-scoped name for an unnamed inline rule, e.g. `api_checkout_0`
fn route_scope(path: &str) -> String {
    let scope: String = path
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if scope.is_empty() {
        "root".to_string()
    } else {
        scope
    }
}

impl PolicyConfig {
    /// Validate every rule and entry and build the registry, access list and
    /// selector. Nothing is returned unless the whole file is valid. Rule
    /// names and key prefixes must be unique across the default rule, named
    /// rules, tiers and inline route rules.
    pub fn compile(&self, clock: Arc<dyn Clock>) -> Result<CompiledPolicy> {
        let registry = Arc::new(RuleRegistry::new(self.default_rule.compile("default")?));

        for rule in &self.rules {
            if rule.name.is_none() {
                return Err(RateLimitError::InvalidRule(
                    "registered rules must have a name".to_string(),
                ));
            }
            let rule = rule.compile("")?;
            let name = rule.name().to_string();
            if registry.upsert(rule)?.is_some() {
                return Err(RateLimitError::InvalidRule(format!(
                    "rule {} is defined more than once",
                    name
                )));
            }
        }

        let mut selector = PolicySelector::new(registry.clone());

        if let Some(tiers) = &self.tiers {
            selector = selector.with_fallback_tiers(compile_tiers(tiers, "tier")?);
        }

        for route in &self.routes {
            let scope = route_scope(&route.path);
            let mut policies = Vec::with_capacity(route.policies.len());
            for (i, entry) in route.policies.iter().enumerate() {
                let policy = match entry {
                    PolicyEntry::Static { rule } => {
                        Policy::fixed(rule.compile(&format!("{}_{}", scope, i))?)
                    }
                    PolicyEntry::Tiered { tiers } => {
                        Policy::Tiered(compile_tiers(tiers, &format!("{}_{}", scope, i))?)
                    }
                    PolicyEntry::Named { rule } => Policy::named(rule.clone()),
                };
                policies.push(policy);
            }
            let methods = parse_methods(&route.methods)?;
            selector = selector.with_route(RoutePolicy::new(route.path.clone(), policies)?.with_methods(methods));
        }

        let default_rule = registry.default_rule();
        let named = registry.list_active();
        rules::ensure_distinct(
            iter::once(&default_rule)
                .chain(named.iter())
                .chain(selector.inline_rules())
                .map(|r| &**r),
        )?;

        for path in &self.exempt_paths {
            selector = selector.with_exempt_path(path.clone());
        }

        let access = Arc::new(AccessList::with_clock(clock));
        for entry in &self.allow {
            access.add(ListKind::Allow, entry.compile()?);
        }
        for entry in &self.deny {
            access.add(ListKind::Deny, entry.compile()?);
        }

        Ok(CompiledPolicy {
            registry,
            access,
            selector,
        })
    }
}

/// Load a policy from a YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<PolicyConfig> {
    serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Load a policy from a YAML file
pub fn load_config_from_file(path: &str) -> Result<PolicyConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub key_prefix: String,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        let defaults = RedisConfig::default();
        Self {
            url: defaults.url,
            key_prefix: defaults.key_prefix,
            connection_timeout_ms: 5_000,
            command_timeout_ms: 1_000,
        }
    }
}

impl From<RedisSettings> for RedisConfig {
    fn from(settings: RedisSettings) -> Self {
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        RedisConfig {
            url: settings.url,
            key_prefix: settings.key_prefix,
            connection_timeout: millis(settings.connection_timeout_ms),
            command_timeout: millis(settings.command_timeout_ms),
        }
    }
}

/// Process settings, layered from an optional file and `RATELIMIT__*`
/// environment variables (e.g. `RATELIMIT__REDIS__URL`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listener for gated storefront traffic
    pub http_addr: String,
    /// Listener for `/admin`, `/metrics` and `/healthcheck`; loopback by default
    pub admin_addr: String,
    pub store: StoreKind,
    pub redis: RedisSettings,
    pub identity: IdentityConfig,
    pub policy_file: Option<String>,
    /// How often expired allow/deny entries and counters are dropped; 0 disables
    pub purge_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            admin_addr: "127.0.0.1:8081".to_string(),
            store: StoreKind::Memory,
            redis: RedisSettings::default(),
            identity: IdentityConfig::default(),
            policy_file: None,
            purge_interval_secs: 60,
        }
    }
}

impl Settings {
    /// Load settings from `file` (if it exists) overlaid with the environment
    pub fn load(file: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("RATELIMIT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RateLimitError::Config(format!("Failed to load settings: {}", e)))
    }
}
