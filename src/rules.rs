use arc_swap::ArcSwap;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    iter,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::info;

use crate::{
    error::{RateLimitError, Result},
    identity::ClientIdentity,
};

/// A validated rate limit rule.
///
/// Rules are shared as `Arc<RateLimitRule>` and never mutated; updating a
/// rule publishes a new value under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitRule {
    name: String,
    requests_allowed: u64,
    #[serde(rename = "window_secs", serialize_with = "serialize_secs")]
    window: Duration,
    key_prefix: String,
    violation_message: Option<String>,
    per_method: bool,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl RateLimitRule {
    /// Build a rule, rejecting a zero quota and windows shorter than one
    /// second. The key prefix defaults to the rule name.
    pub fn new(name: impl Into<String>, requests_allowed: u64, window: Duration) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RateLimitError::InvalidRule("rule name must not be empty".to_string()));
        }
        if requests_allowed == 0 {
            return Err(RateLimitError::InvalidRule(format!(
                "rule {} must allow at least one request",
                name
            )));
        }
        if window < Duration::from_secs(1) {
            return Err(RateLimitError::InvalidRule(format!(
                "rule {} must have a window of at least one second",
                name
            )));
        }

        Ok(Self {
            key_prefix: name.clone(),
            name,
            requests_allowed,
            window,
            violation_message: None,
            per_method: false,
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.trim().is_empty() {
            return Err(RateLimitError::InvalidRule(format!(
                "rule {} has an empty key prefix",
                self.name
            )));
        }
        self.key_prefix = prefix;
        Ok(self)
    }

    pub fn with_violation_message(mut self, message: impl Into<String>) -> Self {
        self.violation_message = Some(message.into());
        self
    }

    /// Keep separate counters per HTTP method
    pub fn per_method(mut self, enabled: bool) -> Self {
        self.per_method = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requests_allowed(&self) -> u64 {
        self.requests_allowed
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn violation_message(&self) -> Option<&str> {
        self.violation_message.as_deref()
    }

    pub fn is_per_method(&self) -> bool {
        self.per_method
    }

    /// Counter key for a caller under this rule
    pub fn key_for(&self, identity: &ClientIdentity, method: Option<&str>) -> RateLimitKey {
        let method = if self.per_method { method } else { None };
        RateLimitKey::new(&self.key_prefix, method, identity)
    }
}

/// Store key for one (rule, caller) pair: `prefix:[method:]identity`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(prefix: &str, method: Option<&str>, identity: &ClientIdentity) -> Self {
        match method {
            Some(m) if !m.is_empty() => {
                Self(format!("{}:{}:{}", prefix, m.to_ascii_uppercase(), identity))
            }
            _ => Self(format!("{}:{}", prefix, identity)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fails when `rule` shares a name or key prefix with any of `others`.
/// Rules with one prefix would count into the same keys.
pub fn ensure_unclaimed<'a>(
    rule: &RateLimitRule,
    others: impl IntoIterator<Item = &'a RateLimitRule>,
) -> Result<()> {
    for other in others {
        if other.name() == rule.name() {
            return Err(RateLimitError::InvalidRule(format!(
                "rule name {} is already in use",
                rule.name()
            )));
        }
        if other.key_prefix() == rule.key_prefix() {
            return Err(RateLimitError::InvalidRule(format!(
                "key prefix {} of rule {} is already used by rule {}",
                rule.key_prefix(),
                rule.name(),
                other.name()
            )));
        }
    }
    Ok(())
}

/// Fails on the first duplicate name or key prefix in `rules`
pub fn ensure_distinct<'a>(rules: impl IntoIterator<Item = &'a RateLimitRule>) -> Result<()> {
    let mut names = HashSet::new();
    let mut prefixes: HashMap<&str, &str> = HashMap::new();
    for rule in rules {
        if !names.insert(rule.name()) {
            return Err(RateLimitError::InvalidRule(format!(
                "rule {} is defined more than once",
                rule.name()
            )));
        }
        if let Some(owner) = prefixes.insert(rule.key_prefix(), rule.name()) {
            return Err(RateLimitError::InvalidRule(format!(
                "rules {} and {} share key prefix {}",
                owner,
                rule.name(),
                rule.key_prefix()
            )));
        }
    }
    Ok(())
}

type RuleMap = HashMap<String, Arc<RateLimitRule>>;

/// Named rules plus a default rule.
///
/// Readers take lock-free snapshots; writers serialise on a mutex and publish
/// a whole new map, so a reader sees either the old or the new rule set.
pub struct RuleRegistry {
    rules: ArcSwap<RuleMap>,
    default_rule: ArcSwap<RateLimitRule>,
    write_lock: Mutex<()>,
}

impl RuleRegistry {
    pub fn new(default_rule: RateLimitRule) -> Self {
        Self {
            rules: ArcSwap::from_pointee(HashMap::new()),
            default_rule: ArcSwap::from_pointee(default_rule),
            write_lock: Mutex::new(()),
        }
    }

    /// Insert or replace a rule by name. Another rule's name or key prefix
    /// (the default rule included) is rejected with `InvalidRule`.
    pub fn upsert(&self, rule: RateLimitRule) -> Result<Option<Arc<RateLimitRule>>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.rules.load();
        let default_rule = self.default_rule.load();
        ensure_unclaimed(
            &rule,
            current
                .values()
                .filter(|r| r.name() != rule.name())
                .map(|r| &**r)
                .chain(iter::once(&**default_rule)),
        )?;

        let mut next: RuleMap = HashMap::clone(&current);
        let name = rule.name().to_string();
        let previous = next.insert(name.clone(), Arc::new(rule));
        self.rules.store(Arc::new(next));
        info!(rule = %name, replaced = previous.is_some(), "Rate limit rule registered");
        Ok(previous)
    }

    pub fn get(&self, name: &str) -> Result<Arc<RateLimitRule>> {
        self.rules
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| RateLimitError::UnknownRule(name.to_string()))
    }

    pub fn remove(&self, name: &str) -> Result<Arc<RateLimitRule>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next: RuleMap = HashMap::clone(&self.rules.load());
        let removed = next
            .remove(name)
            .ok_or_else(|| RateLimitError::UnknownRule(name.to_string()))?;
        self.rules.store(Arc::new(next));
        info!(rule = %name, "Rate limit rule removed");
        Ok(removed)
    }

    /// All named rules, sorted by name
    pub fn list_active(&self) -> Vec<Arc<RateLimitRule>> {
        let mut rules: Vec<_> = self.rules.load().values().cloned().collect();
        rules.sort_by(|a, b| a.name().cmp(b.name()));
        rules
    }

    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn default_rule(&self) -> Arc<RateLimitRule> {
        self.default_rule.load_full()
    }

    /// Replace the default rule; it may not reuse a named rule's name or prefix
    pub fn set_default(&self, rule: RateLimitRule) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        ensure_unclaimed(&rule, self.rules.load().values().map(|r| &**r))?;
        info!(rule = %rule.name(), "Default rate limit rule replaced");
        self.default_rule.store(Arc::new(rule));
        Ok(())
    }

    /// Named rule, or the default rule when the name is unknown
    pub fn get_or_default(&self, name: &str) -> Arc<RateLimitRule> {
        self.get(name).unwrap_or_else(|_| self.default_rule())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, n: u64) -> RateLimitRule {
        RateLimitRule::new(name, n, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_rule_validation() {
        assert!(matches!(
            RateLimitRule::new("zero", 0, Duration::from_secs(1)),
            Err(RateLimitError::InvalidRule(_))
        ));
        assert!(matches!(
            RateLimitRule::new("instant", 1, Duration::ZERO),
            Err(RateLimitError::InvalidRule(_))
        ));
        assert!(matches!(
            RateLimitRule::new("burst", 1, Duration::from_millis(500)),
            Err(RateLimitError::InvalidRule(_))
        ));
        assert!(RateLimitRule::new("burst", 1, Duration::from_secs(1)).is_ok());
        assert!(matches!(
            RateLimitRule::new(" ", 1, Duration::from_secs(1)),
            Err(RateLimitError::InvalidRule(_))
        ));
        assert!(rule("ok", 1).with_key_prefix("").is_err());
    }

    #[test]
    fn test_key_format() {
        let identity = ClientIdentity::ip("1.2.3.4");
        let login = rule("login", 5).with_key_prefix("auth").unwrap();
        assert_eq!(login.key_for(&identity, Some("post")).as_str(), "auth:ip:1.2.3.4");

        let login = login.per_method(true);
        assert_eq!(login.key_for(&identity, Some("post")).as_str(), "auth:POST:ip:1.2.3.4");
        assert_eq!(login.key_for(&identity, None).as_str(), "auth:ip:1.2.3.4");
    }

    #[test]
    fn test_distinct_prefixes_do_not_collide() {
        let identity = ClientIdentity::user("42");
        assert_ne!(rule("a", 1).key_for(&identity, None), rule("b", 1).key_for(&identity, None));
    }

    #[test]
    fn test_registry_crud() {
        let registry = RuleRegistry::new(rule("default", 100));
        assert!(registry.is_empty());

        assert!(registry.upsert(rule("login", 5)).unwrap().is_none());
        assert!(registry.upsert(rule("search", 30)).unwrap().is_none());
        assert_eq!(registry.get("login").unwrap().requests_allowed(), 5);

        let previous = registry.upsert(rule("login", 10)).unwrap().unwrap();
        assert_eq!(previous.requests_allowed(), 5);
        assert_eq!(registry.get("login").unwrap().requests_allowed(), 10);

        let names: Vec<_> = registry.list_active().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["login", "search"]);

        registry.remove("login").unwrap();
        assert!(matches!(registry.get("login"), Err(RateLimitError::UnknownRule(_))));
        assert!(matches!(registry.remove("login"), Err(RateLimitError::UnknownRule(_))));
        assert_eq!(registry.get_or_default("login").name(), "default");
    }

    #[test]
    fn test_registry_rejects_shared_key_prefix() {
        let registry = RuleRegistry::new(rule("default", 100));
        registry.upsert(rule("search", 50)).unwrap();

        let clash = rule("login", 5).with_key_prefix("search").unwrap();
        assert!(matches!(registry.upsert(clash), Err(RateLimitError::InvalidRule(_))));
        let clash = rule("login", 5).with_key_prefix("default").unwrap();
        assert!(matches!(registry.upsert(clash), Err(RateLimitError::InvalidRule(_))));
        assert!(matches!(registry.upsert(rule("default", 5)), Err(RateLimitError::InvalidRule(_))));
        assert!(registry.get("login").is_err());

        // replacing a rule under its own name keeps its prefix
        assert!(registry.upsert(rule("search", 10)).unwrap().is_some());

        let clash = rule("fallback", 10).with_key_prefix("search").unwrap();
        assert!(matches!(registry.set_default(clash), Err(RateLimitError::InvalidRule(_))));
        assert_eq!(registry.default_rule().name(), "default");
        registry.set_default(rule("fallback", 10)).unwrap();
        assert_eq!(registry.default_rule().name(), "fallback");
    }

    #[test]
    fn test_ensure_distinct() {
        let a = rule("a", 1);
        let b = rule("b", 1);
        assert!(ensure_distinct([&a, &b]).is_ok());
        assert!(ensure_distinct([&a, &rule("a", 2)]).is_err());
        let shared = rule("c", 1).with_key_prefix("a").unwrap();
        assert!(matches!(ensure_distinct([&a, &b, &shared]), Err(RateLimitError::InvalidRule(_))));
    }

    #[test]
    fn test_snapshot_survives_replacement() {
        let registry = RuleRegistry::new(rule("default", 100));
        registry.upsert(rule("login", 5)).unwrap();
        let held = registry.get("login").unwrap();
        registry.upsert(rule("login", 50)).unwrap();
        assert_eq!(held.requests_allowed(), 5);
        assert_eq!(registry.get("login").unwrap().requests_allowed(), 50);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_rules() {
        let registry = Arc::new(RuleRegistry::new(rule("default", 100)));
        registry.upsert(rule("hot", 1)).unwrap();

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for n in 1..=500u64 {
                    let r = RateLimitRule::new("hot", n, Duration::from_secs(n))
                        .unwrap()
                        .with_key_prefix(format!("hot{}", n))
                        .unwrap();
                    registry.upsert(r).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let r = registry.get("hot").unwrap();
                        if r.key_prefix() != "hot" {
                            assert_eq!(r.window().as_secs(), r.requests_allowed());
                            assert_eq!(r.key_prefix(), format!("hot{}", r.requests_allowed()));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
