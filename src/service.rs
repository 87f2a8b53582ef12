use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::{
    access::{AccessEntry, ListKind},
    engine::RateLimitInfo,
    error::Result,
    gate::RateLimitGate,
    identity::ClientIdentity,
    metrics::Metrics,
    rules::{RateLimitKey, RateLimitRule},
};

/// Quota state for one rule and caller, as reported to operators
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub rule: String,
    pub key: String,
    pub info: RateLimitInfo,
}

/// What one purge pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub access_entries: usize,
    pub counters: usize,
}

/// Administrative operations over a running gate
pub struct RateLimitService {
    gate: Arc<RateLimitGate>,
    metrics: Arc<Metrics>,
}

impl RateLimitService {
    /// Create a new service around a gate
    pub fn new(gate: Arc<RateLimitGate>) -> Self {
        let metrics = gate.metrics().clone();
        let service = Self { gate, metrics };
        service.refresh_gauges();
        service
    }

    pub fn gate(&self) -> &Arc<RateLimitGate> {
        &self.gate
    }

    fn refresh_gauges(&self) {
        self.metrics
            .set_active_rules(self.gate.selector().registry().len());
        for (kind, label) in [(ListKind::Allow, "allow"), (ListKind::Deny, "deny")] {
            self.metrics
                .set_access_entries(label, self.gate.access().entries(kind).len());
        }
    }

    /// Add or replace a named rule. Counters already running under the old
    /// rule keep their window. A name or key prefix already used by another
    /// rule, inline route and tier rules included, is rejected.
    pub fn upsert_rule(&self, rule: RateLimitRule) -> Result<Option<Arc<RateLimitRule>>> {
        let selector = self.gate.selector();
        selector.ensure_unclaimed_inline(&rule)?;
        let previous = selector.registry().upsert(rule)?;
        self.refresh_gauges();
        Ok(previous)
    }

    pub fn delete_rule(&self, name: &str) -> Result<Arc<RateLimitRule>> {
        let removed = self.gate.selector().registry().remove(name)?;
        self.refresh_gauges();
        Ok(removed)
    }

    pub fn get_rule(&self, name: &str) -> Result<Arc<RateLimitRule>> {
        self.gate.selector().find_rule(name)
    }

    pub fn list_rules(&self) -> Vec<Arc<RateLimitRule>> {
        self.gate.selector().registry().list_active()
    }

    pub fn default_rule(&self) -> Arc<RateLimitRule> {
        self.gate.selector().registry().default_rule()
    }

    pub fn set_default_rule(&self, rule: RateLimitRule) -> Result<()> {
        let selector = self.gate.selector();
        selector.ensure_unclaimed_inline(&rule)?;
        selector.registry().set_default(rule)
    }

    pub fn add_access_entry(&self, kind: ListKind, entry: AccessEntry) {
        self.gate.access().add(kind, entry);
        self.refresh_gauges();
    }

    pub fn remove_access_entry(&self, kind: ListKind, pattern: &str) -> bool {
        let removed = self.gate.access().remove(kind, pattern);
        self.refresh_gauges();
        removed
    }

    pub fn list_access_entries(&self, kind: ListKind) -> Vec<AccessEntry> {
        self.gate.access().entries(kind)
    }

    /// Drop expired allow/deny entries and counters whose window has ended
    pub async fn purge_expired(&self) -> Result<PurgeReport> {
        let access_entries = self.gate.access().purge_expired();
        if access_entries > 0 {
            self.refresh_gauges();
        }
        let counters = self.gate.engine().purge_expired().await?;
        Ok(PurgeReport {
            access_entries,
            counters,
        })
    }

    fn key(&self, rule: &RateLimitRule, identity: &ClientIdentity, method: Option<&str>) -> RateLimitKey {
        rule.key_for(identity, method)
    }

    /// Current quota for `identity` under `rule` without consuming any
    pub async fn query(
        &self,
        rule: &str,
        identity: &ClientIdentity,
        method: Option<&str>,
    ) -> Result<QuotaStatus> {
        let rule = self.gate.selector().find_rule(rule)?;
        let key = self.key(&rule, identity, method);
        let info = self
            .gate
            .engine()
            .peek(&key, rule.requests_allowed(), rule.window())
            .await?;
        Ok(QuotaStatus {
            rule: rule.name().to_string(),
            key: key.to_string(),
            info,
        })
    }

    /// Reset the counter for `identity` under `rule`
    pub async fn clear(&self, rule: &str, identity: &ClientIdentity, method: Option<&str>) -> Result<()> {
        let rule = self.gate.selector().find_rule(rule)?;
        let key = self.key(&rule, identity, method);
        self.gate.engine().clear(&key).await?;
        info!(rule = %rule.name(), identity = %identity, "Rate limit counter cleared");
        Ok(())
    }

    /// Health check for the counter store
    pub async fn health_check(&self) -> Result<()> {
        self.gate.engine().health_check().await
    }
}
