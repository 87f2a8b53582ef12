use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{net::IpAddr, str::FromStr, sync::Arc, sync::Mutex};
use tracing::{debug, info};

use crate::{
    error::{RateLimitError, Result},
    identity::{ClientIdentity, IdentityKind},
    utils::{Clock, SystemClock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Allow,
    Deny,
}

/// Outcome of the override check. Deny wins when both lists match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Deny { reason: Option<String> },
    Allow,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Exact(String),
    Prefix(String),
    Cidr(IpNet),
}

impl Matcher {
    fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" {
            return Err(RateLimitError::Config(format!(
                "access list pattern {:?} would match every caller",
                pattern
            )));
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return Ok(Matcher::Prefix(prefix.to_string()));
        }
        if let Some(net) = pattern.strip_prefix("ip:").filter(|v| v.contains('/')) {
            let net = IpNet::from_str(net)
                .map_err(|e| RateLimitError::Config(format!("invalid CIDR {:?}: {}", pattern, e)))?;
            return Ok(Matcher::Cidr(net));
        }
        Ok(Matcher::Exact(pattern.to_string()))
    }

    fn matches(&self, identity: &ClientIdentity, rendered: &str) -> bool {
        match self {
            Matcher::Exact(p) => p == rendered,
            Matcher::Prefix(p) => rendered.starts_with(p.as_str()),
            Matcher::Cidr(net) => {
                identity.kind() == IdentityKind::Ip
                    && IpAddr::from_str(identity.value())
                        .map(|ip| net.contains(&ip))
                        .unwrap_or(false)
            }
        }
    }
}

/// One allow or deny entry
#[derive(Debug, Clone, Serialize)]
pub struct AccessEntry {
    pattern: String,
    #[serde(skip)]
    matcher: Matcher,
    expires_at: Option<DateTime<Utc>>,
    reason: Option<String>,
}

impl AccessEntry {
    /// `pattern` is an exact identity (`ip:1.2.3.4`), a trailing wildcard
    /// (`api_key:partner-*`) or an IP network (`ip:10.0.0.0/8`).
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into().trim().to_string();
        let matcher = Matcher::parse(&pattern)?;
        Ok(Self {
            pattern,
            matcher,
            expires_at: None,
            reason: None,
        })
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    fn applies(&self, identity: &ClientIdentity, rendered: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.matcher.matches(identity, rendered)
    }
}

type Entries = Vec<AccessEntry>;

/// Allow and deny lists with lazy expiry, checked before any quota logic.
///
/// Lookups read lock-free snapshots; mutations copy the list and publish it.
pub struct AccessList {
    allow: ArcSwap<Entries>,
    deny: ArcSwap<Entries>,
    write_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            allow: ArcSwap::from_pointee(Vec::new()),
            deny: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            clock,
        }
    }

    fn list(&self, kind: ListKind) -> &ArcSwap<Entries> {
        match kind {
            ListKind::Allow => &self.allow,
            ListKind::Deny => &self.deny,
        }
    }

    /// Add an entry, replacing any entry with the same pattern
    pub fn add(&self, kind: ListKind, entry: AccessEntry) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let list = self.list(kind);
        let mut next: Entries = list
            .load()
            .iter()
            .filter(|e| e.pattern != entry.pattern)
            .cloned()
            .collect();
        info!(list = ?kind, pattern = %entry.pattern, reason = ?entry.reason, "Access list entry added");
        next.push(entry);
        list.store(Arc::new(next));
    }

    /// Remove the entry with this pattern; returns whether one existed
    pub fn remove(&self, kind: ListKind, pattern: &str) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let list = self.list(kind);
        let current = list.load();
        let pattern = pattern.trim();
        if !current.iter().any(|e| e.pattern == pattern) {
            return false;
        }
        let next: Entries = current.iter().filter(|e| e.pattern != pattern).cloned().collect();
        list.store(Arc::new(next));
        info!(list = ?kind, pattern, "Access list entry removed");
        true
    }

    /// Current entries of one list, expired ones included until purged
    pub fn entries(&self, kind: ListKind) -> Vec<AccessEntry> {
        Vec::clone(&self.list(kind).load())
    }

    fn matching(&self, kind: ListKind, identity: &ClientIdentity) -> Option<AccessEntry> {
        let now = self.clock.now();
        let rendered = identity.to_string();
        self.list(kind)
            .load()
            .iter()
            .find(|e| e.applies(identity, &rendered, now))
            .cloned()
    }

    pub fn is_allowed(&self, identity: &ClientIdentity) -> bool {
        self.matching(ListKind::Allow, identity).is_some()
    }

    pub fn is_denied(&self, identity: &ClientIdentity) -> bool {
        self.matching(ListKind::Deny, identity).is_some()
    }

    pub fn verdict(&self, identity: &ClientIdentity) -> Verdict {
        if let Some(entry) = self.matching(ListKind::Deny, identity) {
            return Verdict::Deny { reason: entry.reason };
        }
        if self.is_allowed(identity) {
            return Verdict::Allow;
        }
        Verdict::Neutral
    }

    /// Drop expired entries from both lists. Lookups already ignore them.
    pub fn purge_expired(&self) -> usize {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let mut purged = 0;
        for list in [&self.allow, &self.deny] {
            let current = list.load();
            let next: Entries = current.iter().filter(|e| !e.is_expired(now)).cloned().collect();
            if next.len() != current.len() {
                purged += current.len() - next.len();
                list.store(Arc::new(next));
            }
        }
        debug!(purged, "Purged expired access list entries");
        purged
    }
}

impl Default for AccessList {
    fn default() -> Self {
        Self::new()
    }
}
