//! Storefront Rate Limit Core
//!
//! Admission control for the storefront API: fixed-window counters shared
//! through Redis, tiered and per-route policies, allow/deny overrides, and
//! an axum middleware that admits or rejects each request.

pub mod access;
pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod identity;
pub mod metrics;
pub mod policy;
pub mod redis;
pub mod rules;
pub mod service;
pub mod store;
pub mod utils;

// Re-export main types
pub use access::{AccessEntry, AccessList, ListKind};
pub use engine::{AdmissionEngine, RateLimitInfo};
pub use error::{RateLimitError, Result};
pub use gate::{rate_limit_middleware, GateConfig, GateDecision, RateLimitGate};
pub use identity::{AuthenticatedCaller, ClientIdentity, IdentityResolver};
pub use policy::{CallerClass, Policy, PolicySelector};
pub use rules::{RateLimitRule, RuleRegistry};
pub use service::RateLimitService;
pub use store::{CounterStore, MemoryCounterStore};
