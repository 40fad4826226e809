//! Adaptive response cache.
//!
//! Caching here is criticality-aware: TTLs are floored per criticality so
//! important guidance stays warm, sensitive payloads are detected by field
//! name, encrypted at rest, and capped to a short TTL, and eviction favors
//! keeping high-criticality entries over low ones.

mod config;
mod crypto;
mod entry;
mod stats;
mod store;

pub use config::{CacheConfig, CacheConfigBuilder, SENSITIVE_TTL_CAP};
pub use entry::SENSITIVE_FIELD_PATTERNS;
pub use stats::CacheStats;
pub use store::CacheStore;
