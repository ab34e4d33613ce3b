//! Per-row enrichment: rate limiting, response caching, collaborators and
//! the row enricher that combines them.

pub mod cache;
pub mod enricher;
pub mod resilience;
pub mod sources;

pub use cache::{CacheStore, Fingerprint, KeyedCache, MemoryCacheStore, RequestKey, SqliteCacheStore};
pub use enricher::{RowEnricher, RowOutcome, SourceFailure};
pub use resilience::{AdaptiveRateLimiter, AdaptiveSettings, RateLimiter};
pub use sources::{CacheTtls, CachedSources, Sources};
