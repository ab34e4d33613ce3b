//! The external collaborators consulted for each row, and a caching
//! decorator that puts every call behind the [`KeyedCache`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use prospect_core::model::{Coordinates, Filing, Headcount, Profile};

use crate::enrich::cache::{KeyedCache, RequestKey};
use crate::enrich::resilience::AdaptiveRateLimiter;
use crate::error::EnrichResult;

pub const REGISTRY: &str = "registry";
pub const FILINGS: &str = "filings";
pub const HEADCOUNT: &str = "headcount";
pub const SEARCH: &str = "search";
pub const SCRAPER: &str = "scraper";
pub const GEOCODER: &str = "geocoder";

const DAY: u64 = 24 * 60 * 60;

/// Upstream data sources for one row.
///
/// Every method may fail; the row enricher absorbs failures into empty
/// output fields. "Nothing found" is `Ok(None)` or an empty value, not an
/// error.
#[async_trait]
pub trait Sources: Send + Sync {
    /// Registry profile for an entity.
    async fn fetch_profile(&self, entity_id: &str) -> EnrichResult<Option<Profile>>;

    /// Accounts filing history for an entity, newest first.
    async fn fetch_filing_history(&self, entity_id: &str) -> EnrichResult<Vec<Filing>>;

    /// Headcount for each of `periods`, read from the filings' documents.
    async fn extract_headcount(
        &self,
        filings: &[Filing],
        periods: &[String],
    ) -> EnrichResult<Headcount>;

    /// Discover the entity's official website. Implementations gate their
    /// upstream calls through `limiter` and report outcomes to it.
    async fn find_official_site(
        &self,
        name: &str,
        limiter: &AdaptiveRateLimiter,
    ) -> EnrichResult<Option<String>>;

    /// A short description of the business from its website.
    async fn scrape_description(&self, url: &str) -> EnrichResult<String>;

    /// Resolve a postal address to coordinates.
    async fn geocode(&self, address: &str) -> EnrichResult<Option<Coordinates>>;
}

/// Time-to-live per call site, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    pub profile_secs: u64,
    pub filings_secs: u64,
    pub headcount_secs: u64,
    pub search_secs: u64,
    pub description_secs: u64,
    pub geocode_secs: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            profile_secs: 7 * DAY,
            filings_secs: 7 * DAY,
            headcount_secs: 7 * DAY,
            search_secs: DAY,
            description_secs: 7 * DAY,
            geocode_secs: 30 * DAY,
        }
    }
}

/// Wraps a [`Sources`] so each call is answered from the cache when a
/// live entry exists. Cache hits bypass the upstream entirely, including
/// any rate limiter it would have waited on.
#[derive(Debug)]
pub struct CachedSources<S> {
    inner: S,
    cache: KeyedCache,
    ttls: CacheTtls,
}

impl<S: Sources> CachedSources<S> {
    pub fn new(inner: S, cache: KeyedCache, ttls: CacheTtls) -> Self {
        Self { inner, cache, ttls }
    }

    pub fn cache(&self) -> &KeyedCache {
        &self.cache
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

fn headcount_key(filings: &[Filing], periods: &[String]) -> RequestKey {
    let documents = filings
        .iter()
        .map(|f| {
            f.document_id()
                .or(f.made_up_date.as_deref())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join(",");
    RequestKey::new(HEADCOUNT, "extract")
        .exact_param("documents", &documents)
        .exact_param("periods", &periods.join(","))
}

#[async_trait]
impl<S: Sources> Sources for CachedSources<S> {
    async fn fetch_profile(&self, entity_id: &str) -> EnrichResult<Option<Profile>> {
        let key = RequestKey::new(REGISTRY, "profile").exact_param("id", entity_id);
        self.cache
            .get_or_fetch(&key, Duration::from_secs(self.ttls.profile_secs), || {
                self.inner.fetch_profile(entity_id)
            })
            .await
    }

    async fn fetch_filing_history(&self, entity_id: &str) -> EnrichResult<Vec<Filing>> {
        let key = RequestKey::new(FILINGS, "history").exact_param("id", entity_id);
        self.cache
            .get_or_fetch(&key, Duration::from_secs(self.ttls.filings_secs), || {
                self.inner.fetch_filing_history(entity_id)
            })
            .await
    }

    async fn extract_headcount(
        &self,
        filings: &[Filing],
        periods: &[String],
    ) -> EnrichResult<Headcount> {
        let key = headcount_key(filings, periods);
        self.cache
            .get_or_fetch(&key, Duration::from_secs(self.ttls.headcount_secs), || {
                self.inner.extract_headcount(filings, periods)
            })
            .await
    }

    async fn find_official_site(
        &self,
        name: &str,
        limiter: &AdaptiveRateLimiter,
    ) -> EnrichResult<Option<String>> {
        let key = RequestKey::new(SEARCH, "official_site").param("name", name);
        self.cache
            .get_or_fetch(&key, Duration::from_secs(self.ttls.search_secs), || {
                self.inner.find_official_site(name, limiter)
            })
            .await
    }

    async fn scrape_description(&self, url: &str) -> EnrichResult<String> {
        let key = RequestKey::new(SCRAPER, "description").exact_param("url", url);
        self.cache
            .get_or_fetch(&key, Duration::from_secs(self.ttls.description_secs), || {
                self.inner.scrape_description(url)
            })
            .await
    }

    async fn geocode(&self, address: &str) -> EnrichResult<Option<Coordinates>> {
        let key = RequestKey::new(GEOCODER, "lookup").param("address", address);
        self.cache
            .get_or_fetch(&key, Duration::from_secs(self.ttls.geocode_secs), || {
                self.inner.geocode(address)
            })
            .await
    }
}
