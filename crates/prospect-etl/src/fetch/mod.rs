//! HTTP-backed collaborators.

pub mod companies_house;
pub mod geocoder;
pub mod http;
pub mod ixbrl;
pub mod web_search;
pub mod website;

use async_trait::async_trait;

use prospect_core::model::{Coordinates, Filing, Headcount, Profile};

use crate::config::Config;
use crate::enrich::cache::KeyedCache;
use crate::enrich::resilience::AdaptiveRateLimiter;
use crate::enrich::sources::{CachedSources, Sources};
use crate::error::EnrichResult;

pub use companies_house::CompaniesHouse;
pub use geocoder::Geocoder;
pub use web_search::WebSearch;
pub use website::SiteScraper;

/// The live collaborators. Without a Companies House key the registry
/// calls answer "nothing found" and only search, scraping and geocoding
/// do real work.
#[derive(Debug)]
pub struct HttpSources {
    registry: Option<CompaniesHouse>,
    search: WebSearch,
    scraper: SiteScraper,
    geocoder: Geocoder,
}

impl HttpSources {
    pub fn new(
        registry: Option<CompaniesHouse>,
        search: WebSearch,
        scraper: SiteScraper,
        geocoder: Geocoder,
    ) -> Self {
        Self {
            registry,
            search,
            scraper,
            geocoder,
        }
    }

    pub fn from_config(config: &Config) -> EnrichResult<Self> {
        let timeout = config.http_timeout();
        let client = http::build_client(timeout)?;

        let registry = match config.companies_house_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Some(CompaniesHouse::new(
                client.clone(),
                key,
                &config.companies_house_base_url,
                &config.document_base_url,
                timeout,
            )),
            _ => {
                log::warn!(
                    "No Companies House key configured; profiles, filings and headcount will be empty"
                );
                None
            }
        };

        Ok(Self::new(
            registry,
            WebSearch::new(client.clone()),
            SiteScraper::new(client.clone()),
            Geocoder::new(client, config.opencage_key.clone()),
        ))
    }

    pub fn has_registry(&self) -> bool {
        self.registry.is_some()
    }
}

#[async_trait]
impl Sources for HttpSources {
    async fn fetch_profile(&self, entity_id: &str) -> EnrichResult<Option<Profile>> {
        match &self.registry {
            Some(registry) => registry.profile(entity_id).await,
            None => Ok(None),
        }
    }

    async fn fetch_filing_history(&self, entity_id: &str) -> EnrichResult<Vec<Filing>> {
        match &self.registry {
            Some(registry) => registry.filing_history(entity_id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn extract_headcount(
        &self,
        filings: &[Filing],
        periods: &[String],
    ) -> EnrichResult<Headcount> {
        match &self.registry {
            Some(registry) => registry.headcount(filings, periods).await,
            None => Ok(Headcount::new()),
        }
    }

    async fn find_official_site(
        &self,
        name: &str,
        limiter: &AdaptiveRateLimiter,
    ) -> EnrichResult<Option<String>> {
        self.search.find_official_site(name, limiter).await
    }

    async fn scrape_description(&self, url: &str) -> EnrichResult<String> {
        self.scraper.describe(url).await
    }

    async fn geocode(&self, address: &str) -> EnrichResult<Option<Coordinates>> {
        self.geocoder.geocode(address).await
    }
}

/// Live collaborators behind the response cache at `config.cache_path`.
pub fn cached_sources(config: &Config) -> EnrichResult<CachedSources<HttpSources>> {
    let cache = KeyedCache::open(&config.cache_path);
    Ok(CachedSources::new(
        HttpSources::from_config(config)?,
        cache,
        config.cache_ttl,
    ))
}
