//! Per-row enrichment orchestration.
//!
//! A row fans out into three independent branches that run concurrently:
//!
//! - registry profile, then geocoding of its registered address
//! - official-site discovery, then scraping of the site found
//! - filing history, then headcount extraction from those filings
//!
//! A branch's failure leaves only its own output fields empty. Under a
//! row deadline every collaborator call is bounded separately, so a call
//! still pending at the deadline fails on its own and the fields already
//! gathered are kept.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use prospect_core::model::{EntityColumns, EnrichmentResult, InputRow, OutputSchema};

use crate::enrich::resilience::AdaptiveRateLimiter;
use crate::enrich::sources::{self, Sources};
use crate::error::{EnrichError, EnrichResult};

/// Name recorded for failures that concern the row as a whole.
pub const ROW: &str = "row";

/// One collaborator failure absorbed while enriching a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: &'static str,
    pub message: String,
}

/// The result for one input row, with the failures absorbed on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOutcome {
    pub offset: usize,
    pub result: EnrichmentResult,
    pub failures: Vec<SourceFailure>,
}

impl RowOutcome {
    /// An all-empty result for a row that could not be enriched at all.
    pub fn degraded(offset: usize, schema: &OutputSchema, message: impl Into<String>) -> Self {
        Self {
            offset,
            result: schema.empty_result(),
            failures: vec![SourceFailure {
                source: ROW,
                message: message.into(),
            }],
        }
    }

    /// Whether any source failed for this row.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Collects the failures of one branch.
struct Branch<'a> {
    entity: &'a str,
    deadline: Option<Instant>,
    failures: Vec<SourceFailure>,
}

impl<'a> Branch<'a> {
    const fn new(entity: &'a str, deadline: Option<Instant>) -> Self {
        Self {
            entity,
            deadline,
            failures: Vec::new(),
        }
    }

    /// Await one collaborator call, giving up at the row deadline.
    async fn call<T>(
        &mut self,
        source: &'static str,
        call: impl Future<Output = EnrichResult<T>>,
    ) -> Option<T> {
        let outcome = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .unwrap_or_else(|_| {
                    Err(EnrichError::TimedOut {
                        source_name: source.to_string(),
                    })
                }),
            None => call.await,
        };
        self.absorb(source, outcome)
    }

    fn absorb<T>(&mut self, source: &'static str, outcome: EnrichResult<T>) -> Option<T> {
        match outcome {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("{} failed for {}: {}", source, self.entity, e);
                self.failures.push(SourceFailure {
                    source,
                    message: e.to_string(),
                });
                None
            }
        }
    }
}

/// Produces exactly one [`EnrichmentResult`] per input row, never failing.
#[derive(Clone)]
pub struct RowEnricher {
    sources: Arc<dyn Sources>,
    search_limiter: AdaptiveRateLimiter,
    columns: EntityColumns,
    schema: OutputSchema,
}

impl fmt::Debug for RowEnricher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowEnricher")
            .field("search_limiter", &self.search_limiter)
            .field("columns", &self.columns)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl RowEnricher {
    pub fn new(
        sources: Arc<dyn Sources>,
        search_limiter: AdaptiveRateLimiter,
        columns: EntityColumns,
        schema: OutputSchema,
    ) -> Self {
        Self {
            sources,
            search_limiter,
            columns,
            schema,
        }
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    /// Enrich one row with no deadline.
    pub async fn enrich(&self, row: &InputRow) -> RowOutcome {
        self.enrich_within(row, None).await
    }

    /// Enrich one row, bounding every collaborator call by a deadline
    /// `limit` after the row starts.
    pub async fn enrich_within(&self, row: &InputRow, limit: Option<Duration>) -> RowOutcome {
        let deadline = limit.map(|limit| Instant::now() + limit);
        let id = row.entity_id(&self.columns);
        let name = row.display_name(&self.columns);
        let label = if name.is_empty() { id } else { name };
        log::debug!("Enriching {} ({})", label, id);

        let ((location, mut located), (site, mut described), (headcount, mut counted)) = tokio::join!(
            self.locate(id, label, deadline),
            self.describe(name, label, deadline),
            self.count_staff(id, label, deadline),
        );

        let mut result = self.schema.empty_result();
        if let Some(location) = location {
            result.manufacturing_location = location;
        }
        if let Some((url, description)) = site {
            result.company_url = url;
            result.description = description;
        }
        for (period, count) in headcount {
            result.set_headcount(&period, count.to_string());
        }

        let mut failures = Vec::new();
        failures.append(&mut located);
        failures.append(&mut described);
        failures.append(&mut counted);

        log::debug!(
            "Completed {}: {} fields, {} failures",
            label,
            result.filled_fields(),
            failures.len()
        );
        RowOutcome {
            offset: row.offset(),
            result,
            failures,
        }
    }

    /// Registry profile, then its address resolved to coordinates. Falls
    /// back to the raw address when geocoding fails or finds nothing.
    async fn locate(
        &self,
        id: &str,
        label: &str,
        deadline: Option<Instant>,
    ) -> (Option<String>, Vec<SourceFailure>) {
        let mut branch = Branch::new(label, deadline);
        if id.is_empty() {
            return (None, branch.failures);
        }
        let profile = branch
            .call(sources::REGISTRY, self.sources.fetch_profile(id))
            .await
            .flatten();
        let Some(address) = profile.as_ref().and_then(|p| p.address_line()) else {
            return (None, branch.failures);
        };
        let coordinates = branch
            .call(sources::GEOCODER, self.sources.geocode(&address))
            .await
            .flatten();
        let location = coordinates.map_or(address, |c| c.to_string());
        (Some(location), branch.failures)
    }

    /// Official site, then its description. Scraping is skipped when no
    /// site was found.
    async fn describe(
        &self,
        name: &str,
        label: &str,
        deadline: Option<Instant>,
    ) -> (Option<(String, String)>, Vec<SourceFailure>) {
        let mut branch = Branch::new(label, deadline);
        if name.is_empty() {
            return (None, branch.failures);
        }
        let site = branch
            .call(
                sources::SEARCH,
                self.sources.find_official_site(name, &self.search_limiter),
            )
            .await
            .flatten()
            .filter(|url| !url.trim().is_empty());
        let Some(url) = site else {
            return (None, branch.failures);
        };
        let description = branch
            .call(sources::SCRAPER, self.sources.scrape_description(&url))
            .await
            .map(|d| d.trim().to_string())
            .unwrap_or_default();
        (Some((url, description)), branch.failures)
    }

    /// Filing history, then headcount figures from it. Extraction is
    /// skipped for an empty history.
    async fn count_staff(
        &self,
        id: &str,
        label: &str,
        deadline: Option<Instant>,
    ) -> (Vec<(String, u64)>, Vec<SourceFailure>) {
        let mut branch = Branch::new(label, deadline);
        if id.is_empty() {
            return (Vec::new(), branch.failures);
        }
        let filings = branch
            .call(sources::FILINGS, self.sources.fetch_filing_history(id))
            .await
            .unwrap_or_default();
        if filings.is_empty() {
            return (Vec::new(), branch.failures);
        }
        let counts = branch
            .call(
                sources::HEADCOUNT,
                self.sources
                    .extract_headcount(&filings, self.schema.periods()),
            )
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(period, count)| count.map(|c| (period, c)))
            .collect();
        (counts, branch.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::resilience::AdaptiveSettings;
    use async_trait::async_trait;
    use prospect_core::model::{Address, Coordinates, Filing, Headcount, Profile};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeSources {
        fail_profile: bool,
        fail_search: bool,
        fail_geocode: bool,
        no_site: bool,
        no_filings: bool,
        hang_search: bool,
        hang_geocode: bool,
        searches: AtomicUsize,
        scrapes: AtomicUsize,
        extractions: AtomicUsize,
    }

    #[async_trait]
    impl Sources for FakeSources {
        async fn fetch_profile(&self, entity_id: &str) -> EnrichResult<Option<Profile>> {
            if self.fail_profile {
                return Err(EnrichError::http(sources::REGISTRY, "502 Bad Gateway"));
            }
            Ok(Some(Profile {
                company_number: Some(entity_id.to_string()),
                registered_office_address: Some(Address {
                    address_line_1: Some("1 High Street".to_string()),
                    locality: Some("Leeds".to_string()),
                    postal_code: Some("LS1 1AA".to_string()),
                    ..Address::default()
                }),
                ..Profile::default()
            }))
        }

        async fn fetch_filing_history(&self, _: &str) -> EnrichResult<Vec<Filing>> {
            if self.no_filings {
                return Ok(Vec::new());
            }
            Ok(vec![Filing {
                made_up_date: Some("2023-03-31".to_string()),
                ..Filing::default()
            }])
        }

        async fn extract_headcount(&self, _: &[Filing], _: &[String]) -> EnrichResult<Headcount> {
            self.extractions.fetch_add(1, Ordering::SeqCst);
            Ok(Headcount::from([
                ("2023".to_string(), Some(42)),
                ("2022".to_string(), None),
                ("1999".to_string(), Some(5)),
            ]))
        }

        async fn find_official_site(
            &self,
            name: &str,
            limiter: &AdaptiveRateLimiter,
        ) -> EnrichResult<Option<String>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            if self.hang_search {
                std::future::pending::<()>().await;
            }
            limiter.acquire().await;
            if self.fail_search {
                return Err(EnrichError::RateLimited {
                    source_name: sources::SEARCH.to_string(),
                });
            }
            if self.no_site {
                return Ok(None);
            }
            Ok(Some(format!(
                "https://{}.co.uk",
                name.to_lowercase().replace(' ', "")
            )))
        }

        async fn scrape_description(&self, _: &str) -> EnrichResult<String> {
            self.scrapes.fetch_add(1, Ordering::SeqCst);
            Ok("  Precision widgets since 1901. ".to_string())
        }

        async fn geocode(&self, _: &str) -> EnrichResult<Option<Coordinates>> {
            if self.hang_geocode {
                std::future::pending::<()>().await;
            }
            if self.fail_geocode {
                return Err(EnrichError::http(sources::GEOCODER, "timeout"));
            }
            Ok(Some(Coordinates {
                lat: 53.8,
                lng: -1.55,
                label: None,
            }))
        }
    }

    fn enricher(sources: Arc<FakeSources>) -> RowEnricher {
        RowEnricher::new(
            sources,
            AdaptiveRateLimiter::new(10.0, None, AdaptiveSettings::default()),
            EntityColumns::default(),
            OutputSchema::default(),
        )
    }

    fn row(id: &str, name: &str) -> InputRow {
        let columns: Arc<[String]> =
            vec!["CompanyNumber".to_string(), "CompanyName".to_string()].into();
        InputRow::new(7, columns, vec![id.to_string(), name.to_string()]).unwrap()
    }

    #[tokio::test]
    async fn test_all_sources_succeed() {
        let outcome = enricher(Arc::new(FakeSources::default()))
            .enrich(&row("01234567", "Acme Widgets"))
            .await;

        assert_eq!(outcome.offset, 7);
        assert!(!outcome.is_degraded());
        let result = &outcome.result;
        assert_eq!(result.company_url, "https://acmewidgets.co.uk");
        assert_eq!(result.description, "Precision widgets since 1901.");
        assert_eq!(result.manufacturing_location, "53.8,-1.55");
        assert_eq!(result.headcount("2023"), Some("42"));
        assert_eq!(result.headcount("2022"), Some(""));
        assert_eq!(result.headcount("1999"), None);
    }

    #[tokio::test]
    async fn test_failed_search_leaves_other_fields_intact() {
        let sources = Arc::new(FakeSources {
            fail_search: true,
            ..FakeSources::default()
        });
        let outcome = enricher(sources.clone())
            .enrich(&row("01234567", "Acme Widgets"))
            .await;

        let result = &outcome.result;
        assert!(result.company_url.is_empty());
        assert!(result.description.is_empty());
        assert!(!result.manufacturing_location.is_empty());
        assert_eq!(result.headcount("2023"), Some("42"));
        assert_eq!(
            result.values().len(),
            OutputSchema::default().columns().len()
        );

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].source, sources::SEARCH);
        assert_eq!(sources.scrapes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_site_skips_scraping() {
        let sources = Arc::new(FakeSources {
            no_site: true,
            ..FakeSources::default()
        });
        let outcome = enricher(sources.clone())
            .enrich(&row("01234567", "Acme Widgets"))
            .await;

        assert!(!outcome.is_degraded());
        assert!(outcome.result.company_url.is_empty());
        assert_eq!(sources.scrapes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_geocode_failure_falls_back_to_address() {
        let sources = Arc::new(FakeSources {
            fail_geocode: true,
            ..FakeSources::default()
        });
        let outcome = enricher(sources)
            .enrich(&row("01234567", "Acme Widgets"))
            .await;

        assert_eq!(
            outcome.result.manufacturing_location,
            "1 High Street, Leeds, LS1 1AA"
        );
        assert_eq!(outcome.failures[0].source, sources::GEOCODER);
    }

    #[tokio::test]
    async fn test_profile_failure_does_not_block_search() {
        let sources = Arc::new(FakeSources {
            fail_profile: true,
            ..FakeSources::default()
        });
        let outcome = enricher(sources)
            .enrich(&row("01234567", "Acme Widgets"))
            .await;

        assert!(outcome.result.manufacturing_location.is_empty());
        assert!(!outcome.result.company_url.is_empty());
        assert_eq!(outcome.result.headcount("2023"), Some("42"));
        assert_eq!(outcome.failures[0].source, sources::REGISTRY);
    }

    #[tokio::test]
    async fn test_empty_filings_skip_extraction() {
        let sources = Arc::new(FakeSources {
            no_filings: true,
            ..FakeSources::default()
        });
        let outcome = enricher(sources.clone())
            .enrich(&row("01234567", "Acme Widgets"))
            .await;

        assert_eq!(outcome.result.headcount("2023"), Some(""));
        assert_eq!(sources.extractions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blank_identifiers_skip_their_sources() {
        let sources = Arc::new(FakeSources::default());
        let outcome = enricher(sources.clone()).enrich(&row("  ", "")).await;

        assert!(!outcome.is_degraded());
        assert_eq!(outcome.result.filled_fields(), 0);
        assert_eq!(sources.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_search_times_out_alone() {
        let sources = Arc::new(FakeSources {
            hang_search: true,
            ..FakeSources::default()
        });
        let outcome = enricher(sources.clone())
            .enrich_within(&row("01234567", "Acme"), Some(Duration::from_secs(5)))
            .await;

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].source, sources::SEARCH);
        assert!(outcome.result.company_url.is_empty());
        assert_eq!(outcome.result.manufacturing_location, "53.8,-1.55");
        assert_eq!(outcome.result.headcount("2023"), Some("42"));
        assert_eq!(sources.scrapes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_geocode_keeps_address_at_deadline() {
        let sources = Arc::new(FakeSources {
            hang_geocode: true,
            ..FakeSources::default()
        });
        let outcome = enricher(sources)
            .enrich_within(&row("01234567", "Acme"), Some(Duration::from_secs(5)))
            .await;

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].source, sources::GEOCODER);
        assert_eq!(
            outcome.result.manufacturing_location,
            "1 High Street, Leeds, LS1 1AA"
        );
        assert_eq!(outcome.result.company_url, "https://acme.co.uk");
    }
}
