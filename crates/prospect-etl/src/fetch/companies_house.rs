//! Companies House REST and document API client.

use std::time::Duration;

use backon::Retryable;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use serde::Deserialize;

use prospect_core::model::{Filing, Headcount, Profile};

use crate::enrich::sources::{FILINGS, HEADCOUNT, REGISTRY};
use crate::error::{EnrichError, EnrichResult};
use crate::fetch::http::{check_status, retry_policy};
use crate::fetch::ixbrl;

const FILINGS_PER_PAGE: &str = "20";

#[derive(Debug, Deserialize)]
struct FilingPage {
    #[serde(default)]
    items: Vec<Filing>,
}

#[derive(Debug, Deserialize)]
struct DocumentMetadata {
    links: DocumentLinks,
}

#[derive(Debug, Deserialize)]
struct DocumentLinks {
    document: String,
}

/// Authenticated client for one API key.
#[derive(Debug, Clone)]
pub struct CompaniesHouse {
    client: Client,
    api_key: String,
    base_url: String,
    document_base_url: String,
    timeout: Duration,
}

impl CompaniesHouse {
    pub fn new(
        client: Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        document_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            document_base_url: document_base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// GET with basic auth, retrying transient faults.
    async fn get(
        &self,
        source_name: &str,
        url: &str,
        query: &[(&str, &str)],
        accept: &str,
        timeout: Duration,
    ) -> EnrichResult<Response> {
        let client = &self.client;
        let api_key = self.api_key.as_str();

        (move || async move {
            let response = client
                .get(url)
                .basic_auth(api_key, Some(""))
                .header(ACCEPT, accept)
                .query(query)
                .timeout(timeout)
                .send()
                .await?;
            check_status(source_name, response)
        })
        .retry(retry_policy())
        .when(EnrichError::is_transient)
        .notify(|err, delay| {
            log::debug!("Retrying {url} in {delay:?} after: {err}");
        })
        .await
    }

    /// Company profile; `None` for an unknown company number.
    pub async fn profile(&self, company_number: &str) -> EnrichResult<Option<Profile>> {
        let url = format!("{}/company/{company_number}", self.base_url);
        match self
            .get(REGISTRY, &url, &[], "application/json", self.timeout)
            .await
        {
            Ok(response) => Ok(Some(response.json::<Profile>().await?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Accounts filings, newest first.
    pub async fn filing_history(&self, company_number: &str) -> EnrichResult<Vec<Filing>> {
        let url = format!("{}/company/{company_number}/filing-history", self.base_url);
        let query = [("category", "accounts"), ("items_per_page", FILINGS_PER_PAGE)];
        match self
            .get(FILINGS, &url, &query, "application/json", self.timeout)
            .await
        {
            Ok(response) => Ok(response.json::<FilingPage>().await?.items),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Download a filing document as text, preferring the XHTML
    /// (inline XBRL) rendition.
    pub async fn document(&self, document_id: &str) -> EnrichResult<String> {
        let meta_url = format!("{}/document/{document_id}", self.document_base_url);
        let metadata: DocumentMetadata = self
            .get(HEADCOUNT, &meta_url, &[], "application/json", self.timeout)
            .await?
            .json()
            .await?;

        let body = self
            .get(
                HEADCOUNT,
                &metadata.links.document,
                &[],
                "application/xhtml+xml",
                self.timeout * 2,
            )
            .await?
            .bytes()
            .await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Employee counts for `periods`, taken from the first filing of each
    /// period that states one. A period whose filing was read but had no
    /// figure maps to `None`; periods with no filing are left out.
    ///
    /// Download failures are skipped. If every download failed the last
    /// error is returned so the empty result is not mistaken for a real
    /// answer.
    pub async fn headcount(
        &self,
        filings: &[Filing],
        periods: &[String],
    ) -> EnrichResult<Headcount> {
        let mut headcount = Headcount::new();
        let mut attempted = 0usize;
        let mut last_error = None;

        for filing in filings {
            let Some(period) = filing.period() else {
                continue;
            };
            if !periods.iter().any(|p| p == period) {
                continue;
            }
            if matches!(headcount.get(period), Some(Some(_))) {
                continue;
            }
            let Some(document_id) = filing.document_id() else {
                continue;
            };

            attempted += 1;
            let figure = match self.document(document_id).await {
                Ok(document) if ixbrl::is_ixbrl(&document) => ixbrl::extract_employees(&document),
                Ok(_) => {
                    log::debug!("Document {document_id} is not inline XBRL, skipping");
                    None
                }
                Err(err) => {
                    log::warn!("Failed to download document {document_id}: {err}");
                    last_error = Some(err);
                    continue;
                }
            };

            if let Some(count) = figure {
                log::debug!("Found {count} employees for period {period}");
            }
            headcount.insert(period.to_string(), figure);
        }

        match last_error {
            Some(err) if headcount.is_empty() && attempted > 0 => Err(err),
            _ => Ok(headcount),
        }
    }
}
