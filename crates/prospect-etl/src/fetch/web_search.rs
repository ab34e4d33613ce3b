//! Official site discovery through DuckDuckGo's HTML endpoint.

use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use url::Url;

use crate::enrich::resilience::AdaptiveRateLimiter;
use crate::enrich::sources::SEARCH;
use crate::error::{EnrichError, EnrichResult};
use crate::fetch::http::check_status;

pub const DEFAULT_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

/// Hosts that list companies rather than belong to them.
const SKIPPED_HOSTS: &[&str] = &[
    "facebook.com",
    "twitter.com",
    "linkedin.com",
    "instagram.com",
    "companies-house.gov.uk",
    "companieshouse.gov.uk",
    "yell.com",
    "yelp.com",
    "trustpilot.com",
    "wikipedia.org",
    "wikidata.org",
];

const BUSINESS_TLDS: &[&str] = &[
    ".com", ".co.uk", ".uk", ".org", ".net", ".io", ".tech", ".biz", ".info", ".eu", ".gov.uk",
    ".ac.uk",
];

/// Shortest company-name token that must appear in a candidate domain.
const MIN_TOKEN_LEN: usize = 4;

#[derive(Debug, Clone)]
pub struct WebSearch {
    client: Client,
    endpoint: String,
}

impl WebSearch {
    pub fn new(client: Client) -> Self {
        Self::with_endpoint(client, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Search for `name` and return the first result that looks like the
    /// company's own site. Every request waits on `limiter` and reports
    /// its outcome back to it.
    pub async fn find_official_site(
        &self,
        name: &str,
        limiter: &AdaptiveRateLimiter,
    ) -> EnrichResult<Option<String>> {
        limiter.acquire().await;

        match self.search(name).await {
            Ok(results) => {
                limiter.record_success();
                let site = pick_site(&results, name);
                match &site {
                    Some(url) => log::debug!("Found website for {name}: {url}"),
                    None => log::debug!("No suitable website found for {name}"),
                }
                Ok(site)
            }
            Err(err) => {
                limiter.record_failure(err.is_rate_limited());
                Err(err)
            }
        }
    }

    async fn search(&self, name: &str) -> EnrichResult<Vec<String>> {
        let query = format!("\"{name}\" official website");
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query.as_str()), ("kl", "uk-en")])
            .send()
            .await?;

        // A throttled client gets 202 or 403 with a challenge page.
        if matches!(response.status(), StatusCode::ACCEPTED | StatusCode::FORBIDDEN) {
            return Err(EnrichError::RateLimited {
                source_name: SEARCH.to_string(),
            });
        }
        let body = check_status(SEARCH, response)?.text().await?;
        Ok(parse_results(&body))
    }
}

/// Result links from a results page, in rank order, with the redirect
/// wrapper removed.
pub fn parse_results(html: &str) -> Vec<String> {
    let Some(selector) = Selector::parse("a.result__a").ok() else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(unwrap_redirect)
        .collect()
}

/// Resolve `//duckduckgo.com/l/?uddg=<target>` links to their target.
fn unwrap_redirect(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = Url::parse(&absolute).ok()?;
    if parsed.path().starts_with("/l/") {
        return parsed
            .query_pairs()
            .find(|(key, _)| key == "uddg")
            .map(|(_, target)| target.into_owned());
    }
    matches!(parsed.scheme(), "http" | "https").then_some(absolute)
}

/// First candidate that is not a directory or social site and passes
/// [`is_business_domain`].
pub fn pick_site(results: &[String], name: &str) -> Option<String> {
    results
        .iter()
        .filter(|url| !is_skipped(url))
        .find(|url| is_business_domain(url, name))
        .cloned()
}

pub fn is_skipped(url: &str) -> bool {
    let lower = url.to_lowercase();
    SKIPPED_HOSTS.iter().any(|host| lower.contains(host))
}

/// Whether `url` has a business TLD and its domain contains a
/// significant token of the company name.
pub fn is_business_domain(url: &str, name: &str) -> bool {
    let Some(host) = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
    else {
        return false;
    };
    let domain = host.strip_prefix("www.").unwrap_or(&host);

    if !BUSINESS_TLDS.iter().any(|tld| domain.ends_with(tld)) {
        return false;
    }

    let letters: String = domain.chars().filter(char::is_ascii_lowercase).collect();
    name.to_lowercase()
        .split(|c: char| !c.is_ascii_lowercase())
        .filter(|token| token.len() >= MIN_TOKEN_LEN)
        .any(|token| letters.contains(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_PAGE: &str = r#"<html><body>
<div class="result"><h2><a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fuk.linkedin.com%2Fcompany%2Facme-widgets&amp;rut=abc">Acme | LinkedIn</a></h2></div>
<div class="result"><h2><a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.acmewidgets.co.uk%2F&amp;rut=def">Acme Widgets Ltd</a></h2></div>
<div class="result"><h2><a class="result__a" href="https://www.acme-widgets.com/about">About</a></h2></div>
<div class="result"><a class="result__snippet" href="https://ignored.example">snippet</a></div>
</body></html>"#;

    #[test]
    fn test_parse_results_unwraps_redirects() {
        let results = parse_results(RESULTS_PAGE);
        assert_eq!(
            results,
            vec![
                "https://uk.linkedin.com/company/acme-widgets".to_string(),
                "https://www.acmewidgets.co.uk/".to_string(),
                "https://www.acme-widgets.com/about".to_string(),
            ]
        );
    }

    #[test]
    fn test_pick_site_skips_social_hosts() {
        let results = parse_results(RESULTS_PAGE);
        assert_eq!(
            pick_site(&results, "Acme Widgets Ltd").as_deref(),
            Some("https://www.acmewidgets.co.uk/")
        );
    }

    #[test]
    fn test_business_domain_rules() {
        assert!(is_business_domain("https://www.acmewidgets.co.uk/", "Acme Widgets Ltd"));
        assert!(is_business_domain("https://widgets-direct.io", "Acme Widgets Ltd"));
        // Tokens shorter than four letters never match.
        assert!(!is_business_domain("https://abc.com", "ABC Ltd"));
        // Unknown TLD.
        assert!(!is_business_domain("https://acmewidgets.xyz", "Acme Widgets"));
        // No name token in the domain.
        assert!(!is_business_domain("https://example.com/acme-widgets", "Acme Widgets"));
        assert!(!is_business_domain("not a url", "Acme Widgets"));
    }

    #[test]
    fn test_skipped_hosts() {
        assert!(is_skipped("https://find-and-update.companies-house.gov.uk/company/1"));
        assert!(is_skipped("https://en.wikipedia.org/wiki/Acme"));
        assert!(!is_skipped("https://www.acmewidgets.co.uk"));
    }

    #[test]
    fn test_empty_page_has_no_results() {
        assert!(parse_results("<html><body>No results.</body></html>").is_empty());
        assert_eq!(pick_site(&[], "Acme Widgets"), None);
    }
}
