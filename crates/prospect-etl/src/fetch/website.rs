//! Business descriptions scraped from a company's own website.

use reqwest::header::USER_AGENT;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};

use crate::enrich::sources::SCRAPER;
use crate::error::EnrichResult;
use crate::fetch::http::check_status;

/// Some sites refuse non-browser agents outright.
const BROWSER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

const META_SELECTORS: &[&str] = &[
    r#"meta[name="description"]"#,
    r#"meta[property="og:description"]"#,
    r#"meta[name="Description"]"#,
    r#"meta[property="description"]"#,
];

const BOILERPLATE: &[&str] = &[
    "cookie",
    "privacy",
    "gdpr",
    "accept",
    "terms",
    "subscribe",
    "newsletter",
    "email",
];

/// Elements whose paragraphs are never the description.
const CHROME: &[&str] = &["script", "style", "nav", "header", "footer"];

const PREFIXES: &[&str] = &["welcome to ", "about ", "home - ", "home | "];

const MIN_META_CHARS: usize = 21;
const MIN_PARAGRAPH_CHARS: usize = 50;
const MIN_HEADING_CHARS: usize = 11;
const MAX_DESCRIPTION_CHARS: usize = 500;
const MAX_HEADINGS_CHARS: usize = 300;

#[derive(Debug, Clone)]
pub struct SiteScraper {
    client: Client,
}

impl SiteScraper {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetch `url` and describe the business. An empty string means the
    /// page had nothing usable.
    pub async fn describe(&self, url: &str) -> EnrichResult<String> {
        let url = with_scheme(url);
        if url.is_empty() {
            return Ok(String::new());
        }
        let response = self
            .client
            .get(&url)
            .header(USER_AGENT, BROWSER_AGENT)
            .send()
            .await?;
        let body = check_status(SCRAPER, response)?.text().await?;
        Ok(extract_description(&body))
    }
}

/// Prefix `https://` when the URL carries no scheme.
pub fn with_scheme(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() || url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Best description a page offers: its meta description, else the first
/// substantial content paragraph, else its title and leading headings.
pub fn extract_description(html: &str) -> String {
    let document = Html::parse_document(html);
    meta_description(&document)
        .or_else(|| first_paragraph(&document))
        .or_else(|| headings(&document))
        .unwrap_or_default()
}

fn meta_description(document: &Html) -> Option<String> {
    META_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| {
            document
                .select(&selector)
                .filter_map(|meta| meta.value().attr("content"))
                .map(str::trim)
                .find(|content| content.chars().count() >= MIN_META_CHARS)
                .map(|content| truncate(&clean_text(content), MAX_DESCRIPTION_CHARS))
        })
}

fn first_paragraph(document: &Html) -> Option<String> {
    let selector = Selector::parse("p").ok()?;
    document
        .select(&selector)
        .filter(|p| !inside_chrome(p))
        .map(|p| clean_text(&element_text(p)))
        .filter(|text| text.chars().count() >= MIN_PARAGRAPH_CHARS)
        .find(|text| {
            let lower = text.to_lowercase();
            !BOILERPLATE.iter().any(|word| lower.contains(word))
        })
        .map(|text| truncate(&text, MAX_DESCRIPTION_CHARS))
}

fn headings(document: &Html) -> Option<String> {
    let mut parts = Vec::new();

    if let Some(title) = Selector::parse("title")
        .ok()
        .and_then(|s| document.select(&s).next())
    {
        let text = clean_text(&element_text(title));
        if !text.is_empty() {
            parts.push(text);
        }
    }

    if let Ok(selector) = Selector::parse("h1, h2") {
        parts.extend(
            document
                .select(&selector)
                .take(3)
                .map(|h| clean_text(&element_text(h)))
                .filter(|text| text.chars().count() >= MIN_HEADING_CHARS),
        );
    }

    if parts.is_empty() {
        return None;
    }
    Some(truncate(&clean_text(&parts.join(" - ")), MAX_HEADINGS_CHARS))
}

fn inside_chrome(element: &ElementRef<'_>) -> bool {
    element.ancestors().any(|node| {
        node.value()
            .as_element()
            .is_some_and(|e| CHROME.contains(&e.name()))
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

/// Collapse whitespace and drop a leading "Welcome to"-style prefix.
pub fn clean_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    for prefix in PREFIXES {
        let matches = collapsed
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
        if matches {
            return collapsed[prefix.len()..].trim().to_string();
        }
    }
    collapsed
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].trim_end().to_string(),
        None => text.to_string(),
    }
}
