// ============================================================================
// File: src/search_client.rs
// Listing search: keyed search API, scraped results page, synthetic fallback
// ============================================================================

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Serialize;

use crate::config::SearchConfig;
use crate::criteria::SearchCriteria;
use crate::models::SearchApiResponse;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

static PRICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\s?\d{1,3}(?:,\d{3})+|\$\d{4,6}\b").expect("valid price pattern")
});

/// An unverified reference to a vehicle that may be for sale
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingCandidate {
    pub title: String,
    pub source_name: String,
    pub url: Option<String>,
    pub price_text: Option<String>,
    pub snippet: String,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<ListingCandidate>>;
}

/// Result of running the source chain
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub source: &'static str,
    pub candidates: Vec<ListingCandidate>,
}

/// Tries each source in order; the first non-empty answer wins. A failing
/// source counts as empty.
pub struct ListingSearch {
    sources: Vec<Arc<dyn ListingSource>>,
    max_results: usize,
}

impl ListingSearch {
    pub fn new(sources: Vec<Arc<dyn ListingSource>>, max_results: usize) -> Self {
        Self { sources, max_results }
    }

    /// Engine (when keyed), scraper, the given catalog source, then synthetic
    pub fn from_config(config: &SearchConfig, catalog: Arc<dyn ListingSource>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        let mut sources: Vec<Arc<dyn ListingSource>> = Vec::new();
        match config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            Some(key) => sources.push(Arc::new(EngineSource::new(
                client.clone(),
                config.engine_url.clone(),
                key.to_string(),
                config.allowed_domains.clone(),
            ))),
            None => tracing::info!("search API key not configured, engine-backed search disabled"),
        }
        sources.push(Arc::new(ScrapeSource::new(
            client,
            config.scrape_url.clone(),
            config.allowed_domains.clone(),
        )));
        sources.push(catalog);
        sources.push(Arc::new(SyntheticSource));

        Ok(Self::new(sources, config.max_results))
    }

    pub async fn search(&self, criteria: &SearchCriteria) -> SearchOutcome {
        for source in &self.sources {
            match source.search(criteria).await {
                Ok(mut candidates) if !candidates.is_empty() => {
                    candidates.truncate(self.max_results);
                    tracing::debug!(source = source.name(), count = candidates.len(), "listing search hit");
                    return SearchOutcome { source: source.name(), candidates };
                }
                Ok(_) => tracing::debug!(source = source.name(), "listing search empty"),
                Err(e) => tracing::warn!(source = source.name(), error = %e, "listing source failed"),
            }
        }

        // Only reachable with a chain that lacks the synthetic source
        SearchOutcome {
            source: SyntheticSource.name(),
            candidates: synthetic_candidates(criteria),
        }
    }
}

/// Keyed web search API, restricted to known listing sites
pub struct EngineSource {
    client: Client,
    base_url: String,
    api_key: String,
    allowed_domains: Vec<String>,
}

impl EngineSource {
    pub fn new(client: Client, base_url: String, api_key: String, allowed_domains: Vec<String>) -> Self {
        Self { client, base_url, api_key, allowed_domains }
    }
}

#[async_trait]
impl ListingSource for EngineSource {
    fn name(&self) -> &'static str {
        "search_api"
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<ListingCandidate>> {
        let query = criteria.query();
        let http_response = self
            .client
            .get(&self.base_url)
            .query(&[("q", query.as_str()), ("count", "20")])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .send()
            .await?;

        if !http_response.status().is_success() {
            let status = http_response.status();
            let error_text = http_response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Search API error: HTTP {}\nResponse: {}",
                status,
                truncate(&error_text, 500)
            ));
        }

        let response_text = http_response.text().await?;
        let response: SearchApiResponse = serde_json::from_str(&response_text).map_err(|e| {
            anyhow!(
                "Failed to parse search response as JSON: {}\nRaw response (first 500 chars): {}",
                e,
                truncate(&response_text, 500)
            )
        })?;

        let results = response.web.map(|w| w.results).unwrap_or_default();
        Ok(results
            .into_iter()
            .filter_map(|r| {
                let domain = allowed_domain(&r.url, &self.allowed_domains)?;
                Some(candidate(r.title, domain, r.url, r.description))
            })
            .collect())
    }
}

/// Scrapes a plain HTML search results page
pub struct ScrapeSource {
    client: Client,
    base_url: String,
    allowed_domains: Vec<String>,
}

impl ScrapeSource {
    pub fn new(client: Client, base_url: String, allowed_domains: Vec<String>) -> Self {
        Self { client, base_url, allowed_domains }
    }
}

#[async_trait]
impl ListingSource for ScrapeSource {
    fn name(&self) -> &'static str {
        "web_scrape"
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<ListingCandidate>> {
        let query = criteria.query();
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[("q", query.as_str())])
            .header("Accept", "text/html")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(anyhow!("Search page error: HTTP {}", resp.status()));
        }

        let body = resp.text().await?;
        parse_results_page(&body, &self.allowed_domains)
    }
}

/// Result blocks of a DuckDuckGo-style HTML page, kept only when the link
/// points at an allowed listing site.
pub fn parse_results_page(body: &str, allowed_domains: &[String]) -> Result<Vec<ListingCandidate>> {
    let doc = Html::parse_document(body);
    let result_sel = selector(".result")?;
    let link_sel = selector("a.result__a")?;
    let snippet_sel = selector("a.result__snippet, .result__snippet")?;

    let mut out = Vec::new();
    for result in doc.select(&result_sel) {
        let Some(link) = result.select(&link_sel).next() else {
            continue;
        };
        let title = link.text().collect::<String>().trim().to_string();
        let url = unwrap_redirect(link.value().attr("href").unwrap_or(""));
        let snippet = result
            .select(&snippet_sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        if title.is_empty() {
            continue;
        }
        if let Some(domain) = allowed_domain(&url, allowed_domains) {
            out.push(candidate(title, domain, url, snippet));
        }
    }
    Ok(out)
}

/// Always answers, with links to listing-site searches for the criteria
pub struct SyntheticSource;

#[async_trait]
impl ListingSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<ListingCandidate>> {
        Ok(synthetic_candidates(criteria))
    }
}

fn synthetic_candidates(criteria: &SearchCriteria) -> Vec<ListingCandidate> {
    let terms = if criteria.query_terms.is_empty() {
        "car".to_string()
    } else {
        criteria.query_terms.join(" ")
    };
    let budget = criteria
        .max_price
        .map(|p| format!(" under ${}", p))
        .unwrap_or_default();
    let keyword: String =
        url::form_urlencoded::byte_serialize(format!("{} {}", terms, criteria.location).as_bytes()).collect();

    vec![
        ListingCandidate {
            title: format!("{} for sale near {}", title_case(&terms), criteria.location),
            source_name: "cars.com".to_string(),
            url: Some(format!("https://www.cars.com/shopping/results/?keyword={}", keyword)),
            price_text: criteria.max_price.map(|p| format!("${}", p)),
            snippet: format!("Browse {} listings{} from dealers near {}.", terms, budget, criteria.location),
        },
        ListingCandidate {
            title: format!("Shop {} near {}", title_case(&terms), criteria.location),
            source_name: "autotrader.com".to_string(),
            url: Some(format!("https://www.autotrader.com/cars-for-sale/all-cars?keywordPhrases={}", keyword)),
            price_text: None,
            snippet: format!("New and used {} inventory{}.", terms, budget),
        },
    ]
}

fn candidate(title: String, source_name: String, url: String, snippet: String) -> ListingCandidate {
    let price_text = PRICE
        .find(&title)
        .or_else(|| PRICE.find(&snippet))
        .map(|m| m.as_str().to_string());
    ListingCandidate {
        title,
        source_name,
        url: Some(url),
        price_text,
        snippet: truncate(&snippet, 200),
    }
}

/// The allow-listed domain `url` belongs to, if any
pub fn allowed_domain(url: &str, allowed: &[String]) -> Option<String> {
    let host = url::Url::parse(url).ok()?.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    allowed
        .iter()
        .find(|d| host == d.as_str() || host.ends_with(&format!(".{}", d)))
        .cloned()
}

/// Result links are sometimes wrapped like
/// `//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com&rut=...`
fn unwrap_redirect(href: &str) -> String {
    if let Some(pos) = href.find("uddg=") {
        let start = pos + 5;
        let end = href[start..].find('&').map(|i| start + i).unwrap_or(href.len());
        let encoded = &href[start..end];
        if !encoded.is_empty() {
            return percent_decode_str(encoded).decode_utf8_lossy().into_owned();
        }
    }
    href.to_string()
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {}: {:?}", css, e))
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
