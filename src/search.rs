//! External web search capability.
//!
//! The proxy only needs "query in, ranked results out"; [`SearchProvider`] is
//! that seam and [`TavilyClient`] the HTTP implementation behind it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::header;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct SearchQuery<'a> {
    pub query: &'a str,
    pub max_results: usize,
    pub allowed_domains: &'a [String],
    pub blocked_domains: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub page_age: Option<String>,
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search query must be a non-empty string.")]
    InvalidInput,

    #[error("Search query exceeds {0} characters.")]
    QueryTooLong(usize),

    #[error("Search provider rate limit reached.")]
    RateLimited,

    #[error("Search timed out after {}s.", .0.as_secs())]
    Timeout(Duration),

    #[error("Web search is not configured on this proxy.")]
    NotConfigured,

    #[error("Search provider unavailable: {0}")]
    Unavailable(String),
}

impl SearchError {
    /// `error_code` reported in `web_search_tool_result_error` blocks.
    pub fn error_code(&self) -> &'static str {
        match self {
            SearchError::InvalidInput => "invalid_tool_input",
            SearchError::QueryTooLong(_) => "query_too_long",
            SearchError::RateLimited => "too_many_requests",
            SearchError::Timeout(_) | SearchError::NotConfigured | SearchError::Unavailable(_) => {
                "unavailable"
            }
        }
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SearchHit>, SearchError>;
}

// ============================================================================
// Tavily
// ============================================================================

pub const TAVILY_DEFAULT_URL: &str = "https://api.tavily.com";

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    max_results: usize,
    search_depth: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_domains: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exclude_domains: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    published_date: Option<String>,
}

pub struct TavilyClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl TavilyClient {
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build search HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/search", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            timeout,
        })
    }
}

fn non_empty(domains: &[String]) -> Option<&[String]> {
    (!domains.is_empty()).then_some(domains)
}

#[async_trait]
impl SearchProvider for TavilyClient {
    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SearchHit>, SearchError> {
        let body = TavilyRequest {
            query: query.query,
            max_results: query.max_results,
            search_depth: "basic",
            include_domains: non_empty(query.allowed_domains),
            exclude_domains: non_empty(query.blocked_domains),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout(self.timeout)
                } else {
                    SearchError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), body = %body, "search provider error");
            return Err(match status.as_u16() {
                // 432/433 are Tavily's plan and pay-as-you-go limits
                429 | 432 | 433 => SearchError::RateLimited,
                _ => SearchError::Unavailable(format!(
                    "{} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("error")
                )),
            });
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Unavailable(format!("invalid search response: {e}")))?;

        Ok(parsed
            .results
            .into_iter()
            .filter(|r| !r.url.is_empty())
            .take(query.max_results)
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.content,
                page_age: r.published_date,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query<'a>(text: &'a str, allowed: &'a [String]) -> SearchQuery<'a> {
        SearchQuery {
            query: text,
            max_results: 2,
            allowed_domains: allowed,
            blocked_domains: &[],
        }
    }

    #[tokio::test]
    async fn tavily_maps_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header_eq("authorization", "Bearer tvly-test"))
            .and(body_partial_json(json!({
                "query": "rust sse",
                "max_results": 2,
                "include_domains": ["docs.rs"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "query": "rust sse",
                "results": [
                    {"title": "A", "url": "https://docs.rs/a", "content": "first", "score": 0.9},
                    {"title": "B", "url": "https://docs.rs/b", "content": "second", "published_date": "2025-01-02"},
                    {"title": "C", "url": "https://docs.rs/c", "content": "third"}
                ]
            })))
            .mount(&server)
            .await;

        let client = TavilyClient::new(&server.uri(), "tvly-test", Duration::from_secs(5)).unwrap();
        let allowed = vec!["docs.rs".to_string()];
        let hits = client.search(&query("rust sse", &allowed)).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].snippet, "first");
        assert_eq!(hits[1].page_age.as_deref(), Some("2025-01-02"));
    }

    #[tokio::test]
    async fn tavily_rate_limit_maps_to_too_many_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = TavilyClient::new(&server.uri(), "k", Duration::from_secs(5)).unwrap();
        let err = client.search(&query("q", &[])).await.unwrap_err();
        assert!(matches!(err, SearchError::RateLimited));
        assert_eq!(err.error_code(), "too_many_requests");
    }

    #[tokio::test]
    async fn tavily_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = TavilyClient::new(&server.uri(), "k", Duration::from_secs(5)).unwrap();
        let err = client.search(&query("q", &[])).await.unwrap_err();
        assert_eq!(err.error_code(), "unavailable");
    }

    #[tokio::test]
    async fn tavily_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": []}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client = TavilyClient::new(&server.uri(), "k", Duration::from_millis(100)).unwrap();
        let err = client.search(&query("q", &[])).await.unwrap_err();
        assert!(matches!(err, SearchError::Timeout(_)), "{err:?}");
    }
}
