//! The `web_search` server tool, executed by the proxy through a [`SearchProvider`].

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{ServerTool, ServerToolConfig, ToolExecution, ToolFailure};
use crate::protocol::anthropic::{
    ContentBlock, ToolDefinition, WebSearchContent, WebSearchResult, WebSearchToolError,
};
use crate::protocol::openai::ChatTool;
use crate::search::{SearchError, SearchHit, SearchProvider, SearchQuery};

pub const WEB_SEARCH_TOOL_NAME: &str = "web_search";
const DEFINITION_TYPE_PREFIX: &str = "web_search_";
pub const MAX_QUERY_CHARS: usize = 400;

impl From<SearchError> for ToolFailure {
    fn from(err: SearchError) -> Self {
        ToolFailure {
            code: err.error_code(),
            message: err.to_string(),
        }
    }
}

/// Web search run by the proxy on the backend's behalf.
///
/// Without a provider every invocation reports `unavailable`; the backend is
/// told so and can answer from its own knowledge.
pub struct WebSearchTool {
    provider: Option<Arc<dyn SearchProvider>>,
    timeout: Duration,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(provider: Option<Arc<dyn SearchProvider>>, timeout: Duration, max_results: usize) -> Self {
        Self {
            provider,
            timeout,
            max_results,
        }
    }

    async fn run(&self, query: &str, config: &ServerToolConfig) -> Result<Vec<SearchHit>, SearchError> {
        let provider = self.provider.as_ref().ok_or(SearchError::NotConfigured)?;
        let request = SearchQuery {
            query,
            max_results: self.max_results,
            allowed_domains: &config.allowed_domains,
            blocked_domains: &config.blocked_domains,
        };
        tokio::time::timeout(self.timeout, provider.search(&request))
            .await
            .map_err(|_| SearchError::Timeout(self.timeout))?
    }
}

fn query_from_input(input: &Value) -> Result<&str, SearchError> {
    let query = input
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or(SearchError::InvalidInput)?;
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(SearchError::QueryTooLong(MAX_QUERY_CHARS));
    }
    Ok(query)
}

#[async_trait]
impl ServerTool for WebSearchTool {
    fn name(&self) -> &'static str {
        WEB_SEARCH_TOOL_NAME
    }

    fn handles(&self, definition: &ToolDefinition) -> bool {
        definition
            .tool_type
            .as_deref()
            .is_some_and(|t| t.starts_with(DEFINITION_TYPE_PREFIX))
    }

    fn function_definition(&self) -> ChatTool {
        ChatTool::function(
            WEB_SEARCH_TOOL_NAME.to_string(),
            Some(
                "Search the web for current information. Returns titles, URLs and snippets \
                 of the most relevant pages."
                    .to_string(),
            ),
            Some(json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The search query"}
                },
                "required": ["query"]
            })),
        )
    }

    async fn execute(&self, tool_use_id: &str, input: &Value, config: &ServerToolConfig) -> ToolExecution {
        let query = match query_from_input(input) {
            Ok(query) => query,
            Err(err) => return self.refuse(tool_use_id, err.into()),
        };

        match self.run(query, config).await {
            Ok(hits) => {
                info!(query, results = hits.len(), "web search completed");
                let backend_results: Vec<Value> = hits
                    .iter()
                    .map(|hit| {
                        json!({
                            "title": hit.title,
                            "url": hit.url,
                            "snippet": hit.snippet,
                            "page_age": hit.page_age,
                        })
                    })
                    .collect();
                let results = hits
                    .into_iter()
                    .map(|hit| WebSearchResult::new(hit.url, hit.title, hit.snippet, hit.page_age))
                    .collect();
                ToolExecution {
                    result_block: ContentBlock::WebSearchToolResult {
                        tool_use_id: tool_use_id.to_string(),
                        content: WebSearchContent::Results(results),
                    },
                    backend_content: json!({ "query": query, "results": backend_results }),
                    performed: true,
                }
            }
            Err(err) => {
                warn!(query, error = %err, "web search failed");
                // A configured provider was contacted even if it failed.
                let performed = !matches!(err, SearchError::NotConfigured);
                ToolExecution {
                    performed,
                    ..self.refuse(tool_use_id, err.into())
                }
            }
        }
    }

    fn refuse(&self, tool_use_id: &str, failure: ToolFailure) -> ToolExecution {
        ToolExecution {
            result_block: ContentBlock::WebSearchToolResult {
                tool_use_id: tool_use_id.to_string(),
                content: WebSearchContent::Error(WebSearchToolError::new(failure.code)),
            },
            backend_content: failure.backend_content(),
            performed: false,
        }
    }
}
