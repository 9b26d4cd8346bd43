//! HTTP surface: an Anthropic Messages API in front of a chat-completions
//! backend.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::stream::Stream;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{ChatBackend, HttpBackend};
use crate::config::{SearchSettings, Settings};
use crate::convert::request::{ConversionOptions, ConvertedRequest, anthropic_to_chat};
use crate::convert::response::{chat_to_anthropic, reconcile_stop_reason};
use crate::error::{NOT_FOUND_ERROR, ProxyError};
use crate::protocol::anthropic::{
    ContentBlock, CountTokensResponse, ErrorEnvelope, MessagesRequest, MessagesResponse, Usage,
};
use crate::protocol::openai::ChatToolCall;
use crate::search::{SearchProvider, TavilyClient};
use crate::server_tools::{ServerToolExecutor, ServerToolRegistry, WebSearchTool};
use crate::stream::state::StreamState;
use crate::stream::{StreamSession, anthropic_event_stream};
use crate::tokens;

pub struct ProxyState {
    pub backend: Arc<dyn ChatBackend>,
    pub registry: ServerToolRegistry,
    pub conversion: ConversionOptions,
    /// Search budget for tool definitions without their own `max_uses`.
    pub search_max_uses: u32,
    /// Key clients must present. Proxy auth is off when `None`.
    pub api_key: Option<String>,
}

impl ProxyState {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let backend = HttpBackend::new(&settings.backend).context("Failed to build backend client")?;
        Ok(Self {
            backend: Arc::new(backend),
            registry: build_registry(&settings.search)?,
            conversion: ConversionOptions::from(&settings.backend),
            search_max_uses: settings.search.max_uses,
            api_key: settings.server.api_key.clone().filter(|key| !key.is_empty()),
        })
    }
}

fn build_registry(search: &SearchSettings) -> Result<ServerToolRegistry> {
    let provider: Option<Arc<dyn SearchProvider>> =
        match search.tavily_api_key.as_deref().filter(|key| !key.is_empty()) {
            Some(key) => Some(Arc::new(
                TavilyClient::new(&search.base_url, key, search.timeout())
                    .context("Failed to build search client")?,
            )),
            None => {
                warn!("no search API key configured; web searches will report unavailable");
                None
            }
        };
    let web_search = WebSearchTool::new(provider, search.timeout(), search.max_results);
    Ok(ServerToolRegistry::new().with_tool(Arc::new(web_search)))
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .route("/v1/models", get(models_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

/// Serves until ctrl-c.
pub async fn start_server(settings: &Settings) -> Result<()> {
    let state = Arc::new(ProxyState::from_settings(settings)?);
    let app = router(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(
        %addr,
        backend = %settings.backend.chat_completions_url(),
        "messages-bridge listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn fallback_handler(req: axum::extract::Request) -> Response {
    let uri = req.uri().clone();

    // Client telemetry
    if uri.path().contains("event_logging") {
        return StatusCode::NO_CONTENT.into_response();
    }

    debug!(%uri, "unmatched route");
    (
        StatusCode::NOT_FOUND,
        Json(ErrorEnvelope::new(NOT_FOUND_ERROR, format!("Not found: {}", uri.path()))),
    )
        .into_response()
}

/// The caller's key from `x-api-key` or `Authorization: Bearer`.
fn client_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        return Some(strip_bearer_prefix(key).unwrap_or(key).to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| strip_bearer_prefix(value.trim()))
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

fn strip_bearer_prefix(auth: &str) -> Option<&str> {
    let (scheme, token) = auth.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

fn authorize(state: &ProxyState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    match client_credential(headers) {
        Some(presented) if &presented == expected => Ok(()),
        Some(_) => Err(ProxyError::Authentication("invalid x-api-key".to_string())),
        None => Err(ProxyError::Authentication(
            "missing x-api-key or Authorization header".to_string(),
        )),
    }
}

/// The backend to call for this request. Without proxy auth, a keyless
/// backend borrows the caller's credential.
fn backend_for(state: &ProxyState, headers: &HeaderMap) -> Arc<dyn ChatBackend> {
    if state.api_key.is_none()
        && let Some(credential) = client_credential(headers)
        && let Some(backend) = state.backend.with_credential(&credential)
    {
        return backend;
    }
    state.backend.clone()
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ProxyError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ProxyError::validation(rejection.body_text()))
}

fn sse_response(
    stream: impl Stream<Item = Result<String, Infallible>> + Send + 'static,
) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn messages_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Result<Json<MessagesRequest>, JsonRejection>,
) -> Response {
    handle_messages(state, headers, body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_messages(
    state: Arc<ProxyState>,
    headers: HeaderMap,
    body: Result<Json<MessagesRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    authorize(&state, &headers)?;
    let request = json_body(body)?;
    let converted = anthropic_to_chat(&request, &state.registry, &state.conversion)?;
    let backend = backend_for(&state, &headers);

    info!(
        model = %request.model,
        stream = request.is_streaming(),
        messages = request.messages.len(),
        tools = request.tools.as_ref().map_or(0, Vec::len),
        server_tools = converted.server_tools.len(),
        "messages request"
    );

    if !request.is_streaming() {
        let message =
            complete_message(backend.as_ref(), converted, &request.model, state.search_max_uses)
                .await?;
        return Ok(Json(message).into_response());
    }

    let ConvertedRequest {
        request: chat_request,
        server_tools,
    } = converted;
    let executor = ServerToolExecutor::new(server_tools, state.search_max_uses);
    let intercepted = executor
        .as_ref()
        .map(ServerToolExecutor::tool_names)
        .unwrap_or_default();

    // Failures before the first byte keep their HTTP status.
    let first = backend.stream(&chat_request).await?;
    let session = StreamSession {
        backend,
        request: chat_request,
        executor,
        state: StreamState::new(request.model.clone(), tokens::estimate_input_tokens(&request))
            .with_intercepted(intercepted),
    };
    Ok(sse_response(anthropic_event_stream(session, first)))
}

/// Non-streamed turn, including any server-tool rounds. Blocks from earlier
/// rounds precede the final round's blocks; usage is summed across rounds.
async fn complete_message(
    backend: &dyn ChatBackend,
    converted: ConvertedRequest,
    model: &str,
    default_max_uses: u32,
) -> Result<MessagesResponse, ProxyError> {
    let ConvertedRequest {
        mut request,
        server_tools,
    } = converted;
    let mut executor = ServerToolExecutor::new(server_tools, default_max_uses);
    let mut earlier: Vec<ContentBlock> = Vec::new();
    let mut usage = Usage::default();
    let mut searches = 0u32;

    loop {
        let response = backend.complete(&request).await?;
        let mut message = chat_to_anthropic(&response, model)?;
        usage.accumulate(&message.usage);

        let Some(executor) = executor.as_mut() else {
            return Ok(assemble(earlier, message, usage, searches));
        };
        let calls: Vec<ChatToolCall> = response
            .choices
            .first()
            .and_then(|choice| choice.message.tool_calls.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|mut call| {
                if call.id.is_empty() {
                    call.id = tokens::tool_use_id();
                }
                call
            })
            .collect();
        let (server_calls, client_calls) = executor.partition(&calls);
        if server_calls.is_empty() {
            return Ok(assemble(earlier, message, usage, searches));
        }

        let server_names = executor.tool_names();
        let mut round_blocks = std::mem::take(&mut message.content);
        round_blocks.retain(|block| {
            !matches!(block, ContentBlock::ToolUse { name, .. } if server_names.contains(name))
        });

        let mut results = Vec::with_capacity(server_calls.len());
        for call in &server_calls {
            let outcome = executor.execute(call).await;
            if outcome.performed {
                searches += 1;
            }
            round_blocks.extend(outcome.blocks);
            results.push(outcome.message);
        }

        if !client_calls.is_empty() {
            info!(
                client_calls = client_calls.len(),
                "client tool calls pending; no follow-up round"
            );
            message.content = round_blocks;
            return Ok(assemble(earlier, message, usage, searches));
        }

        earlier.extend(round_blocks);
        if !executor.prepare_follow_up(&mut request, server_calls, results) {
            return Ok(assemble(earlier, message, usage, searches));
        }
        debug!("requesting follow-up round");
    }
}

fn assemble(
    mut earlier: Vec<ContentBlock>,
    mut message: MessagesResponse,
    usage: Usage,
    searches: u32,
) -> MessagesResponse {
    earlier.append(&mut message.content);
    message.content = earlier;
    let has_tool_use = message
        .content
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolUse { .. }));
    message.stop_reason = message
        .stop_reason
        .map(|reason| reconcile_stop_reason(reason, has_tool_use));
    message.usage = usage.with_web_search_requests(searches);
    message
}

async fn count_tokens_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Result<Json<MessagesRequest>, JsonRejection>,
) -> Result<Json<CountTokensResponse>, ProxyError> {
    authorize(&state, &headers)?;
    let request = json_body(body)?;
    if request.messages.is_empty() {
        return Err(ProxyError::validation("messages: at least one message is required"));
    }
    Ok(Json(CountTokensResponse {
        input_tokens: tokens::estimate_input_tokens(&request),
    }))
}

async fn models_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProxyError> {
    authorize(&state, &headers)?;
    let backend = backend_for(&state, &headers);
    Ok(Json(backend.list_models().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSettings;
    use crate::server_tools::tests::CountingTool;
    use wiremock::matchers::{body_string_contains, header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn proxy_state(backend_uri: &str, api_key: Option<&str>) -> ProxyState {
        let settings = BackendSettings {
            base_url: format!("{backend_uri}/v1"),
            request_timeout_secs: 5,
            ..BackendSettings::default()
        };
        ProxyState {
            backend: Arc::new(HttpBackend::new(&settings).unwrap()),
            registry: ServerToolRegistry::new().with_tool(Arc::new(CountingTool::default())),
            conversion: ConversionOptions::default(),
            search_max_uses: 5,
            api_key: api_key.map(str::to_string),
        }
    }

    async fn spawn(state: ProxyState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(Arc::new(state))).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn hello(stream: bool) -> Value {
        json!({
            "model": "claude-sonnet",
            "max_tokens": 64,
            "stream": stream,
            "messages": [{"role": "user", "content": "hi"}]
        })
    }

    fn chat_reply(content: &str) -> Value {
        json!({
            "id": "c1",
            "choices": [{"message": {"content": content}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        })
    }

    async fn post(url: String, body: &Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(url)
            .json(body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn non_streaming_round_trip() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("hello")))
            .expect(1)
            .mount(&backend)
            .await;
        let base = spawn(proxy_state(&backend.uri(), None)).await;

        let response = post(format!("{base}/v1/messages"), &hello(false)).await;
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["type"], "message");
        assert_eq!(body["model"], "claude-sonnet");
        assert_eq!(body["content"], json!([{"type": "text", "text": "hello"}]));
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["usage"]["input_tokens"], 12);
    }

    #[tokio::test]
    async fn streaming_round_trip() {
        let backend = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n\
                   data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
                   data: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&backend)
            .await;
        let base = spawn(proxy_state(&backend.uri(), None)).await;

        let response = post(format!("{base}/v1/messages"), &hello(true)).await;
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let body = response.text().await.unwrap();
        let names: Vec<&str> = body
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(body.contains("\"text\":\"hi\""));
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_backend() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("x")))
            .expect(0)
            .mount(&backend)
            .await;
        let base = spawn(proxy_state(&backend.uri(), None)).await;

        let missing_max_tokens = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let response = post(format!("{base}/v1/messages"), &missing_max_tokens).await;
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");

        let malformed = reqwest::Client::new()
            .post(format!("{base}/v1/messages"))
            .header(header::CONTENT_TYPE, "application/json")
            .body("{\"model\":")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), 400);
        let body: Value = malformed.json().await.unwrap();
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn backend_status_is_passed_through() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "Rate limit reached"}
            })))
            .mount(&backend)
            .await;
        let base = spawn(proxy_state(&backend.uri(), None)).await;

        for stream in [false, true] {
            let response = post(format!("{base}/v1/messages"), &hello(stream)).await;
            assert_eq!(response.status(), 429);
            let body: Value = response.json().await.unwrap();
            assert_eq!(body["error"]["type"], "rate_limit_error");
            assert_eq!(body["error"]["message"], "Rate limit reached");
        }
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let base = spawn(proxy_state(&dead, None)).await;

        let response = post(format!("{base}/v1/messages"), &hello(false)).await;
        assert_eq!(response.status(), 502);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["type"], "connection_error");
    }

    #[tokio::test]
    async fn proxy_key_is_enforced() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("ok")))
            .mount(&backend)
            .await;
        let base = spawn(proxy_state(&backend.uri(), Some("secret"))).await;
        let client = reqwest::Client::new();
        let url = format!("{base}/v1/messages");

        let anonymous = client.post(&url).json(&hello(false)).send().await.unwrap();
        assert_eq!(anonymous.status(), 401);
        let body: Value = anonymous.json().await.unwrap();
        assert_eq!(body["error"]["type"], "authentication_error");

        let wrong = client
            .post(&url)
            .header("x-api-key", "nope")
            .json(&hello(false))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401);

        let with_key = client
            .post(&url)
            .header("x-api-key", "secret")
            .json(&hello(false))
            .send()
            .await
            .unwrap();
        assert_eq!(with_key.status(), 200);

        let with_bearer = client
            .post(&url)
            .header(header::AUTHORIZATION, "Bearer secret")
            .json(&hello(false))
            .send()
            .await
            .unwrap();
        assert_eq!(with_bearer.status(), 200);
    }

    #[tokio::test]
    async fn client_credential_reaches_keyless_backend() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_is("authorization", "Bearer sk-client"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("ok")))
            .expect(1)
            .mount(&backend)
            .await;
        let base = spawn(proxy_state(&backend.uri(), None)).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/v1/messages"))
            .header("x-api-key", "sk-client")
            .json(&hello(false))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn search_round_is_folded_into_one_message() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("\"role\":\"tool\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "Rust 1.90 is out."}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 40, "completion_tokens": 6}
            })))
            .with_priority(1)
            .expect(1)
            .mount(&backend)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "content": "",
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "web_search", "arguments": "{\"query\":\"rust release\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 30, "completion_tokens": 8}
            })))
            .expect(1)
            .mount(&backend)
            .await;
        let base = spawn(proxy_state(&backend.uri(), None)).await;

        let mut request = hello(false);
        request["tools"] = json!([{"type": "web_search_20250305", "name": "web_search", "max_uses": 3}]);
        let response = post(format!("{base}/v1/messages"), &request).await;
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();

        let types: Vec<&str> = body["content"]
            .as_array()
            .unwrap()
            .iter()
            .map(|block| block["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["server_tool_use", "web_search_tool_result", "text"]);
        assert_eq!(body["content"][0]["input"]["query"], "rust release");
        assert!(body["content"][0]["id"].as_str().unwrap().starts_with("srvtoolu_"));
        assert_eq!(body["content"][1]["tool_use_id"], body["content"][0]["id"]);
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["usage"]["input_tokens"], 70);
        assert_eq!(body["usage"]["output_tokens"], 14);
        assert_eq!(body["usage"]["server_tool_use"]["web_search_requests"], 1);
    }

    #[tokio::test]
    async fn mixed_tool_calls_return_to_the_client() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "content": "",
                        "tool_calls": [
                            {"id": "call_s", "type": "function",
                             "function": {"name": "web_search", "arguments": "{\"query\":\"q\"}"}},
                            {"id": "call_c", "type": "function",
                             "function": {"name": "read_file", "arguments": "{\"path\":\"a\"}"}}
                        ]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .expect(1)
            .mount(&backend)
            .await;
        let base = spawn(proxy_state(&backend.uri(), None)).await;

        let mut request = hello(false);
        request["tools"] = json!([
            {"type": "web_search_20250305", "name": "web_search"},
            {"name": "read_file", "input_schema": {"type": "object"}}
        ]);
        let body: Value = post(format!("{base}/v1/messages"), &request)
            .await
            .json()
            .await
            .unwrap();

        let types: Vec<&str> = body["content"]
            .as_array()
            .unwrap()
            .iter()
            .map(|block| block["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["tool_use", "server_tool_use", "web_search_tool_result"]);
        assert_eq!(body["content"][0]["id"], "call_c");
        assert_eq!(body["stop_reason"], "tool_use");
    }

    #[tokio::test]
    async fn auxiliary_endpoints() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "qwen3"}]})))
            .mount(&backend)
            .await;
        let base = spawn(proxy_state(&backend.uri(), None)).await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health, json!({"status": "healthy"}));

        let models: Value = client
            .get(format!("{base}/v1/models"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(models["data"][0]["id"], "qwen3");

        let count = post(
            format!("{base}/v1/messages/count_tokens"),
            &json!({"model": "m", "messages": [{"role": "user", "content": "abcdefgh"}]}),
        )
        .await;
        assert_eq!(count.status(), 200);
        let count: Value = count.json().await.unwrap();
        assert!(count["input_tokens"].as_u64().unwrap() >= 2);

        let telemetry = post(format!("{base}/api/event_logging/batch"), &json!({})).await;
        assert_eq!(telemetry.status(), 204);

        let missing = client.get(format!("{base}/v2/nothing")).send().await.unwrap();
        assert_eq!(missing.status(), 404);
        let body: Value = missing.json().await.unwrap();
        assert_eq!(body["error"]["type"], "not_found_error");
    }
}
