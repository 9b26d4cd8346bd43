//! The chat-completions backend.

use async_trait::async_trait;
use axum::http::header;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::BackendSettings;
use crate::error::ProxyError;
use crate::protocol::openai::{ChatCompletionRequest, ChatCompletionResponse};

/// What a streamed request produced.
pub enum BackendStream {
    /// Raw SSE bytes.
    Events(BoxStream<'static, Result<Bytes, ProxyError>>),
    /// The backend ignored `stream: true` and answered with one JSON body.
    Complete(ChatCompletionResponse),
}

impl std::fmt::Debug for BackendStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendStream::Events(_) => f.write_str("BackendStream::Events"),
            BackendStream::Complete(response) => {
                f.debug_tuple("BackendStream::Complete").field(response).finish()
            }
        }
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProxyError>;

    async fn stream(&self, request: &ChatCompletionRequest) -> Result<BackendStream, ProxyError>;

    /// The backend's `/models` listing, passed through untouched.
    async fn list_models(&self) -> Result<Value, ProxyError>;

    /// A backend that authenticates with the caller's own credential, for
    /// deployments that hold no key of their own. `None` keeps `self`.
    fn with_credential(&self, _credential: &str) -> Option<Arc<dyn ChatBackend>> {
        None
    }
}

/// OpenAI-compatible HTTP backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    chat_url: String,
    models_url: String,
    api_key: Option<String>,
    organization: Option<String>,
    project: Option<String>,
}

impl HttpBackend {
    pub fn new(settings: &BackendSettings) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(settings.request_timeout())
                .build()?,
            chat_url: settings.chat_completions_url(),
            models_url: settings.models_url(),
            api_key: settings.api_key.clone().filter(|key| !key.is_empty()),
            organization: settings.organization.clone(),
            project: settings.project.clone(),
        })
    }

    fn authorize(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = &self.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        if let Some(organization) = &self.organization {
            builder = builder.header("OpenAI-Organization", organization);
        }
        if let Some(project) = &self.project {
            builder = builder.header("OpenAI-Project", project);
        }
        builder
    }

    async fn post_chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, ProxyError> {
        if let Ok(body) = serde_json::to_string(request) {
            debug!(url = %self.chat_url, body = %body, "sending chat completion request");
        }
        let builder = self
            .client
            .post(&self.chat_url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(request);
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| {
                error!(url = %self.chat_url, error = %e, "backend request failed");
                ProxyError::from_transport(e)
            })?;
        ensure_success(response).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProxyError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(status = status.as_u16(), body = %body, "backend returned an error");
    Err(ProxyError::from_upstream_body(status, &body))
}

fn is_json(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"))
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProxyError> {
        let response = self.post_chat(request).await?;
        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(ProxyError::from_transport)
    }

    async fn stream(&self, request: &ChatCompletionRequest) -> Result<BackendStream, ProxyError> {
        let response = self.post_chat(request).await?;
        if is_json(&response) {
            debug!("backend answered a streamed request with a JSON body");
            let completion = response
                .json::<ChatCompletionResponse>()
                .await
                .map_err(ProxyError::from_transport)?;
            return Ok(BackendStream::Complete(completion));
        }
        let events = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ProxyError::from_transport))
            .boxed();
        Ok(BackendStream::Events(events))
    }

    async fn list_models(&self) -> Result<Value, ProxyError> {
        let builder = self.client.get(&self.models_url);
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(ProxyError::from_transport)?;
        ensure_success(response)
            .await?
            .json::<Value>()
            .await
            .map_err(ProxyError::from_transport)
    }

    fn with_credential(&self, credential: &str) -> Option<Arc<dyn ChatBackend>> {
        if self.api_key.is_some() || credential.is_empty() {
            return None;
        }
        Some(Arc::new(Self {
            api_key: Some(credential.to_string()),
            ..self.clone()
        }))
    }
}
