//! Tools the proxy runs itself instead of handing them to the client.
//!
//! A [`ServerToolRegistry`] is built once at startup. For each request the
//! tools the client enabled become a [`ServerToolExecutor`], which owns the
//! per-request invocation budget and turns backend tool calls into Anthropic
//! `server_tool_use` / result blocks plus the `tool` messages fed back to the
//! backend on the next round.

pub mod web_search;

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::convert::response::finalize_tool_arguments;
use crate::protocol::anthropic::{ContentBlock, ToolDefinition};
use crate::protocol::openai::{ChatCompletionRequest, ChatMessage, ChatTool, ChatToolCall};
use crate::tokens;

pub use web_search::WebSearchTool;

/// Per-request options taken from the client's tool definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerToolConfig {
    pub max_uses: Option<u32>,
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
}

impl ServerToolConfig {
    pub fn from_definition(definition: &ToolDefinition) -> Self {
        Self {
            max_uses: definition.max_uses,
            allowed_domains: definition.allowed_domains.clone().unwrap_or_default(),
            blocked_domains: definition.blocked_domains.clone().unwrap_or_default(),
        }
    }
}

/// A failed or refused invocation, reported back in-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    /// Machine-readable code surfaced in the result block (`error_code`).
    pub code: &'static str,
    pub message: String,
}

impl ToolFailure {
    pub fn max_uses_exceeded(limit: u32) -> Self {
        Self {
            code: "max_uses_exceeded",
            message: format!("Maximum tool uses exceeded ({limit} per request)."),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_tool_input",
            message: message.into(),
        }
    }

    /// Payload of the `tool` message the backend sees.
    pub fn backend_content(&self) -> Value {
        json!({ "error": self.code, "message": self.message })
    }
}

/// What one invocation produced.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    /// Result block shown to the client, keyed by the `server_tool_use` id.
    pub result_block: ContentBlock,
    /// JSON handed back to the backend as the tool message content.
    pub backend_content: Value,
    /// Whether an external request was actually made.
    pub performed: bool,
}

#[async_trait]
pub trait ServerTool: Send + Sync {
    /// Function name the backend sees and calls.
    fn name(&self) -> &'static str;

    /// Whether a client tool definition asks for this tool.
    fn handles(&self, definition: &ToolDefinition) -> bool;

    /// Synthetic function definition injected into backend requests.
    fn function_definition(&self) -> ChatTool;

    async fn execute(
        &self,
        tool_use_id: &str,
        input: &Value,
        config: &ServerToolConfig,
    ) -> ToolExecution;

    /// Result for an invocation that is answered without running.
    fn refuse(&self, tool_use_id: &str, failure: ToolFailure) -> ToolExecution;
}

#[derive(Default)]
pub struct ServerToolRegistry {
    tools: Vec<Arc<dyn ServerTool>>,
}

impl ServerToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Arc<dyn ServerTool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn find_for_definition(&self, definition: &ToolDefinition) -> Option<Arc<dyn ServerTool>> {
        self.tools
            .iter()
            .find(|tool| tool.handles(definition))
            .cloned()
    }
}

/// A registered tool switched on by the current request.
#[derive(Clone)]
pub struct ActiveServerTool {
    pub tool: Arc<dyn ServerTool>,
    pub config: ServerToolConfig,
}

impl std::fmt::Debug for ActiveServerTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveServerTool")
            .field("name", &self.tool.name())
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServerToolOutcome {
    /// `server_tool_use` followed by the tool's result block.
    pub blocks: Vec<ContentBlock>,
    /// `tool` message answering the backend's call.
    pub message: ChatMessage,
    pub performed: bool,
}

pub struct ServerToolExecutor {
    tools: Vec<ActiveServerTool>,
    default_max_uses: u32,
    uses: HashMap<&'static str, u32>,
    follow_ups: u32,
    max_follow_ups: u32,
}

impl ServerToolExecutor {
    /// Returns `None` when the request enabled no server tools.
    pub fn new(tools: Vec<ActiveServerTool>, default_max_uses: u32) -> Option<Self> {
        if tools.is_empty() {
            return None;
        }
        let largest_budget = tools
            .iter()
            .map(|active| active.config.max_uses.unwrap_or(default_max_uses))
            .max()
            .unwrap_or(default_max_uses);
        Some(Self {
            tools,
            default_max_uses,
            uses: HashMap::new(),
            follow_ups: 0,
            max_follow_ups: largest_budget.saturating_add(1),
        })
    }

    pub fn tool_names(&self) -> HashSet<String> {
        self.tools
            .iter()
            .map(|active| active.tool.name().to_string())
            .collect()
    }

    fn find(&self, name: &str) -> Option<&ActiveServerTool> {
        self.tools.iter().find(|active| active.tool.name() == name)
    }

    fn limit(&self, active: &ActiveServerTool) -> u32 {
        active.config.max_uses.unwrap_or(self.default_max_uses)
    }

    /// Splits backend tool calls into `(server, client)` calls, preserving order.
    pub fn partition(&self, calls: &[ChatToolCall]) -> (Vec<ChatToolCall>, Vec<ChatToolCall>) {
        calls
            .iter()
            .cloned()
            .partition(|call| self.find(&call.function.name).is_some())
    }

    /// Runs one backend call against its tool, or refuses it when the
    /// request's budget for that tool is spent. Never fails the request.
    pub async fn execute(&mut self, call: &ChatToolCall) -> ServerToolOutcome {
        let tool_use_id = tokens::server_tool_use_id();
        let name = call.function.name.as_str();

        let Some(active) = self.find(name).cloned() else {
            // partition() only hands us registered names
            warn!(tool = name, "no server tool registered under this name");
            let failure = ToolFailure::invalid_input(format!("Unknown server tool '{name}'."));
            return ServerToolOutcome {
                blocks: Vec::new(),
                message: ChatMessage::tool_result(call.id.clone(), failure.backend_content().to_string()),
                performed: false,
            };
        };

        let (input, execution) = match finalize_tool_arguments(&call.function.arguments) {
            Err(err) => {
                warn!(tool = name, error = %err, "server tool called with malformed arguments");
                let execution = active
                    .tool
                    .refuse(&tool_use_id, ToolFailure::invalid_input(err.to_string()));
                (json!({}), execution)
            }
            Ok(input) => {
                let limit = self.limit(&active);
                let used = self.uses.entry(active.tool.name()).or_insert(0);
                let execution = if *used >= limit {
                    warn!(tool = name, limit, "server tool budget exhausted");
                    active
                        .tool
                        .refuse(&tool_use_id, ToolFailure::max_uses_exceeded(limit))
                } else {
                    *used += 1;
                    debug!(tool = name, attempt = *used, limit, "executing server tool");
                    active.tool.execute(&tool_use_id, &input, &active.config).await
                };
                (input, execution)
            }
        };

        ServerToolOutcome {
            blocks: vec![
                ContentBlock::ServerToolUse {
                    id: tool_use_id,
                    name: name.to_string(),
                    input,
                },
                execution.result_block,
            ],
            message: ChatMessage::tool_result(call.id.clone(), execution.backend_content.to_string()),
            performed: execution.performed,
        }
    }

    fn exhausted(&self, active: &ActiveServerTool) -> bool {
        self.uses.get(active.tool.name()).copied().unwrap_or(0) >= self.limit(active)
    }

    /// Appends one finished round (the assistant's server calls and their
    /// results) to `request`. Tools whose budget is spent are withdrawn from
    /// the follow-up request. Returns `false` once no further round may run.
    pub fn prepare_follow_up(
        &mut self,
        request: &mut ChatCompletionRequest,
        calls: Vec<ChatToolCall>,
        results: Vec<ChatMessage>,
    ) -> bool {
        request.messages.push(ChatMessage::tool_calls(calls));
        request.messages.extend(results);
        self.follow_ups += 1;

        let spent: Vec<&'static str> = self
            .tools
            .iter()
            .filter(|active| self.exhausted(active))
            .map(|active| active.tool.name())
            .collect();
        if !spent.is_empty() {
            withdraw_tools(request, &spent);
        }

        if self.follow_ups > self.max_follow_ups {
            info!(rounds = self.follow_ups, "server tool round limit reached");
            return false;
        }
        true
    }
}

fn withdraw_tools(request: &mut ChatCompletionRequest, names: &[&str]) {
    if let Some(tools) = request.tools.as_mut() {
        tools.retain(|tool| !names.contains(&tool.function.name.as_str()));
        if tools.is_empty() {
            request.tools = None;
            request.tool_choice = None;
            return;
        }
    }
    let forced_spent_tool = request
        .tool_choice
        .as_ref()
        .and_then(|choice| choice.pointer("/function/name"))
        .and_then(Value::as_str)
        .is_some_and(|name| names.contains(&name));
    if forced_spent_tool {
        request.tool_choice = Some(Value::String("auto".to_string()));
    }
}
