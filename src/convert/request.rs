//! Anthropic Messages request → chat-completions request.

use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, warn};

use super::thinking::{THINK_CLOSE, THINK_OPEN};
use crate::config::BackendSettings;
use crate::error::ProxyError;
use crate::protocol::anthropic::{
    ContentBlock, InputMessage, MessageContent, MessagesRequest, Role, ThinkingConfig,
    ToolChoice, ToolResultContent, WebSearchContent,
};
use crate::protocol::openai::{
    ChatCompletionRequest, ChatContentPart, ChatImageUrl, ChatMessage, ChatMessageContent,
    ChatRole, ChatTool, ChatToolCall,
};
use crate::server_tools::{ActiveServerTool, ServerToolConfig, ServerToolRegistry};

/// Backend capabilities that change what the converted request may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionOptions {
    pub supports_top_k: bool,
    pub supports_reasoning_effort: bool,
    pub chat_template_kwargs: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            supports_top_k: true,
            supports_reasoning_effort: false,
            chat_template_kwargs: true,
        }
    }
}

impl From<&BackendSettings> for ConversionOptions {
    fn from(settings: &BackendSettings) -> Self {
        Self {
            supports_top_k: settings.supports_top_k,
            supports_reasoning_effort: settings.supports_reasoning_effort,
            chat_template_kwargs: settings.chat_template_kwargs,
        }
    }
}

#[derive(Debug)]
pub struct ConvertedRequest {
    pub request: ChatCompletionRequest,
    /// Server tools the client enabled; their definitions were replaced by
    /// synthetic functions in `request.tools`.
    pub server_tools: Vec<ActiveServerTool>,
}

/// Rejects requests no backend call should be made for.
pub fn validate_request(request: &MessagesRequest) -> Result<(), ProxyError> {
    if request.model.trim().is_empty() {
        return Err(ProxyError::validation("model: field required"));
    }
    if request.messages.is_empty() {
        return Err(ProxyError::validation("messages: at least one message is required"));
    }
    if request.max_tokens.is_none() {
        return Err(ProxyError::validation("max_tokens: field required"));
    }

    let mut seen = HashSet::new();
    for tool in request.tools.iter().flatten() {
        if !seen.insert(tool.name.as_str()) {
            return Err(ProxyError::validation(format!(
                "tools: tool names must be unique, '{}' appears more than once",
                tool.name
            )));
        }
    }
    Ok(())
}

pub fn anthropic_to_chat(
    request: &MessagesRequest,
    registry: &ServerToolRegistry,
    options: &ConversionOptions,
) -> Result<ConvertedRequest, ProxyError> {
    validate_request(request)?;

    let mut messages = Vec::new();
    if let Some(system) = collect_system_prompt(request) {
        messages.push(ChatMessage::text(ChatRole::System, system));
    }
    for message in &request.messages {
        match message.role {
            Role::System => {}
            Role::User => convert_user_message(message, &mut messages),
            Role::Assistant => convert_assistant_message(message, &mut messages),
        }
    }

    let (tools, server_tools) = convert_tools(request, registry)?;
    let tool_choice = tools.as_ref().map(|_| {
        request
            .tool_choice
            .as_ref()
            .map(map_tool_choice)
            .unwrap_or_else(|| Value::String("auto".to_string()))
    });

    let top_k = match request.top_k {
        Some(top_k) if !options.supports_top_k => {
            warn!(top_k, "backend does not support top_k, dropping it");
            None
        }
        other => other,
    };

    let mut chat = ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k,
        stop: request.stop_sequences.clone().filter(|stop| !stop.is_empty()),
        stream: None,
        stream_options: None,
        tools,
        tool_choice,
        reasoning_effort: None,
        chat_template_kwargs: None,
    };
    apply_thinking(&mut chat, request.thinking.as_ref(), options);
    chat.set_streaming(request.is_streaming());

    Ok(ConvertedRequest {
        request: chat,
        server_tools,
    })
}

// ============================================================================
// System prompt
// ============================================================================

static BILLING_HEADER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)x-anthropic-billing-header:.*?cch=[a-zA-Z0-9]+;?").ok()
});

/// Removes the per-request billing header some clients prepend to the system
/// prompt. It changes on every call and would defeat backend prefix caching.
pub fn strip_billing_header(text: &str) -> String {
    let Some(pattern) = BILLING_HEADER.as_ref() else {
        return text.to_string();
    };
    let stripped = pattern.replace_all(text, "");
    if stripped.len() == text.len() {
        text.to_string()
    } else {
        stripped.trim().to_string()
    }
}

/// Request-level system prompt first, then any system-role messages.
fn collect_system_prompt(request: &MessagesRequest) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(system) = &request.system {
        parts.push(system.text());
    }
    parts.extend(
        request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.plain_text()),
    );
    parts.retain(|part| !part.is_empty());
    if parts.is_empty() {
        return None;
    }
    let system = strip_billing_header(&parts.join("\n\n"));
    (!system.is_empty()).then_some(system)
}

// ============================================================================
// Messages
// ============================================================================

fn convert_user_message(message: &InputMessage, out: &mut Vec<ChatMessage>) {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            out.push(ChatMessage::text(ChatRole::User, text.clone()));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    let mut tool_results = 0usize;
    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Tool messages must directly follow the assistant turn that
                // requested them, so they go out ahead of the user's text.
                let mut text = tool_result_text(content);
                if *is_error {
                    text = format!("Error: {text}");
                }
                out.push(ChatMessage::tool_result(tool_use_id.clone(), text));
                tool_results += 1;
            }
            ContentBlock::Text { text } => parts.push(ChatContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => parts.push(ChatContentPart::ImageUrl {
                image_url: ChatImageUrl {
                    url: source.to_url(),
                },
            }),
            ContentBlock::WebSearchToolResult { content, .. } => parts.push(ChatContentPart::Text {
                text: render_web_search_result(content),
            }),
            other => debug!(block = block_kind(other), "dropping block from user message"),
        }
    }

    if !parts.is_empty() {
        out.push(ChatMessage::new(
            ChatRole::User,
            ChatMessageContent::from_parts(parts),
        ));
    } else if tool_results == 0 {
        out.push(ChatMessage::text(ChatRole::User, ""));
    }
}

fn convert_assistant_message(message: &InputMessage, out: &mut Vec<ChatMessage>) {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            out.push(ChatMessage::text(ChatRole::Assistant, text.clone()));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(ChatContentPart::Text { text: text.clone() }),
            ContentBlock::Thinking { thinking, .. } => parts.push(ChatContentPart::Text {
                text: format!("{THINK_OPEN}{thinking}{THINK_CLOSE}"),
            }),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall::new(id.clone(), name.clone(), input.to_string()));
            }
            ContentBlock::WebSearchToolResult { content, .. } => parts.push(ChatContentPart::Text {
                text: render_web_search_result(content),
            }),
            other => debug!(block = block_kind(other), "dropping block from assistant message"),
        }
    }

    let content = if parts.is_empty() {
        ChatMessageContent::Text(String::new())
    } else {
        ChatMessageContent::from_parts(parts)
    };
    let mut chat = ChatMessage::new(ChatRole::Assistant, content);
    if !tool_calls.is_empty() {
        chat.tool_calls = Some(tool_calls);
    }
    out.push(chat);
}

fn tool_result_text(content: &ToolResultContent) -> String {
    match content {
        ToolResultContent::Text(text) => text.clone(),
        ToolResultContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::Image { .. } => Some("[Image content]".to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Earlier search results, replayed to the backend as plain text.
pub fn render_web_search_result(content: &WebSearchContent) -> String {
    match content {
        WebSearchContent::Results(results) => {
            let mut text = String::from("Web search results:");
            for result in results {
                text.push_str(&format!("\n- {} ({})", result.title, result.url));
            }
            text
        }
        WebSearchContent::Error(error) => format!("Web search failed: {}", error.error_code),
    }
}

fn block_kind(block: &ContentBlock) -> &'static str {
    match block {
        ContentBlock::Text { .. } => "text",
        ContentBlock::Image { .. } => "image",
        ContentBlock::ToolUse { .. } => "tool_use",
        ContentBlock::ToolResult { .. } => "tool_result",
        ContentBlock::Thinking { .. } => "thinking",
        ContentBlock::RedactedThinking { .. } => "redacted_thinking",
        ContentBlock::ServerToolUse { .. } => "server_tool_use",
        ContentBlock::WebSearchToolResult { .. } => "web_search_tool_result",
        ContentBlock::Unsupported => "unsupported",
    }
}

// ============================================================================
// Tools and parameters
// ============================================================================

type ConvertedTools = (Option<Vec<ChatTool>>, Vec<ActiveServerTool>);

fn convert_tools(
    request: &MessagesRequest,
    registry: &ServerToolRegistry,
) -> Result<ConvertedTools, ProxyError> {
    let mut functions = Vec::new();
    let mut server_tools: Vec<ActiveServerTool> = Vec::new();

    for definition in request.tools.iter().flatten() {
        if let Some(tool) = registry.find_for_definition(definition) {
            debug!(tool = tool.name(), "server tool enabled");
            server_tools.push(ActiveServerTool {
                tool,
                config: ServerToolConfig::from_definition(definition),
            });
            continue;
        }
        functions.push(ChatTool::function(
            definition.name.clone(),
            definition.description.clone(),
            definition.input_schema.clone(),
        ));
    }

    for active in &server_tools {
        let synthetic = active.tool.function_definition();
        if functions
            .iter()
            .any(|f| f.function.name == synthetic.function.name)
        {
            return Err(ProxyError::validation(format!(
                "tools: '{}' collides with the built-in server tool of the same name",
                synthetic.function.name
            )));
        }
        functions.push(synthetic);
    }

    let tools = (!functions.is_empty()).then_some(functions);
    Ok((tools, server_tools))
}

pub fn map_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::Any => Value::String("required".to_string()),
        ToolChoice::None => Value::String("none".to_string()),
        ToolChoice::Tool { name } => json!({
            "type": "function",
            "function": { "name": name }
        }),
    }
}

pub fn reasoning_effort(budget_tokens: Option<u32>) -> &'static str {
    match budget_tokens {
        Some(budget) if budget >= 4096 => "high",
        Some(budget) if budget >= 1024 => "medium",
        Some(_) => "low",
        None => "medium",
    }
}

fn apply_thinking(
    chat: &mut ChatCompletionRequest,
    thinking: Option<&ThinkingConfig>,
    options: &ConversionOptions,
) {
    let enabled = thinking.is_some_and(ThinkingConfig::is_enabled);

    if options.chat_template_kwargs {
        let mut kwargs = json!({ "thinking": enabled, "enable_thinking": enabled });
        if enabled {
            kwargs["clear_thinking"] = Value::Bool(false);
        }
        chat.chat_template_kwargs = Some(kwargs);
    }
    if options.supports_reasoning_effort
        && let Some(thinking) = thinking.filter(|t| t.is_enabled())
    {
        chat.reasoning_effort = Some(reasoning_effort(thinking.budget_tokens()).to_string());
    }
}
