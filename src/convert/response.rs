//! Chat-completions reply → Anthropic message.

use serde_json::{Value, json};
use tracing::warn;

use super::thinking::split_thinking;
use crate::error::{ProxyError, ToolArgumentError};
use crate::protocol::anthropic::{ContentBlock, MessagesResponse, StopReason, Usage};
use crate::protocol::openai::{ChatCompletionResponse, ChatMessage, ChatUsage};
use crate::tokens;

/// Finish reason → stop reason. Unknown or missing reasons end the turn.
pub fn map_finish_reason(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls" | "function_call") => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

/// Stop reason plus the matched stop sequence, if the backend said which one.
///
/// vLLM reports `finish_reason: "stop"` for both EOS and stop strings and puts
/// the matched string (or a token id) in `stop_reason`.
pub fn stop_details(
    finish_reason: Option<&str>,
    backend_stop_reason: Option<&Value>,
) -> (StopReason, Option<String>) {
    if finish_reason == Some("stop")
        && let Some(Value::String(sequence)) = backend_stop_reason
    {
        return (StopReason::StopSequence, Some(sequence.clone()));
    }
    (map_finish_reason(finish_reason), None)
}

/// Makes the stop reason agree with the blocks actually produced.
pub fn reconcile_stop_reason(reason: StopReason, has_tool_use: bool) -> StopReason {
    match reason {
        StopReason::EndTurn if has_tool_use => StopReason::ToolUse,
        StopReason::ToolUse if !has_tool_use => StopReason::EndTurn,
        other => other,
    }
}

/// Parses accumulated argument text into a tool input object.
/// Empty text is an empty object.
pub fn finalize_tool_arguments(arguments: &str) -> Result<Value, ToolArgumentError> {
    if arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    match serde_json::from_str::<Value>(arguments)? {
        object @ Value::Object(_) => Ok(object),
        Value::Array(_) => Err(ToolArgumentError::NotAnObject("array")),
        Value::String(_) => Err(ToolArgumentError::NotAnObject("string")),
        Value::Number(_) => Err(ToolArgumentError::NotAnObject("number")),
        Value::Bool(_) => Err(ToolArgumentError::NotAnObject("boolean")),
        Value::Null => Err(ToolArgumentError::NotAnObject("null")),
    }
}

/// Builds a `tool_use` block. Unparseable arguments do not fail the response;
/// the block carries `{"error", "raw"}` so the client sees what went wrong.
pub fn tool_use_block(id: String, name: String, arguments: &str) -> ContentBlock {
    let input = match finalize_tool_arguments(arguments) {
        Ok(input) => input,
        Err(err) => {
            warn!(tool = %name, id = %id, error = %err, "malformed tool arguments");
            json!({ "error": err.to_string(), "raw": arguments })
        }
    };
    ContentBlock::ToolUse { id, name, input }
}

pub fn usage_from_chat(usage: &ChatUsage) -> Usage {
    let cache_read = usage.cache_read_input_tokens.or_else(|| {
        usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens)
    });
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_creation_input_tokens: usage.cache_creation_input_tokens,
        cache_read_input_tokens: cache_read,
        server_tool_use: None,
    }
}

/// Content blocks for one assistant message: thinking, text, then tool calls.
pub fn message_blocks(message: &ChatMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    let content = message
        .content
        .as_ref()
        .map(|c| c.joined_text())
        .unwrap_or_default();

    if let Some(reasoning) = message.reasoning_text() {
        blocks.push(ContentBlock::thinking(reasoning));
        if !content.is_empty() {
            blocks.push(ContentBlock::text(content));
        }
    } else {
        let (thinking, text) = split_thinking(&content);
        if let Some(thinking) = thinking {
            blocks.push(ContentBlock::thinking(thinking));
        }
        if !text.is_empty() {
            blocks.push(ContentBlock::text(text));
        }
    }

    for call in message.tool_calls.iter().flatten() {
        let id = if call.id.is_empty() {
            tokens::tool_use_id()
        } else {
            call.id.clone()
        };
        blocks.push(tool_use_block(
            id,
            call.function.name.clone(),
            &call.function.arguments,
        ));
    }

    blocks
}

/// Converts one complete backend reply. `model` is the name the client asked
/// for, echoed back regardless of what the backend reports.
pub fn chat_to_anthropic(
    response: &ChatCompletionResponse,
    model: &str,
) -> Result<MessagesResponse, ProxyError> {
    let choice = response.choices.first().ok_or_else(|| {
        ProxyError::UpstreamProtocol("backend response contained no choices".to_string())
    })?;

    let content = message_blocks(&choice.message);
    let has_tool_use = content
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolUse { .. }));
    let (stop_reason, stop_sequence) =
        stop_details(choice.finish_reason.as_deref(), choice.stop_reason.as_ref());

    let usage = response
        .usage
        .as_ref()
        .map(usage_from_chat)
        .unwrap_or_default();
    let id = if response.id.is_empty() {
        tokens::message_id()
    } else {
        format!("msg_{}", response.id)
    };

    let mut message = MessagesResponse::new(id, model.to_string(), content, usage);
    message.stop_reason = Some(reconcile_stop_reason(stop_reason, has_tool_use));
    message.stop_sequence = stop_sequence;
    Ok(message)
}
