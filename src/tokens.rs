//! Heuristic token estimation and identifier generation.
//!
//! No tokenizer is bundled; counts are approximations good enough for
//! `count_tokens` and for `message_start` before the backend reports usage.

use rand::{Rng, distributions::Alphanumeric};

use crate::protocol::anthropic::{
    ContentBlock, MessageContent, MessagesRequest, ToolResultContent, WebSearchContent,
};

const CHARS_PER_TOKEN: usize = 4;

/// Flat cost charged per image, whatever its size.
pub const IMAGE_TOKENS: u32 = 85;

pub fn estimate_text_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

pub fn estimate_input_tokens(request: &MessagesRequest) -> u32 {
    let mut total = 0u32;

    if let Some(system) = &request.system {
        total = total.saturating_add(estimate_text_tokens(&system.text()));
    }

    for message in &request.messages {
        let tokens = match &message.content {
            MessageContent::Text(text) => estimate_text_tokens(text),
            MessageContent::Blocks(blocks) => blocks.iter().map(estimate_block_tokens).sum(),
        };
        total = total.saturating_add(tokens);
    }

    for tool in request.tools.iter().flatten() {
        let mut text = tool.name.clone();
        if let Some(description) = &tool.description {
            text.push_str(description);
        }
        if let Some(schema) = &tool.input_schema {
            text.push_str(&schema.to_string());
        }
        total = total.saturating_add(estimate_text_tokens(&text));
    }

    total
}

fn estimate_block_tokens(block: &ContentBlock) -> u32 {
    match block {
        ContentBlock::Text { text } => estimate_text_tokens(text),
        ContentBlock::Thinking { thinking, .. } => estimate_text_tokens(thinking),
        ContentBlock::Image { .. } => IMAGE_TOKENS,
        ContentBlock::ToolUse { name, input, .. } | ContentBlock::ServerToolUse { name, input, .. } => {
            estimate_text_tokens(name) + estimate_text_tokens(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => match content {
            ToolResultContent::Text(text) => estimate_text_tokens(text),
            ToolResultContent::Blocks(blocks) => blocks.iter().map(estimate_block_tokens).sum(),
        },
        ContentBlock::WebSearchToolResult { content, .. } => match content {
            WebSearchContent::Results(results) => results
                .iter()
                .map(|r| estimate_text_tokens(&r.title) + estimate_text_tokens(&r.url))
                .sum(),
            WebSearchContent::Error(_) => 0,
        },
        ContentBlock::RedactedThinking { .. } | ContentBlock::Unsupported => 0,
    }
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

pub fn message_id() -> String {
    format!("msg_{}", random_suffix(24))
}

pub fn server_tool_use_id() -> String {
    format!("srvtoolu_{}", random_suffix(24))
}

/// Used when a backend streams a tool call without an id.
pub fn tool_use_id() -> String {
    format!("toolu_{}", random_suffix(24))
}
