//! Server-sent events framing, both directions.

use tracing::{debug, error};

use crate::error::ProxyError;
use crate::protocol::anthropic::StreamEvent;
use crate::protocol::openai::ChatCompletionChunk;

/// Splits a backend byte stream into lines.
///
/// Bytes are buffered until a newline so multibyte characters split across
/// network chunks are decoded intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=newline).collect();
        let line = String::from_utf8_lossy(&line[..newline]);
        Some(line.trim_end_matches('\r').to_string())
    }

    /// Whatever is left once the backend closes the stream without a final
    /// newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        (!line.is_empty()).then_some(line)
    }
}

#[derive(Debug)]
pub enum SseData {
    Done,
    Chunk(Box<ChatCompletionChunk>),
}

/// Interprets one line of a chat-completions stream.
///
/// Blank lines, comments and non-`data` fields yield `None`; undecodable
/// chunk JSON is a protocol error.
pub fn parse_data_line(line: &str) -> Result<Option<SseData>, ProxyError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.is_empty() {
        return Ok(None);
    }
    if data == "[DONE]" {
        return Ok(Some(SseData::Done));
    }
    serde_json::from_str::<ChatCompletionChunk>(data)
        .map(|chunk| Some(SseData::Chunk(Box::new(chunk))))
        .map_err(|e| {
            debug!(line = data, "undecodable stream chunk");
            ProxyError::UpstreamProtocol(format!("invalid stream chunk: {e}"))
        })
}

/// One outbound frame: `event: <name>\ndata: <json>\n\n`.
pub fn encode_event(event: &StreamEvent) -> String {
    match serde_json::to_string(event) {
        Ok(data) => format!("event: {}\ndata: {}\n\n", event.name(), data),
        Err(e) => {
            error!(event = event.name(), error = %e, "failed to serialize stream event");
            format!(
                "event: error\ndata: {{\"type\":\"error\",\"error\":{{\"type\":\"api_error\",\"message\":\"failed to serialize {}\"}}}}\n\n",
                event.name()
            )
        }
    }
}
