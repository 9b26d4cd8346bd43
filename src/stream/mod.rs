//! Streamed translation: backend SSE bytes in, Anthropic SSE frames out.
//!
//! One response may span several backend rounds when the backend calls a
//! server tool; the proxy runs the tool, streams its blocks, and asks the
//! backend again with the result appended.

pub mod sse;
pub mod state;

use async_stream::stream;
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendStream, ChatBackend};
use crate::convert::thinking::split_thinking;
use crate::error::ProxyError;
use crate::protocol::anthropic::StreamEvent;
use crate::protocol::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::server_tools::ServerToolExecutor;
use sse::{SseData, SseDecoder, encode_event, parse_data_line};
use state::StreamState;

/// Everything a streamed response needs after the first backend call.
pub struct StreamSession {
    pub backend: Arc<dyn ChatBackend>,
    /// The converted request; follow-up rounds extend its messages.
    pub request: ChatCompletionRequest,
    pub executor: Option<ServerToolExecutor>,
    pub state: StreamState,
}

enum Flow {
    Continue,
    RoundEnd,
}

fn apply_line(state: &mut StreamState, line: &str) -> (Vec<StreamEvent>, Flow) {
    match parse_data_line(line) {
        Ok(None) => (Vec::new(), Flow::Continue),
        Ok(Some(SseData::Done)) => (Vec::new(), Flow::RoundEnd),
        Ok(Some(SseData::Chunk(chunk))) => {
            if let Some(error) = &chunk.error {
                let err = ProxyError::from_stream_error(error);
                warn!(error = %err, "backend reported an error mid-stream");
                return (state.fail(&err), Flow::RoundEnd);
            }
            (state.push_chunk(&chunk), Flow::Continue)
        }
        Err(err) => {
            warn!(error = %err, "aborting stream on malformed chunk");
            (state.fail(&err), Flow::RoundEnd)
        }
    }
}

fn frame(event: &StreamEvent) -> Result<String, Infallible> {
    let frame = encode_event(event);
    debug!(frame = %frame.trim_end(), "sse frame");
    Ok(frame)
}

/// One chunk carrying a whole reply. Inline `<think>` content is split up
/// front so the replay matches the non-streamed conversion, prefix dropped.
fn replay_chunk(response: &ChatCompletionResponse) -> ChatCompletionChunk {
    let mut chunk = ChatCompletionChunk::from_completion(response);
    for choice in &mut chunk.choices {
        let delta = &mut choice.delta;
        if delta.reasoning_text().is_some() {
            continue;
        }
        let Some(content) = delta.content.take() else {
            continue;
        };
        let (thinking, text) = split_thinking(&content);
        delta.reasoning_content = thinking.map(str::to_string);
        delta.content = Some(text.to_string());
    }
    chunk
}

/// Drives `first` and any follow-up rounds to completion.
///
/// The stream always ends with `message_stop` or an `error` event, never by
/// just closing.
pub fn anthropic_event_stream(
    session: StreamSession,
    first: BackendStream,
) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
    let StreamSession {
        backend,
        mut request,
        mut executor,
        mut state,
    } = session;

    stream! {
        let mut current = Some(first);
        let mut rounds = 0u32;

        while let Some(round) = current.take() {
            rounds += 1;
            match round {
                BackendStream::Complete(response) => {
                    let chunk = replay_chunk(&response);
                    for event in state.push_chunk(&chunk) {
                        yield frame(&event);
                    }
                }
                BackendStream::Events(mut body) => {
                    let mut decoder = SseDecoder::default();
                    let mut round_over = false;
                    while !round_over {
                        let Some(next) = body.next().await else {
                            break;
                        };
                        match next {
                            Ok(bytes) => {
                                decoder.push(&bytes);
                                while let Some(line) = decoder.next_line() {
                                    let (events, flow) = apply_line(&mut state, &line);
                                    for event in events {
                                        yield frame(&event);
                                    }
                                    if matches!(flow, Flow::RoundEnd) {
                                        round_over = true;
                                        break;
                                    }
                                }
                            }
                            Err(err) => {
                                error!(error = %err, "backend stream broke off");
                                for event in state.fail(&err) {
                                    yield frame(&event);
                                }
                                round_over = true;
                            }
                        }
                    }
                    if !round_over {
                        if let Some(line) = decoder.finish() {
                            let (events, _) = apply_line(&mut state, &line);
                            for event in events {
                                yield frame(&event);
                            }
                        }
                    }
                }
            }

            if state.is_finished() {
                break;
            }
            for event in state.close_round() {
                yield frame(&event);
            }

            let calls = state.take_round_calls();
            let follow_up = match executor.as_mut() {
                Some(executor) if !calls.server.is_empty() => {
                    let mut results = Vec::with_capacity(calls.server.len());
                    for call in &calls.server {
                        let outcome = executor.execute(call).await;
                        if outcome.performed {
                            state.record_web_search();
                        }
                        for event in state.push_blocks(outcome.blocks) {
                            yield frame(&event);
                        }
                        results.push(outcome.message);
                    }
                    if calls.client > 0 {
                        info!(
                            client_calls = calls.client,
                            "client tool calls pending; no follow-up round"
                        );
                        false
                    } else {
                        executor.prepare_follow_up(&mut request, calls.server, results)
                    }
                }
                _ => false,
            };

            if !follow_up {
                for event in state.finish() {
                    yield frame(&event);
                }
                break;
            }

            state.begin_round();
            debug!(round = rounds + 1, "requesting follow-up round");
            match backend.stream(&request).await {
                Ok(next) => current = Some(next),
                Err(err) => {
                    error!(error = %err, "follow-up round failed");
                    for event in state.fail(&err) {
                        yield frame(&event);
                    }
                }
            }
        }

        info!(rounds, "stream finished");
    }
}
