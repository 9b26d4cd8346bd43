//! `<think>` markup recovery for backends that inline reasoning in content.
//!
//! Only the first span is recognised: the first `</think>` after the first
//! `<think>` closes it, matching is case-sensitive and nesting is not
//! supported.

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// Splits complete content into `(thinking, text)`.
///
/// Anything before the opening tag is dropped. An unterminated span treats the
/// remainder as thinking. Without an opening tag the content is returned
/// untouched as text.
pub fn split_thinking(content: &str) -> (Option<&str>, &str) {
    let Some(open) = content.find(THINK_OPEN) else {
        return (None, content);
    };
    let inner = &content[open + THINK_OPEN.len()..];
    match inner.find(THINK_CLOSE) {
        Some(close) => (Some(&inner[..close]), &inner[close + THINK_CLOSE.len()..]),
        None => (Some(inner), ""),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEvent {
    Text(String),
    ThinkingStart,
    Thinking(String),
    ThinkingEnd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ScanPhase {
    #[default]
    BeforeOpen,
    Inside,
    AfterClose,
}

/// Incremental counterpart of [`split_thinking`] for streamed content.
///
/// A fragment tail that could be the start of the tag being searched for is
/// held back until the next fragment resolves it, so tags split across
/// chunk boundaries are still found. Unlike [`split_thinking`], text before the
/// opening tag has already been forwarded by the time the tag shows up, so it
/// is emitted as text rather than dropped.
#[derive(Debug, Default)]
pub struct ThinkTagScanner {
    phase: ScanPhase,
    pending: String,
}

impl ThinkTagScanner {
    pub fn push(&mut self, fragment: &str) -> Vec<TagEvent> {
        self.pending.push_str(fragment);
        let mut events = Vec::new();

        loop {
            match self.phase {
                ScanPhase::AfterClose => {
                    if !self.pending.is_empty() {
                        events.push(TagEvent::Text(std::mem::take(&mut self.pending)));
                    }
                    break;
                }
                ScanPhase::BeforeOpen => {
                    if let Some(pos) = self.pending.find(THINK_OPEN) {
                        if pos > 0 {
                            events.push(TagEvent::Text(self.pending[..pos].to_string()));
                        }
                        self.pending.drain(..pos + THINK_OPEN.len());
                        self.phase = ScanPhase::Inside;
                        events.push(TagEvent::ThinkingStart);
                        continue;
                    }
                    if let Some(text) = self.release_unambiguous(THINK_OPEN) {
                        events.push(TagEvent::Text(text));
                    }
                    break;
                }
                ScanPhase::Inside => {
                    if let Some(pos) = self.pending.find(THINK_CLOSE) {
                        if pos > 0 {
                            events.push(TagEvent::Thinking(self.pending[..pos].to_string()));
                        }
                        self.pending.drain(..pos + THINK_CLOSE.len());
                        self.phase = ScanPhase::AfterClose;
                        events.push(TagEvent::ThinkingEnd);
                        continue;
                    }
                    if let Some(thinking) = self.release_unambiguous(THINK_CLOSE) {
                        events.push(TagEvent::Thinking(thinking));
                    }
                    break;
                }
            }
        }

        events
    }

    /// Releases whatever is held back, classified by the current phase.
    pub fn flush(&mut self) -> Vec<TagEvent> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let pending = std::mem::take(&mut self.pending);
        match self.phase {
            ScanPhase::Inside => vec![TagEvent::Thinking(pending)],
            ScanPhase::BeforeOpen | ScanPhase::AfterClose => vec![TagEvent::Text(pending)],
        }
    }

    /// Drains the buffer except for a tail that is a proper prefix of `tag`.
    fn release_unambiguous(&mut self, tag: &str) -> Option<String> {
        let keep = partial_tag_suffix(&self.pending, tag);
        let release = self.pending.len() - keep;
        (release > 0).then(|| self.pending.drain(..release).collect())
    }
}

/// Length of the longest suffix of `buffer` that is a proper prefix of `tag`.
fn partial_tag_suffix(buffer: &str, tag: &str) -> usize {
    let max = buffer.len().min(tag.len() - 1);
    (1..=max)
        .rev()
        .find(|&len| buffer.ends_with(&tag[..len]))
        .unwrap_or(0)
}
