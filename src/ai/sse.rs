//! Server-Sent Events (SSE) parser for chat-completion streaming responses.
//!
//! Handles:
//! - Frames split across TCP chunks
//! - Multiple frames in one read
//! - Heartbeats, comments and role-only deltas (ignored)
//! - Unparsable payloads (reported as `Malformed`, never fatal)

use serde_json::Value;

/// Events emitted by a chat-completions streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text from `choices[0].delta.content`.
    TextDelta(String),
    /// A choice reported its `finish_reason`.
    Finished(String),
    /// The provider sent an error object inside the stream.
    Error(String),
}

/// Result of parsing an SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    Event(StreamEvent),
    /// Valid JSON carrying nothing we act on (role announcements, usage, ...).
    Ignored,
    /// The data payload was not valid JSON.
    Malformed(String),
    /// End of stream signal (`[DONE]`).
    Done,
}

/// Stateful SSE parser that buffers incomplete frames across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Feeds a chunk of data to the parser and returns all complete frames.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParseResult> {
        self.buffer.push_str(chunk);
        let mut results = Vec::new();

        while let Some(event_end) = self.find_event_boundary() {
            let event_text = self.buffer[..event_end].to_string();
            self.buffer = self.buffer[event_end..]
                .trim_start_matches(['\r', '\n'])
                .to_string();

            if let Some(result) = Self::parse_event(&event_text) {
                results.push(result);
            }
        }

        results
    }

    /// Parses whatever is left in the buffer once the byte stream has ended.
    pub fn finish(&mut self) -> Option<ParseResult> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return None;
        }
        Self::parse_event(&rest)
    }

    fn find_event_boundary(&self) -> Option<usize> {
        let lf = self.buffer.find("\n\n").map(|pos| pos + 2);
        let crlf = self.buffer.find("\r\n\r\n").map(|pos| pos + 4);
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn parse_event(event_text: &str) -> Option<ParseResult> {
        let mut data_lines: Vec<&str> = Vec::new();

        for line in event_text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data);
                }
            }
        }

        if data_lines.is_empty() {
            return None;
        }

        let data = data_lines.join("\n");
        if data == "[DONE]" {
            return Some(ParseResult::Done);
        }

        Some(Self::parse_json_event(&data))
    }

    fn parse_json_event(data: &str) -> ParseResult {
        let json: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return ParseResult::Malformed(format!("{e}: {}", preview(data))),
        };

        if let Some(error) = json.get("error") {
            return ParseResult::Event(StreamEvent::Error(extract_error_message(error)));
        }

        let Some(choice) = json
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return ParseResult::Ignored;
        };

        if let Some(content) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
        {
            return ParseResult::Event(StreamEvent::TextDelta(content.to_string()));
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            return ParseResult::Event(StreamEvent::Finished(reason.to_string()));
        }

        ParseResult::Ignored
    }

    #[must_use]
    pub fn remaining_buffer(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn extract_error_message(error: &Value) -> String {
    if let Some(msg) = error.get("message").and_then(Value::as_str) {
        return msg.to_string();
    }
    if let Some(msg) = error.as_str() {
        return msg.to_string();
    }
    "Unknown error".to_string()
}

fn preview(data: &str) -> String {
    data.chars().take(80).collect()
}
