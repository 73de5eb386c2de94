//! Turns a raw SSE byte stream into typed [`StreamEvent`]s.

use futures::StreamExt;
use std::collections::VecDeque;
use tracing::{debug, warn};

use super::sse::{ParseResult, SseParser, StreamEvent};
use super::transport::ByteStream;
use crate::errors::AssistantError;

/// An in-flight streaming completion.
pub struct ActiveStream {
    byte_stream: ByteStream,
    parser: SseParser,
    pending_results: VecDeque<ParseResult>,
    utf8_buffer: Vec<u8>,
    malformed_frames: usize,
    completed: bool,
}

impl std::fmt::Debug for ActiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveStream")
            .field("completed", &self.completed)
            .field("malformed_frames", &self.malformed_frames)
            .field("pending_results_len", &self.pending_results.len())
            .field("utf8_buffer_len", &self.utf8_buffer.len())
            .field("parser_buffer_len", &self.parser.remaining_buffer().len())
            .finish_non_exhaustive()
    }
}

impl ActiveStream {
    #[must_use]
    pub fn new(byte_stream: ByteStream) -> Self {
        Self {
            byte_stream,
            parser: SseParser::new(),
            pending_results: VecDeque::new(),
            utf8_buffer: Vec::new(),
            malformed_frames: 0,
            completed: false,
        }
    }

    /// Number of frames skipped because their payload could not be parsed.
    #[must_use]
    pub const fn malformed_frames(&self) -> usize {
        self.malformed_frames
    }

    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    fn drain_pending_results(&mut self) -> Option<StreamEvent> {
        while let Some(result) = self.pending_results.pop_front() {
            match result {
                ParseResult::Event(event) => return Some(event),
                ParseResult::Done => {
                    self.completed = true;
                    self.pending_results.clear();
                    return None;
                }
                ParseResult::Malformed(detail) => {
                    self.malformed_frames += 1;
                    debug!(detail = %detail, "Skipping malformed stream fragment");
                }
                ParseResult::Ignored => {}
            }
        }
        None
    }

    fn feed_utf8(&mut self) {
        loop {
            match std::str::from_utf8(&self.utf8_buffer) {
                Ok(valid) => {
                    self.pending_results.extend(self.parser.feed(valid));
                    self.utf8_buffer.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    if valid_up_to > 0 {
                        let prefix = String::from_utf8_lossy(&self.utf8_buffer[..valid_up_to])
                            .into_owned();
                        self.pending_results.extend(self.parser.feed(&prefix));
                        self.utf8_buffer.drain(..valid_up_to);
                    }
                    match e.error_len() {
                        Some(bad_len) => {
                            // Invalid bytes are dropped like any other malformed fragment.
                            self.malformed_frames += 1;
                            warn!(bytes = bad_len, "Dropping invalid UTF-8 in stream");
                            self.utf8_buffer.drain(..bad_len);
                        }
                        // Incomplete trailing sequence: wait for more bytes.
                        None => return,
                    }
                }
            }
        }
    }

    /// Returns the next stream event, or `None` once the stream is complete.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the body fails.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, AssistantError> {
        loop {
            if let Some(event) = self.drain_pending_results() {
                return Ok(Some(event));
            }
            if self.completed {
                return Ok(None);
            }

            match self.byte_stream.next().await {
                Some(Ok(bytes)) => {
                    self.utf8_buffer.extend_from_slice(&bytes);
                    self.feed_utf8();
                }
                Some(Err(e)) => {
                    self.completed = true;
                    return Err(e);
                }
                None => {
                    if let Some(result) = self.parser.finish() {
                        self.pending_results.push_back(result);
                    }
                    if let Some(event) = self.drain_pending_results() {
                        return Ok(Some(event));
                    }
                    self.completed = true;
                    return Ok(None);
                }
            }
        }
    }
}
