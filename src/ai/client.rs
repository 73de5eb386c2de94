use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parser::{parse_answer, parse_summary};
use super::sse::StreamEvent;
use super::stream::ActiveStream;
use super::transport::{CompletionRequest, CompletionTransport, HttpTransport};
use crate::core::config::{Config, DEFAULT_LANGUAGE, DEFAULT_TEMPERATURE, Settings};
use crate::core::models::{AiSummary, AnswerResponse, Message};
use crate::errors::{AssistantError, AssistantResult};
use crate::prompt;

/// Receives the cumulative text produced so far on every streamed chunk.
pub type ChunkFn = dyn Fn(&str) + Send + Sync;

/// Receives `(current, total)` after each unit of a batch operation.
pub type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

/// Lines with fewer trimmed characters than this are not worth a remote call.
pub const TRIVIAL_LINE_CHARS: usize = 3;

/// The assistant's operation surface, shared by the privileged client and the
/// page-facing proxy.
///
/// Every operation takes the caller's cancellation token. Cancelling it ends
/// the operation with [`AssistantError::Cancelled`] at the next chunk, line or
/// remote-call boundary.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    async fn summarize(
        &self,
        content: &str,
        is_long_form: bool,
        on_chunk: Option<&ChunkFn>,
        target_language: Option<&str>,
        cancel: &CancellationToken,
    ) -> AssistantResult<AiSummary>;

    async fn translate(
        &self,
        content: &str,
        target_lang: Option<&str>,
        professional: bool,
        cancel: &CancellationToken,
    ) -> AssistantResult<String>;

    async fn translate_lines(
        &self,
        lines: &[String],
        target_lang: Option<&str>,
        on_progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> AssistantResult<Vec<String>>;

    async fn answer_question(
        &self,
        question: &str,
        content: &str,
        is_long_form: bool,
        cancel: &CancellationToken,
    ) -> AssistantResult<AnswerResponse>;

    async fn answer_with_history(
        &self,
        question: &str,
        content: &str,
        history: &[Message],
        is_long_form: bool,
        on_chunk: Option<&ChunkFn>,
        cancel: &CancellationToken,
    ) -> AssistantResult<AnswerResponse>;

    /// Aborts the most recently started call, if any. Never fails.
    fn cancel(&self);
}

/// Calls the completion endpoint and shapes its output.
///
/// Each call runs under a child of the caller's token, so cancelling one
/// request never touches another request sharing this client. [`cancel`]
/// only reaches the latest call.
///
/// [`cancel`]: AssistantApi::cancel
pub struct AiClient {
    transport: Arc<dyn CompletionTransport>,
    model: String,
    temperature: f32,
    default_language: String,
    current: Mutex<Option<(u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for AiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiClient")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("default_language", &self.default_language)
            .finish_non_exhaustive()
    }
}

/// Marks a call as the client's current one until dropped.
struct CallHandle<'a> {
    client: &'a AiClient,
    generation: u64,
    token: CancellationToken,
}

impl Drop for CallHandle<'_> {
    fn drop(&mut self) {
        let mut current = self
            .client
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current
            .as_ref()
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            *current = None;
        }
    }
}

impl AiClient {
    pub fn new(transport: Arc<dyn CompletionTransport>, model: impl Into<String>) -> Self {
        Self {
            transport,
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            default_language: DEFAULT_LANGUAGE.to_string(),
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Builds an HTTP-backed client for `config`.
    ///
    /// # Errors
    ///
    /// Returns `NotConfigured` when `config` carries no API key.
    pub fn from_config(config: &Config, settings: &Settings) -> AssistantResult<Self> {
        let transport = HttpTransport::new(config, settings.request_timeout)?;
        info!(
            endpoint = %transport.endpoint(),
            model = %settings.model_for(config),
            "Created AI client"
        );
        Ok(Self::new(Arc::new(transport), settings.model_for(config))
            .with_temperature(settings.temperature)
            .with_default_language(settings.default_language.clone()))
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub fn with_default_language(mut self, language: impl Into<String>) -> Self {
        self.default_language = language.into();
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether a remote call started on this client is still running.
    #[must_use]
    pub fn has_call_in_flight(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn begin_call(&self, parent: &CancellationToken) -> CallHandle<'_> {
        let token = parent.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((generation, token.clone()));
        CallHandle {
            client: self,
            generation,
            token,
        }
    }

    fn request(&self, messages: Vec<Message>, stream: bool) -> CompletionRequest {
        #[cfg(feature = "debug-logs")]
        debug!(?messages, "Completion prompt");

        CompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            stream,
        }
    }

    async fn complete_text(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> AssistantResult<String> {
        let call = self.begin_call(cancel);
        if call.token.is_cancelled() {
            return Err(AssistantError::Cancelled);
        }
        let request = self.request(messages, false);

        tokio::select! {
            biased;
            () = call.token.cancelled() => Err(AssistantError::Cancelled),
            result = self.transport.complete(&request) => result,
        }
    }

    async fn stream_text(
        &self,
        messages: Vec<Message>,
        on_chunk: &ChunkFn,
        cancel: &CancellationToken,
    ) -> AssistantResult<String> {
        let call = self.begin_call(cancel);
        if call.token.is_cancelled() {
            return Err(AssistantError::Cancelled);
        }
        let request = self.request(messages, true);

        let byte_stream = tokio::select! {
            biased;
            () = call.token.cancelled() => return Err(AssistantError::Cancelled),
            result = self.transport.stream(&request) => result?,
        };
        let mut stream = ActiveStream::new(byte_stream);
        let mut full_text = String::new();

        loop {
            let event = tokio::select! {
                biased;
                () = call.token.cancelled() => return Err(AssistantError::Cancelled),
                event = stream.next_event() => event?,
            };

            match event {
                None => break,
                Some(StreamEvent::TextDelta(delta)) => {
                    full_text.push_str(&delta);
                    if call.token.is_cancelled() {
                        return Err(AssistantError::Cancelled);
                    }
                    on_chunk(&full_text);
                }
                Some(StreamEvent::Finished(reason)) => {
                    debug!(reason = %reason, "Stream reported finish reason");
                }
                Some(StreamEvent::Error(message)) => {
                    warn!(error = %message, "Provider reported an error mid-stream");
                    return Err(AssistantError::RemoteError(message));
                }
            }
        }

        if stream.malformed_frames() > 0 {
            debug!(
                skipped = stream.malformed_frames(),
                "Skipped malformed stream frames"
            );
        }
        Ok(full_text)
    }

    async fn run(
        &self,
        messages: Vec<Message>,
        on_chunk: Option<&ChunkFn>,
        cancel: &CancellationToken,
    ) -> AssistantResult<String> {
        match on_chunk {
            Some(on_chunk) => self.stream_text(messages, on_chunk, cancel).await,
            None => self.complete_text(messages, cancel).await,
        }
    }

    fn resolve_target_language<'a>(&'a self, target_lang: Option<&'a str>) -> &'a str {
        target_lang
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .unwrap_or(&self.default_language)
    }
}

#[async_trait]
impl AssistantApi for AiClient {
    async fn summarize(
        &self,
        content: &str,
        is_long_form: bool,
        on_chunk: Option<&ChunkFn>,
        target_language: Option<&str>,
        cancel: &CancellationToken,
    ) -> AssistantResult<AiSummary> {
        let long_form = prompt::is_long_form(content, is_long_form);
        let language = match target_language.map(str::trim).filter(|l| !l.is_empty()) {
            Some(language) => language.to_string(),
            None => prompt::detect_content_language(content, prompt::AUTO_LANGUAGE),
        };
        info!(
            content_chars = content.chars().count(),
            long_form,
            streaming = on_chunk.is_some(),
            language = %language,
            "Summarizing content"
        );

        let messages = prompt::summarize_messages(content, long_form, Some(&language));
        let raw = self.run(messages, on_chunk, cancel).await?;
        Ok(parse_summary(&raw, content))
    }

    async fn translate(
        &self,
        content: &str,
        target_lang: Option<&str>,
        professional: bool,
        cancel: &CancellationToken,
    ) -> AssistantResult<String> {
        let target = self.resolve_target_language(target_lang);
        debug!(
            content_chars = content.chars().count(),
            target = %target,
            professional,
            "Translating content"
        );

        let messages = prompt::translate_messages(content, target, professional);
        self.complete_text(messages, cancel).await
    }

    async fn translate_lines(
        &self,
        lines: &[String],
        target_lang: Option<&str>,
        on_progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> AssistantResult<Vec<String>> {
        let target = self.resolve_target_language(target_lang);
        let total = lines.len();
        info!(lines = total, target = %target, "Translating lines");

        let mut translated = Vec::with_capacity(total);
        for (index, line) in lines.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(done = index, total, "Line translation cancelled");
                return Err(AssistantError::Cancelled);
            }

            let trimmed = line.trim();
            if trimmed.chars().count() < TRIVIAL_LINE_CHARS {
                translated.push(String::new());
            } else {
                match self
                    .translate(trimmed, Some(target), true, cancel)
                    .await
                {
                    Ok(text) => translated.push(text),
                    Err(AssistantError::Cancelled) => return Err(AssistantError::Cancelled),
                    Err(e) => {
                        warn!(line = index, error = %e, "Failed to translate line");
                        translated.push(String::new());
                    }
                }
            }

            if let Some(on_progress) = on_progress {
                on_progress(index + 1, total);
            }
        }

        Ok(translated)
    }

    async fn answer_question(
        &self,
        question: &str,
        content: &str,
        is_long_form: bool,
        cancel: &CancellationToken,
    ) -> AssistantResult<AnswerResponse> {
        self.answer_with_history(question, content, &[], is_long_form, None, cancel)
            .await
    }

    async fn answer_with_history(
        &self,
        question: &str,
        content: &str,
        history: &[Message],
        is_long_form: bool,
        on_chunk: Option<&ChunkFn>,
        cancel: &CancellationToken,
    ) -> AssistantResult<AnswerResponse> {
        let long_form = prompt::is_long_form(content, is_long_form);
        info!(
            history_turns = history.len(),
            long_form,
            streaming = on_chunk.is_some(),
            "Answering question"
        );

        let messages = prompt::answer_messages(question, content, history, long_form);
        let raw = self.run(messages, on_chunk, cancel).await?;
        Ok(parse_answer(&raw, content))
    }

    fn cancel(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((generation, token)) = current {
            debug!(generation, "Cancelling in-flight call");
            token.cancel();
        }
    }
}
