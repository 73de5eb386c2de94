//! The page-facing stand-in for the AI client.
//!
//! A [`ClientProxy`] never holds the credential. Each call is sent to the
//! broker as an `ai-request` envelope under a fresh id; events coming back are
//! routed to the pending call by id until its single terminal event settles
//! it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ai::client::{AssistantApi, ChunkFn, ProgressFn};
use crate::broker::RequestBroker;
use crate::core::models::{AiSummary, AnswerResponse, Message, Translated};
use crate::errors::{AssistantError, AssistantResult};
use crate::protocol::{
    AiRequest, AnswerQuestionParams, AnswerWithHistoryParams, BrokerEvent, ContextId,
    InboundMessage, SummarizeParams, TranslateLinesParams, TranslateParams,
};

type PendingMap = HashMap<u64, mpsc::UnboundedSender<BrokerEvent>>;

/// Delivers broker events to the call waiting for them.
#[derive(Debug, Clone, Default)]
pub struct EventRouter {
    pending: Arc<Mutex<PendingMap>>,
}

impl EventRouter {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes one event. Returns `false` when no call is waiting for its id.
    pub fn route(&self, event: BrokerEvent) -> bool {
        let id = event.id();
        let mut pending = self.pending();
        let delivered = if event.is_terminal() {
            pending.remove(&id).is_some_and(|tx| tx.send(event).is_ok())
        } else {
            pending.get(&id).is_some_and(|tx| tx.send(event).is_ok())
        };
        if !delivered {
            debug!(id, "Dropping event for unknown or settled request");
        }
        delivered
    }

    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }
}

/// Deregisters a call's listener when the call ends, however it ends.
struct ListenerGuard<'a> {
    router: &'a EventRouter,
    id: u64,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.router.pending().remove(&self.id);
    }
}

pub struct ClientProxy {
    next_id: AtomicU64,
    router: EventRouter,
    outbound: mpsc::UnboundedSender<InboundMessage>,
}

impl std::fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProxy")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending_calls", &self.router.pending_calls())
            .finish_non_exhaustive()
    }
}

impl ClientProxy {
    /// Creates a proxy that sends envelopes on `outbound`. Events for it must
    /// be fed to [`ClientProxy::router`].
    pub fn new(outbound: mpsc::UnboundedSender<InboundMessage>) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            router: EventRouter::default(),
            outbound,
        }
    }

    #[must_use]
    pub fn router(&self) -> EventRouter {
        self.router.clone()
    }

    /// Sends `request` and waits for its terminal event.
    ///
    /// # Errors
    ///
    /// Returns the broker's error, `Cancelled` when `cancel` fires first, or
    /// `ChannelClosed` when the broker is unreachable.
    pub async fn call(
        &self,
        request: AiRequest,
        on_chunk: Option<&ChunkFn>,
        on_progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> AssistantResult<Value> {
        if cancel.is_cancelled() {
            return Err(AssistantError::Cancelled);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let method = request.method();
        let envelope = request.into_envelope(id)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.router.pending().insert(id, tx);
        let _listener = ListenerGuard {
            router: &self.router,
            id,
        };

        if self.outbound.send(envelope).is_err() {
            return Err(AssistantError::ChannelClosed(format!(
                "broker unreachable for request {id}"
            )));
        }
        debug!(id, method = %method, "Sent AI request");

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(id, "AI request cancelled by caller");
                    self.send_cancel_all();
                    return Err(AssistantError::Cancelled);
                }
                event = rx.recv() => event,
            };

            match event {
                None => {
                    return Err(AssistantError::ChannelClosed(format!(
                        "request {id} dropped before settling"
                    )));
                }
                Some(BrokerEvent::Chunk { chunk, .. }) => {
                    if let Some(on_chunk) = on_chunk {
                        on_chunk(&chunk);
                    }
                }
                Some(BrokerEvent::Progress { current, total, .. }) => {
                    if let Some(on_progress) = on_progress {
                        on_progress(current, total);
                    }
                }
                Some(BrokerEvent::Response { outcome, .. }) => {
                    return outcome.map_err(|error| AssistantError::from_wire(&error));
                }
            }
        }
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        request: AiRequest,
        on_chunk: Option<&ChunkFn>,
        on_progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> AssistantResult<T> {
        let data = self.call(request, on_chunk, on_progress, cancel).await?;
        serde_json::from_value(data).map_err(|e| {
            AssistantError::ParseError(format!("Unexpected response shape: {e}"))
        })
    }

    fn send_cancel_all(&self) {
        if self
            .outbound
            .send(InboundMessage::Cancel { id: None })
            .is_err()
        {
            warn!("Broker unreachable, cancel not delivered");
        }
    }
}

#[async_trait]
impl AssistantApi for ClientProxy {
    async fn summarize(
        &self,
        content: &str,
        is_long_form: bool,
        on_chunk: Option<&ChunkFn>,
        target_language: Option<&str>,
        cancel: &CancellationToken,
    ) -> AssistantResult<AiSummary> {
        let request = AiRequest::Summarize(SummarizeParams {
            content: content.to_string(),
            is_long_form,
            stream: on_chunk.is_some(),
            target_language: target_language.map(ToString::to_string),
        });
        self.call_typed(request, on_chunk, None, cancel).await
    }

    async fn translate(
        &self,
        content: &str,
        target_lang: Option<&str>,
        professional: bool,
        cancel: &CancellationToken,
    ) -> AssistantResult<String> {
        let request = AiRequest::Translate(TranslateParams {
            content: content.to_string(),
            target_lang: target_lang.map(ToString::to_string),
            professional,
        });
        let translated: Translated = self.call_typed(request, None, None, cancel).await?;
        Ok(translated.translated)
    }

    async fn translate_lines(
        &self,
        lines: &[String],
        target_lang: Option<&str>,
        on_progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> AssistantResult<Vec<String>> {
        let request = AiRequest::TranslateLines(TranslateLinesParams {
            lines: lines.to_vec(),
            target_lang: target_lang.map(ToString::to_string),
            on_progress: on_progress.is_some(),
        });
        self.call_typed(request, None, on_progress, cancel).await
    }

    async fn answer_question(
        &self,
        question: &str,
        content: &str,
        is_long_form: bool,
        cancel: &CancellationToken,
    ) -> AssistantResult<AnswerResponse> {
        let request = AiRequest::AnswerQuestion(AnswerQuestionParams {
            question: question.to_string(),
            content: content.to_string(),
            is_long_form,
        });
        self.call_typed(request, None, None, cancel).await
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
        let request = AiRequest::AnswerWithHistory(AnswerWithHistoryParams {
            question: question.to_string(),
            content: content.to_string(),
            history: history.to_vec(),
            is_long_form,
            stream: on_chunk.is_some(),
        });
        self.call_typed(request, on_chunk, None, cancel).await
    }

    fn cancel(&self) {
        self.send_cancel_all();
    }
}

/// Connects a proxy for `origin` to an in-process broker over channels.
///
/// Must be called inside a tokio runtime. The pumping tasks end once the
/// proxy is dropped and its requests have settled.
pub fn connect_local(broker: Arc<RequestBroker>, origin: ContextId) -> ClientProxy {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<BrokerEvent>();
    let proxy = ClientProxy::new(outbound_tx);
    let router = proxy.router();

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            broker.handle(origin.clone(), message, event_tx.clone());
        }
    });

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            router.route(event);
        }
    });

    proxy
}
