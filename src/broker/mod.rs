//! The privileged side of the bridge.
//!
//! The broker is the only component that ever sees the credential. It
//! validates inbound requests, runs each one in its own task against the
//! current AI client, and relays chunk, progress and terminal events back to
//! the originating context.

pub mod registry;

use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ai::client::{AiClient, AssistantApi, ChunkFn, ProgressFn};
use crate::core::config::{Config, Settings};
use crate::core::models::Translated;
use crate::errors::{AssistantError, AssistantResult};
use crate::protocol::{AiRequest, BrokerEvent, ContextId, InboundMessage};
use crate::storage::CredentialStore;

pub use registry::{ActiveRequestRegistry, Registration, RequestKey};

/// Where the broker sends events for one context.
pub type EventSink = mpsc::UnboundedSender<BrokerEvent>;

/// Builds an AI client from a credential.
pub trait ClientFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when no client can be built for `config`.
    fn build(&self, config: &Config) -> AssistantResult<Arc<dyn AssistantApi>>;
}

/// Builds HTTP-backed [`AiClient`]s.
#[derive(Debug, Clone, Default)]
pub struct HttpClientFactory {
    settings: Settings,
}

impl HttpClientFactory {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl ClientFactory for HttpClientFactory {
    fn build(&self, config: &Config) -> AssistantResult<Arc<dyn AssistantApi>> {
        Ok(Arc::new(AiClient::from_config(config, &self.settings)?))
    }
}

fn emit(reply: &EventSink, event: BrokerEvent) {
    if reply.send(event).is_err() {
        debug!("Reply channel closed, dropping event");
    }
}

/// Removes a registry entry once the request's task is done with it.
struct RegistryGuard {
    registry: Arc<Mutex<ActiveRequestRegistry>>,
    key: RequestKey,
    seq: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key, self.seq);
    }
}

/// A validated request that already holds its registry entry.
struct Admitted {
    origin: ContextId,
    id: u64,
    request: AiRequest,
    token: CancellationToken,
    _guard: RegistryGuard,
}

pub struct RequestBroker {
    credentials: CredentialStore,
    factory: Arc<dyn ClientFactory>,
    client: RwLock<Option<Arc<dyn AssistantApi>>>,
    registry: Arc<Mutex<ActiveRequestRegistry>>,
}

impl std::fmt::Debug for RequestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBroker")
            .field("has_client", &self.has_client())
            .field("active_requests", &self.active_requests())
            .finish_non_exhaustive()
    }
}

impl RequestBroker {
    pub fn new(credentials: CredentialStore, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            credentials,
            factory,
            client: RwLock::new(None),
            registry: Arc::new(Mutex::new(ActiveRequestRegistry::default())),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, ActiveRequestRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_client(&self) -> Option<Arc<dyn AssistantApi>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn has_client(&self) -> bool {
        self.current_client().is_some()
    }

    #[must_use]
    pub fn active_requests(&self) -> usize {
        self.registry().len()
    }

    #[must_use]
    pub fn is_active(&self, origin: &ContextId, id: u64) -> bool {
        self.registry()
            .contains(&RequestKey::new(origin.clone(), id))
    }

    /// Rebuilds the client from the credential store. Requests already
    /// running keep the client they started with.
    ///
    /// Returns whether a client is configured afterwards.
    ///
    /// # Errors
    ///
    /// Propagates credential store and client construction failures.
    pub async fn reload_client(&self) -> AssistantResult<bool> {
        let client = match self.credentials.load().await? {
            Some(config) => Some(self.factory.build(&config)?),
            None => None,
        };
        let configured = client.is_some();
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
        info!(configured, "Reloaded AI client");
        Ok(configured)
    }

    async fn client(&self) -> AssistantResult<Arc<dyn AssistantApi>> {
        if let Some(client) = self.current_client() {
            return Ok(client);
        }
        self.reload_client().await?;
        self.current_client().ok_or(AssistantError::NotConfigured)
    }

    /// Rebuilds the client whenever the credential changes. The task ends
    /// when the broker or the store goes away.
    pub fn watch_credentials(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::downgrade(self);
        let mut watch = self.credentials.subscribe();
        tokio::spawn(async move {
            while watch.changed().await {
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                if let Err(e) = broker.reload_client().await {
                    warn!(error = %e, "Failed to reload AI client after credential change");
                }
            }
            debug!("Credential watch ended");
        })
    }

    /// Cancels every in-flight request and the client's current call.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.registry().cancel_all(None);
        if let Some(client) = self.current_client() {
            client.cancel();
        }
        info!(cancelled, "Cancelled all requests");
        cancelled
    }

    /// Cancels one request of `origin`. Returns `false` if it was not active.
    pub fn cancel_request(&self, origin: &ContextId, id: u64) -> bool {
        let cancelled = self
            .registry()
            .cancel(&RequestKey::new(origin.clone(), id));
        info!(origin = %origin, id, cancelled, "Cancel request");
        cancelled
    }

    /// Handles one inbound message from `origin`.
    ///
    /// A request is validated and registered before this returns, so a
    /// cancel handled right after it always finds it. Accepted requests run
    /// on their own task, whose handle is returned.
    pub fn handle(
        self: &Arc<Self>,
        origin: ContextId,
        message: InboundMessage,
        reply: EventSink,
    ) -> Option<JoinHandle<()>> {
        match message {
            InboundMessage::Request { id, method, params } => {
                let admitted = self.admit(origin, id, &method, params, &reply)?;
                let broker = Arc::clone(self);
                Some(tokio::spawn(async move {
                    broker.run(admitted, reply).await;
                }))
            }
            InboundMessage::Cancel { id: None } => {
                self.cancel_all();
                None
            }
            InboundMessage::Cancel { id: Some(id) } => {
                self.cancel_request(&origin, id);
                None
            }
        }
    }

    /// Runs one request to its single terminal event.
    pub async fn process(
        &self,
        origin: ContextId,
        id: u64,
        method: &str,
        params: Value,
        reply: EventSink,
    ) {
        if let Some(admitted) = self.admit(origin, id, method, params, &reply) {
            self.run(admitted, reply).await;
        }
    }

    /// Validates and registers a request. Rejections get their terminal
    /// event here and never touch the registry.
    fn admit(
        &self,
        origin: ContextId,
        id: u64,
        method: &str,
        params: Value,
        reply: &EventSink,
    ) -> Option<Admitted> {
        info!(origin = %origin, id, method, "Handling AI request");

        let request = match AiRequest::from_parts(method, params) {
            Ok(request) => request,
            Err(e) => {
                warn!(origin = %origin, id, error = %e, "Rejected AI request");
                emit(reply, BrokerEvent::failure(id, &e));
                return None;
            }
        };

        let key = RequestKey::new(origin.clone(), id);
        let registered = self.registry().register(key.clone());
        let registration = match registered {
            Ok(registration) => registration,
            Err(e) => {
                warn!(origin = %origin, id, error = %e, "Duplicate AI request");
                emit(reply, BrokerEvent::failure(id, &e));
                return None;
            }
        };

        Some(Admitted {
            origin,
            id,
            request,
            token: registration.token,
            _guard: RegistryGuard {
                registry: Arc::clone(&self.registry),
                key,
                seq: registration.seq,
            },
        })
    }

    async fn run(&self, admitted: Admitted, reply: EventSink) {
        let Admitted {
            origin,
            id,
            request,
            token,
            _guard,
        } = admitted;

        let outcome = if token.is_cancelled() {
            Err(AssistantError::Cancelled)
        } else {
            match self.client().await {
                Ok(client) => dispatch(client.as_ref(), request, id, &token, &reply).await,
                Err(e) => {
                    warn!(origin = %origin, id, error = %e, "No AI client available");
                    Err(e)
                }
            }
        };

        let terminal = match outcome {
            Ok(data) => BrokerEvent::Response {
                id,
                outcome: Ok(data),
            },
            Err(e) => {
                if e.is_cancelled() {
                    info!(origin = %origin, id, "AI request cancelled");
                } else {
                    warn!(origin = %origin, id, error = %e, "AI request failed");
                }
                BrokerEvent::failure(id, &e)
            }
        };
        emit(&reply, terminal);
    }
}

async fn dispatch(
    client: &dyn AssistantApi,
    request: AiRequest,
    id: u64,
    cancel: &CancellationToken,
    reply: &EventSink,
) -> AssistantResult<Value> {
    let chunk_sink = reply.clone();
    let on_chunk = move |text: &str| {
        emit(
            &chunk_sink,
            BrokerEvent::Chunk {
                id,
                chunk: text.to_string(),
            },
        );
    };
    let progress_sink = reply.clone();
    let on_progress = move |current: usize, total: usize| {
        emit(&progress_sink, BrokerEvent::Progress { id, current, total });
    };

    match request {
        AiRequest::Summarize(params) => {
            let summary = client
                .summarize(
                    &params.content,
                    params.is_long_form,
                    params.stream.then_some(&on_chunk as &ChunkFn),
                    params.target_language.as_deref(),
                    cancel,
                )
                .await?;
            Ok(serde_json::to_value(summary)?)
        }
        AiRequest::Translate(params) => {
            let translated = client
                .translate(
                    &params.content,
                    params.target_lang.as_deref(),
                    params.professional,
                    cancel,
                )
                .await?;
            Ok(serde_json::to_value(Translated { translated })?)
        }
        AiRequest::TranslateLines(params) => {
            let lines = client
                .translate_lines(
                    &params.lines,
                    params.target_lang.as_deref(),
                    params.on_progress.then_some(&on_progress as &ProgressFn),
                    cancel,
                )
                .await?;
            Ok(serde_json::to_value(lines)?)
        }
        AiRequest::AnswerQuestion(params) => {
            let answer = client
                .answer_question(&params.question, &params.content, params.is_long_form, cancel)
                .await?;
            Ok(serde_json::to_value(answer)?)
        }
        AiRequest::AnswerWithHistory(params) => {
            let answer = client
                .answer_with_history(
                    &params.question,
                    &params.content,
                    &params.history,
                    params.is_long_form,
                    params.stream.then_some(&on_chunk as &ChunkFn),
                    cancel,
                )
                .await?;
            Ok(serde_json::to_value(answer)?)
        }
    }
}
