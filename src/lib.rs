/// Reader Assistant - a cross-context bridge for AI summarization, translation
/// and question answering over web pages and PDFs.
///
/// Page-facing contexts never see the API credential. They talk to a
/// [`ClientProxy`], which forwards each call as a correlated, cancellable
/// request to the privileged [`RequestBroker`]. The broker owns the
/// [`AiClient`] and streams cumulative chunks, progress and exactly one
/// terminal response back to the requesting context.
///
/// # Architecture
///
/// - `ai`: completion transport, SSE streaming, prompts and the lenient parser
/// - `broker`: request validation, dispatch and the active request registry
/// - `proxy`: the page-side stand-in with the same `AssistantApi` surface
/// - `storage`: credential and per-page history persistence
/// - `translation`: immersive page translation with pause and resume
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use reader_assistant::{
///     AssistantApi, ContextId, CredentialStore, HttpClientFactory, MemoryStore,
///     RequestBroker, Settings, connect_local,
/// };
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     reader_assistant::setup_logging();
///
///     let credentials = CredentialStore::new(Arc::new(MemoryStore::new()));
///     let factory = Arc::new(HttpClientFactory::new(Settings::from_env()?));
///     let broker = Arc::new(RequestBroker::new(credentials, factory));
///     broker.watch_credentials();
///
///     let proxy = connect_local(broker, ContextId::from("tab-1"));
///     let on_chunk = |text: &str| println!("{text}");
///     let summary = proxy
///         .summarize("Some article text", false, Some(&on_chunk), None, &CancellationToken::new())
///         .await?;
///     println!("{}", summary.summary);
///     Ok(())
/// }
/// ```
// Module declarations
pub mod ai;
pub mod broker;
pub mod core;
pub mod errors;
pub mod prompt;
pub mod protocol;
pub mod proxy;
pub mod storage;
pub mod translation;

pub use ai::{AiClient, AssistantApi, ChunkFn, CompletionTransport, ProgressFn};
pub use broker::{ClientFactory, HttpClientFactory, RequestBroker};
pub use crate::core::config::{Config, Settings};
pub use crate::core::models::{AiSummary, AnswerResponse, Citation, Message, Role};
pub use errors::{AssistantError, AssistantResult};
pub use protocol::{AiRequest, BrokerEvent, ContextId, InboundMessage, Method};
pub use proxy::{ClientProxy, EventRouter, connect_local};
pub use storage::{CredentialStore, HistoryStore, JsonFileStore, KeyValueStore, MemoryStore};
pub use translation::{TranslationControl, TranslationOutcome, translate_elements};

/// Configure structured JSON logging on stderr.
///
/// Stdout is reserved for protocol traffic in the host binary, so logs never
/// go there. The filter honours `RUST_LOG` and defaults to `info`. Calling
/// this more than once is harmless.
///
/// # Example
///
/// ```
/// reader_assistant::setup_logging();
/// ```
pub fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_writer(std::io::stderr);

    // A global subscriber may already be installed (tests, embedding hosts).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
