//! Stdio host for the request broker.
//!
//! Reads newline-delimited JSON envelopes (`ai-request`, `ai-cancel`) on
//! stdin and writes broker events as JSON lines on stdout. An optional
//! `context` field on each envelope names the originating context; it is
//! echoed on every event for that context. Logs go to stderr.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use reader_assistant::broker::EventSink;
use reader_assistant::{
    BrokerEvent, Config, ContextId, CredentialStore, HttpClientFactory, InboundMessage,
    JsonFileStore, KeyValueStore, MemoryStore, RequestBroker, Settings,
};

const DEFAULT_CONTEXT: &str = "stdio";

/// Tags each event with its context and hands it to the stdout writer.
fn forward_events(context: ContextId, out: mpsc::UnboundedSender<Value>) -> EventSink {
    let (tx, mut rx) = mpsc::unbounded_channel::<BrokerEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut wire = event.to_wire();
            if let Some(object) = wire.as_object_mut() {
                object.insert("context".to_string(), Value::String(context.to_string()));
            }
            if out.send(wire).is_err() {
                break;
            }
        }
    });
    tx
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn KeyValueStore>> {
    let store: Arc<dyn KeyValueStore> = match &settings.storage_path {
        Some(path) => Arc::new(
            JsonFileStore::open(path)
                .await
                .with_context(|| format!("Failed to open store at {}", path.display()))?,
        ),
        None => {
            warn!("READER_STORAGE_PATH not set, credentials and history will not persist");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    reader_assistant::setup_logging();

    let settings = Settings::from_env().context("Invalid configuration")?;
    let credentials = CredentialStore::new(open_store(&settings).await?);

    if let Some(api_key) = env::var("READER_API_KEY").ok().filter(|k| !k.trim().is_empty()) {
        let base_url = env::var("READER_BASE_URL").unwrap_or_default();
        credentials
            .save(&Config::new(api_key, base_url))
            .await
            .context("Failed to store credentials from the environment")?;
    }

    let broker = Arc::new(RequestBroker::new(
        credentials,
        Arc::new(HttpClientFactory::new(settings)),
    ));
    let _watch = broker.watch_credentials();
    if !broker.reload_client().await.context("Failed to build AI client")? {
        warn!("No API key configured, requests will fail until one is saved");
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = out_rx.recv().await {
            let mut line = event.to_string();
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!(error = %e, "Failed to write event to stdout");
                break;
            }
            if let Err(e) = stdout.flush().await {
                error!(error = %e, "Failed to flush stdout");
                break;
            }
        }
    });

    let mut sinks: HashMap<ContextId, EventSink> = HashMap::new();
    let mut tasks = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Broker host ready");

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed input line");
                continue;
            }
        };
        let context = value
            .get("context")
            .and_then(Value::as_str)
            .map_or_else(|| ContextId::from(DEFAULT_CONTEXT), ContextId::from);
        let message: InboundMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                warn!(context = %context, error = %e, "Ignoring unknown envelope");
                continue;
            }
        };

        let sink = sinks
            .entry(context.clone())
            .or_insert_with(|| forward_events(context.clone(), out_tx.clone()))
            .clone();
        if let Some(task) = broker.handle(context, message, sink) {
            tasks.push(task);
        }
        tasks.retain(|task| !task.is_finished());
    }

    info!(in_flight = tasks.len(), "Input closed, draining in-flight requests");
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Request task failed");
        }
    }

    drop(sinks);
    drop(out_tx);
    writer.await.context("stdout writer failed")?;
    Ok(())
}
