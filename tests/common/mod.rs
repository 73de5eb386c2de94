#![allow(dead_code)]

use async_trait::async_trait;
use reader_assistant::ai::transport::ByteStream;
use reader_assistant::broker::EventSink;
use reader_assistant::{
    AiClient, AssistantApi, AssistantError, AssistantResult, BrokerEvent, ClientFactory,
    CompletionTransport, Config, CredentialStore, MemoryStore, RequestBroker,
};
use reader_assistant::ai::CompletionRequest;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// What the fake endpoint does with one call.
pub enum Reply {
    Text(String),
    Stream(Vec<String>),
    Fail(AssistantError),
    Hang,
}

type Responder = dyn Fn(&CompletionRequest) -> Reply + Send + Sync;

/// A completion endpoint driven by a closure over the request.
pub struct ScriptedTransport {
    responder: Box<Responder>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&CompletionRequest) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answers every call with the same text.
    pub fn text(reply: &str) -> Arc<Self> {
        let reply = reply.to_string();
        Self::new(move |_| Reply::Text(reply.clone()))
    }

    /// Hangs on any prompt containing `HANG` and echoes the rest.
    pub fn echo_or_hang() -> Arc<Self> {
        Self::new(|request| {
            let prompt = last_user_message(request);
            if prompt.contains("HANG") {
                Reply::Hang
            } else {
                Reply::Text(format!("echo: {prompt}"))
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn reply_to(&self, request: &CompletionRequest) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        (self.responder)(request)
    }
}

pub fn last_user_message(request: &CompletionRequest) -> String {
    request
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn sse_frame(delta: &str) -> bytes::Bytes {
    bytes::Bytes::from(format!(
        "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}\n\n",
        serde_json::to_string(delta).unwrap()
    ))
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn complete(&self, request: &CompletionRequest) -> AssistantResult<String> {
        match self.reply_to(request) {
            Reply::Text(text) => Ok(text),
            Reply::Stream(deltas) => Ok(deltas.concat()),
            Reply::Fail(e) => Err(e),
            Reply::Hang => futures::future::pending().await,
        }
    }

    async fn stream(&self, request: &CompletionRequest) -> AssistantResult<ByteStream> {
        let deltas = match self.reply_to(request) {
            Reply::Stream(deltas) => deltas,
            Reply::Text(text) => vec![text],
            Reply::Fail(e) => return Err(e),
            Reply::Hang => {
                return Ok(Box::pin(
                    futures::stream::pending::<AssistantResult<bytes::Bytes>>(),
                ));
            }
        };
        let mut frames: Vec<AssistantResult<bytes::Bytes>> =
            deltas.iter().map(|d| Ok(sse_frame(d))).collect();
        frames.push(Ok(bytes::Bytes::from_static(b"data: [DONE]\n\n")));
        Ok(Box::pin(futures::stream::iter(frames)))
    }
}

/// Builds clients over one shared scripted transport and counts the builds.
pub struct ScriptedFactory {
    transport: Arc<ScriptedTransport>,
    builds: AtomicUsize,
    configs: Mutex<Vec<Config>>,
}

impl ScriptedFactory {
    pub fn new(transport: Arc<ScriptedTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            builds: AtomicUsize::new(0),
            configs: Mutex::new(Vec::new()),
        })
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.configs().into_iter().map(|c| c.api_key).collect()
    }

    /// Every credential a client was built from, in order.
    pub fn configs(&self) -> Vec<Config> {
        self.configs.lock().unwrap().clone()
    }
}

impl ClientFactory for ScriptedFactory {
    fn build(&self, config: &Config) -> AssistantResult<Arc<dyn AssistantApi>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().unwrap().push(config.clone());
        Ok(Arc::new(AiClient::new(self.transport.clone(), "test-model")))
    }
}

pub struct Harness {
    pub broker: Arc<RequestBroker>,
    pub credentials: CredentialStore,
    pub factory: Arc<ScriptedFactory>,
    pub transport: Arc<ScriptedTransport>,
}

/// A broker over an in-memory store, with an API key saved when `configured`.
pub async fn harness(transport: Arc<ScriptedTransport>, configured: bool) -> Harness {
    let credentials = CredentialStore::new(Arc::new(MemoryStore::new()));
    if configured {
        credentials
            .save(&Config::new("sk-test", "https://api.example.com/v1"))
            .await
            .unwrap();
    }
    let factory = ScriptedFactory::new(transport.clone());
    let broker = Arc::new(RequestBroker::new(credentials.clone(), factory.clone()));
    Harness {
        broker,
        credentials,
        factory,
        transport,
    }
}

pub fn sink() -> (EventSink, mpsc::UnboundedReceiver<BrokerEvent>) {
    mpsc::unbounded_channel()
}

/// Drains everything already queued on `rx`.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> Vec<BrokerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn terminal_error(events: &[BrokerEvent], id: u64) -> Option<String> {
    events.iter().find_map(|event| match event {
        BrokerEvent::Response {
            id: event_id,
            outcome: Err(error),
        } if *event_id == id => Some(error.clone()),
        _ => None,
    })
}

pub fn terminal_count(events: &[BrokerEvent], id: u64) -> usize {
    events
        .iter()
        .filter(|event| event.is_terminal() && event.id() == id)
        .count()
}
