mod common;

use common::{
    Reply, ScriptedTransport, drain, eventually, harness, last_user_message, sink,
    terminal_count, terminal_error,
};
use reader_assistant::{AssistantError, BrokerEvent, Config, ContextId, InboundMessage};
use serde_json::json;

fn request(id: u64, method: &str, params: serde_json::Value) -> InboundMessage {
    InboundMessage::Request {
        id,
        method: method.to_string(),
        params,
    }
}

#[tokio::test]
async fn test_summarize_streams_chunks_before_single_response() {
    let transport = ScriptedTransport::new(|_| {
        Reply::Stream(vec![
            "Summary: Rust is fast\n".to_string(),
            "Key Points:\n- Safe\n".to_string(),
            "- Fast".to_string(),
        ])
    });
    let h = harness(transport, true).await;
    let (tx, mut rx) = sink();

    h.broker
        .process(
            ContextId::from("tab-1"),
            7,
            "summarize",
            json!({ "content": "page text", "stream": true, "targetLanguage": "en" }),
            tx,
        )
        .await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 4);
    assert_eq!(
        events[0],
        BrokerEvent::Chunk {
            id: 7,
            chunk: "Summary: Rust is fast\n".to_string()
        }
    );
    // Chunks are cumulative
    assert_eq!(
        events[2],
        BrokerEvent::Chunk {
            id: 7,
            chunk: "Summary: Rust is fast\nKey Points:\n- Safe\n- Fast".to_string()
        }
    );
    let BrokerEvent::Response { id, outcome: Ok(data) } = &events[3] else {
        panic!("expected a success response, got {:?}", events[3]);
    };
    assert_eq!(*id, 7);
    assert_eq!(data["summary"], "Rust is fast");
    assert_eq!(data["keyPoints"], json!(["Safe", "Fast"]));
    assert_eq!(terminal_count(&events, 7), 1);
    assert_eq!(h.broker.active_requests(), 0);
}

#[tokio::test]
async fn test_summarize_without_stream_emits_no_chunks() {
    let h = harness(ScriptedTransport::text("Summary: short"), true).await;
    let (tx, mut rx) = sink();

    h.broker
        .process(ContextId::from("tab-1"), 1, "summarize", json!({ "content": "x" }), tx)
        .await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(events[0].is_terminal());
    assert!(!h.transport.requests()[0].stream);
}

#[tokio::test]
async fn test_unknown_method_is_rejected_before_client_lookup() {
    let h = harness(ScriptedTransport::text("unused"), true).await;
    let (tx, mut rx) = sink();

    h.broker
        .process(ContextId::from("tab-1"), 3, "explode", json!({}), tx)
        .await;

    let events = drain(&mut rx);
    assert_eq!(terminal_error(&events, 3).as_deref(), Some("Unknown method: explode"));
    assert_eq!(events.len(), 1);
    assert_eq!(h.factory.builds(), 0);
    assert_eq!(h.transport.calls(), 0);
    assert_eq!(h.broker.active_requests(), 0);
}

#[tokio::test]
async fn test_unknown_method_wins_over_missing_credentials() {
    let h = harness(ScriptedTransport::text("unused"), false).await;
    let (tx, mut rx) = sink();

    h.broker
        .process(ContextId::from("tab-1"), 1, "nope", json!({}), tx)
        .await;

    assert_eq!(
        terminal_error(&drain(&mut rx), 1).as_deref(),
        Some("Unknown method: nope")
    );
}

#[tokio::test]
async fn test_invalid_params_are_rejected() {
    let h = harness(ScriptedTransport::text("unused"), true).await;
    let (tx, mut rx) = sink();

    h.broker
        .process(ContextId::from("tab-1"), 4, "translate", json!({ "content": 5 }), tx)
        .await;

    let error = terminal_error(&drain(&mut rx), 4).unwrap();
    assert!(error.starts_with("Invalid parameters for translate"), "{error}");
    assert_eq!(h.transport.calls(), 0);
}

#[tokio::test]
async fn test_missing_credentials_report_not_configured() {
    let h = harness(ScriptedTransport::text("unused"), false).await;
    let (tx, mut rx) = sink();

    h.broker
        .process(ContextId::from("tab-1"), 2, "translate", json!({ "content": "hi" }), tx)
        .await;

    assert_eq!(
        terminal_error(&drain(&mut rx), 2).as_deref(),
        Some("API key not configured")
    );
    assert!(!h.broker.has_client());
}

#[tokio::test]
async fn test_client_is_built_on_first_request() {
    let h = harness(ScriptedTransport::text("Bonjour"), false).await;
    assert!(!h.broker.has_client());

    // Credentials saved without a watcher are picked up lazily
    h.credentials
        .save(&Config::new("sk-late", ""))
        .await
        .unwrap();
    let (tx, mut rx) = sink();
    h.broker
        .process(
            ContextId::from("tab-1"),
            1,
            "translate",
            json!({ "content": "Hello", "targetLang": "fr" }),
            tx,
        )
        .await;

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![BrokerEvent::Response {
            id: 1,
            outcome: Ok(json!({ "translated": "Bonjour" }))
        }]
    );
    assert_eq!(h.factory.keys(), vec!["sk-late"]);
    assert!(h.broker.has_client());
}

#[tokio::test]
async fn test_remote_failure_becomes_error_response() {
    let transport = ScriptedTransport::new(|_| {
        Reply::Fail(AssistantError::RemoteError("Bad Gateway (status 502)".to_string()))
    });
    let h = harness(transport, true).await;
    let (tx, mut rx) = sink();

    h.broker
        .process(
            ContextId::from("tab-1"),
            9,
            "answerQuestion",
            json!({ "question": "why?", "content": "because" }),
            tx,
        )
        .await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(
        terminal_error(&events, 9).as_deref(),
        Some("API Error: Bad Gateway (status 502)")
    );
}

#[tokio::test]
async fn test_translate_lines_reports_progress_per_line() {
    let h = harness(ScriptedTransport::echo_or_hang(), true).await;
    let (tx, mut rx) = sink();

    h.broker
        .process(
            ContextId::from("tab-1"),
            5,
            "translateLines",
            json!({ "lines": ["First line", "ok", "Third line"], "targetLang": "de", "onProgress": true }),
            tx,
        )
        .await;

    let events = drain(&mut rx);
    let progress: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|event| match event {
            BrokerEvent::Progress { current, total, .. } => Some((*current, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);

    let BrokerEvent::Response { outcome: Ok(data), .. } = events.last().unwrap() else {
        panic!("expected a success response");
    };
    let lines: Vec<String> = serde_json::from_value(data.clone()).unwrap();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("echo:"));
    // Trivial lines are not sent
    assert_eq!(lines[1], "");
    assert_eq!(h.transport.calls(), 2);
}

#[tokio::test]
async fn test_cancel_by_id_leaves_other_requests_running() {
    let h = harness(ScriptedTransport::echo_or_hang(), true).await;
    let origin = ContextId::from("tab-1");
    let (tx, mut rx) = sink();

    let first = h
        .broker
        .handle(
            origin.clone(),
            request(1, "translate", json!({ "content": "HANG one" })),
            tx.clone(),
        )
        .unwrap();
    let second = h
        .broker
        .handle(
            origin.clone(),
            request(2, "translate", json!({ "content": "HANG two" })),
            tx.clone(),
        )
        .unwrap();
    eventually(|| h.broker.is_active(&origin, 1) && h.broker.is_active(&origin, 2)).await;

    assert!(h
        .broker
        .handle(origin.clone(), InboundMessage::Cancel { id: Some(1) }, tx.clone())
        .is_none());
    first.await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(terminal_error(&events, 1).as_deref(), Some("Request cancelled"));
    assert_eq!(terminal_count(&events, 1), 1);
    assert_eq!(terminal_count(&events, 2), 0);
    assert!(h.broker.is_active(&origin, 2));

    h.broker.cancel_request(&origin, 2);
    second.await.unwrap();
    assert_eq!(
        terminal_error(&drain(&mut rx), 2).as_deref(),
        Some("Request cancelled")
    );
    assert_eq!(h.broker.active_requests(), 0);
}

#[tokio::test]
async fn test_cancel_right_after_request_is_not_lost() {
    let h = harness(ScriptedTransport::text("Bonjour"), true).await;
    let origin = ContextId::from("tab-1");
    let (tx, mut rx) = sink();

    // No waiting between the two messages: the task has not run yet
    let task = h
        .broker
        .handle(
            origin.clone(),
            request(1, "translate", json!({ "content": "Hello" })),
            tx.clone(),
        )
        .unwrap();
    assert!(h.broker.is_active(&origin, 1));
    h.broker
        .handle(origin.clone(), InboundMessage::Cancel { id: Some(1) }, tx.clone());
    task.await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(terminal_error(&events, 1).as_deref(), Some("Request cancelled"));
    assert_eq!(h.transport.calls(), 0);
    assert_eq!(h.broker.active_requests(), 0);
}

#[tokio::test]
async fn test_cancel_all_right_after_request_is_not_lost() {
    let h = harness(ScriptedTransport::text("Bonjour"), false).await;
    let origin = ContextId::from("tab-1");
    let (tx, mut rx) = sink();

    let task = h
        .broker
        .handle(
            origin.clone(),
            request(1, "translate", json!({ "content": "Hello" })),
            tx.clone(),
        )
        .unwrap();
    h.broker
        .handle(origin.clone(), InboundMessage::Cancel { id: None }, tx.clone());
    task.await.unwrap();

    // Cancelled before the client lookup, so no credential error either
    assert_eq!(
        terminal_error(&drain(&mut rx), 1).as_deref(),
        Some("Request cancelled")
    );
    assert_eq!(h.factory.builds(), 0);
}

#[tokio::test]
async fn test_rejected_request_spawns_no_task() {
    let h = harness(ScriptedTransport::text("unused"), true).await;
    let (tx, mut rx) = sink();

    let task = h
        .broker
        .handle(ContextId::from("tab-1"), request(1, "explode", json!({})), tx);

    assert!(task.is_none());
    assert_eq!(
        terminal_error(&drain(&mut rx), 1).as_deref(),
        Some("Unknown method: explode")
    );
    assert_eq!(h.broker.active_requests(), 0);
}

#[tokio::test]
async fn test_cancel_all_settles_every_context() {
    let h = harness(ScriptedTransport::echo_or_hang(), true).await;
    let (tx_a, mut rx_a) = sink();
    let (tx_b, mut rx_b) = sink();
    let tab_a = ContextId::from("tab-a");
    let tab_b = ContextId::from("tab-b");

    let a = h
        .broker
        .handle(tab_a.clone(), request(1, "translate", json!({ "content": "HANG a" })), tx_a.clone())
        .unwrap();
    let b = h
        .broker
        .handle(tab_b.clone(), request(1, "translate", json!({ "content": "HANG b" })), tx_b.clone())
        .unwrap();
    eventually(|| h.broker.active_requests() == 2).await;

    h.broker
        .handle(tab_a.clone(), InboundMessage::Cancel { id: None }, tx_a);
    a.await.unwrap();
    b.await.unwrap();

    assert_eq!(terminal_error(&drain(&mut rx_a), 1).as_deref(), Some("Request cancelled"));
    assert_eq!(terminal_error(&drain(&mut rx_b), 1).as_deref(), Some("Request cancelled"));
    assert_eq!(h.broker.active_requests(), 0);
}

#[tokio::test]
async fn test_same_id_in_two_contexts_is_tracked_separately() {
    let h = harness(ScriptedTransport::echo_or_hang(), true).await;
    let (tx, _rx) = sink();
    let tab_a = ContextId::from("tab-a");
    let tab_b = ContextId::from("tab-b");

    let a = h
        .broker
        .handle(tab_a.clone(), request(1, "translate", json!({ "content": "HANG a" })), tx.clone())
        .unwrap();
    let b = h
        .broker
        .handle(tab_b.clone(), request(1, "translate", json!({ "content": "HANG b" })), tx.clone())
        .unwrap();
    eventually(|| h.broker.is_active(&tab_a, 1) && h.broker.is_active(&tab_b, 1)).await;

    assert!(h.broker.cancel_request(&tab_a, 1));
    a.await.unwrap();
    assert!(h.broker.is_active(&tab_b, 1));

    h.broker.cancel_all();
    b.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_id_is_rejected_while_first_runs() {
    let h = harness(ScriptedTransport::echo_or_hang(), true).await;
    let origin = ContextId::from("tab-1");
    let (tx, mut rx) = sink();

    let first = h
        .broker
        .handle(origin.clone(), request(1, "translate", json!({ "content": "HANG" })), tx.clone())
        .unwrap();
    eventually(|| h.broker.is_active(&origin, 1)).await;

    h.broker
        .process(origin.clone(), 1, "translate", json!({ "content": "again" }), tx.clone())
        .await;
    assert_eq!(
        terminal_error(&drain(&mut rx), 1).as_deref(),
        Some("Request 1 is already in flight")
    );
    // The original request keeps its registration
    assert!(h.broker.is_active(&origin, 1));

    h.broker.cancel_all();
    first.await.unwrap();
    assert_eq!(h.broker.active_requests(), 0);
}

#[tokio::test]
async fn test_cancel_of_unknown_request_is_a_no_op() {
    let h = harness(ScriptedTransport::echo_or_hang(), true).await;
    assert!(!h.broker.cancel_request(&ContextId::from("tab-1"), 42));
    assert_eq!(h.broker.cancel_all(), 0);
}

#[tokio::test]
async fn test_credential_changes_rebuild_the_client() {
    let h = harness(ScriptedTransport::text("ok"), false).await;
    let _watch = h.broker.watch_credentials();

    h.credentials
        .save(&Config::new("sk-first", ""))
        .await
        .unwrap();
    eventually(|| h.broker.has_client()).await;
    assert_eq!(h.factory.keys().last().map(String::as_str), Some("sk-first"));

    h.credentials
        .save(&Config::new("sk-second", "https://second.example.com/v1"))
        .await
        .unwrap();
    eventually(|| h.factory.keys().last().map(String::as_str) == Some("sk-second")).await;
    // A new key is never paired with the previous base URL
    assert!(
        h.factory
            .configs()
            .iter()
            .filter(|c| c.api_key == "sk-second")
            .all(|c| c.base_url == "https://second.example.com/v1")
    );

    h.credentials.clear().await.unwrap();
    eventually(|| !h.broker.has_client()).await;
}

#[tokio::test]
async fn test_answer_with_history_sends_prior_turns() {
    let transport = ScriptedTransport::new(|request| {
        Reply::Text(format!("Turns seen: {}", request.messages.len()))
    });
    let h = harness(transport, true).await;
    let (tx, mut rx) = sink();

    h.broker
        .process(
            ContextId::from("tab-1"),
            11,
            "answerWithHistory",
            json!({
                "question": "And then?",
                "content": "A story.",
                "history": [
                    { "role": "user", "content": "What happened?" },
                    { "role": "assistant", "content": "Things." }
                ]
            }),
            tx,
        )
        .await;

    let requests = h.transport.requests();
    assert!(last_user_message(&requests[0]).contains("And then?"));
    assert!(requests[0]
        .messages
        .iter()
        .any(|m| m.content == "What happened?"));

    let events = drain(&mut rx);
    let BrokerEvent::Response { outcome: Ok(data), .. } = &events[0] else {
        panic!("expected a success response");
    };
    assert!(data["answer"].as_str().unwrap().starts_with("Turns seen:"));
}
