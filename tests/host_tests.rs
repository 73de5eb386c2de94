use serde_json::Value;
use std::io::Write;
use std::process::{Command, Stdio};

fn run_host(input: &str) -> Vec<Value> {
    let mut child = Command::new(env!("CARGO_BIN_EXE_reader-assistant-host"))
        .env_remove("READER_API_KEY")
        .env_remove("READER_BASE_URL")
        .env_remove("READER_STORAGE_PATH")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());

    String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn event<'a>(events: &'a [Value], event_type: &str) -> &'a Value {
    events
        .iter()
        .find(|e| e["type"] == event_type)
        .unwrap_or_else(|| panic!("no {event_type} event in {events:?}"))
}

#[test]
fn test_host_answers_each_request_on_stdout() {
    let input = concat!(
        r#"{"type":"ai-request","id":1,"method":"explode","params":{}}"#,
        "\n",
        "not json\n",
        r#"{"type":"ai-request","id":2,"method":"translate","params":{"content":"Hi"},"context":"tab-9"}"#,
        "\n",
    );

    let events = run_host(input);

    // Malformed lines are skipped
    assert_eq!(events.len(), 2);

    let unknown = event(&events, "ai-response-1");
    assert_eq!(unknown["error"], "Unknown method: explode");
    assert_eq!(unknown["context"], "stdio");

    let unconfigured = event(&events, "ai-response-2");
    assert_eq!(unconfigured["error"], "API key not configured");
    assert_eq!(unconfigured["context"], "tab-9");
}

#[test]
fn test_host_exits_cleanly_on_empty_input() {
    assert!(run_host("").is_empty());
}
