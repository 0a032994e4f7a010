use std::sync::Arc;

use frida::{Message, ScriptHandler};
use serde_json::Value;
use tracing::info;

/// Receives every message emitted by every loaded script.
pub trait MessageSink: Send + Sync {
    fn emit(&self, script: &str, kind: &str, payload: &str);
}

pub fn format_message_line(kind: &str, payload: &str) -> String {
    format!("[{kind}] => {payload}")
}

/// Writes script messages to the operator log.
pub struct LogSink {
    trace_id: String,
}

impl LogSink {
    pub fn new(trace_id: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
        }
    }
}

impl MessageSink for LogSink {
    fn emit(&self, script: &str, kind: &str, payload: &str) {
        info!(trace_id = %self.trace_id, script = %script, "{}", format_message_line(kind, payload));
    }
}

/// Per-script frida handler forwarding into the shared sink.
pub struct ScriptMessages {
    script: String,
    sink: Arc<dyn MessageSink>,
}

impl ScriptMessages {
    pub fn new(script: &str, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            script: script.to_string(),
            sink,
        }
    }
}

impl ScriptHandler for ScriptMessages {
    fn on_message(&mut self, message: Message, _data: Option<Vec<u8>>) {
        let (kind, payload) = match message {
            Message::Send(msg) => ("send".to_string(), render(&msg.payload.returns)),
            Message::Log(log) => ("log".to_string(), log.payload),
            Message::Error(err) => (
                "error".to_string(),
                format!(
                    "{} at {}:{}:{}",
                    err.description, err.file_name, err.line_number, err.column_number
                ),
            ),
            Message::Other(value) => other_parts(&value),
        };
        self.sink.emit(&self.script, &kind, &payload);
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Plain `send()` messages do not fit frida's RPC reply shape and arrive as
/// `{"data": "<raw message json>", "error": ...}`; the raw message carries
/// `type` and `payload`. Anything unrecognized is shown whole.
fn other_parts(value: &Value) -> (String, String) {
    let raw = value
        .get("data")
        .and_then(Value::as_str)
        .and_then(|data| serde_json::from_str::<Value>(data).ok());
    let message = raw.as_ref().unwrap_or(value);
    let kind = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("message")
        .to_string();
    let payload = match message.get("payload") {
        Some(payload) => render(payload),
        None => message.to_string(),
    };
    (kind, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<String>>,
    }

    impl MessageSink for RecordingSink {
        fn emit(&self, script: &str, kind: &str, payload: &str) {
            self.lines
                .lock()
                .unwrap()
                .push(format!("{script}: {}", format_message_line(kind, payload)));
        }
    }

    #[test]
    fn formats_kind_and_payload() {
        assert_eq!(format_message_line("send", "{\"ok\":true}"), "[send] => {\"ok\":true}");
    }

    fn envelope(raw: Value) -> Value {
        json!({
            "error": "invalid type: string \"hello\", expected struct SendPayload",
            "data": raw.to_string(),
        })
    }

    #[test]
    fn plain_send_is_unwrapped_from_fallback_envelope() {
        let (kind, payload) = other_parts(&envelope(json!({"type": "send", "payload": "hello"})));
        assert_eq!((kind.as_str(), payload.as_str()), ("send", "hello"));

        let (kind, payload) =
            other_parts(&envelope(json!({"type": "send", "payload": {"event": "login"}})));
        assert_eq!(kind, "send");
        assert_eq!(payload, "{\"event\":\"login\"}");
    }

    #[test]
    fn handler_emits_operator_line_for_plain_send() {
        let sink = Arc::new(RecordingSink::default());
        let mut handler = ScriptMessages::new("_.js", sink.clone());
        handler.on_message(
            Message::Other(envelope(json!({"type": "send", "payload": "hello"}))),
            None,
        );
        assert_eq!(*sink.lines.lock().unwrap(), vec!["_.js: [send] => hello"]);
    }

    #[test]
    fn unparsable_data_is_shown_whole() {
        let value = json!({"data": "not json", "error": "bad"});
        let (kind, payload) = other_parts(&value);
        assert_eq!(kind, "message");
        assert_eq!(payload, value.to_string());
    }

    #[test]
    fn untyped_messages_are_shown_whole() {
        let (kind, payload) = other_parts(&json!([1, 2]));
        assert_eq!(kind, "message");
        assert_eq!(payload, "[1,2]");
    }

    #[test]
    fn sink_is_shared_across_scripts() {
        let sink = Arc::new(RecordingSink::default());
        let shared: Arc<dyn MessageSink> = sink.clone();
        shared.emit("_.js", "send", "a");
        shared.emit("vision.js", "log", "b");
        assert_eq!(
            *sink.lines.lock().unwrap(),
            vec!["_.js: [send] => a", "vision.js: [log] => b"]
        );
    }
}
