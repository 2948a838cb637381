use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;

static SILENT: AtomicBool = AtomicBool::new(false);

#[derive(Serialize)]
struct LogEvent<'a> {
    level: &'a str,
    event: &'a str,
    message: &'a str,
    timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

/// Mutes every log line; benches and noisy tests flip this on.
pub fn set_silent(silent: bool) {
    SILENT.store(silent, Ordering::Relaxed);
}

fn emit(level: &str, event: &str, message: &str, metadata: Option<Value>) {
    if SILENT.load(Ordering::Relaxed) {
        return;
    }

    let entry = LogEvent {
        level,
        event,
        message,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        metadata,
    };

    match serde_json::to_string(&entry) {
        Ok(payload) => {
            if level == "error" {
                eprintln!("{payload}");
            } else {
                println!("{payload}");
            }
        }
        Err(err) => eprintln!(
            "{{\"level\":\"error\",\"event\":\"logging_failure\",\"message\":\"failed to serialise log\",\"error\":\"{err}\"}}"
        ),
    }
}

pub fn info(event: &str, message: &str, metadata: Value) {
    emit("info", event, message, Some(metadata));
}

pub fn warn(event: &str, message: &str, metadata: Value) {
    emit("warn", event, message, Some(metadata));
}

pub fn error(event: &str, message: &str, metadata: Value) {
    emit("error", event, message, Some(metadata));
}

pub fn info_simple(event: &str, message: &str) {
    emit("info", event, message, None);
}
