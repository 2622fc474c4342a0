//! Operator-facing progress narration

use std::sync::Mutex;
use tracing::info;

/// One-way sink for progress messages
pub trait Notifier: Send + Sync {
    /// Emit a message; must not block
    fn notify(&self, message: &str);
}

/// Sends progress messages to `tracing` at INFO
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str) {
        info!(target: "ecs_host_replacer::progress", "{}", message);
    }
}

/// Keeps every message, for tests
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}
