use crate::types::StreamEvent;
use std::panic;
use tracing::{error, info};

/// Sets up a global panic hook that logs panics through tracing before the
/// default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-turn stream accounting, logged once when the turn reaches a terminal
/// state.
#[derive(Default)]
pub struct TurnMetric {
    pub events: usize,
    pub text_chars: usize,
    pub thought_chars: usize,
    pub files: usize,
    pub errors: usize,
}

impl TurnMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &StreamEvent) {
        self.events += 1;
        match event {
            StreamEvent::Content { delta, .. } => self.text_chars += delta.len(),
            StreamEvent::Thinking { delta, .. } => self.thought_chars += delta.len(),
            StreamEvent::File { .. } => self.files += 1,
            StreamEvent::Complete { attachments, .. } => self.files += attachments.len(),
            StreamEvent::Error { .. } => self.errors += 1,
        }
    }

    pub fn log_summary(&self, latency: std::time::Duration) {
        info!(
            target: "turn_metrics",
            "[TURN END] Latency: {:?} | Events: {} | Text: {} chars | Thought: {} chars | Files: {} | Errors: {}",
            latency,
            self.events,
            self.text_chars,
            self.thought_chars,
            self.files,
            self.errors
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_metric_accounting() {
        let mut metric = TurnMetric::new();
        metric.record(&StreamEvent::Content {
            delta: "Hello".into(),
            conversation_id: None,
        });
        metric.record(&StreamEvent::Thinking {
            delta: "hm".into(),
            conversation_id: None,
        });
        metric.record(&StreamEvent::Complete {
            text: "Hello".into(),
            attachments: vec![],
            conversation_id: None,
        });

        assert_eq!(metric.events, 3);
        assert_eq!(metric.text_chars, 5);
        assert_eq!(metric.thought_chars, 2);
        assert_eq!(metric.files, 0);
        assert_eq!(metric.errors, 0);
    }
}
