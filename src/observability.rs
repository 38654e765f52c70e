//! Logging setup and process-local counters

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Directive string: dependencies at `base_level`, this crate at `crate_level`
pub fn filter_directives(config: &LoggingConfig) -> String {
    format!(
        "{},{}={}",
        config.base_level,
        env!("CARGO_CRATE_NAME"),
        config.crate_level
    )
}

/// Install the global fmt subscriber
///
/// `RUST_LOG` wins over the configured thresholds when set. Calling this twice
/// is harmless; the second call leaves the first subscriber in place.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Counters for one process; each role increments the ones it owns
#[derive(Debug, Default)]
pub struct Metrics {
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_acked: AtomicU64,
    pages_written: AtomicU64,
    pages_skipped: AtomicU64,
    poison_messages: AtomicU64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(counter = stringify!($field), "Metric incremented");
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(message_published, messages_published);
    counter!(message_delivered, messages_delivered);
    counter!(message_acked, messages_acked);
    counter!(page_written, pages_written);
    counter!(page_skipped, pages_skipped);
    counter!(poison_message, poison_messages);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            pages_skipped: self.pages_skipped.load(Ordering::Relaxed),
            poison_messages: self.poison_messages.load(Ordering::Relaxed),
        }
    }

    /// Log all counters once, typically at shutdown
    pub fn log_summary(&self, role: &str) {
        let s = self.snapshot();
        tracing::info!(
            role,
            published = s.messages_published,
            delivered = s.messages_delivered,
            acked = s.messages_acked,
            written = s.pages_written,
            skipped = s.pages_skipped,
            poison = s.poison_messages,
            "Counters"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_acked: u64,
    pub pages_written: u64,
    pub pages_skipped: u64,
    pub poison_messages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let config = LoggingConfig {
            base_level: "error".to_string(),
            crate_level: "info".to_string(),
        };
        assert_eq!(filter_directives(&config), "error,spiderq=info");
    }

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.page_written();
        metrics.page_written();
        metrics.poison_message();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pages_written, 2);
        assert_eq!(snapshot.poison_messages, 1);
        assert_eq!(snapshot.pages_skipped, 0);
    }
}
