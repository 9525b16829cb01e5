//! Tracing setup and in-memory log capture
//!
//! Hosts embed the engine, so it never prints by default. Log events are kept
//! in a bounded [`LogBuffer`] that a host can dump on request; stderr output is
//! added when the configuration (or `DIAGNOSTICS_LOG_LEVEL`) asks for it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Entries kept in memory before the oldest are dropped
const MAX_LOG_ENTRIES: usize = 1000;

/// Longest message kept per entry
const MAX_MESSAGE_LEN: usize = 4096;

/// One captured log event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Bounded ring buffer of recent log records
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogRecord>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: LogRecord) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(record);
            while entries.len() > MAX_LOG_ENTRIES {
                entries.pop_front();
            }
        }
    }

    /// The last `count` records, oldest first
    pub fn get_last(&self, count: usize) -> Vec<LogRecord> {
        // try_lock: a log event raised while the buffer is being read must not deadlock
        match self.entries.try_lock() {
            Ok(entries) => {
                let skip = entries.len().saturating_sub(count);
                entries.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.try_lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Tracing layer feeding a [`LogBuffer`]
pub struct MemoryLogLayer {
    buffer: LogBuffer,
}

impl MemoryLogLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S> Layer<S> for MemoryLogLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let mut message = if visitor.message.is_empty() {
            metadata.target().to_string()
        } else {
            visitor.message
        };
        if message.len() > MAX_MESSAGE_LEN {
            let mut cut = MAX_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
            message.push_str("... [truncated]");
        }

        self.buffer.push(LogRecord {
            timestamp: chrono::Utc::now()
                .format("%Y-%m-%d %H:%M:%S%.3f UTC")
                .to_string(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message,
        });
    }
}

/// Install the global subscriber. Returns the buffer capturing log events.
///
/// Installing twice is harmless: the second call keeps the existing
/// subscriber and returns a buffer that stays empty.
pub fn init_tracing(config: &LoggingConfig) -> LogBuffer {
    let buffer = LogBuffer::new();
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let forced_level = std::env::var("DIAGNOSTICS_LOG_LEVEL").ok();
    let stderr = config.stderr || forced_level.is_some();
    let filter = match forced_level {
        Some(level) => EnvFilter::try_new(&level).unwrap_or(filter),
        None => filter,
    };

    let subscriber = tracing_subscriber::registry()
        .with(MemoryLogLayer::new(buffer.clone()))
        .with(filter);

    if stderr {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);
        if tracing::subscriber::set_global_default(subscriber.with(fmt_layer)).is_ok() {
            tracing::info!("Tracing initialized with memory and stderr logging");
        }
    } else if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::info!("Tracing initialized with memory logging");
    }

    buffer
}
