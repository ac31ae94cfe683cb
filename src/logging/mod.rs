//! # Structured Logger
//!
//! Level-filtered structured records with context propagation and PII
//! redaction:
//!
//! - **Records**: timestamp, level, message, request/user/component context,
//!   optional duration, error, and metadata
//! - **Child loggers**: `child()` returns a logger whose context merges the
//!   parent's with an overlay
//! - **Redaction**: PII patterns in strings and sensitive field names are
//!   replaced before the record leaves the process (see [`redact`])
//! - **Output**: one JSON record per line in production/staging, colorized
//!   human-readable lines otherwise
//!
//! The logger never fails its caller: sink I/O errors are swallowed, and a
//! record that cannot be serialized is replaced by a best-effort fallback.

use std::fmt;
use std::io::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::{Clock, SystemClock};

pub mod redact;

pub use redact::{redact_str, redact_value, DEPTH_LIMIT, REDACTED};

// ============================================================================
// Levels and records
// ============================================================================

/// Severity levels, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Structured error payload attached to a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogError {
    /// Error type name.
    pub name: String,

    /// Error message.
    pub message: String,

    /// Backtrace or propagation chain, when captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl LogError {
    /// Capture a `std::error::Error` with its source chain as the stack.
    pub fn from_error(name: &str, err: &dyn std::error::Error) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            name: name.to_string(),
            message: err.to_string(),
            stack: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\n"))
            },
        }
    }
}

/// One emitted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Emission time.
    pub timestamp: DateTime<Utc>,

    /// Severity.
    pub level: LogLevel,

    /// Human-readable message.
    pub message: String,

    /// Request correlation id, when in a request scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Acting user, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Emitting component.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    /// Elapsed milliseconds, for timed operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Attached error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LogError>,

    /// Free-form structured metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Optional extras for a single log call.
#[derive(Debug, Default, Clone)]
pub struct LogOptions {
    /// Structured metadata to attach.
    pub metadata: Option<Value>,

    /// Error to attach.
    pub error: Option<LogError>,

    /// Duration to attach, in milliseconds.
    pub duration_ms: Option<u64>,
}

// ============================================================================
// Context and configuration
// ============================================================================

/// Context carried by a logger and merged by `child()`.
#[derive(Debug, Default, Clone)]
pub struct LogContext {
    /// Request correlation id.
    pub request_id: Option<String>,

    /// Acting user id.
    pub user_id: Option<String>,

    /// Component name.
    pub component: Option<String>,
}

impl LogContext {
    /// Context naming only a component.
    pub fn component(name: impl Into<String>) -> Self {
        Self {
            component: Some(name.into()),
            ..Self::default()
        }
    }

    /// Merge `overlay` over `self`: overlay fields win when present.
    fn merged_with(&self, overlay: &LogContext) -> LogContext {
        LogContext {
            request_id: overlay.request_id.clone().or_else(|| self.request_id.clone()),
            user_id: overlay.user_id.clone().or_else(|| self.user_id.clone()),
            component: overlay.component.clone().or_else(|| self.component.clone()),
        }
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON record per line. Production and staging.
    Json,
    /// Colorized human-readable lines. Development.
    Pretty,
}

/// Logger configuration.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Records below this level are dropped silently.
    pub level: LogLevel,

    /// Output format.
    pub format: LogFormat,

    /// Whether redaction is applied.
    pub redact: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            redact: true,
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Destination for formatted records. Implementations must not panic; write
/// failures are the sink's problem, never the caller's.
pub trait LogSink: Send + Sync {
    /// Write one formatted line.
    fn write_line(&self, line: &str);
}

/// Standard-output sink. I/O errors are swallowed.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{}", line);
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

// ============================================================================
// Logger
// ============================================================================

/// Structured logger with context propagation.
#[derive(Clone)]
pub struct Logger {
    config: Arc<LoggerConfig>,
    context: LogContext,
    sink: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
}

impl Logger {
    /// Create a root logger writing to stdout on the system clock.
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    /// Create a root logger with an injected sink.
    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            config: Arc::new(config),
            context: LogContext::default(),
            sink,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A logger whose context merges this one's with `overlay`.
    pub fn child(&self, overlay: LogContext) -> Logger {
        Logger {
            config: self.config.clone(),
            context: self.context.merged_with(&overlay),
            sink: self.sink.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Emit a record. Drops silently below the configured floor; never
    /// returns an error.
    pub fn log(&self, level: LogLevel, message: &str, opts: LogOptions) {
        if level < self.config.level {
            return;
        }

        let redacting = self.config.redact;
        let record = LogRecord {
            timestamp: self.clock.now(),
            level,
            message: if redacting {
                redact_str(message)
            } else {
                message.to_string()
            },
            request_id: self.context.request_id.clone(),
            user_id: self.context.user_id.clone(),
            component: self.context.component.clone(),
            duration_ms: opts.duration_ms,
            error: opts.error.map(|e| {
                if redacting {
                    LogError {
                        name: e.name,
                        message: redact_str(&e.message),
                        stack: e.stack,
                    }
                } else {
                    e
                }
            }),
            metadata: opts
                .metadata
                .map(|m| if redacting { redact_value(&m, 0) } else { m }),
        };

        let line = match self.config.format {
            LogFormat::Json => match serde_json::to_string(&record) {
                Ok(line) => line,
                Err(_) => self.fallback_line(&record),
            },
            LogFormat::Pretty => self.pretty_line(&record),
        };
        self.sink.write_line(&line);
    }

    /// Debug-level record.
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message, LogOptions::default());
    }

    /// Info-level record.
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, LogOptions::default());
    }

    /// Warn-level record.
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message, LogOptions::default());
    }

    /// Error-level record with an attached error.
    pub fn error(&self, message: &str, error: LogError) {
        self.log(
            LogLevel::Error,
            message,
            LogOptions {
                error: Some(error),
                ..LogOptions::default()
            },
        );
    }

    /// Info-level record with metadata.
    pub fn info_with(&self, message: &str, metadata: Value) {
        self.log(
            LogLevel::Info,
            message,
            LogOptions {
                metadata: Some(metadata),
                ..LogOptions::default()
            },
        );
    }

    /// Best-effort record when full serialization fails.
    fn fallback_line(&self, record: &LogRecord) -> String {
        format!(
            r#"{{"timestamp":"{}","level":"{}","message":{},"note":"record serialization failed"}}"#,
            record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            record.level,
            serde_json::to_string(&record.message).unwrap_or_else(|_| "\"?\"".to_string()),
        )
    }

    fn pretty_line(&self, record: &LogRecord) -> String {
        let color = match record.level {
            LogLevel::Debug => "\x1b[2m",
            LogLevel::Info => "\x1b[32m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Error | LogLevel::Fatal => "\x1b[31m",
        };
        let mut line = format!(
            "{} {}{:<5}\x1b[0m {}",
            record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            color,
            record.level.to_string().to_uppercase(),
            record.message,
        );
        if let Some(component) = &record.component {
            line.push_str(&format!(" \x1b[2mcomponent={}\x1b[0m", component));
        }
        if let Some(request_id) = &record.request_id {
            line.push_str(&format!(" \x1b[2mrequest={}\x1b[0m", request_id));
        }
        if let Some(duration) = record.duration_ms {
            line.push_str(&format!(" \x1b[2m{}ms\x1b[0m", duration));
        }
        if let Some(err) = &record.error {
            line.push_str(&format!(" error={}: {}", err.name, err.message));
        }
        if let Some(metadata) = &record.metadata {
            line.push_str(&format!(" {}", metadata));
        }
        line
    }
}
