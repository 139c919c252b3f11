//! Pluggable event sink for node diagnostics.
//!
//! A node reports what it is doing through a [`Logger`] collaborator
//! injected at construction time. The default implementation,
//! [`TracingLogger`], forwards everything to the [`tracing`] ecosystem so
//! embedding applications get structured output for free; custom sinks
//! (files, ring buffers, test collectors) only need to implement the
//! single [`Logger::write`] method, which must be safe to call from any
//! task concurrently.

use std::fmt;

/// Severity of a logged event, ordered from most to least severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        f.write_str(name)
    }
}

/// Sink for node diagnostics. Implementations must be `Send + Sync`;
/// `write` is called concurrently from every node task.
pub trait Logger: Send + Sync {
    fn write(&self, level: LogLevel, message: &str);
}

/// Default sink that forwards to the `tracing` macros.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn write(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => tracing::error!(target: "overnet", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "overnet", "{message}"),
            LogLevel::Info => tracing::info!(target: "overnet", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "overnet", "{message}"),
        }
    }
}

/// A sink plus the maximum level the owning node wants to emit.
///
/// Filtering happens here, before the message string is formatted, so a
/// node configured at `Info` never pays for `Debug` formatting.
#[derive(Clone)]
pub(crate) struct NodeLogger {
    sink: std::sync::Arc<dyn Logger>,
    max_level: LogLevel,
}

impl NodeLogger {
    pub(crate) fn new(sink: std::sync::Arc<dyn Logger>, max_level: LogLevel) -> Self {
        Self { sink, max_level }
    }

    pub(crate) fn enabled(&self, level: LogLevel) -> bool {
        level <= self.max_level
    }

    pub(crate) fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            self.sink.write(level, &args.to_string());
        }
    }

    pub(crate) fn error(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, args);
    }

    pub(crate) fn warning(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Warning, args);
    }

    pub(crate) fn info(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Info, args);
    }

    pub(crate) fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Debug, args);
    }
}

impl fmt::Debug for NodeLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLogger")
            .field("max_level", &self.max_level)
            .finish()
    }
}
