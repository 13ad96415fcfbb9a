//! Structured logging setup and the metrics counters the dispatcher reports.
//!
//! Logging goes through `tracing`; [`init_logging`] installs a
//! `tracing-subscriber` registry with an `EnvFilter` and the selected
//! formatter. Metrics are plain atomic counters exposed through
//! [`MetricsSnapshot`] so hosts and tests can assert on them.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level module [fields] message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// # Example
///
/// ```rust,no_run
/// # use durable_coroutines::runtime::{ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
/// };
/// durable_coroutines::runtime::init_logging(&config).ok();
/// ```
///
/// # Correlation Fields
///
/// Dispatcher logs carry:
/// - `workflow_type` - Workflow type name
/// - `coroutine_id` - Spawn sequence number of the coroutine
/// - `coroutine` - Coroutine name
/// - `channel` - Channel name (channel events)
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Log output format
    pub log_format: LogFormat,
    /// Log level filter (e.g., "info", "debug")
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,durable_coroutines={level}")
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Fails when a global subscriber is already set.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|e| format!("Failed to initialize JSON logging: {}", e))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .map_err(|e| format!("Failed to initialize pretty logging: {}", e))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()
                .map_err(|e| format!("Failed to initialize compact logging: {}", e))?;
        }
    }

    Ok(())
}

/// Snapshot of key observability metrics counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub corrupted_signals: u64,
    pub coroutines_spawned: u64,
    pub coroutine_panics: u64,
    pub stale_coroutines_reaped: u64,
    pub workflow_completions: u64,
    pub workflow_failures: u64,
}

/// Counters shared by every dispatcher built with the same provider.
#[derive(Debug, Default)]
pub struct MetricsProvider {
    corrupted_signals_atomic: AtomicU64,
    coroutines_spawned_atomic: AtomicU64,
    coroutine_panics_atomic: AtomicU64,
    stale_coroutines_reaped_atomic: AtomicU64,
    workflow_completions_atomic: AtomicU64,
    workflow_failures_atomic: AtomicU64,
}

impl MetricsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A payload that did not decode to the channel's element type was dropped.
    #[inline]
    pub fn record_corrupted_signal(&self) {
        self.corrupted_signals_atomic.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_coroutine_spawned(&self) {
        self.coroutines_spawned_atomic.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_coroutine_panic(&self) {
        self.coroutine_panics_atomic.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_coroutine_reaped(&self) {
        self.stale_coroutines_reaped_atomic.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_workflow_completion(&self) {
        self.workflow_completions_atomic.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_workflow_failure(&self) {
        self.workflow_failures_atomic.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            corrupted_signals: self.corrupted_signals_atomic.load(Ordering::Relaxed),
            coroutines_spawned: self.coroutines_spawned_atomic.load(Ordering::Relaxed),
            coroutine_panics: self.coroutine_panics_atomic.load(Ordering::Relaxed),
            stale_coroutines_reaped: self.stale_coroutines_reaped_atomic.load(Ordering::Relaxed),
            workflow_completions: self.workflow_completions_atomic.load(Ordering::Relaxed),
            workflow_failures: self.workflow_failures_atomic.load(Ordering::Relaxed),
        }
    }
}
