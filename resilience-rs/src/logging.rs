//! # Structured Logging
//!
//! Subscriber setup for processes embedding the layer, and the severity to
//! level mapping used whenever an error record is written to the log.

use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::taxonomy::Severity;
use crate::tracker::ErrorRecord;
use crate::types::{Error, ErrorKind, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Flushes the file writer when the process exits
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to output logs to a file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to include file and line of the call site
    pub include_source_code: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "travel-agent".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
            include_source_code: false,
        }
    }
}

/// Initializes the structured logging system; later calls are no-ops
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,h2=warn", config.level)));

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let text_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().json().with_writer(writer).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(Error::new(
            ErrorKind::Configuration,
            format!("Failed to set global subscriber: {}", e),
        ));
    }

    info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Logs an error record at the level matching its severity
pub fn log_record(record: &ErrorRecord) {
    let details = record.details.join(" | ");

    match record.severity {
        Severity::Critical => {
            error!(
                error_id = %record.id,
                component = %record.component,
                severity = %record.severity,
                details = %details,
                "{}",
                record.message
            );
        }
        Severity::Error => {
            error!(
                error_id = %record.id,
                component = %record.component,
                details = %details,
                "{}",
                record.message
            );
        }
        Severity::Warning => {
            warn!(
                error_id = %record.id,
                component = %record.component,
                "{}",
                record.message
            );
        }
        Severity::Info => {
            info!(error_id = %record.id, component = %record.component, "{}", record.message);
        }
        Severity::Debug => {
            debug!(error_id = %record.id, component = %record.component, "{}", record.message);
        }
    }
}
