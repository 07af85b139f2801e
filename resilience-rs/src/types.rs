//! # Standardized Error Types
//!
//! The error type shared by the resilience layer and by the business
//! operations it wraps. Upstream clients convert their failures into an
//! [`Error`] of the matching [`ErrorKind`] so that classification, retry
//! decisions and user-facing messages never depend on upstream error types.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::taxonomy::Component;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Closed set of failure categories understood by the layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// LLM provider call failed
    Llm,
    /// Flight/hotel search provider call failed
    Search,
    /// Shared counter/session store failed
    Store,
    /// User input did not validate
    Validation,
    /// A rate limit rejected the request
    RateLimited,
    /// The enclosing request was cancelled or ran out of time
    Cancelled,
    /// Conversation state could not be read or written
    State,
    /// Security check failed
    Security,
    /// Invalid or missing configuration
    Configuration,
    /// Unexpected or unhandled failure
    Internal,
}

impl ErrorKind {
    /// Upstream calls fail transiently; everything else is permanent unless
    /// the caller says otherwise.
    pub fn is_transient_by_default(&self) -> bool {
        matches!(self, ErrorKind::Llm | ErrorKind::Search | ErrorKind::Store)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Llm => write!(f, "LLM Error"),
            ErrorKind::Search => write!(f, "Search Error"),
            ErrorKind::Store => write!(f, "Store Error"),
            ErrorKind::Validation => write!(f, "Validation Error"),
            ErrorKind::RateLimited => write!(f, "Rate Limit Error"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::State => write!(f, "State Error"),
            ErrorKind::Security => write!(f, "Security Error"),
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

/// Core error type for the travel agent resilience layer
///
/// `Clone` is implemented manually: clones drop the opaque `cause`, which
/// is only meaningful where the error was created.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Detailed error message (operator audience)
    pub message: String,
    /// Component override; `classify` derives one from `kind` otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<Component>,
    /// Context lines for the dashboard
    #[serde(default)]
    pub details: Vec<String>,
    /// Whether the operation might succeed if retried
    pub transient: bool,
    /// Tracker id once the error has been recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
    /// Chain of causes (not serialized)
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            component: self.component,
            details: self.details.clone(),
            transient: self.transient,
            error_id: self.error_id.clone(),
            cause: None,
        }
    }
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            component: None,
            details: Vec::new(),
            transient: kind.is_transient_by_default(),
            error_id: None,
            cause: None,
        }
    }

    pub fn llm<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Llm, message)
    }

    pub fn search<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Search, message)
    }

    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Store, message)
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attributes the error to a specific component
    pub fn component(mut self, component: Component) -> Self {
        self.component = Some(component);
        self
    }

    /// Appends one context line
    pub fn detail<S: Into<String>>(mut self, line: S) -> Self {
        self.details.push(line.into());
        self
    }

    /// Appends several context lines
    pub fn details<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.details.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Marks this error as transient (can be retried)
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Marks this error as permanent (never retried)
    pub fn permanent(mut self) -> Self {
        self.transient = false;
        self
    }

    /// Attaches the tracker id the error was recorded under
    pub fn with_error_id<S: Into<String>>(mut self, error_id: S) -> Self {
        self.error_id = Some(error_id.into());
        self
    }

    /// Returns true if this error is transient and might succeed on retry
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Message plus the cause chain, one entry per line
    pub fn chain(&self) -> Vec<String> {
        let mut lines = vec![self.message.clone()];
        let mut source = self.source();
        while let Some(err) = source {
            lines.push(format!("caused by: {}", err));
            source = err.source();
        }
        lines
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;

        if let Some(component) = &self.component {
            write!(f, " [Component: {}]", component)?;
        }

        if let Some(error_id) = &self.error_id {
            write!(f, " (Error ID: {})", error_id)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Internal, format!("I/O error: {}", err)).cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Internal, format!("JSON error: {}", err)).cause(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, format!("Configuration error: {}", err)).cause(err)
    }
}
