//! # Error Taxonomy
//!
//! Component tags, the five-level severity scale and the error identifier
//! format `E-<COMPONENT>-<6 hex>-<unix seconds>`. Everything here is pure.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{Error, ErrorKind};

/// Subsystem tag used to classify errors and health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Component {
    Llm,
    Search,
    Store,
    Validation,
    RateLimit,
    State,
    Security,
    Api,
    Internal,
}

impl Component {
    /// Every component, in dashboard order
    pub const ALL: [Component; 9] = [
        Component::Llm,
        Component::Search,
        Component::Store,
        Component::Validation,
        Component::RateLimit,
        Component::State,
        Component::Security,
        Component::Api,
        Component::Internal,
    ];

    /// Tag used in error ids, logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Llm => "LLM",
            Component::Search => "SEARCH",
            Component::Store => "STORE",
            Component::Validation => "VALIDATION",
            Component::RateLimit => "RATE_LIMIT",
            Component::State => "STATE",
            Component::Security => "SECURITY",
            Component::Api => "API",
            Component::Internal => "INTERNAL",
        }
    }

    /// Lower-case name used in user-facing text
    pub fn display_name(&self) -> &'static str {
        match self {
            Component::Llm => "llm",
            Component::Search => "search",
            Component::Store => "store",
            Component::Validation => "validation",
            Component::RateLimit => "rate limit",
            Component::State => "state",
            Component::Security => "security",
            Component::Api => "api",
            Component::Internal => "internal",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a string names no known component
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown component: {0}")]
pub struct UnknownComponent(pub String);

impl FromStr for Component {
    type Err = UnknownComponent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "LLM" => Ok(Component::Llm),
            "SEARCH" => Ok(Component::Search),
            "STORE" | "REDIS" => Ok(Component::Store),
            "VALIDATION" | "PARAMETER" => Ok(Component::Validation),
            "RATE_LIMIT" | "RATELIMIT" => Ok(Component::RateLimit),
            "STATE" => Ok(Component::State),
            "SECURITY" => Ok(Component::Security),
            "API" => Ok(Component::Api),
            "INTERNAL" | "GENERAL" => Ok(Component::Internal),
            _ => Err(UnknownComponent(s.to_string())),
        }
    }
}

/// Ordered severity: DEBUG < INFO < WARNING < ERROR < CRITICAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Debug,
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Position in [`Severity::ALL`], used to index per-severity counters
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error onto the component and severity it is recorded under.
///
/// An explicit component on the error wins over the kind's default.
pub fn classify(error: &Error) -> (Component, Severity) {
    let (component, severity) = match error.kind {
        ErrorKind::Llm => (Component::Llm, Severity::Error),
        ErrorKind::Search => (Component::Search, Severity::Error),
        ErrorKind::Store => (Component::Store, Severity::Error),
        ErrorKind::Validation => (Component::Validation, Severity::Warning),
        ErrorKind::RateLimited => (Component::RateLimit, Severity::Warning),
        ErrorKind::Cancelled => (Component::Api, Severity::Warning),
        ErrorKind::State => (Component::State, Severity::Error),
        ErrorKind::Security => (Component::Security, Severity::Error),
        ErrorKind::Configuration | ErrorKind::Internal => (Component::Internal, Severity::Critical),
    };
    (error.component.unwrap_or(component), severity)
}

/// Random part of an id is exactly 24 bits
pub const ERROR_ID_RANDOM_BITS: u32 = 24;
const RANDOM_MASK: u32 = (1 << ERROR_ID_RANDOM_BITS) - 1;

/// Parsed form of `E-<COMPONENT>-<6 hex>-<unix seconds>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorId {
    pub component: Component,
    pub random: u32,
    pub timestamp: i64,
}

impl ErrorId {
    pub fn new(component: Component, random: u32, timestamp: i64) -> Self {
        Self {
            component,
            random: random & RANDOM_MASK,
            timestamp,
        }
    }

    /// Parses an id string; `None` if it does not follow the format
    pub fn parse(id: &str) -> Option<Self> {
        let rest = id.strip_prefix("E-")?;
        let mut parts = rest.rsplitn(3, '-');
        let timestamp = parts.next()?;
        let random = parts.next()?;
        let component = parts.next()?;

        if random.len() != 6 || !random.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        if timestamp.is_empty() || !timestamp.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        // Only canonical tags, no aliases
        let tag = component;
        let component = tag.parse::<Component>().ok()?;
        if component.as_str() != tag {
            return None;
        }

        Some(Self {
            component,
            random: u32::from_str_radix(random, 16).ok()?,
            timestamp: timestamp.parse().ok()?,
        })
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "E-{}-{:06X}-{}",
            self.component.as_str(),
            self.random & RANDOM_MASK,
            self.timestamp
        )
    }
}
