//! # Error Sanitization
//!
//! Users only ever see a generic message plus the error id. Messages that
//! must be echoed (validation feedback) are scrubbed of credentials and
//! personal data first.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::taxonomy::Component;
use crate::tracker::ErrorRecord;

const REDACTED: &str = "[REDACTED]";

// (pattern, replacement) pairs applied in order
static SENSITIVE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        // API keys, tokens, credentials: keep the key name
        (
            r#"(?i)\b(api[_-]?key|access[_-]?token|token|secret|password|credential)s?(["']?\s*[=:]\s*["']?)[^"'\s,;]+"#,
            "${1}${2}[REDACTED]",
        ),
        // OAuth bearer tokens
        (r"(?i)\b(bearer)\s+[A-Za-z0-9._~+/=-]+", "${1} [REDACTED]"),
        // JWTs
        (r"eyJ[a-zA-Z0-9\-_]+\.eyJ[a-zA-Z0-9\-_]+\.[a-zA-Z0-9\-_]+", REDACTED),
        // Provider secret keys
        (r"\bsk-[A-Za-z0-9_-]{16,}", REDACTED),
        // Email addresses
        (r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}", REDACTED),
        // IP addresses
        (r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b", REDACTED),
        // Card numbers
        (r"\b(?:\d{4}[-\s]){3}\d{4}\b|\b\d{15,16}\b", REDACTED),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Removes credentials and personal data from a message
pub fn sanitize_message(message: &str) -> String {
    SENSITIVE_PATTERNS
        .iter()
        .fold(message.to_string(), |text, (pattern, replacement)| {
            pattern.replace_all(&text, *replacement).into_owned()
        })
}

/// Generic message naming only the component and the error id
pub fn user_message(component: Component, error_id: &str) -> String {
    format!(
        "An error occurred in the {} component. Error ID: {}",
        component.display_name(),
        error_id
    )
}

/// What a caller may show to the end user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFacingError {
    pub message: String,
    pub error_id: String,
}

impl UserFacingError {
    /// Generic message for a recorded failure
    pub fn from_record(record: &ErrorRecord) -> Self {
        Self {
            message: user_message(record.component, &record.id),
            error_id: record.id.clone(),
        }
    }

    /// Echoes a validation message back to the user, scrubbed
    pub fn validation(message: &str, error_id: &str) -> Self {
        Self {
            message: format!("{} (Error ID: {})", sanitize_message(message), error_id),
            error_id: error_id.to_string(),
        }
    }
}

impl std::fmt::Display for UserFacingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
