//! Header preparation and sanitization
//!
//! Two concerns share this module: injecting the platform trust headers that
//! carry caller identity to endpoints, and scrubbing credential-bearing
//! values before they enter logs or diagnostic payloads. Scrubbing covers
//! both header maps and request bodies, since some protocols carry the
//! access token inside the message body.

use serde_json::Value;
use std::collections::HashMap;

/// Trust header carrying the calling organization
pub const ORGANIZATION_HEADER: &str = "X-Organization-Id";
/// Trust header carrying the calling user
pub const USER_HEADER: &str = "X-User-Id";

/// Replacement for header values that must not leave the process
const REDACTED: &str = "***REDACTED***";

/// Header name fragments that mark a value as sensitive
const SENSITIVE_MARKERS: [&str; 8] = [
    "authorization",
    "auth",
    "api-key",
    "token",
    "bearer",
    "secret",
    "password",
    "cookie",
];

/// Builds and sanitizes invocation headers
#[derive(Debug, Clone, Default)]
pub struct HeaderManager;

impl HeaderManager {
    pub fn new() -> Self {
        Self
    }

    /// Add trust headers for the caller identity, without overriding values
    /// the endpoint configuration already set
    pub fn inject_trust_headers(
        &self,
        headers: &mut HashMap<String, String>,
        organization_id: Option<&str>,
        user_id: Option<&str>,
    ) {
        if let Some(org) = organization_id {
            if !contains_header(headers, ORGANIZATION_HEADER) {
                headers.insert(ORGANIZATION_HEADER.to_string(), org.to_string());
            }
        }
        if let Some(user) = user_id {
            if !contains_header(headers, USER_HEADER) {
                headers.insert(USER_HEADER.to_string(), user.to_string());
            }
        }
    }

    /// Copy of the headers with credential-bearing values masked
    ///
    /// The original map is left untouched; the copy is what goes into logs
    /// and error diagnostics.
    pub fn sanitize(&self, headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                if is_sensitive(name) {
                    (name.clone(), REDACTED.to_string())
                } else {
                    (name.clone(), value.clone())
                }
            })
            .collect()
    }

    /// Copy of a request body with values under credential-bearing keys masked
    pub fn sanitize_value(&self, body: &Value) -> Value {
        match body {
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| {
                        if is_sensitive(key) {
                            (key.clone(), Value::String(REDACTED.to_string()))
                        } else {
                            (key.clone(), self.sanitize_value(value))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.sanitize_value(item)).collect())
            }
            other => other.clone(),
        }
    }
}

/// Whether a header name marks a credential-bearing value
pub fn is_sensitive(name: &str) -> bool {
    let lowered = name.to_lowercase();
    SENSITIVE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Case-insensitive presence check
fn contains_header(headers: &HashMap<String, String>, name: &str) -> bool {
    headers.keys().any(|key| key.eq_ignore_ascii_case(name))
}
