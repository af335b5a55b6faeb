//! Error types for `apigate-openapi-tools`.
//!
//! Mount-time failures ([`LoadError`], [`TranslationError`]) are fatal to one mount. Invocation
//! failures are values ([`StructuredError`]) scoped to one invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The document could not be reached (missing file, 404, connection failure).
    #[error("spec not found at '{locator}': {message}")]
    NotFound { locator: String, message: String },

    /// The text is not valid YAML/JSON.
    #[error("failed to parse spec from '{locator}': {message}")]
    ParseFailure { locator: String, message: String },

    /// Parsed, but not a well-formed `OpenAPI` 3.x document.
    #[error("invalid OpenAPI document '{locator}': {message}")]
    SchemaInvalid { locator: String, message: String },
}

impl LoadError {
    pub(crate) fn not_found(locator: &str, message: impl Into<String>) -> Self {
        Self::NotFound {
            locator: locator.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn parse_failure(locator: &str, message: impl Into<String>) -> Self {
        Self::ParseFailure {
            locator: locator.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn schema_invalid(locator: &str, message: impl Into<String>) -> Self {
        Self::SchemaInvalid {
            locator: locator.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslationError {
    #[error("duplicate tool name '{name}': produced by both {first} and {second}")]
    DuplicateToolName {
        name: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTool,
    InvalidArguments,
    UpstreamUnreachable,
    UpstreamError,
    Timeout,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::InvalidArguments => "invalid_arguments",
            Self::UpstreamUnreachable => "upstream_unreachable",
            Self::UpstreamError => "upstream_error",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single tool invocation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct StructuredError {
    pub kind: ErrorKind,
    pub message: String,
    /// Upstream HTTP status for `UpstreamError`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Upstream response body for `UpstreamError`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Whether the request timed out. Always present for `UpstreamUnreachable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
    /// Offending argument names for `InvalidArguments`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    /// Registered tool names close to the requested one, for `UnknownTool`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    /// Upstream attempts made before giving up.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl StructuredError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            body: None,
            timeout: None,
            fields: Vec::new(),
            suggestions: Vec::new(),
            attempts: 0,
        }
    }

    #[must_use]
    pub fn unknown_tool(name: &str, suggestions: Vec<String>) -> Self {
        let message = match suggestions.first() {
            Some(s) => format!("unknown tool '{name}' (did you mean '{s}'?)"),
            None => format!("unknown tool '{name}'"),
        };
        Self {
            suggestions,
            ..Self::new(ErrorKind::UnknownTool, message)
        }
    }

    #[must_use]
    pub fn invalid_arguments(fields: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            fields,
            ..Self::new(ErrorKind::InvalidArguments, message)
        }
    }

    #[must_use]
    pub fn unreachable(message: impl Into<String>, timeout: bool, attempts: u32) -> Self {
        Self {
            timeout: Some(timeout),
            attempts,
            ..Self::new(ErrorKind::UpstreamUnreachable, message)
        }
    }

    #[must_use]
    pub fn upstream(status: u16, body: Option<Value>, attempts: u32) -> Self {
        Self {
            status: Some(status),
            body,
            attempts,
            ..Self::new(
                ErrorKind::UpstreamError,
                format!("upstream returned HTTP {status}"),
            )
        }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_error_serializes_only_relevant_fields() {
        let e = StructuredError::unreachable("connection refused", false, 1);
        let v = serde_json::to_value(&e).expect("serialize");
        assert_eq!(
            v,
            json!({
                "kind": "upstream_unreachable",
                "message": "connection refused",
                "timeout": false,
                "attempts": 1
            })
        );

        let e = StructuredError::upstream(404, Some(json!({"error": "nope"})), 1);
        let v = serde_json::to_value(&e).expect("serialize");
        assert_eq!(v["status"], json!(404));
        assert_eq!(v["body"], json!({"error": "nope"}));
        assert!(v.get("timeout").is_none());
    }

    #[test]
    fn unknown_tool_mentions_closest_match() {
        let e = StructuredError::unknown_tool("getbike", vec!["getbikebyid".to_string()]);
        assert_eq!(e.kind, ErrorKind::UnknownTool);
        assert!(e.message.contains("did you mean 'getbikebyid'"));
        assert_eq!(e.suggestions, ["getbikebyid"]);
        assert!(e.fields.is_empty());
        let v = serde_json::to_value(&e).expect("serialize");
        assert_eq!(v["suggestions"], json!(["getbikebyid"]));
        assert!(v.get("fields").is_none());
        assert_eq!(e.to_string(), format!("unknown_tool: {}", e.message));
    }
}
