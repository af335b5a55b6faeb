//! HTTP method semantics (RFC 9110).
//!
//! Used for two things: the MCP `ToolAnnotations` advertised for every tool, and deciding
//! whether a failed upstream call may be retried.

use reqwest::Method;
use rmcp::model::ToolAnnotations;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSemantics {
    pub read_only: Option<bool>,
    pub destructive: Option<bool>,
    /// `None` when the method may or may not be idempotent (PATCH, extension methods).
    pub idempotent: Option<bool>,
    /// Whether a transport failure may be retried once without risking a duplicated effect.
    pub retry_safe: bool,
}

impl MethodSemantics {
    #[must_use]
    pub fn for_method(method: &Method) -> Self {
        let (read_only, destructive, idempotent) = match *method {
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE => {
                (Some(true), Some(false), Some(true))
            }
            Method::POST => (Some(false), Some(false), Some(false)),
            Method::PUT | Method::DELETE => (Some(false), Some(true), Some(true)),
            Method::PATCH => (Some(false), Some(true), None),
            _ => (None, None, None),
        };

        Self {
            read_only,
            destructive,
            idempotent,
            retry_safe: *method == Method::GET || *method == Method::HEAD,
        }
    }

    /// MCP annotations for an HTTP-backed tool. `openWorldHint` is always set: every tool talks
    /// to an external system.
    #[must_use]
    pub fn to_annotations(self, title: Option<String>) -> ToolAnnotations {
        ToolAnnotations {
            title,
            read_only_hint: self.read_only,
            destructive_hint: self.destructive,
            idempotent_hint: self.idempotent,
            open_world_hint: Some(true),
        }
    }
}
