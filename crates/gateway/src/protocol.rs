//! Session wire messages.
//!
//! JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "invoke", "name": "getbikebyid", "args": {"bike_id": "bike-123"}, "invocation_id": "1"}
//! {"type": "result", "invocation_id": "1", "payload": {"status": 200, "body": {}, "rawFallback": false}}
//! ```

use apigate_openapi_tools::{StructuredError, SuccessPayload};
use rmcp::model::Tool;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client -> gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    ListTools,
    Invoke {
        name: String,
        #[serde(default)]
        args: Value,
        invocation_id: String,
    },
    Cancel {
        invocation_id: String,
    },
}

impl Inbound {
    #[must_use]
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::ListTools => None,
            Self::Invoke { invocation_id, .. } | Self::Cancel { invocation_id } => {
                Some(invocation_id)
            }
        }
    }
}

/// Gateway -> client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    ToolList {
        namespace: String,
        tools: Vec<Tool>,
    },
    Result {
        invocation_id: String,
        payload: SuccessPayload,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invocation_id: Option<String>,
        #[serde(flatten)]
        error: StructuredError,
    },
}

impl Outbound {
    #[must_use]
    pub fn error(invocation_id: Option<&str>, error: StructuredError) -> Self {
        Self::Error {
            invocation_id: invocation_id.map(str::to_string),
            error,
        }
    }

    #[must_use]
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::ToolList { .. } => None,
            Self::Result { invocation_id, .. } => Some(invocation_id),
            Self::Error { invocation_id, .. } => invocation_id.as_deref(),
        }
    }
}
