//! Response body reading and decoding.

use crate::safety::sanitize_reqwest_error;
use base64::Engine as _;
use mime::Mime;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error("response too large: exceeded {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read response body: {0}")]
    Read(String),
}

/// Read a response body, failing as soon as it exceeds `max_bytes`.
///
/// # Errors
///
/// Returns [`BodyError::TooLarge`] when the declared or streamed length exceeds the limit, and
/// [`BodyError::Read`] when the body stream fails.
pub async fn read_limited(
    mut response: reqwest::Response,
    max_bytes: Option<usize>,
) -> Result<Vec<u8>, BodyError> {
    let Some(max) = max_bytes else {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BodyError::Read(sanitize_reqwest_error(&e)))?;
        return Ok(bytes.to_vec());
    };

    if let Some(len) = response.content_length()
        && len > max as u64
    {
        return Err(BodyError::TooLarge { limit: max });
    }

    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| BodyError::Read(sanitize_reqwest_error(&e)))?
    {
        if out.len().saturating_add(chunk.len()) > max {
            return Err(BodyError::TooLarge { limit: max });
        }
        out.extend_from_slice(&chunk);
    }

    Ok(out)
}

/// `application/json`, `application/problem+json`, `text/json` and friends.
#[must_use]
pub fn is_json_content_type(content_type: &str) -> bool {
    let Ok(m) = content_type.parse::<Mime>() else {
        return false;
    };
    m.subtype() == mime::JSON || m.suffix() == Some(mime::JSON)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBody {
    pub value: Value,
    /// True when the bytes parsed as JSON.
    pub json: bool,
}

/// Decode a body as JSON when possible, else UTF-8 text, else a base64 envelope.
#[must_use]
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> DecodedBody {
    if bytes.is_empty() {
        return DecodedBody {
            value: Value::Null,
            json: false,
        };
    }

    if let Ok(v) = serde_json::from_slice::<Value>(bytes) {
        return DecodedBody {
            value: v,
            json: true,
        };
    }

    let value = match std::str::from_utf8(bytes) {
        Ok(s) => Value::String(s.to_string()),
        Err(_) => json!({
            "encoding": "base64",
            "mimeType": content_type,
            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        }),
    };
    DecodedBody { value, json: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_media_types_are_recognized() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("application/json; charset=utf-8"));
        assert!(is_json_content_type("application/problem+json"));
        assert!(!is_json_content_type("text/plain"));
        assert!(!is_json_content_type("not a mime"));
    }

    #[test]
    fn decode_prefers_json_then_text_then_base64() {
        let d = decode_body(br#"{"id":"bike-123"}"#, Some("application/json"));
        assert!(d.json);
        assert_eq!(d.value, json!({"id": "bike-123"}));

        let d = decode_body(b"pong", Some("text/plain"));
        assert!(!d.json);
        assert_eq!(d.value, json!("pong"));

        let d = decode_body(&[0xff, 0xfe], Some("application/octet-stream"));
        assert_eq!(d.value["encoding"], json!("base64"));
        assert_eq!(d.value["mimeType"], json!("application/octet-stream"));
    }

    #[test]
    fn empty_body_decodes_to_null() {
        let d = decode_body(b"", None);
        assert_eq!(d.value, Value::Null);
        assert!(!d.json);
    }

    #[tokio::test]
    async fn read_limited_rejects_oversized_bodies() {
        use axum::{Router, routing::get};
        use tokio::net::TcpListener;

        let app = Router::new().route("/big", get(|| async { "x".repeat(64) }));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let handle = tokio::spawn(async move { server.await });

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{addr}/big"))
            .send()
            .await
            .expect("send");
        let err = read_limited(resp, Some(16)).await.unwrap_err();
        assert_eq!(err, BodyError::TooLarge { limit: 16 });

        let resp = client
            .get(format!("http://{addr}/big"))
            .send()
            .await
            .expect("send");
        let ok = read_limited(resp, Some(1024)).await.expect("read");
        assert_eq!(ok.len(), 64);

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }
}
