//! Tool invocation: argument validation, request construction, upstream call.
//!
//! [`Dispatcher::invoke`] never fails with a Rust error; every outcome, including programmer
//! mistakes in the caller's arguments, comes back as an [`InvocationResult`].

use crate::config::DispatchConfig;
use crate::error::StructuredError;
use crate::registry::{BodyEncoding, FieldLocation, OutputSchema, ToolDescriptor, ToolRegistry};
use apigate_http_tools::body::{BodyError, decode_body, read_limited};
use apigate_http_tools::encoding::{
    QueryPair, build_url, encode_path_segment, serialize_query_param, value_to_string,
};
use apigate_http_tools::safety::{OutboundHttpSafety, redact_url, sanitize_reqwest_error};
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use url::Url;

pub type InvocationResult = Result<SuccessPayload, StructuredError>;

/// Upstream response headers worth handing back to the caller.
const FORWARDED_RESPONSE_HEADERS: [&str; 6] = [
    "cache-control",
    "content-length",
    "content-type",
    "etag",
    "last-modified",
    "location",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessPayload {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    /// True when `body` does not conform to the tool's declared output schema, or there is no
    /// declared schema.
    pub raw_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    config: DispatchConfig,
    safety: OutboundHttpSafety,
}

#[derive(Debug)]
enum PreparedBody {
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug)]
struct PreparedRequest {
    url: Url,
    headers: HeaderMap,
    body: Option<PreparedBody>,
}

enum AttemptFailure {
    /// Nothing usable came back; retry-safe methods may try again.
    Unreachable { message: String, timeout: bool },
    Fatal(StructuredError),
}

struct RawResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    bytes: Vec<u8>,
    content_type: Option<String>,
}

impl Dispatcher {
    /// Build a dispatcher with its own HTTP client configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: DispatchConfig) -> reqwest::Result<Self> {
        let safety = OutboundHttpSafety::from(&config.safety);
        let client = safety.build_client(config.connect_timeout())?;
        Ok(Self {
            client,
            config,
            safety,
        })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, config: DispatchConfig) -> Self {
        let safety = OutboundHttpSafety::from(&config.safety);
        Self {
            client,
            config,
            safety,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Invoke tool `name` from `registry` with `arguments`.
    ///
    /// `passthrough` headers (typically caller credentials) are sent after the registry's
    /// default headers and before header parameters, each layer overriding the previous one.
    pub async fn invoke(
        &self,
        registry: &ToolRegistry,
        name: &str,
        arguments: &Value,
        passthrough: &[(String, String)],
    ) -> InvocationResult {
        let Some(tool) = registry.lookup(name) else {
            return Err(StructuredError::unknown_tool(name, registry.suggest(name)));
        };

        let args = validate_arguments(tool, arguments)?;
        let request = prepare_request(registry, tool, &args, passthrough)?;

        self.safety
            .check_url(&request.url)
            .await
            .map_err(|e| StructuredError::internal(format!("outbound request blocked: {e}")))?;

        let max_attempts: u32 = if tool.semantics.retry_safe { 2 } else { 1 };
        let started = Instant::now();
        let mut attempt = 1;
        let raw = loop {
            match self.attempt(tool, &request).await {
                Ok(raw) => break raw,
                Err(AttemptFailure::Fatal(mut e)) => {
                    e.attempts = attempt;
                    return Err(e);
                }
                Err(AttemptFailure::Unreachable { message, timeout }) => {
                    if attempt < max_attempts {
                        tracing::warn!(
                            tool = %tool.name,
                            url = %redact_url(&request.url),
                            error = %message,
                            "upstream unreachable; retrying once"
                        );
                        attempt += 1;
                        tokio::time::sleep(self.config.retry_delay()).await;
                        continue;
                    }
                    tracing::warn!(
                        tool = %tool.name,
                        url = %redact_url(&request.url),
                        attempts = attempt,
                        timeout,
                        error = %message,
                        "upstream unreachable"
                    );
                    return Err(StructuredError::unreachable(message, timeout, attempt));
                }
            }
        };

        tracing::info!(
            namespace = %registry.namespace(),
            tool = %tool.name,
            method = %tool.method,
            url = %redact_url(&request.url),
            status = raw.status,
            attempts = attempt,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "upstream call finished"
        );

        let decoded = decode_body(&raw.bytes, raw.content_type.as_deref());
        if !(200..300).contains(&raw.status) {
            let body = (!decoded.value.is_null()).then_some(decoded.value);
            return Err(StructuredError::upstream(raw.status, body, attempt));
        }

        let conforms = match &tool.output {
            OutputSchema::Typed(node) => {
                decoded.json && node.validate(&decoded.value, "").is_empty()
            }
            OutputSchema::Opaque => false,
        };

        Ok(SuccessPayload {
            status: raw.status,
            headers: raw.headers,
            body: decoded.value,
            raw_fallback: !conforms,
        })
    }

    async fn attempt(
        &self,
        tool: &ToolDescriptor,
        request: &PreparedRequest,
    ) -> Result<RawResponse, AttemptFailure> {
        let mut builder = self
            .client
            .request(tool.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        builder = match &request.body {
            Some(PreparedBody::Json(v)) => builder.json(v),
            Some(PreparedBody::Form(pairs)) => builder.form(pairs),
            None => builder,
        };

        let exchange = async {
            let response = builder.send().await.map_err(|e| AttemptFailure::Unreachable {
                message: sanitize_reqwest_error(&e),
                timeout: e.is_timeout(),
            })?;

            let status = response.status().as_u16();
            let headers = forwarded_headers(response.headers());
            let content_type = headers.get("content-type").cloned();
            let bytes = read_limited(response, self.safety.max_response_bytes)
                .await
                .map_err(|e| match e {
                    BodyError::TooLarge { .. } => {
                        let mut err = StructuredError::upstream(status, None, 1);
                        err.message = format!("upstream returned HTTP {status}; {e}");
                        AttemptFailure::Fatal(err)
                    }
                    BodyError::Read(message) => AttemptFailure::Unreachable {
                        message,
                        timeout: false,
                    },
                })?;

            Ok(RawResponse {
                status,
                headers,
                bytes,
                content_type,
            })
        };

        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AttemptFailure::Unreachable {
                message: format!("no response within {}ms", timeout.as_millis()),
                timeout: true,
            }),
        }
    }
}

fn forwarded_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    FORWARDED_RESPONSE_HEADERS
        .iter()
        .filter_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?;
            Some(((*name).to_string(), value.to_string()))
        })
        .collect()
}

/// Check `arguments` against the tool's fields. Returns the non-null arguments.
fn validate_arguments(
    tool: &ToolDescriptor,
    arguments: &Value,
) -> Result<Map<String, Value>, StructuredError> {
    let empty = Map::new();
    let given = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => {
            return Err(StructuredError::invalid_arguments(
                Vec::new(),
                "arguments must be a JSON object",
            ));
        }
    };

    let mut missing = Vec::new();
    let mut invalid = Vec::new();
    let mut args = Map::new();

    for field in &tool.fields {
        match given.get(&field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    missing.push(field.name.clone());
                }
            }
            Some(v) => {
                invalid.extend(field.schema.validate(v, &field.name));
                args.insert(field.name.clone(), v.clone());
            }
        }
    }

    let unexpected: Vec<String> = given
        .keys()
        .filter(|k| tool.field(k).is_none())
        .cloned()
        .collect();

    if missing.is_empty() && invalid.is_empty() && unexpected.is_empty() {
        return Ok(args);
    }

    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing required: {}", missing.join(", ")));
    }
    if !invalid.is_empty() {
        parts.push(format!("does not match schema: {}", invalid.join(", ")));
    }
    for key in &unexpected {
        let known = tool.fields.iter().map(|f| f.name.as_str());
        match crate::registry::find_similar_strings(key, known).first() {
            Some(s) => parts.push(format!("unexpected '{key}' (did you mean '{s}'?)")),
            None => parts.push(format!("unexpected '{key}'")),
        }
    }

    let fields = missing.into_iter().chain(invalid).chain(unexpected).collect();
    Err(StructuredError::invalid_arguments(
        fields,
        format!("invalid arguments for '{}': {}", tool.name, parts.join("; ")),
    ))
}

fn prepare_request(
    registry: &ToolRegistry,
    tool: &ToolDescriptor,
    args: &Map<String, Value>,
    passthrough: &[(String, String)],
) -> Result<PreparedRequest, StructuredError> {
    let mut path = tool.path.clone();
    let mut query: Vec<QueryPair> = Vec::new();
    let mut headers = HeaderMap::new();
    let mut cookies: Vec<String> = Vec::new();
    let mut body_fields = Map::new();
    let mut body_payload: Option<Value> = None;

    for (name, value) in registry.default_headers().iter().chain(passthrough) {
        match header_pair(name, value) {
            Some((k, v)) => {
                headers.insert(k, v);
            }
            None => tracing::warn!(header = %name, "skipping invalid header"),
        }
    }

    for field in &tool.fields {
        let Some(value) = args.get(&field.name) else {
            continue;
        };
        match field.location {
            FieldLocation::Path => {
                let encoded = encode_path_segment(&value_to_string(value));
                path = path.replace(&format!("{{{}}}", field.source_name), &encoded);
            }
            FieldLocation::Query => {
                query.extend(serialize_query_param(
                    &field.source_name,
                    value,
                    field.required,
                    field.query,
                ));
            }
            FieldLocation::Header => {
                let Some((k, v)) = header_pair(&field.source_name, &value_to_string(value)) else {
                    return Err(StructuredError::invalid_arguments(
                        vec![field.name.clone()],
                        format!("'{}' is not a valid HTTP header value", field.name),
                    ));
                };
                headers.insert(k, v);
            }
            FieldLocation::Cookie => {
                cookies.push(format!("{}={}", field.source_name, value_to_string(value)));
            }
            FieldLocation::BodyField => {
                body_fields.insert(field.source_name.clone(), value.clone());
            }
            FieldLocation::Body => body_payload = Some(value.clone()),
        }
    }

    if !cookies.is_empty() {
        let value = HeaderValue::from_str(&cookies.join("; ")).map_err(|_| {
            StructuredError::invalid_arguments(Vec::new(), "cookie values are not valid")
        })?;
        headers.insert(COOKIE, value);
    }

    let payload =
        body_payload.or_else(|| (!body_fields.is_empty()).then_some(Value::Object(body_fields)));
    let body = match (tool.body_encoding, payload) {
        (_, None) | (None, Some(_)) => None,
        (Some(BodyEncoding::Form), Some(Value::Object(map))) => Some(PreparedBody::Form(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect(),
        )),
        (Some(_), Some(v)) => Some(PreparedBody::Json(v)),
    };

    let url = build_url(registry.base_url(), &path, &query).map_err(|e| {
        StructuredError::internal(format!(
            "invalid upstream URL for '{}': {e}",
            registry.namespace()
        ))
    })?;

    Ok(PreparedRequest { url, headers, body })
}

fn header_pair(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
    let value = HeaderValue::from_str(value).ok()?;
    Some((name, value))
}
