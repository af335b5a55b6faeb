//! Spec loading: fetch, parse, structural validation, `$ref` resolution.
//!
//! Local files are read once. Remote documents get exactly one retry on a transient failure
//! (connect error, timeout, 5xx); anything else fails immediately. There are no partial loads:
//! any failure fails the whole document.

use crate::config::{HashPolicy, SpecSource};
use crate::document::OpenApiDocument;
use crate::error::LoadError;
use crate::resolver::{DocId, RefResolver};
use apigate_http_tools::body::{BodyError, read_limited};
use apigate_http_tools::safety::{OutboundHttpSafety, redact_url, sanitize_reqwest_error};
use openapiv3::OpenAPI;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use std::time::Duration;
use url::Url;

const HTTP_METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// A loaded document plus what the mount layer needs to know about where it came from.
#[derive(Debug, Clone)]
pub struct LoadedSpec {
    pub document: OpenApiDocument,
    /// `sha256:<hex>` of the raw root document text.
    pub hash: String,
    /// First server URL, made absolute against the spec URL when it was relative.
    pub base_url: Option<String>,
}

#[derive(Debug)]
enum FetchFailure {
    Transient(String),
    Permanent(String),
}

#[derive(Debug, Clone)]
pub struct SpecLoader {
    client: reqwest::Client,
    safety: OutboundHttpSafety,
    fetch_timeout: Duration,
    retry_delay: Duration,
}

impl SpecLoader {
    #[must_use]
    pub fn new(client: reqwest::Client, safety: OutboundHttpSafety) -> Self {
        Self {
            client,
            safety,
            fetch_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(250),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, fetch_timeout: Duration, retry_delay: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self.retry_delay = retry_delay;
        self
    }

    /// Load a document from a file path, `file://` URL or `http(s)://` URL.
    ///
    /// # Errors
    ///
    /// - [`LoadError::NotFound`] if the document cannot be reached
    /// - [`LoadError::ParseFailure`] if it is not valid YAML/JSON
    /// - [`LoadError::SchemaInvalid`] if it is not a well-formed `OpenAPI` 3.x document or a
    ///   `$ref` cannot be resolved
    pub async fn load(&self, locator: &str) -> Result<OpenApiDocument, LoadError> {
        Ok(self.load_source(&SpecSource::new(locator)).await?.document)
    }

    /// Like [`SpecLoader::load`], plus hash verification and base URL inference.
    ///
    /// # Errors
    ///
    /// See [`SpecLoader::load`]. A hash mismatch under [`HashPolicy::Fail`] is
    /// [`LoadError::SchemaInvalid`].
    pub async fn load_source(&self, source: &SpecSource) -> Result<LoadedSpec, LoadError> {
        let locator = source.spec.as_str();
        let root = DocId::parse(locator).map_err(|e| LoadError::not_found(locator, e.to_string()))?;

        tracing::info!(spec = %display_locator(&root), "loading OpenAPI spec");
        let text = self.read_document(locator, &root).await?;

        let hash = format!("sha256:{}", hex::encode(Sha256::digest(text.as_bytes())));
        verify_hash(locator, source, &hash)?;

        let value = parse_text(locator, &text)?;
        check_structure(locator, &value)?;

        let spec: OpenAPI = serde_json::from_value(value.clone())
            .map_err(|e| LoadError::schema_invalid(locator, e.to_string()))?;

        let mut resolver = RefResolver::new(root.clone(), value);
        self.load_referenced_documents(locator, &mut resolver).await?;

        let document = OpenApiDocument::build(&spec, &resolver)
            .map_err(|e| LoadError::schema_invalid(locator, e.to_string()))?;

        let base_url = document
            .servers
            .first()
            .and_then(|s| resolve_base_url(&root, s));

        tracing::info!(
            spec = %display_locator(&root),
            title = %document.title,
            operations = document.operations().count(),
            "loaded OpenAPI spec"
        );

        Ok(LoadedSpec {
            document,
            hash,
            base_url,
        })
    }

    async fn read_document(&self, locator: &str, doc: &DocId) -> Result<String, LoadError> {
        match doc {
            DocId::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::InvalidData => {
                        LoadError::parse_failure(locator, "document is not valid UTF-8")
                    }
                    _ => LoadError::not_found(locator, format!("{}: {e}", path.display())),
                }),
            DocId::Url(url) => {
                let bytes = self.fetch_remote(locator, url).await?;
                String::from_utf8(bytes)
                    .map_err(|_| LoadError::parse_failure(locator, "document is not valid UTF-8"))
            }
        }
    }

    async fn fetch_remote(&self, locator: &str, url: &Url) -> Result<Vec<u8>, LoadError> {
        self.safety
            .check_url(url)
            .await
            .map_err(|e| LoadError::not_found(locator, e.to_string()))?;

        let mut attempt = 1;
        loop {
            match self.fetch_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(FetchFailure::Transient(message)) if attempt < 2 => {
                    tracing::warn!(
                        url = %redact_url(url),
                        error = %message,
                        "spec fetch failed; retrying once"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(FetchFailure::Transient(message) | FetchFailure::Permanent(message)) => {
                    return Err(LoadError::not_found(locator, message));
                }
            }
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<u8>, FetchFailure> {
        let resp = self
            .client
            .get(url.clone())
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| {
                let msg = sanitize_reqwest_error(&e);
                if e.is_connect() || e.is_timeout() {
                    FetchFailure::Transient(msg)
                } else {
                    FetchFailure::Permanent(msg)
                }
            })?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(FetchFailure::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchFailure::Permanent(format!("HTTP {status}")));
        }

        read_limited(resp, self.safety.max_response_bytes)
            .await
            .map_err(|e| match e {
                BodyError::TooLarge { .. } => FetchFailure::Permanent(e.to_string()),
                BodyError::Read(_) => FetchFailure::Transient(e.to_string()),
            })
    }

    /// Pull every externally referenced document into the resolver, transitively.
    async fn load_referenced_documents(
        &self,
        locator: &str,
        resolver: &mut RefResolver,
    ) -> Result<(), LoadError> {
        loop {
            let missing = resolver
                .missing_documents()
                .map_err(|e| LoadError::schema_invalid(locator, e.to_string()))?;
            if missing.is_empty() {
                return Ok(());
            }

            for doc in missing {
                if resolver.root().is_url() && !doc.is_url() {
                    return Err(LoadError::schema_invalid(
                        locator,
                        format!(
                            "remote document may not reference local file {}",
                            doc.display()
                        ),
                    ));
                }
                let unresolvable = |message: String| {
                    LoadError::schema_invalid(
                        locator,
                        format!("unresolvable $ref document {}: {message}", doc.display()),
                    )
                };
                let text = self
                    .read_document(locator, &doc)
                    .await
                    .map_err(|e| unresolvable(e.to_string()))?;
                let value: Value =
                    serde_yaml::from_str(&text).map_err(|e| unresolvable(e.to_string()))?;
                tracing::debug!(doc = %doc.display(), "loaded referenced document");
                resolver.insert_document(doc, value);
            }
        }
    }
}

fn display_locator(doc: &DocId) -> String {
    match doc {
        DocId::Url(u) => redact_url(u),
        DocId::File(_) => doc.display(),
    }
}

fn verify_hash(locator: &str, source: &SpecSource, actual: &str) -> Result<(), LoadError> {
    let Some(expected) = &source.spec_hash else {
        return Ok(());
    };
    if expected.eq_ignore_ascii_case(actual) {
        return Ok(());
    }
    match source.spec_hash_policy {
        HashPolicy::Fail => Err(LoadError::schema_invalid(
            locator,
            format!("spec hash mismatch: expected {expected}, got {actual}"),
        )),
        HashPolicy::Warn => {
            tracing::warn!(spec = %locator, expected = %expected, actual = %actual, "spec hash mismatch");
            Ok(())
        }
        HashPolicy::Ignore => Ok(()),
    }
}

/// JSON is a subset of YAML, so one parser covers both.
fn parse_text(locator: &str, text: &str) -> Result<Value, LoadError> {
    let value: Value =
        serde_yaml::from_str(text).map_err(|e| LoadError::parse_failure(locator, e.to_string()))?;
    if value.is_null() {
        return Err(LoadError::parse_failure(locator, "document is empty"));
    }
    Ok(value)
}

/// Minimal `OpenAPI` 3.x shape: version marker, `paths` mapping, `responses` on every operation.
fn check_structure(locator: &str, value: &Value) -> Result<(), LoadError> {
    let invalid = |m: String| LoadError::schema_invalid(locator, m);

    let Some(root) = value.as_object() else {
        return Err(invalid("document root must be a mapping".to_string()));
    };

    match root.get("openapi").and_then(Value::as_str) {
        Some(v) if v.starts_with("3.") => {}
        Some(v) => return Err(invalid(format!("unsupported OpenAPI version '{v}'"))),
        None if root.contains_key("swagger") => {
            return Err(invalid("Swagger 2.0 documents are not supported".to_string()));
        }
        None => return Err(invalid("missing `openapi` version field".to_string())),
    }

    let Some(paths) = root.get("paths").and_then(Value::as_object) else {
        return Err(invalid("`paths` must be a mapping".to_string()));
    };

    for (path, item) in paths {
        let Some(item) = item.as_object() else {
            return Err(invalid(format!("path item '{path}' must be a mapping")));
        };
        for method in HTTP_METHODS {
            let Some(op) = item.get(method) else {
                continue;
            };
            if !op.get("responses").is_some_and(Value::is_object) {
                return Err(invalid(format!(
                    "operation {} {path} has no `responses`",
                    method.to_ascii_uppercase()
                )));
            }
        }
    }

    Ok(())
}

/// Absolute server URLs pass through; relative ones only make sense against a remote spec URL.
fn resolve_base_url(root: &DocId, server_url: &str) -> Option<String> {
    if server_url.starts_with("http://") || server_url.starts_with("https://") {
        return Some(server_url.to_string());
    }
    match root {
        DocId::Url(spec_url) => spec_url.join(server_url).ok().map(|u| u.to_string()),
        DocId::File(_) => None,
    }
}
