//! `OpenAPI` `$ref` resolver.
//!
//! The `openapiv3` crate models `$ref`s using `ReferenceOr<T>` but does not resolve them.
//! Resolution here is two-phase: the loader first pulls every externally referenced document
//! into the [`RefResolver`] (see [`RefResolver::missing_documents`]), after which all lookups are
//! synchronous.
//!
//! Supported refs:
//! - Local refs (`#/...`)
//! - File refs (`./common.yaml#/...`, `/abs/path/spec.yaml#/...`, `file:///...#/...`)
//! - URL refs (`https://example.com/common.yaml#/...`)
//!
//! `$ref` resolution is relative to the document that contains the `$ref`, so callers pass the
//! current document id ([`DocId`]) along with every ref.

use openapiv3::ReferenceOr;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid reference '{reference}': {message}")]
    BadReference { reference: String, message: String },

    #[error("cyclic $ref detected while resolving '{0}'")]
    Cycle(String),

    #[error("unresolved $ref '{reference}' (doc {doc}, missing pointer '{pointer}')")]
    MissingPointer {
        reference: String,
        doc: String,
        pointer: String,
    },

    #[error("referenced document {0} was not loaded")]
    MissingDocument(String),

    #[error("referenced value '{reference}' has the wrong shape: {message}")]
    WrongShape { reference: String, message: String },
}

type Result<T> = std::result::Result<T, ResolveError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocId {
    Url(Url),
    File(PathBuf),
}

impl DocId {
    /// Parse a root spec locator into a document identifier (URL or file path).
    ///
    /// # Errors
    ///
    /// Returns an error if the locator is an invalid URL or an invalid file URL.
    pub fn parse(locator: &str) -> Result<Self> {
        Self::resolve(None, locator)
    }

    /// Resolve `doc_part` of a `$ref` relative to `base` (or as a root locator when `None`).
    fn resolve(base: Option<&DocId>, doc_part: &str) -> Result<Self> {
        let bad = |message: String| ResolveError::BadReference {
            reference: doc_part.to_string(),
            message,
        };

        if doc_part.starts_with("http://") || doc_part.starts_with("https://") {
            let url = Url::parse(doc_part).map_err(|e| bad(e.to_string()))?;
            return Ok(DocId::Url(strip_fragment(url)));
        }

        if doc_part.starts_with("file://") {
            let url = Url::parse(doc_part).map_err(|e| bad(e.to_string()))?;
            let path = url
                .to_file_path()
                .map_err(|()| bad("file URL is not a path".to_string()))?;
            return Ok(DocId::File(canonicalize_best_effort(path)));
        }

        match base {
            None => Ok(DocId::File(canonicalize_best_effort(PathBuf::from(doc_part)))),
            Some(DocId::Url(base)) => {
                let joined = base.join(doc_part).map_err(|e| bad(e.to_string()))?;
                Ok(DocId::Url(strip_fragment(joined)))
            }
            Some(DocId::File(base)) => {
                let resolved = if Path::new(doc_part).is_absolute() {
                    PathBuf::from(doc_part)
                } else {
                    base.parent()
                        .unwrap_or_else(|| Path::new("."))
                        .join(doc_part)
                };
                Ok(DocId::File(canonicalize_best_effort(resolved)))
            }
        }
    }

    #[must_use]
    pub fn is_url(&self) -> bool {
        matches!(self, DocId::Url(_))
    }

    #[must_use]
    pub fn display(&self) -> String {
        match self {
            DocId::Url(u) => u.to_string(),
            DocId::File(p) => p.display().to_string(),
        }
    }
}

fn strip_fragment(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

fn canonicalize_best_effort(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}

#[derive(Debug)]
pub struct RefResolver {
    root: DocId,
    docs: HashMap<DocId, Arc<Value>>,
}

impl RefResolver {
    #[must_use]
    pub fn new(root: DocId, root_value: Value) -> Self {
        let mut docs = HashMap::new();
        docs.insert(root.clone(), Arc::new(root_value));
        Self { root, docs }
    }

    #[must_use]
    pub fn root(&self) -> &DocId {
        &self.root
    }

    /// Raw value of a loaded document.
    #[must_use]
    pub fn document(&self, doc: &DocId) -> Option<&Value> {
        self.docs.get(doc).map(|v| &**v)
    }

    pub fn insert_document(&mut self, doc: DocId, value: Value) {
        self.docs.insert(doc, Arc::new(value));
    }

    /// External documents referenced from any loaded document but not loaded yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a `$ref` string is malformed.
    pub fn missing_documents(&self) -> Result<BTreeSet<DocId>> {
        let mut missing = BTreeSet::new();
        for (doc, value) in &self.docs {
            let mut refs = Vec::new();
            collect_refs(value, &mut refs);
            for reference in refs {
                let (target, _) = parse_ref(doc, reference)?;
                if !self.docs.contains_key(&target) {
                    missing.insert(target);
                }
            }
        }
        Ok(missing)
    }

    /// Resolve a (possibly chained) reference down to an item.
    ///
    /// Returns the id of the document the item lives in; refs nested inside the item must be
    /// resolved against that document.
    ///
    /// # Errors
    ///
    /// Returns an error on cycles, missing documents or pointers, or when the target cannot be
    /// deserialized as `T`.
    pub fn resolve<T>(&self, current_doc: &DocId, r: &ReferenceOr<T>) -> Result<(DocId, T)>
    where
        T: Clone + DeserializeOwned,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut doc = current_doc.clone();
        let mut cur: ReferenceOr<T> = r.clone();

        loop {
            match cur {
                ReferenceOr::Item(item) => return Ok((doc, item)),
                ReferenceOr::Reference { reference } => {
                    if !seen.insert(self.canonical_key(&doc, &reference)?) {
                        return Err(ResolveError::Cycle(reference));
                    }

                    let (target_doc, value) = self.resolve_value(&doc, &reference)?;
                    cur = serde_json::from_value(value).map_err(|e| ResolveError::WrongShape {
                        reference: reference.clone(),
                        message: e.to_string(),
                    })?;
                    doc = target_doc;
                }
            }
        }
    }

    /// Stable identity of a reference target, used for cycle detection.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference is malformed.
    pub fn canonical_key(&self, current_doc: &DocId, reference: &str) -> Result<String> {
        let (target_doc, pointer) = parse_ref(current_doc, reference)?;
        let mut key = match &target_doc {
            DocId::Url(u) => format!("url:{u}"),
            DocId::File(p) => format!("file:{}", p.display()),
        };
        if let Some(ptr) = pointer {
            key.push('#');
            key.push_str(&ptr);
        }
        Ok(key)
    }

    pub(crate) fn resolve_value(&self, current_doc: &DocId, reference: &str) -> Result<(DocId, Value)> {
        let (target_doc, pointer) = parse_ref(current_doc, reference)?;
        let doc_value = self
            .docs
            .get(&target_doc)
            .ok_or_else(|| ResolveError::MissingDocument(target_doc.display()))?;

        let selected = match pointer {
            Some(ptr) => doc_value
                .pointer(&ptr)
                .cloned()
                .ok_or_else(|| ResolveError::MissingPointer {
                    reference: reference.to_string(),
                    doc: target_doc.display(),
                    pointer: ptr,
                })?,
            None => (**doc_value).clone(),
        };

        Ok((target_doc, selected))
    }
}

fn parse_ref(current_doc: &DocId, reference: &str) -> Result<(DocId, Option<String>)> {
    let (doc_part, frag_part) = match reference.split_once('#') {
        Some((d, f)) => (d, Some(f)),
        None => (reference, None),
    };

    let target_doc = if doc_part.is_empty() {
        current_doc.clone()
    } else {
        DocId::resolve(Some(current_doc), doc_part)?
    };

    let ptr = match frag_part {
        Some("") | None => None,
        Some(frag) if frag.starts_with('/') => Some(frag.to_string()),
        Some(_) => {
            return Err(ResolveError::BadReference {
                reference: reference.to_string(),
                message: "expected a JSON pointer starting with '/'".to_string(),
            });
        }
    };

    Ok((target_doc, ptr))
}

fn collect_refs<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(r)) = map.get("$ref") {
                out.push(r);
            }
            for v in map.values() {
                collect_refs(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_refs(v, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openapiv3::Parameter;
    use serde_json::json;

    fn root() -> DocId {
        DocId::Url(Url::parse("https://specs.local/api/openapi.yaml").expect("url"))
    }

    #[test]
    fn resolves_local_parameter_ref() {
        let resolver = RefResolver::new(
            root(),
            json!({
                "components": {"parameters": {"BikeId": {
                    "name": "bike_id", "in": "path", "required": true,
                    "schema": {"type": "string"}
                }}}
            }),
        );
        let r: ReferenceOr<Parameter> = ReferenceOr::ref_("#/components/parameters/BikeId");
        let (_, p) = resolver.resolve(&root(), &r).expect("resolve");
        assert_eq!(p.parameter_data_ref().name, "bike_id");
    }

    #[test]
    fn detects_ref_cycles() {
        let resolver = RefResolver::new(
            root(),
            json!({
                "components": {"parameters": {
                    "A": {"$ref": "#/components/parameters/B"},
                    "B": {"$ref": "#/components/parameters/A"}
                }}
            }),
        );
        let r: ReferenceOr<Parameter> = ReferenceOr::ref_("#/components/parameters/A");
        let err = resolver.resolve(&root(), &r).unwrap_err();
        assert!(matches!(err, ResolveError::Cycle(_)));
    }

    #[test]
    fn missing_pointer_is_reported() {
        let resolver = RefResolver::new(root(), json!({}));
        let r: ReferenceOr<Parameter> = ReferenceOr::ref_("#/components/parameters/Nope");
        let err = resolver.resolve(&root(), &r).unwrap_err();
        assert!(matches!(err, ResolveError::MissingPointer { .. }));
    }

    #[test]
    fn external_refs_resolve_relative_to_containing_doc() {
        let mut resolver = RefResolver::new(
            root(),
            json!({"a": {"$ref": "common/params.yaml#/Limit"}}),
        );
        let missing = resolver.missing_documents().expect("scan");
        let common = DocId::Url(Url::parse("https://specs.local/api/common/params.yaml").expect("url"));
        assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec![common.clone()]);

        resolver.insert_document(
            common,
            json!({"Limit": {"name": "limit", "in": "query", "schema": {"type": "integer"}}}),
        );
        assert!(resolver.missing_documents().expect("scan").is_empty());

        let r: ReferenceOr<Parameter> = ReferenceOr::ref_("common/params.yaml#/Limit");
        let (doc, p) = resolver.resolve(&root(), &r).expect("resolve");
        assert!(doc.display().ends_with("common/params.yaml"));
        assert_eq!(p.parameter_data_ref().name, "limit");
    }
}
