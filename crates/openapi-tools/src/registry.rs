//! Tool descriptors and the per-namespace registry.
//!
//! A [`ToolRegistry`] is built in one go from a document and never mutated afterwards; share it
//! behind an `Arc` and look tools up from any number of tasks.

use crate::document::{OpenApiDocument, ParamLocation};
use crate::error::TranslationError;
use crate::schema::SchemaNode;
use crate::translator;
use apigate_http_tools::encoding::QuerySerialization;
use apigate_http_tools::semantics::MethodSemantics;
use reqwest::Method;
use rmcp::model::{JsonObject, Tool};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLocation {
    Path,
    Query,
    Header,
    Cookie,
    /// One property of a flattened object body.
    BodyField,
    /// The whole request body.
    Body,
}

impl FieldLocation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Cookie => "cookie",
            Self::BodyField | Self::Body => "body",
        }
    }
}

impl From<ParamLocation> for FieldLocation {
    fn from(value: ParamLocation) -> Self {
        match value {
            ParamLocation::Path => Self::Path,
            ParamLocation::Query => Self::Query,
            ParamLocation::Header => Self::Header,
            ParamLocation::Cookie => Self::Cookie,
        }
    }
}

/// One argument of a tool. `name` is what callers send; `source_name` is what goes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct InputField {
    pub name: String,
    pub source_name: String,
    pub location: FieldLocation,
    pub required: bool,
    pub schema: SchemaNode,
    pub query: QuerySerialization,
}

impl InputField {
    #[must_use]
    pub fn is_alias(&self) -> bool {
        self.name != self.source_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Json,
    Form,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputSchema {
    /// Schema of the first declared 2xx JSON response.
    Typed(SchemaNode),
    /// Nothing declared; callers must not assume structure.
    Opaque,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub title: Option<String>,
    pub description: String,
    pub method: Method,
    pub path: String,
    pub fields: Vec<InputField>,
    /// `Some` when the operation declares a request body.
    pub body_encoding: Option<BodyEncoding>,
    pub output: OutputSchema,
    pub semantics: MethodSemantics,
}

impl ToolDescriptor {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&InputField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// JSON Schema for the tool arguments.
    #[must_use]
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.schema.to_json_schema()))
            .collect();
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();

        let mut schema = json!({
            "type": "object",
            "properties": properties,
            "additionalProperties": false,
        });
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        schema
    }

    /// MCP requires an object at the root of an output schema, so the body schema is wrapped.
    #[must_use]
    pub fn output_schema(&self) -> Option<Value> {
        match &self.output {
            OutputSchema::Typed(node) => Some(json!({
                "type": "object",
                "required": ["status", "body"],
                "properties": {
                    "status": {"type": "integer"},
                    "headers": {"type": "object"},
                    "body": node.to_json_schema(),
                    "rawFallback": {"type": "boolean"},
                }
            })),
            OutputSchema::Opaque => None,
        }
    }

    #[must_use]
    pub fn to_mcp_tool(&self) -> Tool {
        let mut tool = Tool::new(
            self.name.clone(),
            self.description.clone(),
            Arc::new(as_object(self.input_schema())),
        );
        tool.output_schema = self.output_schema().map(|s| Arc::new(as_object(s)));
        tool.annotations = Some(self.semantics.to_annotations(self.title.clone()));
        tool
    }
}

fn as_object(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

#[derive(Debug)]
pub struct ToolRegistry {
    namespace: String,
    base_url: String,
    default_headers: Vec<(String, String)>,
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Translate `doc` and freeze the result. Either every tool is registered or none is.
    ///
    /// # Errors
    ///
    /// Returns [`TranslationError::DuplicateToolName`] if two operations map to one name.
    pub fn build(
        namespace: impl Into<String>,
        base_url: impl Into<String>,
        default_headers: Vec<(String, String)>,
        doc: &OpenApiDocument,
    ) -> Result<Self, TranslationError> {
        let tools = translator::translate(doc)?;
        let index = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Ok(Self {
            namespace: namespace.into(),
            base_url: base_url.into(),
            default_headers,
            tools,
            index,
        })
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Tools in document declaration order.
    #[must_use]
    pub fn list(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn default_headers(&self) -> &[(String, String)] {
        &self.default_headers
    }

    #[must_use]
    pub fn mcp_tools(&self) -> Vec<Tool> {
        self.tools.iter().map(ToolDescriptor::to_mcp_tool).collect()
    }

    /// Registered names close to `unknown`, best match first.
    #[must_use]
    pub fn suggest(&self, unknown: &str) -> Vec<String> {
        find_similar_strings(unknown, self.tools.iter().map(|t| t.name.as_str()))
    }
}

pub(crate) fn find_similar_strings<'a>(
    unknown: &str,
    known: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut candidates: Vec<(f64, String)> = Vec::new();
    for k in known {
        let score = strsim::jaro(unknown, k);
        if score > 0.7 {
            candidates.push((score, k.to_string()));
        }
    }
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    candidates.into_iter().map(|(_, s)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::tests::document;

    fn registry() -> ToolRegistry {
        let doc = document(json!({
            "/bikes": {
                "get": {"operationId": "listBikes", "responses": {"200": {"description": "ok"}}},
                "post": {"operationId": "Createbike", "responses": {"201": {"description": "ok"}}}
            },
            "/{bike_id}": {
                "get": {
                    "operationId": "GetbikeByID",
                    "parameters": [{"name": "bike_id", "in": "path", "required": true, "schema": {"type": "string"}}],
                    "responses": {"200": {"description": "ok", "content": {"application/json": {
                        "schema": {"type": "object", "properties": {"id": {"type": "string"}}}
                    }}}}
                }
            }
        }));
        ToolRegistry::build("bikes", "http://upstream.local", Vec::new(), &doc).expect("build")
    }

    #[test]
    fn list_preserves_declaration_order() {
        let reg = registry();
        let names: Vec<_> = reg.list().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["listbikes", "createbike", "getbikebyid"]);
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.namespace(), "bikes");
    }

    #[test]
    fn lookup_is_exact() {
        let reg = registry();
        assert!(reg.lookup("getbikebyid").is_some());
        assert!(reg.lookup("GetbikeByID").is_none());
        assert!(reg.lookup("deletebike").is_none());
    }

    #[test]
    fn suggestions_rank_close_names_first() {
        let reg = registry();
        let s = reg.suggest("getbike");
        assert_eq!(s.first().map(String::as_str), Some("getbikebyid"));
    }

    #[test]
    fn mcp_tools_carry_schemas_and_annotations() {
        let reg = registry();
        let tools = reg.mcp_tools();
        let get = tools
            .iter()
            .find(|t| t.name == "getbikebyid")
            .expect("tool");
        assert_eq!(
            get.input_schema.get("required"),
            Some(&json!(["bike_id"]))
        );
        assert!(get.output_schema.is_some());
        let ann = get.annotations.as_ref().expect("annotations");
        assert_eq!(ann.read_only_hint, Some(true));

        let create = tools.iter().find(|t| t.name == "createbike").expect("tool");
        assert!(create.output_schema.is_none());
        assert_eq!(
            create.annotations.as_ref().and_then(|a| a.read_only_hint),
            Some(false)
        );
    }
}
