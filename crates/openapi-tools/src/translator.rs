//! Operation -> tool translation.
//!
//! Translation is a pure function of the document: same document in, same tools out, in
//! declaration order.

use crate::document::{OpenApiDocument, Operation, ParamLocation, ResponseSpec, StatusSpec};
use crate::error::TranslationError;
use crate::registry::{BodyEncoding, FieldLocation, InputField, OutputSchema, ToolDescriptor};
use crate::schema::{SchemaKind, SchemaNode};
use apigate_http_tools::encoding::QuerySerialization;
use apigate_http_tools::semantics::MethodSemantics;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static TEMPLATE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("static regex"));
static UNDERSCORE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_+").expect("static regex"));

/// Header parameters that `OpenAPI` says must be ignored; they are controlled elsewhere.
const IGNORED_HEADER_PARAMS: [&str; 3] = ["accept", "content-type", "authorization"];

const PRECEDENCE: [ParamLocation; 4] = [
    ParamLocation::Path,
    ParamLocation::Query,
    ParamLocation::Header,
    ParamLocation::Cookie,
];

/// Translate every operation of `doc` into a tool descriptor.
///
/// # Errors
///
/// Returns [`TranslationError::DuplicateToolName`] if two operations resolve to the same tool
/// name. Nothing is returned in that case.
pub fn translate(doc: &OpenApiDocument) -> Result<Vec<ToolDescriptor>, TranslationError> {
    let mut tools = Vec::new();
    let mut owners: HashMap<String, String> = HashMap::new();

    for op in doc.operations() {
        let tool = translate_operation(op);
        if let Some(first) = owners.get(&tool.name) {
            return Err(TranslationError::DuplicateToolName {
                name: tool.name,
                first: first.clone(),
                second: op.label(),
            });
        }
        owners.insert(tool.name.clone(), op.label());
        tools.push(tool);
    }

    Ok(tools)
}

/// Lowercase, every character outside `[a-z0-9]` replaced with `_`.
#[must_use]
pub fn sanitize_tool_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Name for an operation without an `operationId`: `GET /bikes/{id}` -> `get_bikes_by_id`.
#[must_use]
pub fn synthesize_tool_name(method: &str, path: &str) -> String {
    let path = TEMPLATE_PARAM.replace_all(path, "by_$1");
    let raw = format!("{method}_{path}");
    let name = sanitize_tool_name(&raw);
    UNDERSCORE_RUNS
        .replace_all(&name, "_")
        .trim_matches('_')
        .to_string()
}

fn tool_name(op: &Operation) -> String {
    if let Some(id) = op.operation_id.as_deref()
        && !id.trim().is_empty()
    {
        return sanitize_tool_name(id);
    }
    synthesize_tool_name(op.method.as_str(), &op.path)
}

fn translate_operation(op: &Operation) -> ToolDescriptor {
    let mut fields = FieldSet::default();

    for location in PRECEDENCE {
        for p in op.parameters.iter().filter(|p| p.location == location) {
            if location == ParamLocation::Header
                && IGNORED_HEADER_PARAMS.contains(&p.name.to_ascii_lowercase().as_str())
            {
                continue;
            }
            fields.push(
                &p.name,
                location.into(),
                p.required,
                p.schema.clone(),
                p.query,
            );
        }

        if location == ParamLocation::Path {
            // Template variables the document forgot to declare still have to be filled in.
            for cap in TEMPLATE_PARAM.captures_iter(&op.path) {
                let name = &cap[1];
                let declared = op
                    .parameters
                    .iter()
                    .any(|p| p.location == ParamLocation::Path && p.name == name);
                if !declared {
                    fields.push(
                        name,
                        FieldLocation::Path,
                        true,
                        SchemaNode::string(),
                        QuerySerialization::default(),
                    );
                }
            }
        }
    }

    let body_encoding = op.request_body.as_ref().map(|body| {
        let encoding = if body.media_type.starts_with("application/x-www-form-urlencoded") {
            BodyEncoding::Form
        } else {
            BodyEncoding::Json
        };

        match &body.schema.kind {
            SchemaKind::Object {
                fields: props,
                required,
                ..
            } if !props.is_empty() => {
                for prop in props {
                    fields.push(
                        &prop.name,
                        FieldLocation::BodyField,
                        body.required && required.contains(&prop.name),
                        prop.node.clone(),
                        QuerySerialization::default(),
                    );
                }
            }
            _ => fields.push(
                "body",
                FieldLocation::Body,
                body.required,
                body.schema.clone(),
                QuerySerialization::default(),
            ),
        }
        encoding
    });

    let description = op
        .summary
        .clone()
        .or_else(|| op.description.clone())
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| format!("Calls {} {}", op.method, op.path));

    ToolDescriptor {
        name: tool_name(op),
        title: op.summary.clone(),
        description,
        method: op.method.clone(),
        path: op.path.clone(),
        fields: fields.fields,
        body_encoding,
        output: output_schema(&op.responses),
        semantics: MethodSemantics::for_method(&op.method),
    }
}

/// Fields in precedence order; a later field whose name is taken gets `<location>_<name>`.
#[derive(Default)]
struct FieldSet {
    fields: Vec<InputField>,
    taken: HashSet<String>,
}

impl FieldSet {
    fn push(
        &mut self,
        source_name: &str,
        location: FieldLocation,
        required: bool,
        schema: SchemaNode,
        query: QuerySerialization,
    ) {
        let name = if self.taken.contains(source_name) {
            let base = format!("{}_{source_name}", location.as_str());
            let mut candidate = base.clone();
            let mut n = 2;
            while self.taken.contains(&candidate) {
                candidate = format!("{base}_{n}");
                n += 1;
            }
            candidate
        } else {
            source_name.to_string()
        };
        self.taken.insert(name.clone());
        self.fields.push(InputField {
            name,
            source_name: source_name.to_string(),
            location,
            required,
            schema,
            query,
        });
    }
}

/// First JSON schema among 2xx responses: explicit codes ascending, then `2XX`.
fn output_schema(responses: &[ResponseSpec]) -> OutputSchema {
    let mut candidates: Vec<&ResponseSpec> = responses
        .iter()
        .filter(|r| match r.status {
            StatusSpec::Code(c) => (200..300).contains(&c),
            StatusSpec::Range(r) => r == 2,
            StatusSpec::Default => false,
        })
        .collect();
    candidates.sort_by_key(|r| match r.status {
        StatusSpec::Code(c) => c,
        _ => 300,
    });

    candidates
        .into_iter()
        .find_map(|r| r.schema.as_ref().filter(|_| r.is_json()))
        .map_or(OutputSchema::Opaque, |s| OutputSchema::Typed(s.clone()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resolver::{DocId, RefResolver};
    use openapiv3::OpenAPI;
    use serde_json::{Value, json};
    use url::Url;

    pub(crate) fn document(paths: Value) -> OpenApiDocument {
        let value = json!({
            "openapi": "3.0.3",
            "info": {"title": "bikes-api", "version": "1.0"},
            "paths": paths,
        });
        let spec: OpenAPI = serde_json::from_value(value.clone()).expect("openapi");
        let root = DocId::Url(Url::parse("https://specs.local/openapi.json").expect("url"));
        OpenApiDocument::build(&spec, &RefResolver::new(root, value)).expect("build")
    }

    #[test]
    fn operation_id_is_sanitized() {
        assert_eq!(sanitize_tool_name("GetbikeByID"), "getbikebyid");
        assert_eq!(sanitize_tool_name("bikes.list-all"), "bikes_list_all");
    }

    #[test]
    fn names_are_synthesized_from_method_and_path() {
        assert_eq!(synthesize_tool_name("GET", "/bikes/{id}"), "get_bikes_by_id");
        assert_eq!(
            synthesize_tool_name("post", "/shops/{shop-id}/bikes/"),
            "post_shops_by_shop_id_bikes"
        );
        assert_eq!(synthesize_tool_name("GET", "/"), "get");
    }

    #[test]
    fn bike_by_id_scenario() {
        let doc = document(json!({"/{bike_id}": {"get": {
            "operationId": "GetbikeByID",
            "parameters": [{"name": "bike_id", "in": "path", "required": true, "schema": {"type": "string"}}],
            "responses": {"200": {"description": "ok", "content": {"application/json": {
                "schema": {"type": "object", "properties": {"id": {"type": "string"}, "make": {"type": "string"}}}
            }}}}
        }}}));
        let tools = translate(&doc).expect("translate");
        assert_eq!(tools.len(), 1);
        let t = &tools[0];
        assert_eq!(t.name, "getbikebyid");
        assert_eq!(t.fields.len(), 1);
        assert_eq!(t.fields[0].location, FieldLocation::Path);
        assert!(t.fields[0].required);
        assert!(matches!(t.output, OutputSchema::Typed(_)));
        assert_eq!(t.description, "Calls GET /{bike_id}");
    }

    #[test]
    fn collisions_are_aliased_by_precedence() {
        let doc = document(json!({"/bikes/{id}": {"put": {
            "operationId": "updateBike",
            "parameters": [
                {"name": "id", "in": "query", "schema": {"type": "string"}},
                {"name": "id", "in": "path", "required": true, "schema": {"type": "string"}},
                {"name": "make", "in": "header", "schema": {"type": "string"}}
            ],
            "requestBody": {"required": true, "content": {"application/json": {"schema": {
                "type": "object", "required": ["id", "make"],
                "properties": {"id": {"type": "string"}, "make": {"type": "string"}, "year": {"type": "integer"}}
            }}}},
            "responses": {"200": {"description": "ok"}}
        }}}));
        let tool = translate(&doc).expect("translate").remove(0);
        let summary: Vec<(&str, &str, FieldLocation, bool)> = tool
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.source_name.as_str(), f.location, f.required))
            .collect();
        assert_eq!(
            summary,
            [
                ("id", "id", FieldLocation::Path, true),
                ("query_id", "id", FieldLocation::Query, false),
                ("make", "make", FieldLocation::Header, false),
                ("body_id", "id", FieldLocation::BodyField, true),
                ("body_make", "make", FieldLocation::BodyField, true),
                ("year", "year", FieldLocation::BodyField, false),
            ]
        );
        assert_eq!(tool.body_encoding, Some(BodyEncoding::Json));
        assert!(tool.fields[1].is_alias());
    }

    #[test]
    fn non_object_body_is_a_single_field() {
        let doc = document(json!({"/bikes/bulk": {"post": {
            "requestBody": {"content": {"application/json": {"schema": {
                "type": "array", "items": {"type": "string"}
            }}}},
            "responses": {"202": {"description": "accepted"}}
        }}}));
        let tool = translate(&doc).expect("translate").remove(0);
        assert_eq!(tool.name, "post_bikes_bulk");
        assert_eq!(tool.fields.len(), 1);
        assert_eq!(tool.fields[0].name, "body");
        assert_eq!(tool.fields[0].location, FieldLocation::Body);
        assert!(!tool.fields[0].required);
        assert_eq!(tool.output, OutputSchema::Opaque);
    }

    #[test]
    fn output_schema_prefers_lowest_explicit_2xx_json() {
        let doc = document(json!({"/bikes": {"post": {
            "operationId": "Createbike",
            "responses": {
                "2XX": {"description": "any", "content": {"application/json": {"schema": {"type": "string"}}}},
                "201": {"description": "created", "content": {"application/json": {"schema": {"type": "integer"}}}},
                "200": {"description": "text", "content": {"text/plain": {"schema": {"type": "string"}}}},
                "400": {"description": "bad", "content": {"application/json": {"schema": {"type": "object"}}}}
            }
        }}}));
        let tool = translate(&doc).expect("translate").remove(0);
        let OutputSchema::Typed(node) = &tool.output else {
            panic!("expected typed output");
        };
        assert_eq!(node.to_json_schema(), json!({"type": "integer"}));
    }

    #[test]
    fn undeclared_template_variables_become_required_fields() {
        let doc = document(json!({"/shops/{shop}/bikes": {"get": {
            "responses": {"200": {"description": "ok"}}
        }}}));
        let tool = translate(&doc).expect("translate").remove(0);
        assert_eq!(tool.fields[0].name, "shop");
        assert!(tool.fields[0].required);
    }

    #[test]
    fn reserved_header_params_are_ignored() {
        let doc = document(json!({"/bikes": {"get": {
            "parameters": [
                {"name": "Authorization", "in": "header", "schema": {"type": "string"}},
                {"name": "X-Trace", "in": "header", "schema": {"type": "string"}}
            ],
            "responses": {"200": {"description": "ok"}}
        }}}));
        let tool = translate(&doc).expect("translate").remove(0);
        let names: Vec<_> = tool.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["X-Trace"]);
    }

    #[test]
    fn duplicate_names_fail_the_whole_document() {
        let doc = document(json!({
            "/bikes": {"get": {"operationId": "listBikes", "responses": {"200": {"description": "ok"}}}},
            "/bikes/all": {"get": {"operationId": "list-bikes", "responses": {"200": {"description": "ok"}}}}
        }));
        let doc2 = document(json!({
            "/a": {"get": {"operationId": "listbikes", "responses": {"200": {"description": "ok"}}}},
            "/b": {"get": {"operationId": "ListBikes", "responses": {"200": {"description": "ok"}}}}
        }));
        let err = translate(&doc2).unwrap_err();
        assert_eq!(
            err,
            TranslationError::DuplicateToolName {
                name: "listbikes".to_string(),
                first: "GET /a".to_string(),
                second: "GET /b".to_string(),
            }
        );
        // `listBikes` vs `list-bikes` sanitize differently and coexist.
        assert_eq!(translate(&doc).expect("translate").len(), 2);
    }

    #[test]
    fn synthesized_name_collisions_are_duplicates() {
        let doc = document(json!({
            "/bikes/{id}": {"get": {"responses": {"200": {"description": "ok"}}}},
            "/bikes/by_id": {"get": {"responses": {"200": {"description": "ok"}}}}
        }));
        assert!(matches!(
            translate(&doc),
            Err(TranslationError::DuplicateToolName { .. })
        ));
    }

    #[test]
    fn translation_is_deterministic() {
        let paths = json!({
            "/bikes": {
                "get": {"operationId": "listBikes",
                        "parameters": [{"name": "limit", "in": "query", "schema": {"type": "integer"}}],
                        "responses": {"200": {"description": "ok", "content": {"application/json": {
                            "schema": {"type": "array", "items": {"type": "object", "properties": {
                                "id": {"type": "string"}, "make": {"type": "string"}}}}}}}}},
                "post": {"operationId": "Createbike",
                         "requestBody": {"content": {"application/json": {"schema": {
                             "type": "object", "properties": {"make": {"type": "string"}}}}}},
                         "responses": {"201": {"description": "ok"}}}
            }
        });
        let a = translate(&document(paths.clone())).expect("a");
        let b = translate(&document(paths)).expect("b");
        assert_eq!(a, b);
        let schemas_a: Vec<_> = a.iter().map(ToolDescriptor::input_schema).collect();
        let schemas_b: Vec<_> = b.iter().map(ToolDescriptor::input_schema).collect();
        assert_eq!(
            serde_json::to_string(&schemas_a).expect("json"),
            serde_json::to_string(&schemas_b).expect("json")
        );
    }
}
