//! In-memory document model.
//!
//! Built once by the loader from the `openapiv3` types with every `$ref` resolved, then
//! read-only. Path items and operations keep their declaration order.

use crate::resolver::{DocId, RefResolver, ResolveError};
use crate::schema::{SchemaConverter, SchemaNode};
use apigate_http_tools::body::is_json_content_type;
use apigate_http_tools::encoding::{QuerySerialization, QueryStyle};
use openapiv3::{
    MediaType, OpenAPI, Parameter as OaParameter, ParameterSchemaOrContent, ReferenceOr,
    RequestBody as OaRequestBody, Response, StatusCode,
};
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct OpenApiDocument {
    pub title: String,
    pub version: String,
    /// Server URLs in declaration order, with server variables substituted by their defaults.
    pub servers: Vec<String>,
    pub path_items: Vec<PathItem>,
}

#[derive(Debug, Clone)]
pub struct PathItem {
    pub path: String,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub operation_id: Option<String>,
    pub method: Method,
    pub path: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub deprecated: bool,
    pub parameters: Vec<Parameter>,
    pub request_body: Option<RequestBody>,
    pub responses: Vec<ResponseSpec>,
}

impl Operation {
    /// `GET /bikes/{id}`, for logs and error messages.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

impl ParamLocation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Cookie => "cookie",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub schema: SchemaNode,
    pub query: QuerySerialization,
}

#[derive(Debug, Clone)]
pub struct RequestBody {
    pub required: bool,
    pub media_type: String,
    pub schema: SchemaNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSpec {
    Code(u16),
    /// `2XX` style range; holds the leading digit.
    Range(u16),
    Default,
}

#[derive(Debug, Clone)]
pub struct ResponseSpec {
    pub status: StatusSpec,
    pub media_type: Option<String>,
    pub schema: Option<SchemaNode>,
}

impl ResponseSpec {
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.media_type.as_deref().is_some_and(is_json_content_type)
    }
}

impl OpenApiDocument {
    /// Build the model from a parsed document.
    ///
    /// # Errors
    ///
    /// Returns an error if any `$ref` reachable from a path item cannot be resolved.
    pub fn build(spec: &OpenAPI, resolver: &RefResolver) -> Result<Self, ResolveError> {
        let root = resolver.root().clone();
        let mut schemas = SchemaConverter::new(resolver);
        let mut path_items = Vec::with_capacity(spec.paths.paths.len());

        for (path, item) in &spec.paths.paths {
            let (item_doc, item) = resolver.resolve(&root, item)?;
            let shared_params = &item.parameters;
            let mut operations = Vec::new();

            for (method, op) in ordered_operations(&item, &declared_methods(resolver, path)) {
                let Some(method) = resolve_http_method(method) else {
                    continue;
                };
                let parameters = merge_parameters(
                    resolver,
                    &mut schemas,
                    &item_doc,
                    shared_params,
                    &op.parameters,
                )?;
                let request_body = match &op.request_body {
                    Some(rb) => {
                        let (doc, rb) = resolver.resolve(&item_doc, rb)?;
                        build_request_body(&mut schemas, &doc, &rb)?
                    }
                    None => None,
                };
                let responses = build_responses(resolver, &mut schemas, &item_doc, op)?;

                operations.push(Operation {
                    operation_id: op.operation_id.clone(),
                    method,
                    path: path.clone(),
                    summary: op.summary.clone(),
                    description: op.description.clone(),
                    deprecated: op.deprecated,
                    parameters,
                    request_body,
                    responses,
                });
            }

            path_items.push(PathItem {
                path: path.clone(),
                operations,
            });
        }

        Ok(Self {
            title: spec.info.title.clone(),
            version: spec.info.version.clone(),
            servers: spec.servers.iter().map(server_url).collect(),
            path_items,
        })
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.path_items.iter().flat_map(|p| p.operations.iter())
    }
}

/// Method keys of the raw path item for `path`, in declaration order.
fn declared_methods(resolver: &RefResolver, path: &str) -> Vec<String> {
    let root = resolver.root();
    let Some(raw) = resolver
        .document(root)
        .and_then(|d| d.get("paths"))
        .and_then(|p| p.get(path))
    else {
        return Vec::new();
    };
    let resolved;
    let raw = match raw.get("$ref").and_then(Value::as_str) {
        Some(reference) => match resolver.resolve_value(root, reference) {
            Ok((_, value)) => {
                resolved = value;
                &resolved
            }
            Err(_) => return Vec::new(),
        },
        None => raw,
    };
    raw.as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

/// Operations of `item` ordered as `declared`; undeclared methods keep their fixed order.
fn ordered_operations<'a>(
    item: &'a openapiv3::PathItem,
    declared: &[String],
) -> Vec<(&'a str, &'a openapiv3::Operation)> {
    let mut ops: Vec<_> = item.iter().collect();
    ops.sort_by_key(|(method, _)| {
        declared
            .iter()
            .position(|d| d == method)
            .unwrap_or(usize::MAX)
    });
    ops
}

fn resolve_http_method(method: &str) -> Option<Method> {
    Some(match method {
        "get" => Method::GET,
        "put" => Method::PUT,
        "post" => Method::POST,
        "delete" => Method::DELETE,
        "options" => Method::OPTIONS,
        "head" => Method::HEAD,
        "patch" => Method::PATCH,
        "trace" => Method::TRACE,
        _ => return None,
    })
}

fn server_url(server: &openapiv3::Server) -> String {
    let mut url = server.url.clone();
    if let Some(vars) = &server.variables {
        for (name, var) in vars {
            url = url.replace(&format!("{{{name}}}"), &var.default);
        }
    }
    url
}

/// Path-item parameters overridden by operation parameters with the same name and location.
fn merge_parameters(
    resolver: &RefResolver,
    schemas: &mut SchemaConverter<'_>,
    doc: &DocId,
    path_item_params: &[ReferenceOr<OaParameter>],
    operation_params: &[ReferenceOr<OaParameter>],
) -> Result<Vec<Parameter>, ResolveError> {
    let mut merged: Vec<Parameter> = Vec::new();
    let mut index: HashMap<(ParamLocation, String), usize> = HashMap::new();

    for p in path_item_params.iter().chain(operation_params) {
        let (param_doc, param) = resolver.resolve(doc, p)?;
        let param = build_parameter(schemas, &param_doc, &param)?;
        let key = (param.location, param.name.clone());
        match index.get(&key) {
            Some(&i) => merged[i] = param,
            None => {
                index.insert(key, merged.len());
                merged.push(param);
            }
        }
    }

    Ok(merged)
}

fn build_parameter(
    schemas: &mut SchemaConverter<'_>,
    doc: &DocId,
    param: &OaParameter,
) -> Result<Parameter, ResolveError> {
    let data = param.parameter_data_ref();
    let (location, query) = match param {
        OaParameter::Path { .. } => (ParamLocation::Path, QuerySerialization::default()),
        OaParameter::Header { .. } => (ParamLocation::Header, QuerySerialization::default()),
        OaParameter::Cookie { .. } => (ParamLocation::Cookie, QuerySerialization::default()),
        OaParameter::Query {
            allow_reserved,
            style,
            allow_empty_value,
            ..
        } => {
            let style = match style {
                openapiv3::QueryStyle::Form => QueryStyle::Form,
                openapiv3::QueryStyle::SpaceDelimited => QueryStyle::SpaceDelimited,
                openapiv3::QueryStyle::PipeDelimited => QueryStyle::PipeDelimited,
                openapiv3::QueryStyle::DeepObject => QueryStyle::DeepObject,
            };
            (
                ParamLocation::Query,
                QuerySerialization {
                    style,
                    explode: data.explode.unwrap_or_else(|| style.default_explode()),
                    allow_reserved: *allow_reserved,
                    allow_empty_value: allow_empty_value.unwrap_or(false),
                },
            )
        }
    };

    let schema = match &data.format {
        ParameterSchemaOrContent::Schema(s) => schemas.convert_ref(doc, s)?,
        ParameterSchemaOrContent::Content(content) => {
            match content.values().find_map(|m| m.schema.as_ref()) {
                Some(s) => schemas.convert_ref(doc, s)?,
                None => SchemaNode::string(),
            }
        }
    };

    Ok(Parameter {
        name: data.name.clone(),
        location,
        // Path parameters are always required, whatever the document says.
        required: data.required || location == ParamLocation::Path,
        schema: schema.with_description(data.description.clone()),
        query,
    })
}

/// Prefer a JSON media type, then form encoding, then whatever is declared first.
fn pick_media_type<'m>(
    content: impl IntoIterator<Item = (&'m String, &'m MediaType)> + Clone,
) -> Option<(&'m String, &'m MediaType)> {
    content
        .clone()
        .into_iter()
        .find(|(k, _)| is_json_content_type(k))
        .or_else(|| {
            content
                .clone()
                .into_iter()
                .find(|(k, _)| k.starts_with("application/x-www-form-urlencoded"))
        })
        .or_else(|| content.into_iter().next())
}

fn build_request_body(
    schemas: &mut SchemaConverter<'_>,
    doc: &DocId,
    body: &OaRequestBody,
) -> Result<Option<RequestBody>, ResolveError> {
    let Some((media_type, media)) = pick_media_type(&body.content) else {
        return Ok(None);
    };
    let schema = match &media.schema {
        Some(s) => schemas.convert_ref(doc, s)?,
        None => SchemaNode::any(),
    };
    Ok(Some(RequestBody {
        required: body.required,
        media_type: media_type.clone(),
        schema: schema.with_description(body.description.clone()),
    }))
}

fn build_responses(
    resolver: &RefResolver,
    schemas: &mut SchemaConverter<'_>,
    doc: &DocId,
    op: &openapiv3::Operation,
) -> Result<Vec<ResponseSpec>, ResolveError> {
    let declared = op
        .responses
        .responses
        .iter()
        .map(|(code, r)| {
            let status = match code {
                StatusCode::Code(c) => StatusSpec::Code(*c),
                StatusCode::Range(r) => StatusSpec::Range(*r),
            };
            (status, r)
        })
        .chain(
            op.responses
                .default
                .iter()
                .map(|r| (StatusSpec::Default, r)),
        );

    let mut out = Vec::new();
    for (status, r) in declared {
        let (resp_doc, resp): (DocId, Response) = resolver.resolve(doc, r)?;
        let (media_type, schema) = match pick_media_type(&resp.content) {
            Some((mt, media)) => {
                let schema = match &media.schema {
                    Some(s) => Some(schemas.convert_ref(&resp_doc, s)?),
                    None => None,
                };
                (Some(mt.clone()), schema)
            }
            None => (None, None),
        };
        out.push(ResponseSpec {
            status,
            media_type,
            schema,
        });
    }
    Ok(out)
}
