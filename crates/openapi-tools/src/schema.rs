//! Tagged schema nodes.
//!
//! `OpenAPI` schemas are converted once, at load time, into a small closed set of node shapes.
//! Everything downstream (input schemas, output schemas, argument validation) walks these nodes
//! instead of raw JSON Schema.

use crate::resolver::{DocId, RefResolver, ResolveError};
use openapiv3::{AdditionalProperties, ReferenceOr, Schema, SchemaKind as OaSchemaKind, Type};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    String,
    Number,
    Integer,
    Boolean,
}

impl ScalarType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
            }
            Self::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub node: SchemaNode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaKind {
    Scalar {
        ty: ScalarType,
        enumeration: Vec<Value>,
    },
    Array {
        items: Box<SchemaNode>,
    },
    Object {
        fields: Vec<ObjectField>,
        required: Vec<String>,
        additional: bool,
    },
    /// Composed or otherwise opaque schema; accepts any value.
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    pub kind: SchemaKind,
    pub description: Option<String>,
    pub nullable: bool,
}

impl SchemaNode {
    #[must_use]
    pub fn new(kind: SchemaKind) -> Self {
        Self {
            kind,
            description: None,
            nullable: false,
        }
    }

    #[must_use]
    pub fn scalar(ty: ScalarType) -> Self {
        Self::new(SchemaKind::Scalar {
            ty,
            enumeration: Vec::new(),
        })
    }

    #[must_use]
    pub fn string() -> Self {
        Self::scalar(ScalarType::String)
    }

    #[must_use]
    pub fn any() -> Self {
        Self::new(SchemaKind::Any)
    }

    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        if description.is_some() {
            self.description = description;
        }
        self
    }

    #[must_use]
    pub fn object_fields(&self) -> Option<(&[ObjectField], &[String])> {
        match &self.kind {
            SchemaKind::Object {
                fields, required, ..
            } => Some((fields, required)),
            _ => None,
        }
    }

    /// Render as a JSON Schema fragment. Output is deterministic for a given node.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut out = Map::new();
        if let Some(desc) = &self.description {
            out.insert("description".into(), json!(desc));
        }

        let type_name = match &self.kind {
            SchemaKind::Scalar { ty, enumeration } => {
                if !enumeration.is_empty() {
                    out.insert("enum".into(), Value::Array(enumeration.clone()));
                }
                Some(ty.as_str())
            }
            SchemaKind::Array { items } => {
                out.insert("items".into(), items.to_json_schema());
                Some("array")
            }
            SchemaKind::Object {
                fields,
                required,
                additional,
            } => {
                let props: Map<String, Value> = fields
                    .iter()
                    .map(|f| (f.name.clone(), f.node.to_json_schema()))
                    .collect();
                out.insert("properties".into(), Value::Object(props));
                if !required.is_empty() {
                    out.insert("required".into(), json!(required));
                }
                if !additional {
                    out.insert("additionalProperties".into(), json!(false));
                }
                Some("object")
            }
            SchemaKind::Any => None,
        };

        if let Some(t) = type_name {
            let ty = if self.nullable {
                json!([t, "null"])
            } else {
                json!(t)
            };
            out.insert("type".into(), ty);
        }

        Value::Object(out)
    }

    /// Validate `value` against this node. Returns the paths of offending values, rooted at
    /// `path`; an empty result means the value conforms.
    #[must_use]
    pub fn validate(&self, value: &Value, path: &str) -> Vec<String> {
        let mut errors = Vec::new();
        self.validate_into(value, path, &mut errors);
        errors
    }

    fn validate_into(&self, value: &Value, path: &str, errors: &mut Vec<String>) {
        if value.is_null() {
            if !self.nullable && !matches!(self.kind, SchemaKind::Any) {
                errors.push(path.to_string());
            }
            return;
        }

        match &self.kind {
            SchemaKind::Any => {}
            SchemaKind::Scalar { ty, enumeration } => {
                if !ty.accepts(value)
                    || (!enumeration.is_empty()
                        && !enumeration.iter().any(|e| json_values_equal(e, value)))
                {
                    errors.push(path.to_string());
                }
            }
            SchemaKind::Array { items } => {
                let Some(arr) = value.as_array() else {
                    errors.push(path.to_string());
                    return;
                };
                for (i, item) in arr.iter().enumerate() {
                    items.validate_into(item, &format!("{path}[{i}]"), errors);
                }
            }
            SchemaKind::Object {
                fields,
                required,
                additional,
            } => {
                let Some(obj) = value.as_object() else {
                    errors.push(path.to_string());
                    return;
                };
                for name in required {
                    if obj.get(name).is_none_or(Value::is_null) {
                        errors.push(join_path(path, name));
                    }
                }
                for field in fields {
                    let Some(v) = obj.get(&field.name) else {
                        continue;
                    };
                    if v.is_null() && required.contains(&field.name) {
                        continue;
                    }
                    field.node.validate_into(v, &join_path(path, &field.name), errors);
                }
                if !additional {
                    for key in obj.keys() {
                        if !fields.iter().any(|f| &f.name == key) {
                            errors.push(join_path(path, key));
                        }
                    }
                }
            }
        }
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn json_values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

/// Converts `openapiv3` schemas into [`SchemaNode`]s, resolving `$ref`s on the way.
///
/// Recursive schemas are cut at the point of recursion and become [`SchemaKind::Any`].
pub struct SchemaConverter<'a> {
    resolver: &'a RefResolver,
    active: Vec<String>,
}

impl<'a> SchemaConverter<'a> {
    #[must_use]
    pub fn new(resolver: &'a RefResolver) -> Self {
        Self {
            resolver,
            active: Vec::new(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if a `$ref` cannot be resolved.
    pub fn convert_ref(
        &mut self,
        doc: &DocId,
        schema: &ReferenceOr<Schema>,
    ) -> Result<SchemaNode, ResolveError> {
        let reference = match schema {
            ReferenceOr::Item(s) => return self.convert(doc, s),
            ReferenceOr::Reference { reference } => reference,
        };

        let key = self.resolver.canonical_key(doc, reference)?;
        if self.active.contains(&key) {
            return Ok(SchemaNode::any());
        }
        let (target_doc, resolved) = self.resolver.resolve(doc, schema)?;
        self.active.push(key);
        let node = self.convert(&target_doc, &resolved);
        self.active.pop();
        node
    }

    fn convert_boxed(
        &mut self,
        doc: &DocId,
        schema: &ReferenceOr<Box<Schema>>,
    ) -> Result<SchemaNode, ResolveError> {
        match schema {
            ReferenceOr::Item(s) => self.convert(doc, s),
            ReferenceOr::Reference { reference } => self.convert_ref(
                doc,
                &ReferenceOr::Reference {
                    reference: reference.clone(),
                },
            ),
        }
    }

    /// # Errors
    ///
    /// Returns an error if a nested `$ref` cannot be resolved.
    pub fn convert(&mut self, doc: &DocId, schema: &Schema) -> Result<SchemaNode, ResolveError> {
        let kind = match &schema.schema_kind {
            OaSchemaKind::Type(t) => self.convert_type(doc, t)?,
            OaSchemaKind::AllOf { all_of } => self.merge_all_of(doc, all_of)?,
            OaSchemaKind::OneOf { .. } | OaSchemaKind::AnyOf { .. } | OaSchemaKind::Not { .. } => {
                SchemaKind::Any
            }
            OaSchemaKind::Any(any) => {
                if !any.one_of.is_empty() || !any.any_of.is_empty() || any.not.is_some() {
                    SchemaKind::Any
                } else if !any.all_of.is_empty() {
                    self.merge_all_of(doc, &any.all_of)?
                } else {
                    match any.typ.as_deref() {
                        Some("object") => self.object_kind(
                            doc,
                            &any.properties,
                            &any.required,
                            any.additional_properties.as_ref(),
                        )?,
                        Some("array") => self.array_kind(doc, any.items.as_ref())?,
                        Some("number") => scalar_kind(ScalarType::Number, &any.enumeration),
                        Some("integer") => scalar_kind(ScalarType::Integer, &any.enumeration),
                        Some("boolean") => scalar_kind(ScalarType::Boolean, &any.enumeration),
                        Some("string") => scalar_kind(ScalarType::String, &any.enumeration),
                        Some(_) => SchemaKind::Any,
                        None if !any.properties.is_empty() => self.object_kind(
                            doc,
                            &any.properties,
                            &any.required,
                            any.additional_properties.as_ref(),
                        )?,
                        None if any.items.is_some() => self.array_kind(doc, any.items.as_ref())?,
                        // An untyped schema is treated as a string.
                        None => scalar_kind(ScalarType::String, &any.enumeration),
                    }
                }
            }
        };

        Ok(SchemaNode {
            kind,
            description: schema.schema_data.description.clone(),
            nullable: schema.schema_data.nullable,
        })
    }

    fn convert_type(&mut self, doc: &DocId, t: &Type) -> Result<SchemaKind, ResolveError> {
        Ok(match t {
            Type::String(s) => SchemaKind::Scalar {
                ty: ScalarType::String,
                enumeration: s.enumeration.iter().flatten().map(|v| json!(v)).collect(),
            },
            Type::Number(n) => SchemaKind::Scalar {
                ty: ScalarType::Number,
                enumeration: n.enumeration.iter().flatten().map(|v| json!(v)).collect(),
            },
            Type::Integer(i) => SchemaKind::Scalar {
                ty: ScalarType::Integer,
                enumeration: i.enumeration.iter().flatten().map(|v| json!(v)).collect(),
            },
            Type::Boolean(_) => SchemaKind::Scalar {
                ty: ScalarType::Boolean,
                enumeration: Vec::new(),
            },
            Type::Array(a) => self.array_kind(doc, a.items.as_ref())?,
            Type::Object(o) => self.object_kind(
                doc,
                &o.properties,
                &o.required,
                o.additional_properties.as_ref(),
            )?,
        })
    }

    fn array_kind(
        &mut self,
        doc: &DocId,
        items: Option<&ReferenceOr<Box<Schema>>>,
    ) -> Result<SchemaKind, ResolveError> {
        let items = match items {
            Some(i) => self.convert_boxed(doc, i)?,
            None => SchemaNode::any(),
        };
        Ok(SchemaKind::Array {
            items: Box::new(items),
        })
    }

    fn object_kind<'p>(
        &mut self,
        doc: &DocId,
        properties: impl IntoIterator<Item = (&'p String, &'p ReferenceOr<Box<Schema>>)>,
        required: &[String],
        additional: Option<&AdditionalProperties>,
    ) -> Result<SchemaKind, ResolveError> {
        let mut fields = Vec::new();
        for (name, prop) in properties {
            fields.push(ObjectField {
                name: name.clone(),
                node: self.convert_boxed(doc, prop)?,
            });
        }
        Ok(SchemaKind::Object {
            fields,
            required: required.to_vec(),
            additional: !matches!(additional, Some(AdditionalProperties::Any(false))),
        })
    }

    /// `allOf` of object schemas merges into one object; anything else is opaque.
    fn merge_all_of(
        &mut self,
        doc: &DocId,
        all_of: &[ReferenceOr<Schema>],
    ) -> Result<SchemaKind, ResolveError> {
        let mut parts = Vec::with_capacity(all_of.len());
        for s in all_of {
            parts.push(self.convert_ref(doc, s)?);
        }
        if parts.len() == 1 {
            return Ok(parts.remove(0).kind);
        }

        let mut merged_fields: Vec<ObjectField> = Vec::new();
        let mut merged_required: Vec<String> = Vec::new();
        let mut merged_additional = true;
        for part in parts {
            let SchemaKind::Object {
                fields,
                required,
                additional,
            } = part.kind
            else {
                return Ok(SchemaKind::Any);
            };
            for f in fields {
                match merged_fields.iter_mut().find(|m| m.name == f.name) {
                    Some(existing) => *existing = f,
                    None => merged_fields.push(f),
                }
            }
            for r in required {
                if !merged_required.contains(&r) {
                    merged_required.push(r);
                }
            }
            merged_additional &= additional;
        }
        Ok(SchemaKind::Object {
            fields: merged_fields,
            required: merged_required,
            additional: merged_additional,
        })
    }
}

fn scalar_kind(ty: ScalarType, enumeration: &[Value]) -> SchemaKind {
    SchemaKind::Scalar {
        ty,
        enumeration: enumeration.iter().filter(|v| !v.is_null()).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn doc() -> DocId {
        DocId::Url(Url::parse("https://specs.local/openapi.yaml").expect("url"))
    }

    fn convert(root: Value, schema: Value) -> SchemaNode {
        let resolver = RefResolver::new(doc(), root);
        let schema: ReferenceOr<Schema> = serde_json::from_value(schema).expect("schema");
        SchemaConverter::new(&resolver)
            .convert_ref(&doc(), &schema)
            .expect("convert")
    }

    #[test]
    fn missing_type_defaults_to_string() {
        let node = convert(json!({}), json!({"description": "free text"}));
        assert_eq!(node.kind, SchemaNode::string().kind);
        assert_eq!(node.description.as_deref(), Some("free text"));
    }

    #[test]
    fn object_with_nested_ref_is_resolved() {
        let root = json!({"components": {"schemas": {
            "Wheel": {"type": "object", "properties": {"size": {"type": "integer"}}, "required": ["size"]}
        }}});
        let node = convert(
            root,
            json!({
                "type": "object",
                "required": ["make"],
                "properties": {
                    "make": {"type": "string", "enum": ["Yamaha", "Honda"]},
                    "wheels": {"type": "array", "items": {"$ref": "#/components/schemas/Wheel"}}
                }
            }),
        );
        let (fields, required) = node.object_fields().expect("object");
        assert_eq!(required, ["make".to_string()]);
        assert_eq!(fields.len(), 2);
        let SchemaKind::Array { items } = &fields[1].node.kind else {
            panic!("wheels should be an array");
        };
        assert!(items.object_fields().is_some());
    }

    #[test]
    fn recursive_schema_is_cut_to_any() {
        let root = json!({"components": {"schemas": {
            "Node": {"type": "object", "properties": {"child": {"$ref": "#/components/schemas/Node"}}}
        }}});
        let node = convert(root, json!({"$ref": "#/components/schemas/Node"}));
        let (fields, _) = node.object_fields().expect("object");
        assert_eq!(fields[0].node.kind, SchemaKind::Any);
    }

    #[test]
    fn all_of_objects_are_merged() {
        let node = convert(
            json!({}),
            json!({"allOf": [
                {"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]},
                {"type": "object", "properties": {"make": {"type": "string"}}}
            ]}),
        );
        let (fields, required) = node.object_fields().expect("object");
        let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["id", "make"]);
        assert_eq!(required, ["id".to_string()]);
    }

    #[test]
    fn one_of_is_opaque() {
        let node = convert(
            json!({}),
            json!({"oneOf": [{"type": "string"}, {"type": "integer"}]}),
        );
        assert_eq!(node.kind, SchemaKind::Any);
        assert_eq!(node.to_json_schema(), json!({}));
    }

    #[test]
    fn json_schema_rendering_is_stable() {
        let node = convert(
            json!({}),
            json!({"type": "object", "required": ["id"], "additionalProperties": false,
                   "properties": {"id": {"type": "string", "nullable": true}}}),
        );
        assert_eq!(
            node.to_json_schema(),
            json!({
                "type": "object",
                "properties": {"id": {"type": ["string", "null"]}},
                "required": ["id"],
                "additionalProperties": false
            })
        );
    }

    #[test]
    fn validator_reports_nested_paths() {
        let node = convert(
            json!({}),
            json!({"type": "object", "required": ["make"], "properties": {
                "make": {"type": "string", "enum": ["Yamaha"]},
                "year": {"type": "integer"},
                "tags": {"type": "array", "items": {"type": "string"}}
            }}),
        );
        assert!(node.validate(&json!({"make": "Yamaha", "year": 2020.0}), "").is_empty());
        let errs = node.validate(&json!({"make": "Ducati", "year": "new", "tags": ["a", 1]}), "bike");
        assert_eq!(errs, ["bike.make", "bike.year", "bike.tags[1]"]);
        assert_eq!(node.validate(&json!({}), ""), ["make"]);
    }
}
