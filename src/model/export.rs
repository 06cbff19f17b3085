//! Model Rendering
//!
//! Renders a [`Model`] in one of the supported `schema=` formats:
//!
//! - `xRegistry-json` (default, also `xRegistry-json/1.0`): the model
//!   document with core attributes included
//! - `jsonschema` (also `jsonschema/draft-07`): a JSON Schema for the
//!   Registry document with one definition per Group and Resource type

use serde_json::{json, Map, Value};

use super::{AttrKind, Attributes, Model, ScalarType};
use crate::error::{RegistryError, Result};

pub const XREGISTRY_JSON: &str = "xRegistry-json";
pub const JSON_SCHEMA: &str = "jsonschema";

const DRAFT_07: &str = "http://json-schema.org/draft-07/schema#";

/// Render `model` in the named format, defaulting to `xRegistry-json`
pub fn render_model(model: &Model, schema: Option<&str>) -> Result<Value> {
    match schema.unwrap_or(XREGISTRY_JSON) {
        "xRegistry-json" | "xRegistry-json/1.0" => Ok(model.to_json()),
        "jsonschema" | "jsonschema/draft-07" => Ok(json_schema(model)),
        other => Err(RegistryError::bad_request(format!(
            "Unsupported schema format: {}",
            other
        ))),
    }
}

// =============================================================================
// JSON Schema
// =============================================================================

fn json_schema(model: &Model) -> Value {
    let mut definitions = Map::new();

    let mut registry_props = Map::new();
    for group in &model.groups {
        registry_props.insert(group.plural.clone(), collection_of(&group.plural));

        let mut group_props = Map::new();
        for resource in &group.resources {
            let rkey = format!("{}_{}", group.plural, resource.plural);
            let version_key = format!("{}_version", rkey);
            let meta_key = format!("{}_meta", rkey);
            group_props.insert(resource.plural.clone(), collection_of(&rkey));

            let mut resource_props = Map::new();
            resource_props.insert("meta".into(), reference(&meta_key));
            resource_props.insert("versions".into(), collection_of(&version_key));
            let mut resource_schema = object_schema(&[resource.version_schema(), resource.resource_schema()], resource_props);
            if let Some(desc) = &resource.description {
                resource_schema.insert("description".into(), Value::from(desc.clone()));
            }

            definitions.insert(rkey, Value::Object(resource_schema));
            definitions.insert(
                version_key,
                Value::Object(object_schema(&[resource.version_schema()], Map::new())),
            );
            definitions.insert(
                meta_key,
                Value::Object(object_schema(&[resource.meta_schema()], Map::new())),
            );
        }

        let mut group_schema = object_schema(&[group.schema()], group_props);
        if let Some(desc) = &group.description {
            group_schema.insert("description".into(), Value::from(desc.clone()));
        }
        definitions.insert(group.plural.clone(), Value::Object(group_schema));
    }

    let mut root = Map::new();
    root.insert("$schema".into(), Value::from(DRAFT_07));
    root.extend(object_schema(&[model.registry_schema()], registry_props));
    root.insert("definitions".into(), Value::Object(definitions));
    Value::Object(root)
}

fn reference(key: &str) -> Value {
    json!({ "$ref": format!("#/definitions/{}", key) })
}

/// Entity collection: an object keyed by id
fn collection_of(key: &str) -> Value {
    json!({ "type": "object", "additionalProperties": reference(key) })
}

/// Object schema for one or more attribute scopes rendered as a single
/// object, plus extra (collection) properties
fn object_schema(scopes: &[&Attributes], extra: Map<String, Value>) -> Map<String, Value> {
    let mut properties = Map::new();
    let mut required = Vec::new();
    let mut conditions = Vec::new();
    let mut wildcard = None;

    for attrs in scopes {
        for attr in attrs.iter() {
            if attr.is_wildcard() {
                wildcard = Some(attribute_schema(&attr.kind, attr.enum_values.as_ref(), attr.strict));
                continue;
            }
            let mut schema = attribute_schema(&attr.kind, attr.enum_values.as_ref(), attr.strict);
            if let (Some(desc), Value::Object(obj)) = (&attr.description, &mut schema) {
                obj.insert("description".into(), Value::from(desc.clone()));
            }
            properties.insert(attr.name.clone(), schema);
            if attr.flags.client_required {
                required.push(Value::from(attr.name.clone()));
            }
            for branch in &attr.if_values {
                let trigger = trigger_value(&attr.kind, &branch.value);
                let then = object_schema(&[&branch.siblings], Map::new());
                conditions.push(json!({
                    "if": {
                        "properties": { attr.name.clone(): { "const": trigger } },
                        "required": [attr.name.clone()]
                    },
                    "then": Value::Object(then)
                }));
            }
        }
    }
    properties.extend(extra);

    let mut out = Map::new();
    out.insert("type".into(), Value::from("object"));
    out.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        out.insert("required".into(), Value::Array(required));
    }
    match wildcard {
        Some(schema) => {
            out.insert("additionalProperties".into(), schema);
        }
        // Conditional siblings live outside "properties", so the object
        // can only be closed when there are none
        None if conditions.is_empty() => {
            out.insert("additionalProperties".into(), Value::Bool(false));
        }
        None => {}
    }
    if !conditions.is_empty() {
        out.insert("allOf".into(), Value::Array(conditions));
    }
    out
}

fn attribute_schema(kind: &AttrKind, enum_values: Option<&Vec<Value>>, strict: bool) -> Value {
    let mut schema = match kind {
        AttrKind::Scalar(scalar) => scalar_schema(*scalar),
        AttrKind::Object(attrs) => Value::Object(object_schema(&[attrs], Map::new())),
        AttrKind::Map(item) => json!({
            "type": "object",
            "additionalProperties": attribute_schema(item, None, true)
        }),
        AttrKind::Array(item) => json!({
            "type": "array",
            "items": attribute_schema(item, None, true)
        }),
    };
    if let (Some(values), true, Value::Object(obj)) = (enum_values, strict, &mut schema) {
        obj.insert("enum".into(), Value::Array(values.clone()));
    }
    schema
}

fn scalar_schema(scalar: ScalarType) -> Value {
    match scalar {
        ScalarType::String => json!({ "type": "string" }),
        ScalarType::Boolean => json!({ "type": "boolean" }),
        ScalarType::Decimal => json!({ "type": "number" }),
        ScalarType::Integer => json!({ "type": "integer" }),
        ScalarType::UInteger => json!({ "type": "integer", "minimum": 0 }),
        ScalarType::Timestamp => json!({ "type": "string", "format": "date-time" }),
        ScalarType::Uri | ScalarType::Url => json!({ "type": "string", "format": "uri" }),
        ScalarType::UriReference => json!({ "type": "string", "format": "uri-reference" }),
        ScalarType::UriTemplate => json!({ "type": "string", "format": "uri-template" }),
        ScalarType::Any => json!({}),
    }
}

/// IfValues keys are strings; the schema compares typed values
fn trigger_value(kind: &AttrKind, key: &str) -> Value {
    match kind {
        AttrKind::Scalar(ScalarType::Boolean) => key.parse::<bool>().map(Value::from).unwrap_or_else(|_| Value::from(key)),
        AttrKind::Scalar(ScalarType::Integer | ScalarType::UInteger | ScalarType::Decimal) => {
            serde_json::from_str::<serde_json::Number>(key)
                .map(Value::Number)
                .unwrap_or_else(|_| Value::from(key))
        }
        _ => Value::from(key),
    }
}
