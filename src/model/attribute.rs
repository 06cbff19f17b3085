//! Attribute definitions
//!
//! An [`Attribute`] is a closed, tagged description of one named property:
//! a scalar kind, an object with its own ordered attribute set, or a
//! homomorphic map/array with a single item kind. Conditional sibling
//! attributes ("ifvalues") hang off the attribute that triggers them.

use serde_json::{Map, Value};
use std::fmt;

use crate::error::{RegistryError, Result};
use crate::validate::{check_kind, display_value};

/// Scalar attribute types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    String,
    Boolean,
    Decimal,
    Integer,
    UInteger,
    Timestamp,
    Uri,
    UriReference,
    UriTemplate,
    Url,
    Any,
}

/// Shape of an attribute's value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrKind {
    Scalar(ScalarType),
    Object(Attributes),
    Map(Box<AttrKind>),
    Array(Box<AttrKind>),
}

impl AttrKind {
    /// Parse the `type` name used in model documents
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrKind::Scalar(ScalarType::String) => "string",
            AttrKind::Scalar(ScalarType::Boolean) => "boolean",
            AttrKind::Scalar(ScalarType::Decimal) => "decimal",
            AttrKind::Scalar(ScalarType::Integer) => "integer",
            AttrKind::Scalar(ScalarType::UInteger) => "uinteger",
            AttrKind::Scalar(ScalarType::Timestamp) => "timestamp",
            AttrKind::Scalar(ScalarType::Uri) => "uri",
            AttrKind::Scalar(ScalarType::UriReference) => "urireference",
            AttrKind::Scalar(ScalarType::UriTemplate) => "uritemplate",
            AttrKind::Scalar(ScalarType::Url) => "url",
            AttrKind::Scalar(ScalarType::Any) => "any",
            AttrKind::Object(_) => "object",
            AttrKind::Map(_) => "map",
            AttrKind::Array(_) => "array",
        }
    }

    /// Type name with its article, as used in validation errors
    pub fn described(&self) -> String {
        let name = self.type_name();
        match name.as_bytes()[0] {
            b'a' | b'e' | b'i' | b'o' => format!("an {}", name),
            _ => format!("a {}", name),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, AttrKind::Scalar(_))
    }

    /// Parse a `type` + nested `attributes`/`item` definition
    fn parse(def: &Map<String, Value>, path: &str) -> Result<Self> {
        let type_name = def
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| model_error(path, "is missing a \"type\""))?;

        let scalar = match type_name {
            "string" => Some(ScalarType::String),
            "boolean" => Some(ScalarType::Boolean),
            "decimal" => Some(ScalarType::Decimal),
            "integer" => Some(ScalarType::Integer),
            "uinteger" => Some(ScalarType::UInteger),
            "timestamp" => Some(ScalarType::Timestamp),
            "uri" => Some(ScalarType::Uri),
            "urireference" => Some(ScalarType::UriReference),
            "uritemplate" => Some(ScalarType::UriTemplate),
            "url" => Some(ScalarType::Url),
            "any" => Some(ScalarType::Any),
            "object" | "map" | "array" => None,
            other => {
                return Err(model_error(path, &format!("has an invalid type: {}", other)));
            }
        };

        if let Some(scalar) = scalar {
            if def.contains_key("attributes") || def.contains_key("item") {
                return Err(model_error(path, "is a scalar and can't have \"attributes\" or \"item\""));
            }
            return Ok(AttrKind::Scalar(scalar));
        }

        match type_name {
            "object" => {
                if def.contains_key("item") {
                    return Err(model_error(path, "is an object and can't have an \"item\""));
                }
                let attrs = match def.get("attributes") {
                    Some(Value::Object(attrs)) => Attributes::parse(attrs, path)?,
                    Some(Value::Null) | None => Attributes::default(),
                    Some(_) => return Err(model_error(path, "has non-object \"attributes\"")),
                };
                Ok(AttrKind::Object(attrs))
            }
            _ => {
                let item = match def.get("item") {
                    Some(Value::Object(item)) => item,
                    _ => return Err(model_error(path, &format!("is a {} and must have an \"item\"", type_name))),
                };
                let item_path = format!("{}.item", path);
                let kind = Box::new(AttrKind::parse(item, &item_path)?);
                if type_name == "map" {
                    Ok(AttrKind::Map(kind))
                } else {
                    Ok(AttrKind::Array(kind))
                }
            }
        }
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("type".into(), Value::from(self.type_name()));
        match self {
            AttrKind::Object(attrs) => {
                out.insert("attributes".into(), Value::Object(attrs.to_json()));
            }
            AttrKind::Map(item) | AttrKind::Array(item) => {
                out.insert("item".into(), Value::Object(item.to_json()));
            }
            AttrKind::Scalar(_) => {}
        }
        out
    }
}

impl fmt::Display for AttrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Attribute flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrFlags {
    /// Client values are ignored, the server owns the value
    pub readonly: bool,
    /// Once set the value can't change
    pub immutable: bool,
    /// Clients must supply the attribute
    pub client_required: bool,
    /// The server always emits the attribute
    pub server_required: bool,
}

/// A conditional sibling bundle activated when the owning attribute
/// equals `value` (compared in its stringified form)
#[derive(Debug, Clone, PartialEq)]
pub struct IfValue {
    pub value: String,
    pub siblings: Attributes,
}

/// A single attribute definition
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub kind: AttrKind,
    pub description: Option<String>,
    pub flags: AttrFlags,
    pub enum_values: Option<Vec<Value>>,
    /// Strict enums reject values outside the list
    pub strict: bool,
    pub if_values: Vec<IfValue>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            flags: AttrFlags::default(),
            enum_values: None,
            strict: true,
            if_values: Vec::new(),
        }
    }

    pub fn scalar(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self::new(name, AttrKind::Scalar(scalar))
    }

    pub fn readonly(mut self) -> Self {
        self.flags.readonly = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.flags.immutable = true;
        self
    }

    pub fn server_required(mut self) -> Self {
        self.flags.server_required = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.flags.client_required = true;
        self.flags.server_required = true;
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>, strict: bool) -> Self {
        self.enum_values = Some(values);
        self.strict = strict;
        self
    }

    pub fn with_if_value(mut self, value: impl Into<String>, siblings: Attributes) -> Self {
        self.if_values.push(IfValue {
            value: value.into(),
            siblings,
        });
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.name == "*"
    }

    /// Sibling set activated by `value`, if any
    pub fn activated_by(&self, value: &Value) -> Option<&Attributes> {
        if self.if_values.is_empty() {
            return None;
        }
        let key = stringify(value)?;
        self.if_values
            .iter()
            .find(|iv| iv.value == key)
            .map(|iv| &iv.siblings)
    }

    fn parse(name: &str, def: &Value, path: &str) -> Result<Self> {
        let def = def
            .as_object()
            .ok_or_else(|| model_error(path, "must be an object"))?;

        let kind = AttrKind::parse(def, path)?;
        let flag = |key: &str| def.get(key).and_then(Value::as_bool).unwrap_or(false);

        let required = flag("required");
        let flags = AttrFlags {
            readonly: flag("readonly"),
            immutable: flag("immutable"),
            client_required: required || flag("clientrequired"),
            server_required: required || flag("serverrequired"),
        };
        if flags.client_required && !flags.server_required {
            return Err(model_error(path, "has \"clientrequired\" but not \"serverrequired\""));
        }

        let enum_values = match def.get("enum") {
            None | Some(Value::Null) => None,
            Some(Value::Array(values)) => {
                if !kind.is_scalar() || kind == AttrKind::Scalar(ScalarType::Any) {
                    return Err(model_error(path, "can only use \"enum\" on scalar types"));
                }
                if values.is_empty() {
                    return Err(model_error(path, "has an empty \"enum\""));
                }
                for value in values {
                    if check_kind(&kind, value).is_err() {
                        return Err(model_error(
                            path,
                            &format!("has an \"enum\" value ({}) that isn't {}", display_value(value), kind.described()),
                        ));
                    }
                }
                Some(values.clone())
            }
            Some(_) => return Err(model_error(path, "has a non-array \"enum\"")),
        };

        let mut if_values = Vec::new();
        if let Some(ifv) = def.get("ifvalues") {
            let ifv = ifv
                .as_object()
                .ok_or_else(|| model_error(path, "has a non-object \"ifvalues\""))?;
            if !ifv.is_empty() && !kind.is_scalar() {
                return Err(model_error(path, "can only use \"ifvalues\" on scalar types"));
            }
            for (value, bundle) in ifv {
                if value.is_empty() {
                    return Err(model_error(path, "has an empty \"ifvalues\" key"));
                }
                let branch_path = format!("{}.ifvalues.{}", path, value);
                let siblings = match bundle.get("siblingattributes") {
                    Some(Value::Object(attrs)) => Attributes::parse(attrs, &branch_path)?,
                    _ => Attributes::default(),
                };
                if_values.push(IfValue {
                    value: value.clone(),
                    siblings,
                });
            }
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            description: def
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
            flags,
            enum_values,
            strict: def.get("strict").and_then(Value::as_bool).unwrap_or(true),
            if_values,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("name".into(), Value::from(self.name.clone()));
        out.extend(self.kind.to_json());
        if let Some(desc) = &self.description {
            out.insert("description".into(), Value::from(desc.clone()));
        }
        if let Some(values) = &self.enum_values {
            out.insert("enum".into(), Value::Array(values.clone()));
            if !self.strict {
                out.insert("strict".into(), Value::Bool(false));
            }
        }
        if self.flags.readonly {
            out.insert("readonly".into(), Value::Bool(true));
        }
        if self.flags.immutable {
            out.insert("immutable".into(), Value::Bool(true));
        }
        if self.flags.client_required {
            out.insert("clientrequired".into(), Value::Bool(true));
        }
        if self.flags.server_required {
            out.insert("serverrequired".into(), Value::Bool(true));
        }
        if !self.if_values.is_empty() {
            let mut ifv = Map::new();
            for branch in &self.if_values {
                let mut bundle = Map::new();
                bundle.insert(
                    "siblingattributes".into(),
                    Value::Object(branch.siblings.to_json()),
                );
                ifv.insert(branch.value.clone(), Value::Object(bundle));
            }
            out.insert("ifvalues".into(), Value::Object(ifv));
        }
        Value::Object(out)
    }
}

/// Ordered attribute set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(Vec<Attribute>);

impl Attributes {
    pub fn new(attrs: Vec<Attribute>) -> Self {
        Self(attrs)
    }

    /// Parse a model `attributes` object, keeping document order
    pub fn parse(defs: &Map<String, Value>, path: &str) -> Result<Self> {
        let mut attrs = Vec::with_capacity(defs.len());
        for (name, def) in defs {
            let attr_path = join_path(path, name);
            if let Some(declared) = def.get("name").and_then(Value::as_str) {
                if declared != name {
                    return Err(model_error(
                        &attr_path,
                        &format!("has a \"name\" of \"{}\" that doesn't match its key", declared),
                    ));
                }
            }
            attrs.push(Attribute::parse(name, def, &attr_path)?);
        }
        Ok(Self(attrs))
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.0.iter().find(|a| a.name == name)
    }

    pub fn wildcard(&self) -> Option<&Attribute> {
        self.get("*")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert or replace by name, keeping the original position on replace
    pub fn upsert(&mut self, attr: Attribute) {
        match self.0.iter_mut().find(|a| a.name == attr.name) {
            Some(existing) => *existing = attr,
            None => self.0.push(attr),
        }
    }

    pub fn push(&mut self, attr: Attribute) {
        self.0.push(attr);
    }

    pub fn to_json(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|a| (a.name.clone(), a.to_json()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = &'a Attribute;
    type IntoIter = std::slice::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// IfValues keys compare against the scalar's string form
pub fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn model_error(path: &str, what: &str) -> RegistryError {
    RegistryError::bad_request(format!("Model attribute \"{}\" {}", path, what))
}
