//! Document Validator
//!
//! Walks an input document against an attribute set and produces a
//! normalized property map or the first error found. The walk is a pure
//! function of the attribute set, the existing snapshot and the input.
//!
//! Per object level:
//! 1. `null` members are dropped (a `null` deletes the attribute)
//! 2. keys matching declared attributes are checked in document order;
//!    a matching `ifvalues` branch makes its siblings legal, and the
//!    pass repeats until nothing new activates
//! 3. leftover keys go to the `*` wildcard or are reported as invalid
//!    extensions
//! 4. client-required attributes must be present

use chrono::DateTime;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

use crate::error::{RegistryError, Result};
use crate::model::core::SERVER_MANAGED;
use crate::model::{join_path, AttrKind, Attribute, Attributes, ScalarType};

/// How an input document combines with the existing entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// PUT: the document is the complete new set of attributes
    #[default]
    Replace,
    /// PATCH: absent attributes are untouched, `null` deletes
    Merge,
}

/// Validates documents for one entity level
#[derive(Debug, Clone)]
pub struct Validator<'a> {
    attrs: &'a Attributes,
    ignored: HashSet<String>,
}

impl<'a> Validator<'a> {
    pub fn new(attrs: &'a Attributes) -> Self {
        let ignored = attrs
            .iter()
            .filter(|a| a.flags.readonly)
            .map(|a| a.name.clone())
            .chain(SERVER_MANAGED.iter().map(|s| s.to_string()))
            .collect();
        Self { attrs, ignored }
    }

    /// Also drop these keys from input before validation (identity
    /// attributes and nested collections handled by the caller)
    pub fn ignoring<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn attributes(&self) -> &Attributes {
        self.attrs
    }

    /// An identity attribute repeated in a body must match the entity's id
    pub fn check_identity(doc: &Map<String, Value>, attr: &str, expected: &str) -> Result<()> {
        match doc.get(attr) {
            None | Some(Value::Null) => Ok(()),
            Some(Value::String(got)) if got == expected => Ok(()),
            Some(got) => Err(RegistryError::identity(format!(
                "The \"{}\" attribute must be set to \"{}\", not \"{}\"",
                attr,
                expected,
                display_value(got)
            ))),
        }
    }

    /// An `epoch` in the body must match the stored one; omitting it opts out
    pub fn check_epoch(doc: &Map<String, Value>, current: Option<u64>, skip: bool) -> Result<()> {
        if skip {
            return Ok(());
        }
        let (Some(got), Some(current)) = (doc.get("epoch"), current) else {
            return Ok(());
        };
        if got.is_null() {
            return Ok(());
        }
        match got.as_u64() {
            Some(epoch) if epoch == current => Ok(()),
            Some(_) => Err(RegistryError::epoch_mismatch(got, current)),
            None => Err(RegistryError::schema(format!(
                "Attribute \"epoch\" must be {}",
                AttrKind::Scalar(ScalarType::UInteger).described()
            ))),
        }
    }

    /// Combine `input` with the `existing` snapshot per `mode`, validate
    /// and return the normalized user attributes
    pub fn admit(
        &self,
        existing: Option<&Map<String, Value>>,
        input: &Map<String, Value>,
        mode: WriteMode,
    ) -> Result<Map<String, Value>> {
        let mut doc = match (mode, existing) {
            (WriteMode::Merge, Some(existing)) => {
                let mut base = self.strip(existing);
                merge_level(Some(self.attrs), &mut base, &self.strip(input));
                base
            }
            _ => self.strip(input),
        };

        self.validate(&mut doc)?;

        if let Some(existing) = existing {
            for attr in self.attrs.iter().filter(|a| a.flags.immutable) {
                if self.ignored.contains(&attr.name) {
                    continue;
                }
                if let Some(old) = existing.get(&attr.name) {
                    if doc.get(&attr.name) != Some(old) {
                        return Err(RegistryError::schema(format!(
                            "Attribute \"{}\" is immutable",
                            attr.name
                        )));
                    }
                }
            }
        }
        Ok(doc)
    }

    /// Validate and normalize an already-combined document in place
    pub fn validate(&self, doc: &mut Map<String, Value>) -> Result<()> {
        validate_level(self.attrs, doc, "")
    }

    /// Type-check one top-level member ahead of `admit`; undeclared,
    /// ignored and `null` members pass
    pub fn check_member(&self, key: &str, value: &Value) -> Result<()> {
        if value.is_null() || self.ignored.contains(key) {
            return Ok(());
        }
        match self.attrs.get(key) {
            Some(attr) if !attr.is_wildcard() => validate_attribute(attr, &mut value.clone(), key),
            _ => Ok(()),
        }
    }

    fn strip(&self, doc: &Map<String, Value>) -> Map<String, Value> {
        doc.iter()
            .filter(|(k, _)| !self.ignored.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Values as they appear inside error messages: strings unquoted
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Remove `key` keeping the remaining keys in document order
pub fn take_key(doc: &mut Map<String, Value>, key: &str) -> Option<Value> {
    let value = doc.get(key).cloned()?;
    doc.retain(|k, _| k != key);
    Some(value)
}

/// Find a definition for `name` among declared attributes and any
/// ifvalues siblings beneath them
fn lookup<'a>(attrs: &'a Attributes, name: &str) -> Option<&'a Attribute> {
    if let Some(attr) = attrs.get(name) {
        return Some(attr);
    }
    for attr in attrs {
        for branch in &attr.if_values {
            if let Some(found) = lookup(&branch.siblings, name) {
                return Some(found);
            }
        }
    }
    attrs.wildcard()
}

/// Recursive PATCH merge: `null` deletes, objects and maps merge member-wise
fn merge_level(attrs: Option<&Attributes>, base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            take_key(base, key);
            continue;
        }
        let kind = attrs.and_then(|a| lookup(a, key)).map(|a| &a.kind);
        match (kind, base.get_mut(key), value) {
            (Some(kind), Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_kind(kind, existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_kind(kind: &AttrKind, existing: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    match kind {
        AttrKind::Object(children) => merge_level(Some(children), existing, incoming),
        AttrKind::Map(item) => {
            for (key, value) in incoming {
                if value.is_null() {
                    take_key(existing, key);
                    continue;
                }
                match (item.as_ref(), existing.get_mut(key), value) {
                    (AttrKind::Object(_) | AttrKind::Map(_), Some(Value::Object(old)), Value::Object(new)) => {
                        merge_kind(item, old, new);
                    }
                    _ => {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        _ => {
            *existing = incoming.clone();
        }
    }
}

fn validate_level(attrs: &Attributes, obj: &mut Map<String, Value>, path: &str) -> Result<()> {
    obj.retain(|_, v| !v.is_null());

    let mut legal: Vec<&Attribute> = attrs.iter().filter(|a| !a.is_wildcard()).collect();
    let mut done: HashSet<String> = HashSet::new();

    loop {
        let mut activated: Vec<&Attribute> = Vec::new();
        let keys: Vec<String> = obj.keys().cloned().collect();
        for key in keys {
            if done.contains(&key) {
                continue;
            }
            let Some(attr) = legal.iter().find(|a| a.name == key).copied() else {
                continue;
            };
            if let Some(value) = obj.get_mut(&key) {
                validate_attribute(attr, value, &join_path(path, &key))?;
                if let Some(siblings) = attr.activated_by(value) {
                    activated.extend(siblings.iter().filter(|s| !s.is_wildcard()));
                }
            }
            done.insert(key);
        }
        if activated.is_empty() {
            break;
        }
        legal.extend(activated);
    }

    let wildcard = attrs.wildcard();
    let mut unknown = Vec::new();
    let keys: Vec<String> = obj.keys().filter(|k| !done.contains(*k)).cloned().collect();
    for key in keys {
        let key_path = join_path(path, &key);
        match wildcard {
            Some(wild) => {
                if let Some(value) = obj.get_mut(&key) {
                    validate_attribute(wild, value, &key_path)?;
                }
            }
            None => unknown.push(key_path),
        }
    }
    if !unknown.is_empty() {
        unknown.sort();
        return Err(RegistryError::schema(format!(
            "Invalid extension(s): {}",
            unknown.join(",")
        )));
    }

    for attr in &legal {
        if attr.flags.client_required && !obj.contains_key(&attr.name) {
            return Err(RegistryError::schema(format!(
                "Required property \"{}\" is missing",
                join_path(path, &attr.name)
            )));
        }
    }
    Ok(())
}

fn validate_attribute(attr: &Attribute, value: &mut Value, path: &str) -> Result<()> {
    validate_kind(&attr.kind, value, path)?;

    if let (Some(values), true) = (&attr.enum_values, attr.strict) {
        if !values.iter().any(|v| enum_eq(v, value)) {
            let listed: Vec<String> = values.iter().map(display_value).collect();
            return Err(RegistryError::schema(format!(
                "Attribute \"{}\"({}) must be one of the enum values: {}",
                path,
                display_value(value),
                listed.join(", ")
            )));
        }
    }
    Ok(())
}

/// Numeric enum entries compare by value, so 1 matches 1.0
fn enum_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Type check alone, leaving `value` untouched
pub(crate) fn check_kind(kind: &AttrKind, value: &Value) -> Result<()> {
    validate_kind(kind, &mut value.clone(), "")
}

fn validate_kind(kind: &AttrKind, value: &mut Value, path: &str) -> Result<()> {
    let type_error = || {
        RegistryError::schema(format!("Attribute \"{}\" must be {}", path, kind.described()))
    };

    match kind {
        AttrKind::Scalar(scalar) => match scalar {
            ScalarType::Any => Ok(()),
            ScalarType::Boolean => value.is_boolean().then_some(()).ok_or_else(type_error),
            ScalarType::Decimal => value.is_number().then_some(()).ok_or_else(type_error),
            ScalarType::Integer | ScalarType::UInteger => {
                let unsigned = *scalar == ScalarType::UInteger;
                let normalized = whole_number(value, unsigned).ok_or_else(type_error)?;
                *value = Value::Number(normalized);
                Ok(())
            }
            ScalarType::Timestamp => {
                let s = value.as_str().ok_or_else(type_error)?;
                DateTime::parse_from_rfc3339(s).map_err(|_| {
                    RegistryError::schema(format!("Attribute \"{}\" is a malformed timestamp", path))
                })?;
                Ok(())
            }
            ScalarType::String
            | ScalarType::Uri
            | ScalarType::UriReference
            | ScalarType::UriTemplate
            | ScalarType::Url => value.is_string().then_some(()).ok_or_else(type_error),
        },
        AttrKind::Object(children) => {
            let obj = value.as_object_mut().ok_or_else(type_error)?;
            validate_level(children, obj, path)
        }
        AttrKind::Map(item) => {
            let obj = value.as_object_mut().ok_or_else(type_error)?;
            // A null map entry deletes that key, like a null attribute
            obj.retain(|_, v| !v.is_null());
            for (key, entry) in obj.iter_mut() {
                validate_kind(item, entry, &join_path(path, key))?;
            }
            Ok(())
        }
        AttrKind::Array(item) => {
            let arr = value.as_array_mut().ok_or_else(type_error)?;
            for (i, entry) in arr.iter_mut().enumerate() {
                validate_kind(item, entry, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
    }
}

/// JSON number with no fractional part, normalized to an integer
fn whole_number(value: &Value, unsigned: bool) -> Option<Number> {
    let Value::Number(n) = value else {
        return None;
    };
    if let Some(u) = n.as_u64() {
        return Some(Number::from(u));
    }
    if let Some(i) = n.as_i64() {
        return (!unsigned).then(|| Number::from(i));
    }
    let f = n.as_f64()?;
    if f.fract() != 0.0 || !f.is_finite() {
        return None;
    }
    if unsigned {
        (f >= 0.0 && f <= u64::MAX as f64).then(|| Number::from(f as u64))
    } else {
        (f >= i64::MIN as f64 && f <= i64::MAX as f64).then(|| Number::from(f as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn attrs(defs: Value) -> Attributes {
        Attributes::parse(defs.as_object().unwrap(), "").unwrap()
    }

    fn check(defs: Value, doc: Value) -> Result<Map<String, Value>> {
        let attrs = attrs(defs);
        let mut doc = doc.as_object().unwrap().clone();
        Validator::new(&attrs).validate(&mut doc)?;
        Ok(doc)
    }

    fn err(defs: Value, doc: Value) -> String {
        check(defs, doc).unwrap_err().to_string()
    }

    #[rstest]
    #[case("integer", json!(1.01), "Attribute \"x\" must be an integer")]
    #[case("integer", json!("1"), "Attribute \"x\" must be an integer")]
    #[case("uinteger", json!(-1), "Attribute \"x\" must be a uinteger")]
    #[case("boolean", json!("true"), "Attribute \"x\" must be a boolean")]
    #[case("decimal", json!("1.5"), "Attribute \"x\" must be a decimal")]
    #[case("string", json!(5), "Attribute \"x\" must be a string")]
    #[case("url", json!(true), "Attribute \"x\" must be a url")]
    #[case("uri", json!({}), "Attribute \"x\" must be a uri")]
    #[case("timestamp", json!(5), "Attribute \"x\" must be a timestamp")]
    #[case("timestamp", json!("yesterday"), "Attribute \"x\" is a malformed timestamp")]
    fn test_scalar_type_errors(#[case] type_name: &str, #[case] value: Value, #[case] expected: &str) {
        let defs = json!({ "x": { "type": type_name } });
        assert_eq!(err(defs, json!({ "x": value })), expected);
    }

    #[rstest]
    #[case("object", json!([]), "Attribute \"x\" must be an object")]
    #[case("map", json!("a"), "Attribute \"x\" must be a map")]
    #[case("array", json!({}), "Attribute \"x\" must be an array")]
    fn test_composite_type_errors(#[case] type_name: &str, #[case] value: Value, #[case] expected: &str) {
        let defs = json!({ "x": { "type": type_name, "item": { "type": "string" } } });
        let defs = if type_name == "object" { json!({ "x": { "type": "object" } }) } else { defs };
        assert_eq!(err(defs, json!({ "x": value })), expected);
    }

    #[test]
    fn test_whole_decimal_normalized_to_integer() {
        let doc = check(json!({ "x": { "type": "integer" } }), json!({ "x": 3.0 })).unwrap();
        assert_eq!(doc["x"], json!(3));
    }

    #[test]
    fn test_any_accepts_everything() {
        let doc = check(json!({ "x": { "type": "any" } }), json!({ "x": [1, "a", null] })).unwrap();
        assert_eq!(doc["x"], json!([1, "a", null]));
    }

    #[test]
    fn test_valid_timestamp() {
        assert!(check(json!({ "t": { "type": "timestamp" } }), json!({ "t": "2024-01-01T12:00:00Z" })).is_ok());
    }

    #[test]
    fn test_invalid_extensions_sorted_with_paths() {
        let defs = json!({
            "myobj2": {
                "type": "object",
                "attributes": {
                    "myobj2_1": { "type": "object", "attributes": { "ok": { "type": "string" } } }
                }
            }
        });
        assert_eq!(
            err(defs.clone(), json!({ "myobj2": { "myobj2_1": { "ext": 1 } } })),
            "Invalid extension(s): myobj2.myobj2_1.ext"
        );
        assert_eq!(
            err(defs, json!({ "zoo": 1, "foo": 2 })),
            "Invalid extension(s): foo,zoo"
        );
    }

    #[test]
    fn test_wildcard_accepts_unknown_keys() {
        let defs = json!({
            "obj": {
                "type": "object",
                "attributes": { "*": { "type": "integer" } }
            }
        });
        assert!(check(defs.clone(), json!({ "obj": { "a": 1, "b": 2 } })).is_ok());
        assert_eq!(
            err(defs, json!({ "obj": { "a": "x" } })),
            "Attribute \"obj.a\" must be an integer"
        );
    }

    #[test]
    fn test_strict_and_advisory_enums() {
        let defs = json!({
            "color": { "type": "string", "enum": ["red", "blue"] },
            "size": { "type": "integer", "enum": [1, 2], "strict": false }
        });
        assert_eq!(
            err(defs.clone(), json!({ "color": "green" })),
            "Attribute \"color\"(green) must be one of the enum values: red, blue"
        );
        assert!(check(defs, json!({ "size": 7 })).is_ok());
    }

    #[test]
    fn test_ifvalues_activate_siblings() {
        let defs = json!({
            "kind": {
                "type": "string",
                "ifvalues": {
                    "file": { "siblingattributes": {
                        "path": { "type": "string", "required": true },
                        "mode": {
                            "type": "integer",
                            "ifvalues": { "7": { "siblingattributes": { "owner": { "type": "string" } } } }
                        }
                    } }
                }
            }
        });
        assert!(check(defs.clone(), json!({ "kind": "file", "path": "/a", "mode": 7, "owner": "me" })).is_ok());
        // Siblings only exist when the trigger value matches
        assert_eq!(
            err(defs.clone(), json!({ "kind": "dir", "path": "/a" })),
            "Invalid extension(s): path"
        );
        assert_eq!(
            err(defs.clone(), json!({ "kind": "file" })),
            "Required property \"path\" is missing"
        );
        assert_eq!(
            err(defs, json!({ "kind": "file", "path": "/a", "mode": 6, "owner": "me" })),
            "Invalid extension(s): owner"
        );
    }

    #[test]
    fn test_ifvalues_activation_independent_of_key_order() {
        let defs = json!({
            "kind": {
                "type": "string",
                "ifvalues": { "x": { "siblingattributes": { "extra": { "type": "string" } } } }
            }
        });
        assert!(check(defs, json!({ "extra": "a", "kind": "x" })).is_ok());
    }

    #[test]
    fn test_required_nested_property() {
        let defs = json!({
            "obj": { "type": "object", "attributes": { "must": { "type": "string", "required": true } } }
        });
        assert_eq!(err(defs, json!({ "obj": {} })), "Required property \"obj.must\" is missing");
    }

    #[test]
    fn test_first_error_in_document_order() {
        let defs = json!({ "a": { "type": "integer" }, "b": { "type": "boolean" } });
        assert_eq!(err(defs.clone(), json!({ "b": 1, "a": "x" })), "Attribute \"b\" must be a boolean");
        assert_eq!(err(defs, json!({ "a": "x", "b": 1 })), "Attribute \"a\" must be an integer");
    }

    #[test]
    fn test_array_and_map_item_paths() {
        let defs = json!({
            "arr": { "type": "array", "item": { "type": "integer" } },
            "m": { "type": "map", "item": { "type": "uinteger" } }
        });
        assert_eq!(err(defs.clone(), json!({ "arr": [1, "x"] })), "Attribute \"arr[1]\" must be an integer");
        assert_eq!(err(defs, json!({ "m": { "k": -3 } })), "Attribute \"m.k\" must be a uinteger");
    }

    #[test]
    fn test_null_map_entry_deletes_key() {
        let doc = check(
            json!({ "m": { "type": "map", "item": { "type": "uinteger" } } }),
            json!({ "m": { "asd": null, "keep": 1 } }),
        )
        .unwrap();
        assert_eq!(doc["m"], json!({ "keep": 1 }));
    }

    #[test]
    fn test_identity_check() {
        let doc = json!({ "fileid": "bad id" });
        let err = Validator::check_identity(doc.as_object().unwrap(), "fileid", "f1").unwrap_err();
        assert_eq!(err.to_string(), "The \"fileid\" attribute must be set to \"f1\", not \"bad id\"");
        assert!(Validator::check_identity(&Map::new(), "fileid", "f1").is_ok());
    }

    #[test]
    fn test_epoch_check() {
        let doc = json!({ "epoch": 2 });
        let doc = doc.as_object().unwrap();
        assert!(Validator::check_epoch(doc, Some(2), false).is_ok());
        assert_eq!(
            Validator::check_epoch(doc, Some(3), false).unwrap_err().to_string(),
            "Attribute \"epoch\"(2) doesn't match existing value (3)"
        );
        assert!(Validator::check_epoch(doc, Some(3), true).is_ok());
        assert!(Validator::check_epoch(&Map::new(), Some(3), false).is_ok());
    }

    #[test]
    fn test_admit_merge_and_replace() {
        let attrs = attrs(json!({
            "a": { "type": "string" },
            "b": { "type": "string" },
            "obj": { "type": "object", "attributes": { "x": { "type": "integer" }, "y": { "type": "integer" } } },
            "epoch": { "type": "uinteger" }
        }));
        let validator = Validator::new(&attrs);
        let existing = json!({ "a": "1", "b": "2", "obj": { "x": 1, "y": 2 }, "epoch": 4 });
        let existing = existing.as_object().unwrap();

        let patch = json!({ "a": null, "obj": { "y": null, "x": 5 } });
        let merged = validator.admit(Some(existing), patch.as_object().unwrap(), WriteMode::Merge).unwrap();
        assert_eq!(Value::Object(merged), json!({ "b": "2", "obj": { "x": 5 } }));

        let put = json!({ "a": "new", "epoch": 4 });
        let replaced = validator.admit(Some(existing), put.as_object().unwrap(), WriteMode::Replace).unwrap();
        assert_eq!(Value::Object(replaced), json!({ "a": "new" }));
    }

    #[test]
    fn test_admit_rejects_immutable_change() {
        let attrs = attrs(json!({ "serial": { "type": "string", "immutable": true } }));
        let validator = Validator::new(&attrs);
        let existing = json!({ "serial": "abc" });
        let input = json!({ "serial": "xyz" });
        let err = validator
            .admit(existing.as_object(), input.as_object().unwrap(), WriteMode::Replace)
            .unwrap_err();
        assert_eq!(err.to_string(), "Attribute \"serial\" is immutable");
    }

    #[test]
    fn test_readonly_values_are_dropped() {
        let attrs = attrs(json!({ "self": { "type": "url", "readonly": true } }));
        let input = json!({ "self": 42 });
        let out = Validator::new(&attrs)
            .admit(None, input.as_object().unwrap(), WriteMode::Replace)
            .unwrap();
        assert!(out.is_empty());
    }
}
