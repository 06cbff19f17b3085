//! Header translation
//!
//! Raw (non-`$structure`) Resource and Version requests carry their
//! attributes as `xRegistry-<attr>` headers, map members as
//! `xRegistry-<attr>-<key>`, and the document itself as the body.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Number, Value};

use crate::content::ContentNames;
use crate::error::Result;
use crate::model::{AttrKind, Attributes, ScalarType};

pub const PREFIX: &str = "xRegistry-";

/// Render attributes as headers; nested objects beyond map members are skipped
pub fn to_headers(props: &Map<String, Value>) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for (name, value) in props {
        match value {
            Value::Null => {}
            Value::Object(members) => {
                for (key, member) in members {
                    if let Some(text) = scalar_text(member) {
                        headers.push((format!("{}{}-{}", PREFIX, name, key), text));
                    }
                }
            }
            other => {
                if let Some(text) = scalar_text(other) {
                    headers.push((format!("{}{}", PREFIX, name), text));
                }
            }
        }
    }
    headers
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        _ => None,
    }
}

/// Build an attribute document from `xRegistry-*` headers, coercing
/// values by the declared attribute types. A value of `null` deletes.
pub fn from_headers(headers: &[(String, String)], attrs: &Attributes) -> Map<String, Value> {
    let mut doc = Map::new();
    for (name, raw) in headers {
        let Some(rest) = strip_prefix(name) else {
            continue;
        };
        let rest = rest.to_ascii_lowercase();
        let (attr_name, member) = match rest.split_once('-') {
            Some((attr, key)) => (attr.to_string(), Some(key.to_string())),
            None => (rest.clone(), None),
        };
        let kind = attrs.get(&attr_name).map(|a| &a.kind);

        match member {
            Some(key) => {
                let item = match kind {
                    Some(AttrKind::Map(item)) => Some(item.as_ref()),
                    _ => None,
                };
                let entry = doc
                    .entry(attr_name)
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(map) = entry {
                    map.insert(key, coerce(raw, item));
                }
            }
            None => {
                doc.insert(attr_name, coerce(raw, kind));
            }
        }
    }
    doc
}

fn strip_prefix(name: &str) -> Option<&str> {
    let head = name.get(..PREFIX.len())?;
    head.eq_ignore_ascii_case(PREFIX).then(|| &name[PREFIX.len()..])
}

fn coerce(raw: &str, kind: Option<&AttrKind>) -> Value {
    if raw == "null" {
        return Value::Null;
    }
    let parsed = match kind {
        Some(AttrKind::Scalar(ScalarType::Boolean)) => raw.parse::<bool>().ok().map(Value::Bool),
        Some(AttrKind::Scalar(ScalarType::Integer)) => raw.parse::<i64>().ok().map(Value::from),
        Some(AttrKind::Scalar(ScalarType::UInteger)) => raw.parse::<u64>().ok().map(Value::from),
        Some(AttrKind::Scalar(ScalarType::Decimal)) => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        _ => None,
    };
    // Unparseable values stay strings so validation reports the type
    parsed.unwrap_or_else(|| Value::from(raw))
}

/// Structured document for a raw write: headers plus the body as the
/// base64 channel and `Content-Type` as `contenttype`
pub fn document_from_raw(
    headers: &[(String, String)],
    body: &[u8],
    names: &ContentNames,
    attrs: &Attributes,
) -> Result<Map<String, Value>> {
    let mut doc = from_headers(headers, attrs);
    let external = [&names.url, &names.proxy_url]
        .iter()
        .any(|n| doc.get(n.as_str()).is_some_and(|v| !v.is_null()));
    if !external {
        doc.insert(names.base64.clone(), Value::from(STANDARD.encode(body)));
    }
    if let Some((_, ct)) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
    {
        doc.insert("contenttype".into(), Value::from(ct.clone()));
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs() -> Attributes {
        Attributes::parse(
            json!({
                "count": { "type": "uinteger" },
                "enabled": { "type": "boolean" },
                "labels": { "type": "map", "item": { "type": "string" } },
                "limits": { "type": "map", "item": { "type": "integer" } }
            })
            .as_object()
            .unwrap(),
            "",
        )
        .unwrap()
    }

    fn h(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_to_headers_flattens_maps() {
        let props = json!({ "name": "n", "epoch": 2, "labels": { "env": "prod" }, "gone": null });
        let headers = to_headers(props.as_object().unwrap());
        assert_eq!(
            headers,
            h(&[("xRegistry-name", "n"), ("xRegistry-epoch", "2"), ("xRegistry-labels-env", "prod")])
        );
    }

    #[test]
    fn test_from_headers_coerces_types() {
        let doc = from_headers(
            &h(&[
                ("xregistry-count", "5"),
                ("xRegistry-enabled", "true"),
                ("xRegistry-labels-Env", "prod"),
                ("xRegistry-limits-max", "10"),
                ("xRegistry-description", "null"),
                ("Content-Length", "3"),
            ]),
            &attrs(),
        );
        assert_eq!(
            Value::Object(doc),
            json!({
                "count": 5,
                "enabled": true,
                "labels": { "env": "prod" },
                "limits": { "max": 10 },
                "description": null
            })
        );
    }

    #[test]
    fn test_unparseable_values_stay_strings() {
        let doc = from_headers(&h(&[("xRegistry-count", "-1")]), &attrs());
        assert_eq!(doc["count"], "-1");
    }

    #[test]
    fn test_document_from_raw() {
        let names = ContentNames::new("file");
        let doc = document_from_raw(
            &h(&[("xRegistry-name", "n"), ("Content-Type", "text/plain")]),
            b"hello",
            &names,
            &attrs(),
        )
        .unwrap();
        assert_eq!(doc["filebase64"], "aGVsbG8=");
        assert_eq!(doc["contenttype"], "text/plain");

        let doc = document_from_raw(&h(&[("xRegistry-fileurl", "http://x")]), b"", &names, &attrs()).unwrap();
        assert!(doc.get("filebase64").is_none());
    }
}
