//! Core attributes
//!
//! Server-defined attributes present at every level regardless of the
//! user model. User attributes are merged on top of these when a model
//! is built.

use super::attribute::{AttrKind, Attribute, Attributes, ScalarType};
use super::{GroupModel, ResourceModel};

fn string(name: &str) -> Attribute {
    Attribute::scalar(name, ScalarType::String)
}

fn labels() -> Attribute {
    Attribute::new("labels", AttrKind::Map(Box::new(AttrKind::Scalar(ScalarType::String))))
}

fn id_attr(name: &str) -> Attribute {
    string(name).immutable().server_required()
}

/// Attributes every entity carries: self/xid, epoch and timestamps
fn common(id: Option<&str>) -> Vec<Attribute> {
    let mut attrs = Vec::new();
    if let Some(id) = id {
        attrs.push(id_attr(id));
    }
    attrs.push(Attribute::scalar("self", ScalarType::Url).readonly().server_required());
    attrs.push(Attribute::scalar("xid", ScalarType::UriReference).readonly().server_required());
    attrs.push(Attribute::scalar("epoch", ScalarType::UInteger).server_required());
    attrs
}

fn descriptive() -> Vec<Attribute> {
    vec![
        string("name"),
        string("description"),
        Attribute::scalar("documentation", ScalarType::Url),
        labels(),
    ]
}

fn timestamps() -> Vec<Attribute> {
    vec![
        Attribute::scalar("createdat", ScalarType::Timestamp).server_required(),
        Attribute::scalar("modifiedat", ScalarType::Timestamp).server_required(),
    ]
}

/// Read-only `<plural>url` / `<plural>count` pair for a child collection
fn collection(plural: &str) -> Vec<Attribute> {
    vec![
        Attribute::scalar(format!("{}url", plural), ScalarType::Url).readonly(),
        Attribute::scalar(format!("{}count", plural), ScalarType::UInteger).readonly(),
    ]
}

pub fn registry(groups: &[GroupModel]) -> Attributes {
    let mut attrs = vec![
        string("specversion").readonly().server_required(),
        string("registryid").readonly().server_required(),
    ];
    attrs.extend(common(None));
    attrs.extend(descriptive());
    attrs.extend(timestamps());
    attrs.push(Attribute::new("model", AttrKind::Scalar(ScalarType::Any)).readonly());
    for group in groups {
        attrs.extend(collection(&group.plural));
    }
    Attributes::new(attrs)
}

pub fn group(plural_resources: &[ResourceModel], singular: &str) -> Attributes {
    let mut attrs = common(Some(&format!("{}id", singular)));
    attrs.extend(descriptive());
    attrs.extend(timestamps());
    for resource in plural_resources {
        attrs.extend(collection(&resource.plural));
    }
    Attributes::new(attrs)
}

/// Version-level attributes; also rendered on the Resource as the
/// default Version's view
pub fn version(singular: &str, has_document: bool) -> Attributes {
    let mut attrs = vec![id_attr(&format!("{}id", singular)), id_attr("versionid")];
    attrs.extend(common(None));
    attrs.push(Attribute::scalar("isdefault", ScalarType::Boolean).readonly());
    attrs.extend(descriptive());
    attrs.extend(timestamps());
    attrs.push(string("contenttype"));
    if has_document {
        attrs.push(Attribute::scalar(singular, ScalarType::Any));
        attrs.push(string(&format!("{}base64", singular)));
        attrs.push(Attribute::scalar(format!("{}url", singular), ScalarType::Url));
        attrs.push(Attribute::scalar(format!("{}proxyurl", singular), ScalarType::Url));
    }
    Attributes::new(attrs)
}

/// Attributes that live on the Resource itself rather than its Versions
pub fn resource(singular: &str) -> Attributes {
    let mut attrs = vec![id_attr(&format!("{}id", singular))];
    attrs.push(Attribute::scalar("self", ScalarType::Url).readonly().server_required());
    attrs.push(Attribute::scalar("xid", ScalarType::UriReference).readonly().server_required());
    attrs.push(Attribute::scalar("metaurl", ScalarType::Url).readonly());
    attrs.extend(collection("versions"));
    Attributes::new(attrs)
}

pub fn meta(singular: &str) -> Attributes {
    let mut attrs = common(Some(&format!("{}id", singular)));
    attrs.push(Attribute::scalar("xref", ScalarType::UriReference));
    attrs.extend(timestamps());
    attrs.push(Attribute::scalar("readonly", ScalarType::Boolean));
    attrs.push(
        string("compatibility").with_enum(
            ["none", "backward", "backward_transitive", "forward", "forward_transitive", "full", "full_transitive"]
                .iter()
                .map(|s| serde_json::Value::from(*s))
                .collect(),
            false,
        ),
    );
    attrs.push(string("defaultversionid"));
    attrs.push(Attribute::scalar("defaultversionurl", ScalarType::Url).readonly());
    attrs.push(Attribute::scalar("defaultversionsticky", ScalarType::Boolean));
    Attributes::new(attrs)
}

/// Attributes the server owns outright; client values are dropped
pub const SERVER_MANAGED: &[&str] = &["epoch", "createdat", "modifiedat"];
