//! Registry Model
//!
//! The static, ordered schema of a registry: registry-level attributes
//! plus one definition per Group type and, inside each, per Resource
//! type. A model is built once from its JSON document and verified for
//! internal consistency before it is ever used for validation.
//!
//! ## Model document
//!
//! ```json
//! {
//!   "attributes": { "myext": { "type": "string" } },
//!   "groups": {
//!     "dirs": {
//!       "plural": "dirs", "singular": "dir",
//!       "resources": {
//!         "files": {
//!           "plural": "files", "singular": "file",
//!           "maxversions": 0, "setversionid": true,
//!           "setdefaultversionsticky": true, "hasdocument": true,
//!           "attributes": {}, "resourceattributes": {}, "metaattributes": {}
//!         }
//!       }
//!     }
//!   }
//! }
//! ```

pub mod attribute;
pub mod core;
pub mod export;

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;

pub use attribute::{join_path, AttrFlags, AttrKind, Attribute, Attributes, IfValue, ScalarType};

use crate::error::{RegistryError, Result};

/// A complete, verified registry model
#[derive(Debug, Clone, Default)]
pub struct Model {
    /// User-defined registry attributes
    pub attributes: Attributes,
    pub groups: Vec<GroupModel>,
    /// Core + user registry attributes
    schema: Attributes,
}

/// One Group type
#[derive(Debug, Clone)]
pub struct GroupModel {
    pub plural: String,
    pub singular: String,
    pub description: Option<String>,
    pub attributes: Attributes,
    pub resources: Vec<ResourceModel>,
    schema: Attributes,
}

/// One Resource type
#[derive(Debug, Clone)]
pub struct ResourceModel {
    pub plural: String,
    pub singular: String,
    pub description: Option<String>,
    /// 0 means unlimited
    pub max_versions: u64,
    /// Clients may choose version ids
    pub set_version_id: bool,
    /// Clients may pin the default version
    pub set_default_sticky: bool,
    pub has_document: bool,
    /// Version-level user attributes
    pub attributes: Attributes,
    pub resource_attributes: Attributes,
    pub meta_attributes: Attributes,
    version_schema: Attributes,
    resource_schema: Attributes,
    meta_schema: Attributes,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z_][a-z_0-9]{0,57}$").expect("static regex"))
}

impl Model {
    /// Parse and verify a model document
    pub fn from_json(doc: &Value) -> Result<Self> {
        let doc = match doc {
            Value::Object(doc) => doc,
            Value::Null => return Self::build(Attributes::default(), Vec::new()),
            _ => return Err(RegistryError::bad_request("Model must be an object")),
        };

        let attributes = match doc.get("attributes") {
            Some(Value::Object(attrs)) => user_attributes(attrs, "")?,
            None | Some(Value::Null) => Attributes::default(),
            Some(_) => return Err(RegistryError::bad_request("Model \"attributes\" must be an object")),
        };

        let mut groups = Vec::new();
        if let Some(defs) = doc.get("groups") {
            let defs = defs
                .as_object()
                .ok_or_else(|| RegistryError::bad_request("Model \"groups\" must be an object"))?;
            for (plural, def) in defs {
                groups.push(GroupModel::parse(plural, def)?);
            }
        }

        Self::build(attributes, groups)
    }

    /// Merge core attributes and verify the whole model
    pub fn build(attributes: Attributes, groups: Vec<GroupModel>) -> Result<Self> {
        let mut seen = HashSet::new();
        for group in &groups {
            if !seen.insert(group.plural.as_str()) || !seen.insert(group.singular.as_str()) {
                return Err(RegistryError::bad_request(format!(
                    "Duplicate Group type name: {}",
                    group.plural
                )));
            }
        }

        let schema = merge_core(core::registry(&groups), &attributes, "")?;
        verify_scope(&[&schema], "")?;

        Ok(Self {
            attributes,
            groups,
            schema,
        })
    }

    pub fn registry_schema(&self) -> &Attributes {
        &self.schema
    }

    pub fn group(&self, plural: &str) -> Option<&GroupModel> {
        self.groups.iter().find(|g| g.plural == plural)
    }

    pub fn resource(&self, gplural: &str, rplural: &str) -> Option<&ResourceModel> {
        self.group(gplural).and_then(|g| g.resource(rplural))
    }

    /// Model document including core attributes
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("attributes".into(), Value::Object(self.schema.to_json()));
        let groups: Map<String, Value> = self
            .groups
            .iter()
            .map(|g| (g.plural.clone(), g.to_json()))
            .collect();
        out.insert("groups".into(), Value::Object(groups));
        Value::Object(out)
    }
}

impl GroupModel {
    pub fn new(plural: impl Into<String>, singular: impl Into<String>) -> Self {
        Self {
            plural: plural.into(),
            singular: singular.into(),
            description: None,
            attributes: Attributes::default(),
            resources: Vec::new(),
            schema: Attributes::default(),
        }
    }

    fn parse(key: &str, def: &Value) -> Result<Self> {
        let def = def.as_object().ok_or_else(|| {
            RegistryError::bad_request(format!("Group type \"{}\" must be an object", key))
        })?;
        let (plural, singular) = names(key, def, "Group")?;
        let path = format!("groups.{}", plural);

        let attributes = match def.get("attributes") {
            Some(Value::Object(attrs)) => user_attributes(attrs, &path)?,
            _ => Attributes::default(),
        };

        let mut resources = Vec::new();
        if let Some(Value::Object(defs)) = def.get("resources") {
            for (rplural, rdef) in defs {
                resources.push(ResourceModel::parse(rplural, rdef)?);
            }
        }

        let mut group = Self {
            plural,
            singular,
            description: def.get("description").and_then(Value::as_str).map(String::from),
            attributes,
            resources,
            schema: Attributes::default(),
        };
        group.finish()?;
        Ok(group)
    }

    /// Build the effective schema; also used after programmatic construction
    pub fn finish(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        for resource in &self.resources {
            if !seen.insert(resource.plural.as_str()) || !seen.insert(resource.singular.as_str()) {
                return Err(RegistryError::bad_request(format!(
                    "Duplicate Resource type name: {}",
                    resource.plural
                )));
            }
        }
        let path = format!("groups.{}", self.plural);
        self.schema = merge_core(core::group(&self.resources, &self.singular), &self.attributes, &path)?;
        verify_scope(&[&self.schema], &path)
    }

    pub fn schema(&self) -> &Attributes {
        &self.schema
    }

    pub fn id_attr(&self) -> String {
        format!("{}id", self.singular)
    }

    pub fn resource(&self, plural: &str) -> Option<&ResourceModel> {
        self.resources.iter().find(|r| r.plural == plural)
    }

    fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("plural".into(), Value::from(self.plural.clone()));
        out.insert("singular".into(), Value::from(self.singular.clone()));
        if let Some(desc) = &self.description {
            out.insert("description".into(), Value::from(desc.clone()));
        }
        out.insert("attributes".into(), Value::Object(self.schema.to_json()));
        let resources: Map<String, Value> = self
            .resources
            .iter()
            .map(|r| (r.plural.clone(), r.to_json()))
            .collect();
        out.insert("resources".into(), Value::Object(resources));
        Value::Object(out)
    }
}

impl ResourceModel {
    pub fn new(plural: impl Into<String>, singular: impl Into<String>) -> Self {
        Self {
            plural: plural.into(),
            singular: singular.into(),
            description: None,
            max_versions: 0,
            set_version_id: true,
            set_default_sticky: true,
            has_document: true,
            attributes: Attributes::default(),
            resource_attributes: Attributes::default(),
            meta_attributes: Attributes::default(),
            version_schema: Attributes::default(),
            resource_schema: Attributes::default(),
            meta_schema: Attributes::default(),
        }
    }

    fn parse(key: &str, def: &Value) -> Result<Self> {
        let def = def.as_object().ok_or_else(|| {
            RegistryError::bad_request(format!("Resource type \"{}\" must be an object", key))
        })?;
        let (plural, singular) = names(key, def, "Resource")?;
        let path = format!("resources.{}", plural);
        let attrs = |field: &str, path: &str| -> Result<Attributes> {
            match def.get(field) {
                Some(Value::Object(attrs)) => user_attributes(attrs, path),
                None | Some(Value::Null) => Ok(Attributes::default()),
                Some(_) => Err(RegistryError::bad_request(format!(
                    "Resource type \"{}\" has a non-object \"{}\"",
                    plural, field
                ))),
            }
        };
        let flag = |field: &str, default: bool| def.get(field).and_then(Value::as_bool).unwrap_or(default);

        let max_versions = match def.get("maxversions") {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_u64().ok_or_else(|| {
                RegistryError::bad_request(format!(
                    "Resource type \"{}\" has an invalid \"maxversions\"",
                    plural
                ))
            })?,
        };

        let mut resource = Self {
            description: def.get("description").and_then(Value::as_str).map(String::from),
            max_versions,
            set_version_id: flag("setversionid", true),
            set_default_sticky: flag("setdefaultversionsticky", true),
            has_document: flag("hasdocument", true),
            attributes: attrs("attributes", &path)?,
            resource_attributes: attrs("resourceattributes", &path)?,
            meta_attributes: attrs("metaattributes", &format!("{}.meta", path))?,
            ..Self::new(plural.clone(), singular)
        };
        resource.finish()?;
        Ok(resource)
    }

    /// Build the effective schemas; also used after programmatic construction
    pub fn finish(&mut self) -> Result<()> {
        let path = format!("resources.{}", self.plural);
        self.version_schema = merge_core(
            core::version(&self.singular, self.has_document),
            &self.attributes,
            &path,
        )?;
        let resource_core = core::resource(&self.singular);
        for attr in &self.resource_attributes {
            if self.version_schema.contains(&attr.name) && !resource_core.contains(&attr.name) {
                return Err(RegistryError::bad_request(format!(
                    "Duplicate attribute name ({}) at: {}",
                    attr.name, path
                )));
            }
        }
        self.resource_schema = merge_core(resource_core, &self.resource_attributes, &path)?;
        // Resource and version attributes share one rendered object
        verify_scope(&[&self.version_schema, &self.resource_schema], &path)?;

        let meta_path = format!("{}.meta", path);
        self.meta_schema = merge_core(core::meta(&self.singular), &self.meta_attributes, &meta_path)?;
        verify_scope(&[&self.meta_schema], &meta_path)
    }

    pub fn id_attr(&self) -> String {
        format!("{}id", self.singular)
    }

    pub fn version_schema(&self) -> &Attributes {
        &self.version_schema
    }

    pub fn resource_schema(&self) -> &Attributes {
        &self.resource_schema
    }

    pub fn meta_schema(&self) -> &Attributes {
        &self.meta_schema
    }

    /// Names of the four content channel attributes
    pub fn content_names(&self) -> crate::content::ContentNames {
        crate::content::ContentNames::new(&self.singular)
    }

    fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("plural".into(), Value::from(self.plural.clone()));
        out.insert("singular".into(), Value::from(self.singular.clone()));
        if let Some(desc) = &self.description {
            out.insert("description".into(), Value::from(desc.clone()));
        }
        out.insert("maxversions".into(), Value::from(self.max_versions));
        out.insert("setversionid".into(), Value::Bool(self.set_version_id));
        out.insert("setdefaultversionsticky".into(), Value::Bool(self.set_default_sticky));
        out.insert("hasdocument".into(), Value::Bool(self.has_document));
        out.insert("attributes".into(), Value::Object(self.version_schema.to_json()));
        out.insert("resourceattributes".into(), Value::Object(self.resource_schema.to_json()));
        out.insert("metaattributes".into(), Value::Object(self.meta_schema.to_json()));
        Value::Object(out)
    }
}

fn names(key: &str, def: &Map<String, Value>, what: &str) -> Result<(String, String)> {
    let plural = def.get("plural").and_then(Value::as_str).unwrap_or(key).to_string();
    if plural != key {
        return Err(RegistryError::bad_request(format!(
            "{} type \"{}\" has a \"plural\" of \"{}\" that doesn't match its key",
            what, key, plural
        )));
    }
    let singular = def
        .get("singular")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            RegistryError::bad_request(format!("{} type \"{}\" is missing a \"singular\"", what, key))
        })?
        .to_string();
    for name in [&plural, &singular] {
        if !name_pattern().is_match(name) {
            return Err(RegistryError::bad_request(format!(
                "Invalid {} type name: {}",
                what, name
            )));
        }
    }
    if plural == singular {
        return Err(RegistryError::bad_request(format!(
            "{} type \"{}\" must have different plural and singular names",
            what, plural
        )));
    }
    Ok((plural, singular))
}

fn user_attributes(defs: &Map<String, Value>, path: &str) -> Result<Attributes> {
    let attrs = Attributes::parse(defs, path)?;
    for attr in &attrs {
        if !attr.is_wildcard() && !name_pattern().is_match(&attr.name) {
            return Err(RegistryError::bad_request(format!(
                "Invalid attribute name: {}",
                attr.name
            )));
        }
    }
    Ok(attrs)
}

/// Overlay user attributes onto the core set. A user attribute may
/// redefine a core one (to add a description or enum) but not change
/// its type, and it inherits the core flags.
fn merge_core(mut core: Attributes, user: &Attributes, path: &str) -> Result<Attributes> {
    for attr in user {
        match core.get(&attr.name) {
            Some(existing) => {
                if existing.kind.type_name() != attr.kind.type_name() {
                    return Err(RegistryError::bad_request(format!(
                        "Attribute \"{}\" at: {} must have a \"type\" of \"{}\"",
                        attr.name,
                        if path.is_empty() { "model" } else { path },
                        existing.kind.type_name()
                    )));
                }
                let mut merged = attr.clone();
                merged.flags.readonly |= existing.flags.readonly;
                merged.flags.immutable |= existing.flags.immutable;
                merged.flags.server_required |= existing.flags.server_required;
                core.upsert(merged);
            }
            None => core.push(attr.clone()),
        }
    }
    Ok(core)
}

/// Reject any name reachable twice in one logical scope. Branches of the
/// same attribute's ifvalues are mutually exclusive, so they may reuse
/// names among themselves, but never names already in scope.
fn verify_scope(scopes: &[&Attributes], path: &str) -> Result<()> {
    let mut taken: HashSet<String> = scopes
        .iter()
        .flat_map(|attrs| attrs.iter().map(|a| a.name.clone()))
        .collect();
    for attrs in scopes {
        verify_attributes(attrs, &mut taken, path)?;
    }
    Ok(())
}

fn verify_attributes(attrs: &Attributes, taken: &mut HashSet<String>, path: &str) -> Result<()> {
    for attr in attrs {
        let mut introduced = HashSet::new();
        for branch in &attr.if_values {
            let branch_path = format!("{}.ifvalues.{}", join_path(path, &attr.name), branch.value);
            let mut scope = taken.clone();
            for sibling in &branch.siblings {
                if !scope.insert(sibling.name.clone()) {
                    return Err(RegistryError::bad_request(format!(
                        "Duplicate attribute name ({}) at: {}",
                        sibling.name, branch_path
                    )));
                }
            }
            verify_attributes(&branch.siblings, &mut scope, &branch_path)?;
            introduced.extend(scope.difference(taken).cloned().collect::<Vec<_>>());
        }
        taken.extend(introduced);

        verify_kind(&attr.kind, &join_path(path, &attr.name))?;
    }
    Ok(())
}

/// Nested objects open a fresh scope
fn verify_kind(kind: &AttrKind, path: &str) -> Result<()> {
    match kind {
        AttrKind::Object(children) => {
            let mut taken = children.iter().map(|a| a.name.clone()).collect();
            verify_attributes(children, &mut taken, path)
        }
        AttrKind::Map(item) | AttrKind::Array(item) => verify_kind(item, &format!("{}.item", path)),
        AttrKind::Scalar(_) => Ok(()),
    }
}
