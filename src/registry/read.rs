//! Read projection
//!
//! Renders stored rows as the documents clients see: identity, `self`
//! and `xid`, stored attributes, collection links, and whatever the
//! `inline` paths ask to expand. A Resource renders as its default
//! Version plus its own attributes; an aliasing Resource renders the
//! target's default Version under its own identity.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::{unknown_group_type, unknown_resource_type, Outcome, ReadOptions, Written};
use crate::config::RegistrySettings;
use crate::content::{ContentNames, ContentState};
use crate::default_version::DefaultState;
use crate::error::{RegistryError, Result};
use crate::model::{Model, ResourceModel};
use crate::path::{GroupRef, ResourceRef, XPath};
use crate::store::{Row, Store};
use crate::xref;

/// Dotted `inline` paths relative to the entity being rendered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inline {
    all: bool,
    paths: BTreeSet<String>,
}

impl Inline {
    pub fn everything() -> Self {
        Self {
            all: true,
            paths: BTreeSet::new(),
        }
    }

    /// Add a comma-separated list such as `dirs.files,model`
    pub fn extend(&mut self, list: &str) {
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part == "*" {
                self.all = true;
            } else {
                self.paths.insert(part.to_string());
            }
        }
    }

    /// `name` itself or something below it is inlined
    pub fn has(&self, name: &str) -> bool {
        self.all
            || self.paths.iter().any(|p| {
                p == name || p.strip_prefix(name).is_some_and(|rest| rest.starts_with('.'))
            })
    }

    /// Paths relative to the child `name`
    pub fn child(&self, name: &str) -> Inline {
        let mut child = Inline {
            all: self.all,
            paths: BTreeSet::new(),
        };
        for path in &self.paths {
            if let Some(rest) = path.strip_prefix(name).and_then(|r| r.strip_prefix('.')) {
                child.extend(rest);
            }
        }
        child
    }
}

pub(crate) struct View<'s> {
    store: &'s dyn Store,
    model: &'s Model,
    settings: &'s RegistrySettings,
}

impl<'s> View<'s> {
    pub fn new(store: &'s dyn Store, model: &'s Model, settings: &'s RegistrySettings) -> Self {
        Self { store, model, settings }
    }

    fn url(&self, path: &str) -> Value {
        Value::from(format!("{}{}", self.settings.base_url.trim_end_matches('/'), path))
    }

    fn require(&self, key: &str, what: &str, id: &str) -> Result<Row> {
        self.store
            .get(key)?
            .ok_or_else(|| RegistryError::not_found(format!("{} \"{}\" not found", what, id)))
    }

    fn resource_model(&self, rref: &ResourceRef) -> Result<&'s ResourceModel> {
        let gmodel = self
            .model
            .group(&rref.group.plural)
            .ok_or_else(|| unknown_group_type(&rref.group.plural))?;
        gmodel.resource(&rref.plural).ok_or_else(|| unknown_resource_type(&rref.plural))
    }

    /// The Resource that owns the Versions `rref` shows
    pub fn owner(&self, rref: &ResourceRef) -> Result<Option<ResourceRef>> {
        xref::resolve(self.store, rref)
    }

    /// Local default pointer, without following xrefs
    pub fn default_version_id(&self, rref: &ResourceRef) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&rref.meta_key())?
            .and_then(|meta| DefaultState::from_meta(&meta.props).pointer))
    }

    /// Default Version row, following xrefs
    pub fn default_version(&self, rref: &ResourceRef) -> Result<Option<Row>> {
        let Some(owner) = self.owner(rref)? else {
            return Ok(None);
        };
        match self.default_version_id(&owner)? {
            Some(vid) => self.store.get(&owner.version_key(&vid)),
            None => Ok(None),
        }
    }

    pub fn read(&self, path: &XPath, opts: &ReadOptions) -> Result<Value> {
        let inline = &opts.inline;
        match path {
            XPath::Registry => self.render_registry(inline, opts.compact),
            XPath::Model => Ok(self.model.to_json()),
            XPath::Groups(plural) => {
                self.model.group(plural).ok_or_else(|| unknown_group_type(plural))?;
                let mut out = Map::new();
                for row in self.store.children("/", plural)? {
                    let gref = GroupRef::new(plural, &row.id);
                    out.insert(row.id.clone(), self.render_group(&gref, &row, inline, opts.compact)?);
                }
                Ok(Value::Object(out))
            }
            XPath::Group(gref) => {
                self.model.group(&gref.plural).ok_or_else(|| unknown_group_type(&gref.plural))?;
                let row = self.require(&gref.key(), "Group", &gref.id)?;
                self.render_group(gref, &row, inline, opts.compact)
            }
            XPath::Resources(gref, plural) => {
                self.resource_model(&gref.resource(plural, ""))?;
                self.require(&gref.key(), "Group", &gref.id)?;
                let mut out = Map::new();
                for row in self.store.children(&gref.key(), plural)? {
                    let rref = gref.resource(plural, &row.id);
                    out.insert(row.id.clone(), self.render_resource(&rref, &row, inline, opts.compact)?);
                }
                Ok(Value::Object(out))
            }
            XPath::Resource(rref) => {
                self.resource_model(rref)?;
                let row = self.require(&rref.key(), "Resource", &rref.id)?;
                self.render_resource(rref, &row, inline, opts.compact)
            }
            XPath::Meta(rref) => {
                self.resource_model(rref)?;
                self.require(&rref.key(), "Resource", &rref.id)?;
                let meta = self.require(&rref.meta_key(), "Resource", &rref.id)?;
                self.render_meta(rref, &meta)
            }
            XPath::Versions(rref) => {
                self.resource_model(rref)?;
                self.require(&rref.key(), "Resource", &rref.id)?;
                Ok(Value::Object(self.render_versions(rref, inline)?))
            }
            XPath::Version(rref, vid) => {
                self.resource_model(rref)?;
                self.require(&rref.key(), "Resource", &rref.id)?;
                let owner = self.owner(rref)?.unwrap_or_else(|| rref.clone());
                let row = self.require(&owner.version_key(vid), "Version", vid)?;
                let is_default = self.default_version_id(&owner)?.as_deref() == Some(vid.as_str());
                self.render_version(rref, &row, is_default, inline)
            }
        }
    }

    /// `<plural>url` and `<plural>count`
    fn links(&self, out: &mut Map<String, Value>, plural: &str, path: &str, count: usize, compact: bool) {
        if compact && count == 0 {
            return;
        }
        out.insert(format!("{}url", plural), self.url(path));
        out.insert(format!("{}count", plural), Value::from(count));
    }

    fn render_registry(&self, inline: &Inline, compact: bool) -> Result<Value> {
        let root = self.require("/", "Registry", "/")?;
        let mut out = Map::new();
        out.insert("specversion".into(), Value::from(self.settings.spec_version.clone()));
        out.insert("registryid".into(), Value::from(self.settings.id.clone()));
        out.insert("self".into(), self.url("/"));
        out.insert("xid".into(), Value::from("/"));
        out.extend(root.props);

        if inline.has("model") {
            out.insert("model".into(), self.model.to_json());
        }
        for gmodel in &self.model.groups {
            let rows = self.store.children("/", &gmodel.plural)?;
            self.links(&mut out, &gmodel.plural, &format!("/{}", gmodel.plural), rows.len(), compact);
            if inline.has(&gmodel.plural) && !(compact && rows.is_empty()) {
                let child = inline.child(&gmodel.plural);
                let mut members = Map::new();
                for row in rows {
                    let gref = GroupRef::new(&gmodel.plural, &row.id);
                    members.insert(row.id.clone(), self.render_group(&gref, &row, &child, compact)?);
                }
                out.insert(gmodel.plural.clone(), Value::Object(members));
            }
        }
        Ok(Value::Object(out))
    }

    fn render_group(&self, gref: &GroupRef, row: &Row, inline: &Inline, compact: bool) -> Result<Value> {
        let gmodel = self
            .model
            .group(&gref.plural)
            .ok_or_else(|| unknown_group_type(&gref.plural))?;
        let mut out = Map::new();
        out.insert(gmodel.id_attr(), Value::from(gref.id.clone()));
        out.insert("self".into(), self.url(&gref.key()));
        out.insert("xid".into(), Value::from(gref.key()));
        out.extend(row.props.clone());

        for rmodel in &gmodel.resources {
            let rows = self.store.children(&gref.key(), &rmodel.plural)?;
            let path = format!("{}/{}", gref.key(), rmodel.plural);
            self.links(&mut out, &rmodel.plural, &path, rows.len(), compact);
            if inline.has(&rmodel.plural) && !(compact && rows.is_empty()) {
                let child = inline.child(&rmodel.plural);
                let mut members = Map::new();
                for row in rows {
                    let rref = gref.resource(&rmodel.plural, &row.id);
                    members.insert(row.id.clone(), self.render_resource(&rref, &row, &child, compact)?);
                }
                out.insert(rmodel.plural.clone(), Value::Object(members));
            }
        }
        Ok(Value::Object(out))
    }

    fn render_resource(&self, rref: &ResourceRef, row: &Row, inline: &Inline, compact: bool) -> Result<Value> {
        let rmodel = self.resource_model(rref)?;
        let mut out = Map::new();
        out.insert(rmodel.id_attr(), Value::from(rref.id.clone()));

        match self.default_version(rref)? {
            Some(version) => {
                out.insert("versionid".into(), Value::from(version.id.clone()));
                out.insert("self".into(), self.url(&rref.key()));
                out.insert("xid".into(), Value::from(rref.key()));
                out.extend(version.props.clone());
                out.insert("isdefault".into(), Value::Bool(true));
                if rmodel.has_document {
                    let names = rmodel.content_names();
                    ContentState::load(&version, &names).render(&names, &mut out, inline.has(&rmodel.singular));
                }
            }
            None => {
                out.insert("self".into(), self.url(&rref.key()));
                out.insert("xid".into(), Value::from(rref.key()));
            }
        }
        if xref::xref_of(self.store, rref)?.is_some() {
            if let Some(Value::Object(overlay)) = row.system.get("overlay") {
                out.extend(overlay.clone());
            }
        }
        out.extend(row.props.clone());

        out.insert("metaurl".into(), self.url(&rref.meta_key()));
        if inline.has("meta") {
            let meta = self.require(&rref.meta_key(), "Resource", &rref.id)?;
            out.insert("meta".into(), self.render_meta(rref, &meta)?);
        }

        let versions = self.render_versions(rref, &inline.child("versions"))?;
        self.links(&mut out, "versions", &rref.versions_key(), versions.len(), compact);
        if inline.has("versions") && !(compact && versions.is_empty()) {
            out.insert("versions".into(), Value::Object(versions));
        }
        Ok(Value::Object(out))
    }

    fn render_versions(&self, rref: &ResourceRef, inline: &Inline) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        let Some(owner) = self.owner(rref)? else {
            return Ok(out);
        };
        let default = self.default_version_id(&owner)?;
        for row in self.store.children(&owner.key(), "versions")? {
            let is_default = default.as_deref() == Some(row.id.as_str());
            out.insert(row.id.clone(), self.render_version(rref, &row, is_default, inline)?);
        }
        Ok(out)
    }

    fn render_version(&self, rref: &ResourceRef, row: &Row, is_default: bool, inline: &Inline) -> Result<Value> {
        let rmodel = self.resource_model(rref)?;
        let key = rref.version_key(&row.id);
        let mut out = Map::new();
        out.insert(rmodel.id_attr(), Value::from(rref.id.clone()));
        out.insert("versionid".into(), Value::from(row.id.clone()));
        out.insert("self".into(), self.url(&key));
        out.insert("xid".into(), Value::from(key));
        out.extend(row.props.clone());
        out.insert("isdefault".into(), Value::Bool(is_default));
        if rmodel.has_document {
            let names = rmodel.content_names();
            ContentState::load(row, &names).render(&names, &mut out, inline.has(&rmodel.singular));
        }
        Ok(Value::Object(out))
    }

    pub(super) fn render_meta(&self, rref: &ResourceRef, meta: &Row) -> Result<Value> {
        let rmodel = self.resource_model(rref)?;
        let mut out = Map::new();
        out.insert(rmodel.id_attr(), Value::from(rref.id.clone()));
        out.insert("self".into(), self.url(&rref.meta_key()));
        out.insert("xid".into(), Value::from(rref.meta_key()));
        out.extend(meta.props.clone());

        // An alias reports the target's default selection
        let (owner, state) = match meta.prop_str("xref") {
            Some(_) => match self.owner(rref)? {
                Some(owner) => {
                    let state = self
                        .store
                        .get(&owner.meta_key())?
                        .map(|m| DefaultState::from_meta(&m.props))
                        .unwrap_or_default();
                    (owner, state)
                }
                None => return Ok(Value::Object(out)),
            },
            None => (rref.clone(), DefaultState::from_meta(&meta.props)),
        };
        if let Some(pointer) = &state.pointer {
            out.insert("defaultversionid".into(), Value::from(pointer.clone()));
            out.insert("defaultversionsticky".into(), Value::Bool(state.sticky));
            out.insert("defaultversionurl".into(), self.url(&owner.version_key(pointer)));
        }
        Ok(Value::Object(out))
    }

    /// Render what a write produced
    pub fn render_outcome(&self, outcome: &Outcome) -> Result<Written> {
        let opts = ReadOptions::default();
        match outcome {
            Outcome::One(path, created) => Ok(Written {
                value: self.read(path, &opts)?,
                created: *created,
                location: path.to_string(),
            }),
            Outcome::Many(path, ids) => {
                let mut out = Map::new();
                for id in ids {
                    if let Some(member) = member_path(path, id) {
                        out.insert(id.clone(), self.read(&member, &opts)?);
                    }
                }
                Ok(Written {
                    value: Value::Object(out),
                    created: false,
                    location: path.to_string(),
                })
            }
        }
    }

    /// Pieces of a raw read: channel names, content and metadata
    pub fn raw_parts(&self, path: &XPath) -> Result<(ContentNames, ContentState, Map<String, Value>)> {
        let (rref, version) = match path {
            XPath::Resource(rref) => {
                self.require(&rref.key(), "Resource", &rref.id)?;
                (rref, self.default_version(rref)?)
            }
            XPath::Version(rref, vid) => {
                self.require(&rref.key(), "Resource", &rref.id)?;
                let owner = self.owner(rref)?.unwrap_or_else(|| rref.clone());
                (rref, Some(self.require(&owner.version_key(vid), "Version", vid)?))
            }
            _ => {
                return Err(RegistryError::bad_request(format!(
                    "Raw document reads need a Resource or Version path, not \"{}\"",
                    path
                )))
            }
        };
        let names = self.resource_model(rref)?.content_names();
        let state = version
            .map(|row| ContentState::load(&row, &names))
            .unwrap_or_default();

        let mut props = match self.read(path, &ReadOptions::default())? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        props.retain(|k, _| !names.all().contains(&k.as_str()));
        Ok((names, state, props))
    }
}

fn member_path(path: &XPath, id: &str) -> Option<XPath> {
    match path {
        XPath::Groups(plural) => Some(XPath::Group(GroupRef::new(plural, id))),
        XPath::Resources(gref, plural) => Some(XPath::Resource(gref.resource(plural, id))),
        XPath::Versions(rref) => Some(XPath::Version(rref.clone(), id.to_string())),
        _ => None,
    }
}
