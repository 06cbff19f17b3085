//! Create and update
//!
//! Writes descend the entity tree: Registry, Groups, Resources, then for
//! each Resource its Meta before its Versions, so that an `xref` set or
//! cleared in the same document governs the Versions that follow.

use serde_json::{Map, Value};
use tracing::debug;

use super::txn::{replace_props, Txn};
use super::{not_allowed, Outcome, ReadOptions, WriteMethod};
use crate::content::{ContentState, ContentUpdate};
use crate::default_version::{meta_request, DefaultState};
use crate::epoch::Mutation;
use crate::error::{RegistryError, Result};
use crate::model::core::SERVER_MANAGED;
use crate::model::{AttrKind, Attributes, ResourceModel, ScalarType};
use crate::path::{validate_id, GroupRef, ResourceRef, XPath};
use crate::store::{EntityKind, Row};
use crate::validate::{take_key, Validator, WriteMode};
use crate::xref::{self, ORIGINAL_CREATEDAT, OVERLAY};

const OVERLAY_KEY: &str = "overlay";

/// Members of a collection document: `{id: {...}}`
fn members(doc: &Map<String, Value>) -> Result<Vec<(String, Map<String, Value>)>> {
    doc.iter()
        .map(|(id, value)| match value {
            Value::Object(entity) => Ok((id.clone(), entity.clone())),
            _ => Err(RegistryError::bad_request(format!("Value of \"{}\" must be an object", id))),
        })
        .collect()
}

/// A nested collection inside an entity document
fn nested(value: &Value) -> Result<Vec<(String, Map<String, Value>)>> {
    match value {
        Value::Object(map) => members(map),
        _ => Err(RegistryError::bad_request("Collection must be a map of entities keyed by id")),
    }
}

impl<'a> Txn<'a> {
    pub fn write(&mut self, method: WriteMethod, path: &XPath, doc: &Map<String, Value>) -> Result<Outcome> {
        let mode = method.mode();
        let set_default = self.opts.set_default.clone();
        match (method, path) {
            (_, XPath::Model)
            | (WriteMethod::Post, XPath::Registry | XPath::Group(_) | XPath::Meta(_) | XPath::Version(..))
            | (WriteMethod::Put, XPath::Groups(_) | XPath::Resources(..) | XPath::Versions(_)) => {
                Err(not_allowed(method.as_str(), path))
            }
            (_, XPath::Registry) => {
                self.write_registry(mode, doc)?;
                Ok(Outcome::One(path.clone(), false))
            }
            (_, XPath::Groups(plural)) => {
                self.group_model(plural)?;
                let mut ids = Vec::new();
                for (id, entity) in members(doc)? {
                    self.write_group(mode, &GroupRef::new(plural, &id), &entity)?;
                    ids.push(id);
                }
                Ok(Outcome::Many(path.clone(), ids))
            }
            (_, XPath::Group(gref)) => {
                let created = self.write_group(mode, gref, doc)?;
                Ok(Outcome::One(path.clone(), created))
            }
            (_, XPath::Resources(gref, plural)) => {
                let mut ids = Vec::new();
                for (id, entity) in members(doc)? {
                    self.write_resource(mode, &gref.resource(plural, &id), &entity)?;
                    ids.push(id);
                }
                Ok(Outcome::Many(path.clone(), ids))
            }
            (WriteMethod::Post, XPath::Resource(rref)) => {
                let (vid, created) = self.post_version(rref, doc)?;
                self.note_default(rref, None, set_default);
                Ok(Outcome::One(XPath::Version(rref.clone(), vid), created))
            }
            (_, XPath::Resource(rref)) => {
                let created = self.write_resource(mode, rref, doc)?;
                self.note_default(rref, None, set_default);
                Ok(Outcome::One(path.clone(), created))
            }
            (_, XPath::Meta(rref)) => {
                self.require(&rref.key(), "Resource", &rref.id)?;
                self.write_meta(mode, rref, doc, false)?;
                Ok(Outcome::One(path.clone(), false))
            }
            (_, XPath::Versions(rref)) => {
                self.prepare_resource(rref, &Map::new())?;
                let mut ids = Vec::new();
                for (vid, entity) in members(doc)? {
                    self.write_version(mode, rref, &vid, &entity, false)?;
                    ids.push(vid);
                }
                self.note_default(rref, None, set_default);
                Ok(Outcome::Many(path.clone(), ids))
            }
            (_, XPath::Version(rref, vid)) => {
                self.prepare_resource(rref, doc)?;
                let created = self.write_version(mode, rref, vid, doc, false)?;
                self.note_default(rref, None, set_default);
                Ok(Outcome::One(path.clone(), created))
            }
        }
    }

    fn write_registry(&mut self, mode: WriteMode, doc: &Map<String, Value>) -> Result<()> {
        let mut root = self.require("/", "Registry", "/")?;
        Validator::check_epoch(doc, Some(root.epoch()), self.opts.no_epoch)?;

        let model = self.model;
        let plurals = model.groups.iter().map(|g| g.plural.clone());
        let validator = Validator::new(model.registry_schema()).ignoring(plurals);
        let props = validator.admit(Some(&root.props), doc, mode)?;
        replace_props(&mut root, props);
        self.store.put(&root)?;
        self.cascade.record(Mutation::Update, EntityKind::Registry, "/");

        if self.opts.nested {
            for gmodel in &model.groups {
                if let Some(groups) = doc.get(&gmodel.plural).filter(|v| !v.is_null()) {
                    for (id, entity) in nested(groups)? {
                        self.write_group(mode, &GroupRef::new(&gmodel.plural, &id), &entity)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_group(&mut self, mode: WriteMode, gref: &GroupRef, doc: &Map<String, Value>) -> Result<bool> {
        let gmodel = self.group_model(&gref.plural)?;
        validate_id(&gref.id)?;
        let id_attr = gmodel.id_attr();
        Validator::check_identity(doc, &id_attr, &gref.id)?;

        let key = gref.key();
        let existing = self.store.get(&key)?;
        if existing.is_none() {
            self.check_collision("/", &gref.plural, &gref.id, "Group", &id_attr)?;
        }
        Validator::check_epoch(doc, existing.as_ref().map(Row::epoch), self.opts.no_epoch)?;

        let validator = Validator::new(gmodel.schema())
            .ignoring(gmodel.resources.iter().map(|r| r.plural.clone()))
            .ignoring([id_attr]);
        let props = validator.admit(existing.as_ref().map(|r| &r.props), doc, mode)?;

        let created = existing.is_none();
        let mut row = match existing {
            Some(row) => row,
            None => self.insert(key.clone(), "/", &gref.plural, EntityKind::Group, &gref.id)?,
        };
        replace_props(&mut row, props);
        self.store.put(&row)?;
        let mutation = if created { Mutation::Create } else { Mutation::Update };
        self.cascade.record(mutation, EntityKind::Group, &key);

        if self.opts.nested {
            for rmodel in &gmodel.resources {
                if let Some(resources) = doc.get(&rmodel.plural).filter(|v| !v.is_null()) {
                    for (id, entity) in nested(resources)? {
                        self.write_resource(mode, &gref.resource(&rmodel.plural, &id), &entity)?;
                    }
                }
            }
        }
        Ok(created)
    }

    /// Create the Group on first reference
    fn ensure_group(&mut self, gref: &GroupRef) -> Result<()> {
        let gmodel = self.group_model(&gref.plural)?;
        if self.store.get(&gref.key())?.is_some() {
            return Ok(());
        }
        validate_id(&gref.id)?;
        self.check_collision("/", &gref.plural, &gref.id, "Group", &gmodel.id_attr())?;
        let row = self.insert(gref.key(), "/", &gref.plural, EntityKind::Group, &gref.id)?;
        self.store.put(&row)?;
        self.cascade.record(Mutation::Create, EntityKind::Group, &gref.key());
        Ok(())
    }

    /// Identity checks plus Group, Resource and Meta creation on first
    /// reference. Returns the Resource row and whether it is new.
    fn prepare_resource(&mut self, rref: &ResourceRef, doc: &Map<String, Value>) -> Result<(Row, bool)> {
        let rmodel = self.resource_model(rref)?;
        validate_id(&rref.id)?;
        let id_attr = rmodel.id_attr();
        Validator::check_identity(doc, &id_attr, &rref.id)?;

        if let Some(row) = self.store.get(&rref.key())? {
            return Ok((row, false));
        }
        self.ensure_group(&rref.group)?;
        let gkey = rref.group.key();
        self.check_collision(&gkey, &rref.plural, &rref.id, "Resource", &id_attr)?;

        let row = self.insert(rref.key(), &gkey, &rref.plural, EntityKind::Resource, &rref.id)?;
        self.store.put(&row)?;
        let mut meta = self.insert(rref.meta_key(), &rref.key(), "meta", EntityKind::Meta, "meta")?;
        DefaultState::default().write_to(&mut meta.props);
        self.store.put(&meta)?;
        self.cascade.record(Mutation::Create, EntityKind::Resource, &rref.key());
        Ok((row, true))
    }

    fn write_resource(&mut self, mode: WriteMode, rref: &ResourceRef, doc: &Map<String, Value>) -> Result<bool> {
        let rmodel = self.resource_model(rref)?;
        let (mut row, created) = self.prepare_resource(rref, doc)?;
        if !created {
            self.check_writable(rref)?;
        }

        let id_attr = rmodel.id_attr();
        let (resource_part, mut version_part) = split_resource_doc(rmodel, doc);

        let validator = Validator::new(rmodel.resource_schema()).ignoring([id_attr.clone()]);
        let version_check =
            Validator::new(rmodel.version_schema()).ignoring([id_attr.clone(), "versionid".to_string()]);
        // Type errors surface in document order across both levels
        for (key, value) in doc {
            if resource_part.contains_key(key) {
                validator.check_member(key, value)?;
            } else if version_part.contains_key(key) {
                version_check.check_member(key, value)?;
            }
        }
        let props = validator.admit((!created).then_some(&row.props), &resource_part, mode)?;
        if !created || !props.is_empty() {
            row.props = props;
            self.store.put(&row)?;
        }
        if !created {
            self.cascade.record(Mutation::Update, EntityKind::Resource, &rref.key());
        }

        let nested_versions = if self.opts.nested { doc.get("versions").filter(|v| !v.is_null()) } else { None };
        if self.opts.nested {
            if let Some(Value::Object(meta)) = doc.get("meta") {
                self.write_meta(mode, rref, meta, nested_versions.is_some())?;
            }
        }

        if xref::xref_of(&*self.store, rref)?.is_some() {
            if nested_versions.is_some() {
                return Err(xref::versions_locked(false));
            }
            let shown = object(self.view().read(&XPath::Resource(rref.clone()), &ReadOptions::default())?);
            let schema = rmodel.version_schema();
            xref::check_alias_extras(&version_part, &rmodel.singular, &shown, |k| {
                k == id_attr || SERVER_MANAGED.contains(&k) || schema.get(k).is_some_and(|a| a.flags.readonly)
            })?;
            self.write_overlay(mode, rref, rmodel, &version_part)?;
            return Ok(created);
        }

        let mut wrote_versions = false;
        if let Some(versions) = nested_versions {
            for (vid, entity) in nested(versions)? {
                self.write_version(mode, rref, &vid, &entity, false)?;
                wrote_versions = true;
            }
        }

        // The flat version attributes go to the named or default Version
        let has_data = version_data(rmodel, &version_part);
        let skip = !has_data && (wrote_versions || (mode == WriteMode::Merge && !created));
        if skip {
            return Ok(created);
        }

        let named = match take_key(&mut version_part, "versionid") {
            Some(Value::String(vid)) => Some(vid),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(RegistryError::schema(format!(
                    "Attribute \"versionid\" must be {}",
                    AttrKind::Scalar(ScalarType::String).described()
                )));
            }
        };
        let current = self.view().default_version_id(rref)?;
        let (vid, generated) = match (named, current) {
            (Some(vid), _) => (vid, false),
            (None, Some(current)) => (current, false),
            (None, None) if created => ("1".to_string(), true),
            (None, None) => (self.next_version_id(rref)?, true),
        };
        self.write_version(mode, rref, &vid, &version_part, generated)?;
        Ok(created)
    }

    /// POST on a Resource: one new (or replaced) Version
    fn post_version(&mut self, rref: &ResourceRef, doc: &Map<String, Value>) -> Result<(String, bool)> {
        self.prepare_resource(rref, doc)?;
        let (vid, generated) = match doc.get("versionid") {
            Some(Value::String(vid)) => (vid.clone(), false),
            _ => (self.next_version_id(rref)?, true),
        };
        let created = self.write_version(WriteMode::Replace, rref, &vid, doc, generated)?;
        Ok((vid, created))
    }

    fn write_version(
        &mut self,
        mode: WriteMode,
        rref: &ResourceRef,
        vid: &str,
        doc: &Map<String, Value>,
        generated: bool,
    ) -> Result<bool> {
        let rmodel = self.resource_model(rref)?;
        if xref::xref_of(&*self.store, rref)?.is_some() {
            return Err(xref::versions_locked(false));
        }
        self.check_writable(rref)?;
        validate_id(vid)?;
        Validator::check_identity(doc, "versionid", vid)?;
        Validator::check_identity(doc, &rmodel.id_attr(), &rref.id)?;

        let key = rref.version_key(vid);
        let existing = self.store.get(&key)?;
        if existing.is_none() {
            if !generated && !rmodel.set_version_id {
                return Err(RegistryError::bad_request(format!(
                    "Resource \"{}\" doesn't allow setting of \"versionid\"",
                    rmodel.plural
                )));
            }
            self.check_collision(&rref.key(), "versions", vid, "Version", "versionid")?;
        }
        Validator::check_epoch(doc, existing.as_ref().map(Row::epoch), self.opts.no_epoch)?;

        let names = rmodel.content_names();
        let mut doc = doc.clone();
        let update = if rmodel.has_document {
            ContentUpdate::extract(&names, &mut doc)?
        } else {
            ContentUpdate::default()
        };

        let validator = Validator::new(rmodel.version_schema()).ignoring([rmodel.id_attr(), "versionid".to_string()]);
        let props = validator.admit(existing.as_ref().map(|r| &r.props), &doc, mode)?;

        let created = existing.is_none();
        let mut row = match existing {
            Some(row) => row,
            None => {
                let mut row = self.insert(key.clone(), &rref.key(), "versions", EntityKind::Version, vid)?;
                row.props.insert("createdat".into(), Value::from(self.now.clone()));
                row
            }
        };
        let previous = ContentState::load(&row, &names);
        replace_props(&mut row, props);
        if rmodel.has_document {
            update.apply(&previous, &names)?.store(&mut row, &names);
        }
        self.store.put(&row)?;

        let mutation = if created { Mutation::Create } else { Mutation::Update };
        self.cascade.record(mutation, EntityKind::Version, &key);
        self.note_default(rref, Some(vid), None);
        Ok(created)
    }

    /// Descriptive attributes an aliasing Resource keeps locally
    fn write_overlay(
        &mut self,
        mode: WriteMode,
        rref: &ResourceRef,
        rmodel: &ResourceModel,
        version_part: &Map<String, Value>,
    ) -> Result<()> {
        let input: Map<String, Value> = version_part
            .iter()
            .filter(|(k, _)| OVERLAY.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if mode == WriteMode::Merge && input.is_empty() {
            return Ok(());
        }
        let attrs = Attributes::new(
            rmodel
                .version_schema()
                .iter()
                .filter(|a| OVERLAY.contains(&a.name.as_str()))
                .cloned()
                .collect(),
        );
        let mut row = self.require(&rref.key(), "Resource", &rref.id)?;
        let existing = match row.system.get(OVERLAY_KEY) {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        };
        let overlay = Validator::new(&attrs).admit(existing.as_ref(), &input, mode)?;
        row.system.insert(OVERLAY_KEY.into(), Value::Object(overlay));
        self.store.put(&row)?;
        self.cascade.record(Mutation::Update, EntityKind::Resource, &rref.key());
        Ok(())
    }

    /// `versions_follow` is set when the same document carries a
    /// `versions` map, which then replaces the snapshot on xref removal
    fn write_meta(
        &mut self,
        mode: WriteMode,
        rref: &ResourceRef,
        doc: &Map<String, Value>,
        versions_follow: bool,
    ) -> Result<()> {
        let rmodel = self.resource_model(rref)?;
        let id_attr = rmodel.id_attr();
        let mut meta = self.require(&rref.meta_key(), "Resource", &rref.id)?;
        Validator::check_identity(doc, &id_attr, &rref.id)?;
        Validator::check_epoch(doc, Some(meta.epoch()), self.opts.no_epoch)?;

        let current = meta.prop_str("xref").map(String::from);
        let incoming = match doc.get("xref") {
            Some(Value::String(s)) if !s.is_empty() => Some(Some(s.clone())),
            Some(Value::String(_)) | Some(Value::Null) => Some(None),
            None if mode == WriteMode::Replace => Some(None),
            None => None,
            Some(_) => {
                return Err(RegistryError::schema(format!(
                    "Attribute \"xref\" must be {}",
                    AttrKind::Scalar(ScalarType::UriReference).described()
                )))
            }
        };

        match (incoming, current) {
            (Some(Some(target)), current) => {
                let target_ref = xref::parse(&target)?;
                xref::check_target(rref, &target_ref)?;
                let shown = object(self.view().render_meta(rref, &meta)?);
                xref::check_meta_extras(doc, &id_attr, &shown)?;
                if current.as_deref() == Some(target.as_str()) {
                    return Ok(());
                }
                self.set_xref(rref, &mut meta, target, current.is_none())
            }
            (None, Some(_)) => {
                let shown = object(self.view().render_meta(rref, &meta)?);
                xref::check_meta_extras(doc, &id_attr, &shown)
            }
            (Some(None), Some(previous)) => {
                if let Some(createdat) = meta.system.remove(ORIGINAL_CREATEDAT) {
                    meta.props.insert("createdat".into(), createdat);
                }
                let mut row = self.require(&rref.key(), "Resource", &rref.id)?;
                if row.system.remove(OVERLAY_KEY).is_some() {
                    self.store.put(&row)?;
                }
                self.cascade.record(Mutation::Xref, EntityKind::Meta, &meta.key);
                debug!(resource = %rref.key(), xref = %previous, "xref cleared");
                self.update_meta(mode, rref, rmodel, meta, doc)?;
                if !versions_follow {
                    self.snapshot_target(rref, rmodel, &previous)?;
                }
                Ok(())
            }
            (_, None) => self.update_meta(mode, rref, rmodel, meta, doc),
        }
    }

    fn set_xref(&mut self, rref: &ResourceRef, meta: &mut Row, target: String, first: bool) -> Result<()> {
        for version in self.store.children(&rref.key(), "versions")? {
            self.store.delete(&version.key)?;
            self.cascade.forget(&version.key);
        }
        if first {
            if let Some(createdat) = meta.props.get("createdat").cloned() {
                meta.system.insert(ORIGINAL_CREATEDAT.into(), createdat);
            }
        }
        let mut props = Map::new();
        props.insert("xref".into(), Value::from(target.clone()));
        replace_props(meta, props);
        self.store.put(meta)?;
        self.cascade.record(Mutation::Xref, EntityKind::Meta, &meta.key);
        self.forget_defaults(rref);
        debug!(resource = %rref.key(), xref = %target, "xref set");
        Ok(())
    }

    fn update_meta(
        &mut self,
        mode: WriteMode,
        rref: &ResourceRef,
        rmodel: &ResourceModel,
        mut meta: Row,
        doc: &Map<String, Value>,
    ) -> Result<()> {
        let state = DefaultState::from_meta(&meta.props);
        let request = meta_request(&state, doc, mode);

        let validator = Validator::new(rmodel.meta_schema()).ignoring([rmodel.id_attr(), "xref".to_string()]);
        let mut props = validator.admit(Some(&meta.props), doc, mode)?;
        take_key(&mut props, "defaultversionid");
        take_key(&mut props, "defaultversionsticky");
        replace_props(&mut meta, props);
        state.write_to(&mut meta.props);
        self.store.put(&meta)?;
        self.cascade.record(Mutation::Update, EntityKind::Meta, &meta.key);
        self.note_default(rref, None, request);
        Ok(())
    }

    /// Recreate Version "1" from the former target's default Version
    fn snapshot_target(&mut self, rref: &ResourceRef, rmodel: &ResourceModel, previous: &str) -> Result<()> {
        let source = match xref::parse(previous) {
            Ok(target) => match xref::resolve(&*self.store, &target)? {
                Some(owner) => self.view().default_version(&owner)?,
                None => None,
            },
            Err(_) => None,
        };

        let vid = "1";
        let key = rref.version_key(vid);
        let mut row = self.insert(key.clone(), &rref.key(), "versions", EntityKind::Version, vid)?;
        if let Some(source) = source {
            row.props = source
                .props
                .into_iter()
                .filter(|(k, _)| !SERVER_MANAGED.contains(&k.as_str()))
                .collect();
            row.system = source.system;
            row.content = source.content;
        }
        row.props.insert("createdat".into(), Value::from(self.now.clone()));
        if !rmodel.has_document {
            row.content = None;
        }
        self.store.put(&row)?;
        self.cascade.record(Mutation::Create, EntityKind::Version, &key);
        self.note_default(rref, Some(vid), None);
        Ok(())
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Split a Resource document into Resource-level and Version-level parts
fn split_resource_doc(rmodel: &ResourceModel, doc: &Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let id_attr = rmodel.id_attr();
    let mut resource_part = Map::new();
    let mut version_part = Map::new();
    for (key, value) in doc {
        if key == "meta" || key == "versions" {
            continue;
        }
        let resource_level = rmodel.resource_schema().contains(key) && !rmodel.version_schema().contains(key);
        if resource_level && *key != id_attr {
            resource_part.insert(key.clone(), value.clone());
        } else {
            version_part.insert(key.clone(), value.clone());
        }
    }
    (resource_part, version_part)
}

/// Whether a version part carries anything beyond identity and server fields
fn version_data(rmodel: &ResourceModel, part: &Map<String, Value>) -> bool {
    let id_attr = rmodel.id_attr();
    part.keys().any(|key| {
        *key != id_attr
            && key != "versionid"
            && !SERVER_MANAGED.contains(&key.as_str())
            && !rmodel.version_schema().get(key).is_some_and(|a| a.flags.readonly)
    })
}
