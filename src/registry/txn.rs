//! One registry call's unit of work
//!
//! A [`Txn`] borrows the store for the duration of a call, collects
//! cascade effects and default-version work as entities are written, and
//! settles both in [`Txn::finish`] before the caller commits.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::read::View;
use super::{unknown_group_type, unknown_resource_type, WriteOptions};
use crate::config::RegistrySettings;
use crate::default_version::{DefaultState, SetDefault, Selector, VersionStamp};
use crate::epoch::{Cascade, Mutation};
use crate::error::{RegistryError, Result};
use crate::model::core::SERVER_MANAGED;
use crate::model::{GroupModel, Model, ResourceModel};
use crate::path::{GroupRef, ResourceRef};
use crate::store::{EntityKind, Row, Store};
use crate::validate::Validator;
use crate::xref;

/// RFC 3339 with nanoseconds, so creation order sorts as text
pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Default-version work queued for one Resource
#[derive(Debug)]
struct PendingDefault {
    rref: ResourceRef,
    processed: Vec<String>,
    request: Option<SetDefault>,
}

pub(crate) struct Txn<'a> {
    pub store: &'a mut dyn Store,
    pub model: &'a Model,
    pub settings: &'a RegistrySettings,
    pub opts: &'a WriteOptions,
    pub cascade: Cascade,
    pub now: String,
    defaults: BTreeMap<String, PendingDefault>,
}

impl<'a> Txn<'a> {
    pub fn new(
        store: &'a mut dyn Store,
        model: &'a Model,
        settings: &'a RegistrySettings,
        opts: &'a WriteOptions,
    ) -> Self {
        Self {
            store,
            model,
            settings,
            opts,
            cascade: Cascade::new(),
            now: timestamp(),
            defaults: BTreeMap::new(),
        }
    }

    pub fn view(&self) -> View<'_> {
        View::new(&*self.store, self.model, self.settings)
    }

    pub fn group_model(&self, plural: &str) -> Result<&'a GroupModel> {
        self.model.group(plural).ok_or_else(|| unknown_group_type(plural))
    }

    pub fn resource_model(&self, rref: &ResourceRef) -> Result<&'a ResourceModel> {
        self.group_model(&rref.group.plural)?
            .resource(&rref.plural)
            .ok_or_else(|| unknown_resource_type(&rref.plural))
    }

    /// Stored row or `<what> "<id>" not found`
    pub fn require(&self, key: &str, what: &str, id: &str) -> Result<Row> {
        self.store
            .get(key)?
            .ok_or_else(|| RegistryError::not_found(format!("{} \"{}\" not found", what, id)))
    }

    /// Fresh row with the next creation sequence number
    pub fn insert(&mut self, key: String, parent: &str, collection: &str, kind: EntityKind, id: &str) -> Result<Row> {
        let seq = self.store.next_seq()?;
        Ok(Row::new(key, Some(parent.to_string()), collection, kind, id, seq))
    }

    /// IDs are unique per collection regardless of case
    pub fn check_collision(&self, parent: &str, collection: &str, id: &str, kind: &str, id_attr: &str) -> Result<()> {
        for row in self.store.children(parent, collection)? {
            if row.id != id && row.id.eq_ignore_ascii_case(id) {
                return Err(RegistryError::identity(format!(
                    "Attempting to create a {} with a \"{}\" of \"{}\", when one already exists as \"{}\"",
                    kind, id_attr, id, row.id
                )));
            }
        }
        Ok(())
    }

    pub fn check_epoch(&self, row: &Row, expected: Option<u64>) -> Result<()> {
        match expected {
            Some(epoch) if !self.opts.no_epoch && epoch != row.epoch() => {
                Err(RegistryError::epoch_mismatch(&Value::from(epoch), row.epoch()))
            }
            _ => Ok(()),
        }
    }

    /// Reject writes under a Resource whose Meta is `readonly`
    pub fn check_writable(&self, rref: &ResourceRef) -> Result<()> {
        let readonly = self
            .store
            .get(&rref.meta_key())?
            .and_then(|meta| meta.props.get("readonly").and_then(Value::as_bool))
            .unwrap_or(false);
        if readonly {
            return Err(RegistryError::ReadOnlyViolation(
                "Write operations on read-only Resources are not allowed".into(),
            ));
        }
        Ok(())
    }

    pub fn version_stamps(&self, rref: &ResourceRef) -> Result<Vec<VersionStamp>> {
        Ok(self
            .store
            .children(&rref.key(), "versions")?
            .into_iter()
            .map(|row| {
                let createdat = row.prop_str("createdat").unwrap_or_default().to_string();
                VersionStamp::new(row.id, createdat, row.seq)
            })
            .collect())
    }

    /// Largest numeric Version id plus one
    pub fn next_version_id(&self, rref: &ResourceRef) -> Result<String> {
        let max = self
            .store
            .children(&rref.key(), "versions")?
            .iter()
            .filter_map(|row| row.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok((max + 1).to_string())
    }

    /// Queue default-version selection for `rref`
    pub fn note_default(&mut self, rref: &ResourceRef, processed: Option<&str>, request: Option<SetDefault>) {
        let pending = self.defaults.entry(rref.key()).or_insert_with(|| PendingDefault {
            rref: rref.clone(),
            processed: Vec::new(),
            request: None,
        });
        if let Some(vid) = processed {
            if !pending.processed.iter().any(|p| p == vid) {
                pending.processed.push(vid.to_string());
            }
        }
        if request.is_some() {
            pending.request = request;
        }
    }

    pub fn forget_defaults(&mut self, rref: &ResourceRef) {
        self.defaults.remove(&rref.key());
    }

    /// Settle default versions and pruning, then apply the cascade
    pub fn finish(&mut self) -> Result<()> {
        for (_, pending) in std::mem::take(&mut self.defaults) {
            self.settle_default(&pending)?;
        }
        self.cascade.flush(self.store, &self.now)?;
        Ok(())
    }

    fn settle_default(&mut self, pending: &PendingDefault) -> Result<()> {
        let rref = &pending.rref;
        let Some(mut meta) = self.store.get(&rref.meta_key())? else {
            return Ok(());
        };
        if meta.prop_str("xref").is_some() {
            return match pending.request {
                Some(_) => Err(xref::versions_locked(false)),
                None => Ok(()),
            };
        }

        let rmodel = self.resource_model(rref)?;
        let versions = self.version_stamps(rref)?;
        let state = DefaultState::from_meta(&meta.props);
        let selector = Selector::new(&rmodel.plural, rmodel.set_default_sticky);
        let next = selector.after_write(&state, &versions, &pending.processed, pending.request.as_ref())?;

        self.prune(rref, rmodel.max_versions, &next, versions)?;

        if next != state {
            next.write_to(&mut meta.props);
            self.store.put(&meta)?;
            if pending.request.is_some() {
                self.cascade.record(Mutation::SetDefault, EntityKind::Meta, &meta.key);
            }
            debug!(resource = %rref.key(), default = ?next.pointer, sticky = next.sticky, "Default version moved");
        }
        Ok(())
    }

    /// Drop the oldest non-default Versions beyond `max` (0 = unlimited)
    fn prune(&mut self, rref: &ResourceRef, max: u64, state: &DefaultState, mut versions: Vec<VersionStamp>) -> Result<()> {
        if max == 0 || versions.len() as u64 <= max {
            return Ok(());
        }
        versions.sort_by(|a, b| (&a.createdat, a.seq).cmp(&(&b.createdat, b.seq)));
        let mut excess = versions.len() as u64 - max;
        for version in &versions {
            if excess == 0 {
                break;
            }
            if state.pointer.as_deref() == Some(version.id.as_str()) {
                continue;
            }
            let key = rref.version_key(&version.id);
            self.store.delete(&key)?;
            self.cascade.forget(&key);
            excess -= 1;
            debug!(version = %key, "Pruned version");
        }
        Ok(())
    }

    /// Re-check every stored entity against the current model
    pub fn revalidate(&mut self) -> Result<()> {
        let root = self.require("/", "Registry", "/")?;
        check_stored(&Validator::new(self.model.registry_schema()), &root)?;

        for gmodel in &self.model.groups {
            let groups = self.store.children("/", &gmodel.plural)?;
            for group in groups {
                check_stored(&Validator::new(gmodel.schema()), &group)?;
                let gref = GroupRef::new(&gmodel.plural, &group.id);
                for rmodel in &gmodel.resources {
                    for resource in self.store.children(&gref.key(), &rmodel.plural)? {
                        check_stored(&Validator::new(rmodel.resource_schema()), &resource)?;
                        let rref = gref.resource(&rmodel.plural, &resource.id);
                        if let Some(meta) = self.store.get(&rref.meta_key())? {
                            check_stored(&Validator::new(rmodel.meta_schema()), &meta)?;
                        }
                        for version in self.store.children(&rref.key(), "versions")? {
                            check_stored(&Validator::new(rmodel.version_schema()), &version)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_stored(validator: &Validator<'_>, row: &Row) -> Result<()> {
    let mut props = row.props.clone();
    validator.validate(&mut props)
}

/// Replace a row's user attributes, keeping its server-managed fields
pub(crate) fn replace_props(row: &mut Row, mut props: Map<String, Value>) {
    for name in SERVER_MANAGED {
        if let Some(value) = row.props.get(*name) {
            props.insert(name.to_string(), value.clone());
        }
    }
    row.props = props;
}
