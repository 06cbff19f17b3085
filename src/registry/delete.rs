//! Deletes
//!
//! A single entity is deleted by path, optionally guarded by `?epoch=`.
//! A collection delete takes `{id: {"epoch": n}}` entries (or no body to
//! delete every member); every named entry must exist.

use serde_json::{Map, Value};
use tracing::debug;

use super::not_allowed;
use super::txn::Txn;
use crate::default_version::{DefaultState, Selector};
use crate::epoch::Mutation;
use crate::error::{RegistryError, Result};
use crate::path::{GroupRef, ResourceRef, XPath};
use crate::store::EntityKind;
use crate::xref;

/// Target ids with their expected epochs
type Entries = Vec<(String, Option<u64>)>;

fn entries(batch: Option<&Map<String, Value>>, all: Vec<String>) -> Result<Entries> {
    let Some(batch) = batch else {
        return Ok(all.into_iter().map(|id| (id, None)).collect());
    };
    batch
        .iter()
        .map(|(id, entry)| {
            let epoch = match entry {
                Value::Null => None,
                Value::Object(fields) => match fields.get("epoch") {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(value.as_u64().ok_or_else(|| {
                        RegistryError::schema("Attribute \"epoch\" must be a uinteger")
                    })?),
                },
                _ => {
                    return Err(RegistryError::bad_request(format!(
                        "Value of \"{}\" must be an object",
                        id
                    )))
                }
            };
            Ok((id.clone(), epoch))
        })
        .collect()
}

impl<'a> Txn<'a> {
    pub fn delete(&mut self, path: &XPath, batch: Option<&Map<String, Value>>) -> Result<()> {
        let epoch = self.opts.epoch;
        match path {
            XPath::Registry | XPath::Model | XPath::Meta(_) => Err(not_allowed("DELETE", path)),
            XPath::Groups(plural) => {
                self.group_model(plural)?;
                let all = self.store.children("/", plural)?.into_iter().map(|r| r.id).collect();
                for (id, epoch) in entries(batch, all)? {
                    self.delete_group(&GroupRef::new(plural, &id), epoch)?;
                }
                Ok(())
            }
            XPath::Group(gref) => {
                self.group_model(&gref.plural)?;
                self.delete_group(gref, epoch)
            }
            XPath::Resources(gref, plural) => {
                self.resource_model(&gref.resource(plural, ""))?;
                self.require(&gref.key(), "Group", &gref.id)?;
                let all = self.store.children(&gref.key(), plural)?.into_iter().map(|r| r.id).collect();
                for (id, epoch) in entries(batch, all)? {
                    self.delete_resource(&gref.resource(plural, &id), epoch)?;
                }
                Ok(())
            }
            XPath::Resource(rref) => {
                self.resource_model(rref)?;
                self.delete_resource(rref, epoch)
            }
            XPath::Versions(rref) => {
                self.resource_model(rref)?;
                self.require(&rref.key(), "Resource", &rref.id)?;
                if xref::xref_of(&*self.store, rref)?.is_some() {
                    return Err(xref::versions_locked(true));
                }
                let all = self.store.children(&rref.key(), "versions")?.into_iter().map(|r| r.id).collect();
                let targets = entries(batch, all)?;
                self.delete_versions(rref, &targets)
            }
            XPath::Version(rref, vid) => {
                self.resource_model(rref)?;
                self.delete_versions(rref, &[(vid.clone(), epoch)])
            }
        }
    }

    fn delete_group(&mut self, gref: &GroupRef, epoch: Option<u64>) -> Result<()> {
        let key = gref.key();
        let row = self.require(&key, "Group", &gref.id)?;
        self.check_epoch(&row, epoch)?;
        self.store.delete(&key)?;
        self.cascade.forget(&key);
        self.cascade.record(Mutation::Delete, EntityKind::Group, &key);
        Ok(())
    }

    fn delete_resource(&mut self, rref: &ResourceRef, epoch: Option<u64>) -> Result<()> {
        self.require(&rref.key(), "Resource", &rref.id)?;
        self.check_writable(rref)?;
        if let Some(expected) = epoch {
            // A Resource shows its default Version's epoch
            let current = match self.view().default_version(rref)? {
                Some(version) => version,
                None => self.require(&rref.meta_key(), "Resource", &rref.id)?,
            };
            self.check_epoch(&current, Some(expected))?;
        }
        self.remove_resource(rref)
    }

    fn remove_resource(&mut self, rref: &ResourceRef) -> Result<()> {
        let key = rref.key();
        self.store.delete(&key)?;
        self.cascade.forget(&key);
        self.cascade.record(Mutation::Delete, EntityKind::Resource, &key);
        self.forget_defaults(rref);
        Ok(())
    }

    fn delete_versions(&mut self, rref: &ResourceRef, targets: &[(String, Option<u64>)]) -> Result<()> {
        let rmodel = self.resource_model(rref)?;
        self.require(&rref.key(), "Resource", &rref.id)?;
        if xref::xref_of(&*self.store, rref)?.is_some() {
            return Err(xref::versions_locked(true));
        }
        self.check_writable(rref)?;

        let mut deleted = Vec::new();
        for (vid, epoch) in targets {
            let key = rref.version_key(vid);
            let row = self.require(&key, "Version", vid)?;
            self.check_epoch(&row, *epoch)?;
            self.store.delete(&key)?;
            self.cascade.forget(&key);
            self.cascade.record(Mutation::Delete, EntityKind::Version, &key);
            deleted.push(vid.clone());
        }

        let mut meta = self.require(&rref.meta_key(), "Resource", &rref.id)?;
        let state = DefaultState::from_meta(&meta.props);
        let remaining = self.version_stamps(rref)?;
        let selector = Selector::new(&rmodel.plural, rmodel.set_default_sticky);
        let next = selector.after_delete(&state, &remaining, &deleted, self.opts.set_default.as_ref())?;

        if remaining.is_empty() {
            debug!(resource = %rref.key(), "Last version deleted, removing resource");
            return self.remove_resource(rref);
        }
        if next != state {
            next.write_to(&mut meta.props);
            self.store.put(&meta)?;
            if self.opts.set_default.is_some() {
                self.cascade.record(Mutation::SetDefault, EntityKind::Meta, &meta.key);
            }
            debug!(resource = %rref.key(), default = ?next.pointer, "Default version moved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_batch_entries() {
        let batch = json!({ "a": { "epoch": 2 }, "b": null, "c": {} });
        let parsed = entries(batch.as_object(), Vec::new()).unwrap();
        assert_eq!(
            parsed,
            vec![("a".to_string(), Some(2)), ("b".to_string(), None), ("c".to_string(), None)]
        );
    }

    #[test]
    fn test_missing_batch_means_everything() {
        let parsed = entries(None, vec!["x".into(), "y".into()]).unwrap();
        assert_eq!(parsed, vec![("x".to_string(), None), ("y".to_string(), None)]);
    }

    #[test]
    fn test_bad_batch_epoch() {
        let batch = json!({ "a": { "epoch": "2" } });
        assert_eq!(
            entries(batch.as_object(), Vec::new()).unwrap_err().to_string(),
            "Attribute \"epoch\" must be a uinteger"
        );
    }
}
