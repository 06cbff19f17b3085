//! Epoch/Timestamp Cascade
//!
//! Each committed mutation updates the mutated entity's `epoch` and
//! `modifiedat` and touches `modifiedat` up the ownership chain. Which
//! entity gets which treatment is a lookup in [`CASCADE_POLICY`], keyed
//! by (mutation, entity kind).
//!
//! Effects collected during a transaction are merged per entity (the
//! strongest wins) and written once by [`Cascade::flush`], so an entity
//! touched several times in one call still moves its epoch by one.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::Result;
use crate::store::{EntityKind, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    Create,
    Update,
    Delete,
    /// Client-requested default version change
    SetDefault,
    /// `xref` set or cleared
    Xref,
}

/// What happens to one entity's server-managed fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Effect {
    Keep,
    /// `modifiedat` only
    Touch,
    /// `epoch + 1` and `modifiedat`
    Bump,
    /// New entity: `epoch = 1`, `createdat` and `modifiedat`
    Stamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeRule {
    pub mutation: Mutation,
    pub target: EntityKind,
    pub on_target: Effect,
    /// The owning Resource's Meta (Resource and Version targets)
    pub on_meta: Effect,
    /// Group and Registry above the target
    pub on_ancestors: Effect,
}

const fn rule(
    mutation: Mutation,
    target: EntityKind,
    on_target: Effect,
    on_meta: Effect,
    on_ancestors: Effect,
) -> CascadeRule {
    CascadeRule {
        mutation,
        target,
        on_target,
        on_meta,
        on_ancestors,
    }
}

use EntityKind::{Group, Meta, Registry, Resource, Version};
use Effect::{Bump, Keep, Stamp, Touch};

/// The complete cascade table. Resources carry no timestamps of their
/// own; their rendered epoch comes from the default Version.
pub const CASCADE_POLICY: &[CascadeRule] = &[
    rule(Mutation::Create, Registry, Stamp, Keep, Keep),
    rule(Mutation::Update, Registry, Bump, Keep, Keep),
    rule(Mutation::Create, Group, Stamp, Keep, Touch),
    rule(Mutation::Update, Group, Bump, Keep, Touch),
    rule(Mutation::Delete, Group, Keep, Keep, Touch),
    rule(Mutation::Create, Resource, Keep, Stamp, Touch),
    rule(Mutation::Update, Resource, Keep, Keep, Touch),
    rule(Mutation::Delete, Resource, Keep, Keep, Touch),
    rule(Mutation::Create, Meta, Stamp, Keep, Touch),
    rule(Mutation::Update, Meta, Bump, Keep, Touch),
    rule(Mutation::SetDefault, Meta, Bump, Keep, Touch),
    rule(Mutation::Xref, Meta, Bump, Keep, Touch),
    // Adding a Version leaves Meta alone even when the default moves
    rule(Mutation::Create, Version, Stamp, Keep, Touch),
    rule(Mutation::Update, Version, Bump, Keep, Touch),
    // Removing one changes the Version set Meta describes
    rule(Mutation::Delete, Version, Keep, Bump, Touch),
];

pub fn lookup(mutation: Mutation, target: EntityKind) -> Option<&'static CascadeRule> {
    CASCADE_POLICY
        .iter()
        .find(|r| r.mutation == mutation && r.target == target)
}

/// Keys of the entities a mutation can reach
#[derive(Debug, Clone, Default)]
pub struct Chain {
    pub target: String,
    pub meta: Option<String>,
    pub ancestors: Vec<String>,
}

impl Chain {
    /// Chain for an entity key such as `/dirs/d1/files/f1/versions/v1`
    pub fn for_key(key: &str) -> Self {
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        let mut ancestors = Vec::new();
        if !segments.is_empty() {
            ancestors.push("/".to_string());
        }
        if segments.len() > 2 {
            ancestors.push(format!("/{}/{}", segments[0], segments[1]));
        }
        let meta = (segments.len() >= 4).then(|| format!("/{}/meta", segments[..4].join("/")));
        Self {
            target: key.to_string(),
            meta,
            ancestors,
        }
    }
}

/// Pending effects for one transaction
#[derive(Debug, Default)]
pub struct Cascade {
    pending: BTreeMap<String, Effect>,
}

impl Cascade {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `mutation` of the `kind` entity at `key`
    pub fn record(&mut self, mutation: Mutation, kind: EntityKind, key: &str) {
        let Some(rule) = lookup(mutation, kind) else {
            return;
        };
        let chain = Chain::for_key(key);
        self.mark(&chain.target, rule.on_target);
        if let Some(meta) = &chain.meta {
            if *meta != chain.target {
                self.mark(meta, rule.on_meta);
            }
        }
        for ancestor in &chain.ancestors {
            if *ancestor != chain.target {
                self.mark(ancestor, rule.on_ancestors);
            }
        }
    }

    fn mark(&mut self, key: &str, effect: Effect) {
        if effect == Keep {
            return;
        }
        let slot = self.pending.entry(key.to_string()).or_insert(Keep);
        *slot = (*slot).max(effect);
    }

    pub fn effect(&self, key: &str) -> Effect {
        self.pending.get(key).copied().unwrap_or(Keep)
    }

    /// Drop pending effects for a subtree that no longer exists
    pub fn forget(&mut self, key: &str) {
        self.pending.retain(|k, _| !crate::store::is_within(k, key));
    }

    /// Apply every pending effect to the stored rows
    pub fn flush(&mut self, store: &mut dyn Store, now: &str) -> Result<usize> {
        let mut applied = 0;
        for (key, effect) in std::mem::take(&mut self.pending) {
            let Some(mut row) = store.get(&key)? else {
                continue;
            };
            apply(&mut row.props, effect, now);
            store.put(&row)?;
            applied += 1;
            debug!(key = %key, ?effect, epoch = row.epoch(), "Cascade applied");
        }
        Ok(applied)
    }
}

/// Apply one effect to an entity's attribute map
pub fn apply(props: &mut serde_json::Map<String, Value>, effect: Effect, now: &str) {
    match effect {
        Keep => {}
        Touch => {
            props.insert("modifiedat".into(), Value::from(now));
        }
        Bump => {
            let epoch = props.get("epoch").and_then(Value::as_u64).unwrap_or(0);
            props.insert("epoch".into(), Value::from(epoch + 1));
            props.insert("modifiedat".into(), Value::from(now));
        }
        Stamp => {
            props.insert("epoch".into(), Value::from(1u64));
            if !props.contains_key("createdat") {
                props.insert("createdat".into(), Value::from(now));
            }
            props.insert("modifiedat".into(), Value::from(now));
        }
    }
}
