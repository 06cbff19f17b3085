//! Xref Resolver
//!
//! A Resource whose Meta carries `xref` aliases another Resource of the
//! same type: it owns no Versions and its reads are served from the
//! target's default Version. The helpers here check xref writes and
//! follow alias chains; the entity tree calls them while setting,
//! clearing and rendering.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::error::{RegistryError, Result};
use crate::model::core::SERVER_MANAGED;
use crate::path::{validate_id, GroupRef, ResourceRef};
use crate::store::Store;

/// Meta `system` key keeping `createdat` from before the xref was set
pub const ORIGINAL_CREATEDAT: &str = "originalcreatedat";

/// Local attributes an aliasing Resource keeps displaying
pub const OVERLAY: &[&str] = &["name", "description", "documentation", "labels"];

fn xref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^/([^/]+)/([^/]+)/([^/]+)/([^/]+)$").expect("static regex"))
}

/// Parse `/GROUPS/gID/RESOURCES/rID`
pub fn parse(value: &str) -> Result<ResourceRef> {
    let invalid = || {
        RegistryError::bad_request(format!(
            "'xref' ({}) must be of the form: /GROUPS/gID/RESOURCES/rID",
            value
        ))
    };
    let caps = xref_pattern().captures(value).ok_or_else(invalid)?;
    let part = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
    validate_id(part(2)).map_err(|_| invalid())?;
    validate_id(part(4)).map_err(|_| invalid())?;
    Ok(GroupRef::new(part(1), part(2)).resource(part(3), part(4)))
}

/// An xref must name a different Resource of the same type
pub fn check_target(source: &ResourceRef, target: &ResourceRef) -> Result<()> {
    if !source.same_type(target) {
        return Err(RegistryError::bad_request(format!(
            "'xref' ({}) must point to a Resource of type \"/{}/{}\"",
            target.key(),
            source.group.plural,
            source.plural
        )));
    }
    if source == target {
        return Err(RegistryError::bad_request(format!(
            "'xref' ({}) can't point to itself",
            target.key()
        )));
    }
    Ok(())
}

/// Non-null members of `doc` outside `allowed` that differ from what a
/// read currently shows, sorted
fn extras<'d>(doc: &'d Map<String, Value>, shown: &Map<String, Value>, allowed: impl Fn(&str) -> bool) -> Vec<&'d str> {
    let mut extras: Vec<&str> = doc
        .iter()
        .filter(|(k, v)| !v.is_null() && !allowed(k.as_str()) && shown.get(k.as_str()) != Some(*v))
        .map(|(k, _)| k.as_str())
        .collect();
    extras.sort_unstable();
    extras
}

fn extras_error(extras: &[&str], scope: &str) -> RegistryError {
    RegistryError::structural(format!(
        "Extra attributes ({}) in \"{}\" not allowed when \"xref\" is set",
        extras.join(","),
        scope
    ))
}

/// Only identity and epoch attributes may accompany `xref` in a Meta
/// write. Server-managed fields and values repeated from the current
/// Meta pass, so a read-back can be written as is.
pub fn check_meta_extras(doc: &Map<String, Value>, id_attr: &str, shown: &Map<String, Value>) -> Result<()> {
    let allowed = |k: &str| {
        k == id_attr || ["xref", "self", "xid", "defaultversionurl"].contains(&k) || SERVER_MANAGED.contains(&k)
    };
    let found = extras(doc, shown, allowed);
    if found.is_empty() {
        return Ok(());
    }
    Err(extras_error(&found, "meta"))
}

/// An aliasing Resource takes only its [`OVERLAY`] attributes; anything
/// else must be `allowed` or repeat the Resource as currently read
pub fn check_alias_extras(
    doc: &Map<String, Value>,
    singular: &str,
    shown: &Map<String, Value>,
    allowed: impl Fn(&str) -> bool,
) -> Result<()> {
    let found = extras(doc, shown, |k| OVERLAY.contains(&k) || allowed(k));
    if found.is_empty() {
        return Ok(());
    }
    Err(extras_error(&found, singular))
}

/// Rejection for Version writes on an aliasing Resource
pub fn versions_locked(delete: bool) -> RegistryError {
    let verb = if delete { "delete" } else { "update" };
    RegistryError::structural(format!("Can't {} \"versions\" if \"xref\" is set", verb))
}

/// `xref` of a stored Meta, if set
pub fn xref_of(store: &dyn Store, resource: &ResourceRef) -> Result<Option<String>> {
    Ok(store
        .get(&resource.meta_key())?
        .and_then(|meta| meta.prop_str("xref").map(String::from)))
}

/// Follow xrefs from `start` to the Resource that owns Versions.
/// `None` when the chain dangles or loops.
pub fn resolve(store: &dyn Store, start: &ResourceRef) -> Result<Option<ResourceRef>> {
    let mut seen = HashSet::new();
    let mut current = start.clone();
    loop {
        if !seen.insert(current.key()) {
            return Ok(None);
        }
        if store.get(&current.key())?.is_none() {
            return Ok(None);
        }
        match xref_of(store, &current)? {
            Some(xref) => current = parse(&xref)?,
            None => return Ok(Some(current)),
        }
    }
}
