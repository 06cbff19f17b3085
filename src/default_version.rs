//! Default-Version Selector
//!
//! A Resource's Meta holds `{pointer, sticky}`. The transition functions
//! here take the complete proposed Version set and return the next
//! state; they never look at storage. "Latest" is decided by creation
//! time with the store's creation sequence as tiebreak.

use serde_json::{Map, Value};

use crate::error::{RegistryError, Result};
use crate::validate::WriteMode;

/// What the selector needs to know about a Version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionStamp {
    pub id: String,
    pub createdat: String,
    pub seq: u64,
}

impl VersionStamp {
    pub fn new(id: impl Into<String>, createdat: impl Into<String>, seq: u64) -> Self {
        Self {
            id: id.into(),
            createdat: createdat.into(),
            seq,
        }
    }
}

/// A client's `setdefaultversionid` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetDefault {
    Id(String),
    /// Clear stickiness, follow the latest Version
    Null,
    /// The single Version processed by this call
    Request,
}

impl SetDefault {
    pub fn parse(value: &str) -> Self {
        match value {
            "null" => SetDefault::Null,
            "request" => SetDefault::Request,
            id => SetDefault::Id(id.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DefaultState {
    pub pointer: Option<String>,
    pub sticky: bool,
}

impl DefaultState {
    pub fn from_meta(props: &Map<String, Value>) -> Self {
        Self {
            pointer: props
                .get("defaultversionid")
                .and_then(Value::as_str)
                .map(String::from),
            sticky: props
                .get("defaultversionsticky")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    pub fn write_to(&self, props: &mut Map<String, Value>) {
        match &self.pointer {
            Some(id) => props.insert("defaultversionid".into(), Value::from(id.clone())),
            None => props.remove("defaultversionid"),
        };
        props.insert("defaultversionsticky".into(), Value::Bool(self.sticky));
    }

    fn latest(versions: &[VersionStamp]) -> Self {
        Self {
            pointer: latest(versions).map(|v| v.id.clone()),
            sticky: false,
        }
    }
}

/// Newest Version by creation time, then creation order
pub fn latest(versions: &[VersionStamp]) -> Option<&VersionStamp> {
    versions
        .iter()
        .max_by(|a, b| (&a.createdat, a.seq).cmp(&(&b.createdat, b.seq)))
}

fn forbid(plural: &str) -> RegistryError {
    RegistryError::bad_request(format!(
        "Resource \"{}\" doesn't allow setting of \"defaultversionid\"",
        plural
    ))
}

/// Selection rules for a Resource type
#[derive(Debug, Clone, Copy)]
pub struct Selector<'a> {
    pub plural: &'a str,
    /// Clients may choose the default
    pub allow_set: bool,
}

impl<'a> Selector<'a> {
    pub fn new(plural: &'a str, allow_set: bool) -> Self {
        Self { plural, allow_set }
    }

    /// State after Versions were created or updated in one call.
    /// `versions` is the full set after the write, `processed` the ids
    /// this call wrote.
    pub fn after_write(
        &self,
        state: &DefaultState,
        versions: &[VersionStamp],
        processed: &[String],
        request: Option<&SetDefault>,
    ) -> Result<DefaultState> {
        if request.is_some() && !self.allow_set {
            return Err(forbid(self.plural));
        }
        match request {
            Some(SetDefault::Id(id)) => {
                if !versions.iter().any(|v| &v.id == id) {
                    return Err(RegistryError::structural(format!("Version \"{}\" not found", id)));
                }
                Ok(DefaultState {
                    pointer: Some(id.clone()),
                    sticky: true,
                })
            }
            Some(SetDefault::Request) => match processed {
                [] => Err(RegistryError::bad_request(
                    "Can't use 'request' if a version wasn't processed",
                )),
                [id] => Ok(DefaultState {
                    pointer: Some(id.clone()),
                    sticky: true,
                }),
                _ => Err(RegistryError::bad_request(
                    "?setdefaultversionid can not be 'request'",
                )),
            },
            Some(SetDefault::Null) => Ok(DefaultState::latest(versions)),
            None => {
                let pinned = state
                    .pointer
                    .as_ref()
                    .filter(|p| state.sticky && versions.iter().any(|v| &v.id == *p));
                match pinned {
                    Some(_) => Ok(state.clone()),
                    None => Ok(DefaultState::latest(versions)),
                }
            }
        }
    }

    /// State after `deleted` Versions were removed, leaving `remaining`
    pub fn after_delete(
        &self,
        state: &DefaultState,
        remaining: &[VersionStamp],
        deleted: &[String],
        next: Option<&SetDefault>,
    ) -> Result<DefaultState> {
        if next.is_some() && !self.allow_set {
            return Err(forbid(self.plural));
        }
        match next {
            Some(SetDefault::Id(id)) => {
                if deleted.contains(id) {
                    return Err(RegistryError::structural(
                        "Can't set defaultversionid to Version being deleted",
                    ));
                }
                if !remaining.iter().any(|v| &v.id == id) {
                    return Err(RegistryError::not_found(format!(
                        "Can't find next default Version \"{}\"",
                        id
                    )));
                }
                Ok(DefaultState {
                    pointer: Some(id.clone()),
                    sticky: true,
                })
            }
            Some(SetDefault::Request) => Err(RegistryError::bad_request(
                "Can't use 'request' if a version wasn't processed",
            )),
            Some(SetDefault::Null) => Ok(DefaultState::latest(remaining)),
            None => {
                let survives = state
                    .pointer
                    .as_ref()
                    .is_some_and(|p| remaining.iter().any(|v| &v.id == p));
                if survives {
                    Ok(state.clone())
                } else {
                    Ok(DefaultState::latest(remaining))
                }
            }
        }
    }
}

/// Translate a Meta write's `defaultversionid`/`defaultversionsticky`
/// into a selector request, if it asks for a change
pub fn meta_request(current: &DefaultState, doc: &Map<String, Value>, mode: WriteMode) -> Option<SetDefault> {
    let sticky = match doc.get("defaultversionsticky") {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::Null) => Some(false),
        Some(_) => None,
        None if mode == WriteMode::Replace => Some(false),
        None => None,
    };
    let id = doc.get("defaultversionid").and_then(Value::as_str);

    match (sticky, id) {
        (Some(false), _) => current.sticky.then_some(SetDefault::Null),
        (_, Some(id)) => {
            let unchanged = current.sticky && current.pointer.as_deref() == Some(id);
            (!unchanged).then(|| SetDefault::Id(id.to_string()))
        }
        (Some(true), None) => match (&current.pointer, current.sticky) {
            (Some(pointer), false) => Some(SetDefault::Id(pointer.clone())),
            _ => None,
        },
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn versions(ids: &[&str]) -> Vec<VersionStamp> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| VersionStamp::new(*id, "2024-01-01T00:00:00Z", i as u64 + 1))
            .collect()
    }

    fn state(pointer: &str, sticky: bool) -> DefaultState {
        DefaultState {
            pointer: Some(pointer.to_string()),
            sticky,
        }
    }

    const SEL: Selector<'static> = Selector {
        plural: "files",
        allow_set: true,
    };

    #[test]
    fn test_latest_uses_creation_order_tiebreak() {
        let mut all = versions(&["b", "a"]);
        assert_eq!(latest(&all).unwrap().id, "a");
        all[0].createdat = "2025-01-01T00:00:00Z".into();
        assert_eq!(latest(&all).unwrap().id, "b");
    }

    #[test]
    fn test_new_version_becomes_default_when_not_sticky() {
        let next = SEL
            .after_write(&state("1", false), &versions(&["1", "2"]), &["2".into()], None)
            .unwrap();
        assert_eq!(next, state("2", false));
    }

    #[test]
    fn test_sticky_default_survives_new_version() {
        let next = SEL
            .after_write(&state("1", true), &versions(&["1", "2"]), &["2".into()], None)
            .unwrap();
        assert_eq!(next, state("1", true));
    }

    #[test]
    fn test_explicit_id_makes_sticky() {
        let next = SEL
            .after_write(&state("2", false), &versions(&["1", "2"]), &[], Some(&SetDefault::Id("1".into())))
            .unwrap();
        assert_eq!(next, state("1", true));

        let err = SEL
            .after_write(&state("2", false), &versions(&["1", "2"]), &[], Some(&SetDefault::Id("9".into())))
            .unwrap_err();
        assert_eq!(err.to_string(), "Version \"9\" not found");
    }

    #[test]
    fn test_request_needs_exactly_one_version() {
        let all = versions(&["1", "2", "3"]);
        let next = SEL
            .after_write(&state("1", false), &all, &["2".into()], Some(&SetDefault::Request))
            .unwrap();
        assert_eq!(next, state("2", true));

        let none = SEL.after_write(&state("1", false), &all, &[], Some(&SetDefault::Request));
        assert_eq!(none.unwrap_err().to_string(), "Can't use 'request' if a version wasn't processed");

        let many = SEL.after_write(&state("1", false), &all, &["2".into(), "3".into()], Some(&SetDefault::Request));
        assert_eq!(many.unwrap_err().to_string(), "?setdefaultversionid can not be 'request'");
    }

    #[test]
    fn test_null_reverts_to_latest() {
        let next = SEL
            .after_write(&state("1", true), &versions(&["1", "2"]), &[], Some(&SetDefault::Null))
            .unwrap();
        assert_eq!(next, state("2", false));
    }

    #[test]
    fn test_forbidden_by_model() {
        let sel = Selector::new("files", false);
        let err = sel
            .after_write(&state("1", false), &versions(&["1"]), &[], Some(&SetDefault::Id("1".into())))
            .unwrap_err();
        assert_eq!(err.to_string(), "Resource \"files\" doesn't allow setting of \"defaultversionid\"");
        assert!(sel.after_delete(&state("1", false), &versions(&["2"]), &["1".into()], Some(&SetDefault::Null)).is_err());
    }

    #[test]
    fn test_delete_default_with_next() {
        let next = SEL
            .after_delete(&state("1", true), &versions(&["2", "3"]), &["1".into()], Some(&SetDefault::Id("2".into())))
            .unwrap();
        assert_eq!(next, state("2", true));
    }

    #[test]
    fn test_delete_next_errors() {
        let same = SEL.after_delete(&state("1", true), &versions(&["2"]), &["1".into()], Some(&SetDefault::Id("1".into())));
        assert_eq!(same.unwrap_err().to_string(), "Can't set defaultversionid to Version being deleted");
        let missing = SEL.after_delete(&state("1", true), &versions(&["2"]), &["1".into()], Some(&SetDefault::Id("7".into())));
        assert_eq!(missing.unwrap_err().to_string(), "Can't find next default Version \"7\"");
    }

    #[test]
    fn test_delete_default_falls_back_to_latest() {
        let next = SEL
            .after_delete(&state("3", true), &versions(&["1", "2"]), &["3".into()], None)
            .unwrap();
        assert_eq!(next, state("2", false));
    }

    #[test]
    fn test_delete_non_default_keeps_pointer() {
        let next = SEL
            .after_delete(&state("1", true), &versions(&["1", "3"]), &["2".into()], None)
            .unwrap();
        assert_eq!(next, state("1", true));
    }

    #[test]
    fn test_delete_everything_clears() {
        let next = SEL.after_delete(&state("1", false), &[], &["1".into()], None).unwrap();
        assert_eq!(next, DefaultState::default());
    }

    #[test]
    fn test_meta_request_translation() {
        let doc = |v: Value| v.as_object().unwrap().clone();
        let cur = state("1", false);
        assert_eq!(
            meta_request(&cur, &doc(json!({ "defaultversionid": "2", "defaultversionsticky": true })), WriteMode::Replace),
            Some(SetDefault::Id("2".into()))
        );
        assert_eq!(meta_request(&cur, &doc(json!({})), WriteMode::Replace), None);
        assert_eq!(
            meta_request(&cur, &doc(json!({ "defaultversionsticky": true })), WriteMode::Merge),
            Some(SetDefault::Id("1".into()))
        );
        let pinned = state("1", true);
        assert_eq!(meta_request(&pinned, &doc(json!({})), WriteMode::Replace), Some(SetDefault::Null));
        assert_eq!(meta_request(&pinned, &doc(json!({ "name": "x" })), WriteMode::Merge), None);
        assert_eq!(
            meta_request(&pinned, &doc(json!({ "defaultversionid": "1", "defaultversionsticky": true })), WriteMode::Replace),
            None
        );
    }

    #[test]
    fn test_state_round_trips_through_meta() {
        let mut props = Map::new();
        state("4", true).write_to(&mut props);
        assert_eq!(DefaultState::from_meta(&props), state("4", true));
    }
}
