//! Entity Paths
//!
//! Parsing and formatting of registry paths:
//!
//! ```text
//! /                                   Registry
//! /model                              Model
//! /<groups>[/<gid>]                   Group collection / Group
//! /<groups>/<gid>/<resources>[/<rid>] Resource collection / Resource
//! /<groups>/<gid>/<resources>/<rid>/meta
//! /<groups>/<gid>/<resources>/<rid>/versions[/<vid>]
//! ```
//!
//! A trailing `$structure` on a Resource or Version id selects the
//! metadata view instead of the raw document.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{RegistryError, Result};

pub const STRUCTURE_SUFFIX: &str = "$structure";

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9_.\-~:@]{0,127}$").expect("static regex")
    })
}

/// Reject ids outside the allowed character set
pub fn validate_id(id: &str) -> Result<()> {
    if id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(RegistryError::bad_request(format!("Invalid ID \"{}\"", id)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupRef {
    pub plural: String,
    pub id: String,
}

impl GroupRef {
    pub fn new(plural: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            plural: plural.into(),
            id: id.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("/{}/{}", self.plural, self.id)
    }

    pub fn resource(&self, plural: impl Into<String>, id: impl Into<String>) -> ResourceRef {
        ResourceRef {
            group: self.clone(),
            plural: plural.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub group: GroupRef,
    pub plural: String,
    pub id: String,
}

impl ResourceRef {
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.group.key(), self.plural, self.id)
    }

    pub fn meta_key(&self) -> String {
        format!("{}/meta", self.key())
    }

    pub fn versions_key(&self) -> String {
        format!("{}/versions", self.key())
    }

    pub fn version_key(&self, vid: &str) -> String {
        format!("{}/versions/{}", self.key(), vid)
    }

    /// Same Group and Resource types
    pub fn same_type(&self, other: &ResourceRef) -> bool {
        self.group.plural == other.group.plural && self.plural == other.plural
    }
}

/// A parsed registry path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XPath {
    Registry,
    Model,
    Groups(String),
    Group(GroupRef),
    Resources(GroupRef, String),
    Resource(ResourceRef),
    Meta(ResourceRef),
    Versions(ResourceRef),
    Version(ResourceRef, String),
}

impl XPath {
    /// Parse a path, rejecting `$structure`
    pub fn parse(path: &str) -> Result<Self> {
        let (xpath, structure) = Self::parse_request(path)?;
        if structure {
            return Err(RegistryError::bad_request(format!("Invalid path \"{}\"", path)));
        }
        Ok(xpath)
    }

    /// Parse a request path; the flag reports a `$structure` suffix
    pub fn parse_request(path: &str) -> Result<(Self, bool)> {
        let invalid = || RegistryError::bad_request(format!("Invalid path \"{}\"", path));
        let segments: Vec<&str> = path
            .trim_start_matches('/')
            .trim_end_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        let mut structure = false;
        let mut owned: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
        if let Some(last) = owned.last_mut() {
            if let Some(stripped) = last.strip_suffix(STRUCTURE_SUFFIX) {
                *last = stripped.to_string();
                structure = true;
            }
        }

        let xpath = match owned.as_slice() {
            [] => XPath::Registry,
            [m] if m == "model" => XPath::Model,
            [g] => XPath::Groups(g.clone()),
            [g, gid] => XPath::Group(GroupRef::new(g, gid)),
            [g, gid, r] => XPath::Resources(GroupRef::new(g, gid), r.clone()),
            [g, gid, r, rid] => XPath::Resource(GroupRef::new(g, gid).resource(r, rid)),
            [g, gid, r, rid, m] if m == "meta" => XPath::Meta(GroupRef::new(g, gid).resource(r, rid)),
            [g, gid, r, rid, v] if v == "versions" => {
                XPath::Versions(GroupRef::new(g, gid).resource(r, rid))
            }
            [g, gid, r, rid, v, vid] if v == "versions" => {
                XPath::Version(GroupRef::new(g, gid).resource(r, rid), vid.clone())
            }
            _ => return Err(invalid()),
        };

        if structure && !matches!(xpath, XPath::Resource(_) | XPath::Version(..)) {
            return Err(invalid());
        }
        if owned.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }
        Ok((xpath, structure))
    }

    /// Store key of the entity the path names; collections have none
    pub fn key(&self) -> Option<String> {
        match self {
            XPath::Registry => Some("/".to_string()),
            XPath::Group(g) => Some(g.key()),
            XPath::Resource(r) => Some(r.key()),
            XPath::Meta(r) => Some(r.meta_key()),
            XPath::Version(r, vid) => Some(r.version_key(vid)),
            _ => None,
        }
    }
}

impl fmt::Display for XPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XPath::Registry => write!(f, "/"),
            XPath::Model => write!(f, "/model"),
            XPath::Groups(g) => write!(f, "/{}", g),
            XPath::Group(g) => write!(f, "{}", g.key()),
            XPath::Resources(g, r) => write!(f, "{}/{}", g.key(), r),
            XPath::Resource(r) => write!(f, "{}", r.key()),
            XPath::Meta(r) => write!(f, "{}", r.meta_key()),
            XPath::Versions(r) => write!(f, "{}", r.versions_key()),
            XPath::Version(r, vid) => write!(f, "{}", r.version_key(vid)),
        }
    }
}
