//! xRegistry core
//!
//! A versioned metadata registry: a model-driven tree of Groups,
//! Resources and Versions with typed attributes, epochs, default-version
//! selection, content channels and cross-Resource references.
//!
//! ## Architecture
//!
//! ```text
//! /                                   Registry
//! ├── model                           attribute model
//! └── <groups>/<gid>                  Group
//!     └── <resources>/<rid>           Resource (default Version view)
//!         ├── meta                    Meta: defaultversionid, sticky, xref
//!         └── versions/<vid>          Version (attributes + document)
//! ```
//!
//! Every call runs in one store transaction; the epoch cascade and the
//! default-version selector run before it commits.

pub mod config;
pub mod content;
pub mod default_version;
pub mod epoch;
pub mod error;
pub mod headers;
pub mod model;
pub mod path;
pub mod registry;
pub mod request;
pub mod store;
pub mod validate;
pub mod xref;

pub use config::{RegistryConfig, RegistrySettings, StoreBackend};
pub use content::{ContentFetcher, HttpFetcher};
pub use default_version::SetDefault;
pub use error::{ErrorKind, RegistryError, Result};
pub use model::Model;
pub use path::{GroupRef, ResourceRef, XPath};
pub use registry::{Inline, ReadOptions, Registry, WriteMethod, WriteOptions, Written};
pub use request::{dispatch, Method, Request, Response};
pub use store::{MemoryStore, SqliteStore, Store};
