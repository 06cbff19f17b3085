//! Registry
//!
//! The entity tree: one Registry root, Groups per Group type, Resources
//! per Resource type, and under each Resource a Meta record plus its
//! Versions. Every call runs as a single transaction against the
//! [`Store`]: the whole call commits, or nothing does.

mod delete;
mod read;
mod txn;
mod write;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{RegistryConfig, RegistrySettings, StoreBackend};
use crate::content::{self, ContentFetcher, ContentResponse, HttpFetcher};
use crate::default_version::SetDefault;
use crate::epoch::Mutation;
use crate::error::{RegistryError, Result};
use crate::model::{export, Model};
use crate::path::XPath;
use crate::store::{EntityKind, MemoryStore, Row, SqliteStore, Store};
use crate::validate::WriteMode;

pub use read::Inline;
use read::View;
use txn::Txn;

/// HTTP-style write verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    Put,
    Patch,
    Post,
}

impl WriteMethod {
    pub fn mode(&self) -> WriteMode {
        match self {
            WriteMethod::Patch => WriteMode::Merge,
            WriteMethod::Put | WriteMethod::Post => WriteMode::Replace,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMethod::Put => "PUT",
            WriteMethod::Patch => "PATCH",
            WriteMethod::Post => "POST",
        }
    }
}

/// Query options recognized on writes and deletes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Accept child collections, `meta` and `versions` inside documents
    pub nested: bool,
    /// Skip the epoch match check
    pub no_epoch: bool,
    pub set_default: Option<SetDefault>,
    /// Expected epoch for a single-entity delete
    pub epoch: Option<u64>,
}

impl WriteOptions {
    pub fn from_query(pairs: &[(String, String)]) -> Result<Self> {
        let mut opts = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                "nested" => opts.nested = true,
                "noepoch" => opts.no_epoch = true,
                "setdefaultversionid" => {
                    if value.is_empty() {
                        return Err(RegistryError::bad_request(
                            "\"setdefaultversionid\" must not be empty",
                        ));
                    }
                    opts.set_default = Some(SetDefault::parse(value));
                }
                "epoch" => {
                    let epoch = value.parse::<u64>().map_err(|_| {
                        RegistryError::bad_request(format!("Epoch value \"{}\" must be a UINTEGER", value))
                    })?;
                    opts.epoch = Some(epoch);
                }
                _ => {}
            }
        }
        Ok(opts)
    }
}

/// Query options recognized on reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub inline: Inline,
    /// Omit empty child collections
    pub compact: bool,
}

impl ReadOptions {
    pub fn from_query(pairs: &[(String, String)]) -> Result<Self> {
        let mut opts = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                "inline" => opts.inline.extend(value),
                "compact" => opts.compact = true,
                _ => {}
            }
        }
        Ok(opts)
    }

    pub fn inline(paths: &str) -> Self {
        let mut opts = Self::default();
        opts.inline.extend(paths);
        opts
    }
}

/// Result of a write
#[derive(Debug, Clone, PartialEq)]
pub struct Written {
    /// Rendered entity (or map of entities for collection writes)
    pub value: Value,
    pub created: bool,
    pub location: String,
}

/// What a write produced, rendered after the cascade is applied
pub(crate) enum Outcome {
    One(XPath, bool),
    Many(XPath, Vec<String>),
}

struct State {
    store: Box<dyn Store>,
    model: Model,
}

pub struct Registry {
    state: Mutex<State>,
    settings: RegistrySettings,
    fetcher: Arc<dyn ContentFetcher>,
}

const MODEL_KEY: &str = "model";

impl Registry {
    /// Open a registry over `store`, creating the root entity on first use
    pub fn new(store: Box<dyn Store>, settings: RegistrySettings) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&Default::default())?);
        Self::with_parts(store, settings, fetcher)
    }

    /// In-memory registry with default settings
    pub fn in_memory() -> Result<Self> {
        Self::new(Box::new(MemoryStore::new()), RegistrySettings::default())
    }

    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let store: Box<dyn Store> = match config.store.backend {
            StoreBackend::Memory => Box::new(MemoryStore::new()),
            StoreBackend::Sqlite => Box::new(SqliteStore::open(&config.store_path())?),
        };
        let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
        let registry = Self::with_parts(store, config.registry.clone(), fetcher)?;
        if let Some(path) = &config.model.path {
            let doc: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            registry.set_model(&doc)?;
        }
        Ok(registry)
    }

    pub fn with_parts(
        mut store: Box<dyn Store>,
        settings: RegistrySettings,
        fetcher: Arc<dyn ContentFetcher>,
    ) -> Result<Self> {
        store.begin()?;
        let model = match Self::bootstrap(store.as_mut(), &settings) {
            Ok(model) => {
                store.commit()?;
                model
            }
            Err(e) => {
                store.rollback()?;
                return Err(e);
            }
        };
        Ok(Self {
            state: Mutex::new(State { store, model }),
            settings,
            fetcher,
        })
    }

    /// Swap the proxy fetcher
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    fn bootstrap(store: &mut dyn Store, settings: &RegistrySettings) -> Result<Model> {
        match store.get("/")? {
            Some(root) => match root.system.get(MODEL_KEY) {
                Some(doc) => Model::from_json(doc),
                None => Ok(Model::default()),
            },
            None => {
                let seq = store.next_seq()?;
                let mut root = Row::new("/", None, "", EntityKind::Registry, settings.id.clone(), seq);
                let now = txn::timestamp();
                crate::epoch::apply(&mut root.props, crate::epoch::Effect::Stamp, &now);
                store.put(&root)?;
                info!(id = %settings.id, "Registry created");
                Ok(Model::default())
            }
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn model(&self) -> Model {
        self.state.lock().model.clone()
    }

    /// Run `op` in one transaction and render its outcome
    fn transaction<F>(&self, opts: &WriteOptions, op: F) -> Result<Written>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<Outcome>,
    {
        if self.settings.read_only {
            return Err(RegistryError::ReadOnlyViolation("The registry is read-only".into()));
        }
        let mut guard = self.state.lock();
        let State { store, model } = &mut *guard;
        store.begin()?;

        let result = {
            let mut txn = Txn::new(store.as_mut(), model, &self.settings, opts);
            op(&mut txn).and_then(|outcome| {
                txn.finish()?;
                txn.view().render_outcome(&outcome)
            })
        };

        match result {
            Ok(written) => {
                store.commit()?;
                info!(location = %written.location, created = written.created, "Write committed");
                Ok(written)
            }
            Err(e) => {
                store.rollback()?;
                warn!(error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }

    pub fn put(&self, path: &XPath, doc: &Value, opts: &WriteOptions) -> Result<Written> {
        self.write(WriteMethod::Put, path, doc, opts)
    }

    pub fn patch(&self, path: &XPath, doc: &Value, opts: &WriteOptions) -> Result<Written> {
        self.write(WriteMethod::Patch, path, doc, opts)
    }

    pub fn post(&self, path: &XPath, doc: &Value, opts: &WriteOptions) -> Result<Written> {
        self.write(WriteMethod::Post, path, doc, opts)
    }

    pub fn write(&self, method: WriteMethod, path: &XPath, doc: &Value, opts: &WriteOptions) -> Result<Written> {
        if *path == XPath::Model {
            return match method {
                WriteMethod::Put => {
                    let value = self.set_model(doc)?;
                    Ok(Written {
                        value,
                        created: false,
                        location: path.to_string(),
                    })
                }
                _ => Err(not_allowed(method.as_str(), path)),
            };
        }
        let doc = as_object(doc)?;
        self.transaction(opts, |txn| txn.write(method, path, &doc))
    }

    /// Raw write of a Resource or Version: headers carry the attributes,
    /// the body is the document
    pub fn write_raw(
        &self,
        method: WriteMethod,
        path: &XPath,
        headers: &[(String, String)],
        body: &[u8],
        opts: &WriteOptions,
    ) -> Result<Written> {
        let rref = match path {
            XPath::Resource(r) | XPath::Version(r, _) => r,
            _ => return Err(not_allowed(method.as_str(), path)),
        };
        let doc = {
            let state = self.state.lock();
            let rmodel = state
                .model
                .resource(&rref.group.plural, &rref.plural)
                .ok_or_else(|| unknown_resource_type(&rref.plural))?;
            crate::headers::document_from_raw(headers, body, &rmodel.content_names(), rmodel.version_schema())?
        };
        self.transaction(opts, |txn| txn.write(method, path, &doc))
    }

    /// Delete an entity, or entries of a collection. A collection delete
    /// takes `{id: {"epoch": n}}` or deletes everything when `batch` is absent.
    pub fn delete(&self, path: &XPath, batch: Option<&Value>, opts: &WriteOptions) -> Result<()> {
        let batch = match batch {
            None | Some(Value::Null) => None,
            Some(v) => Some(as_object(v)?),
        };
        self.transaction(opts, |txn| {
            txn.delete(path, batch.as_ref())?;
            Ok(Outcome::Many(XPath::Registry, Vec::new()))
        })
        .map(|_| ())
    }

    /// Structured read
    pub fn get(&self, path: &XPath, opts: &ReadOptions) -> Result<Value> {
        let guard = self.state.lock();
        let view = View::new(guard.store.as_ref(), &guard.model, &self.settings);
        view.read(path, opts)
    }

    /// Raw read of a Resource or Version document
    pub fn get_raw(&self, path: &XPath) -> Result<ContentResponse> {
        let guard = self.state.lock();
        let view = View::new(guard.store.as_ref(), &guard.model, &self.settings);
        let (names, state, props) = view.raw_parts(path)?;
        let mut response = content::respond(&state, &names, self.fetcher.as_ref())?;
        let mut headers = crate::headers::to_headers(&props);
        headers.append(&mut response.headers);
        response.headers = headers;
        Ok(response)
    }

    /// Render the model in a named format
    pub fn render_model(&self, schema: Option<&str>) -> Result<Value> {
        export::render_model(&self.state.lock().model, schema)
    }

    /// Replace the model, re-validating every stored entity against it
    pub fn set_model(&self, doc: &Value) -> Result<Value> {
        if self.settings.read_only {
            return Err(RegistryError::ReadOnlyViolation("The registry is read-only".into()));
        }
        let model = Model::from_json(doc)?;
        let mut guard = self.state.lock();
        let State { store, .. } = &mut *guard;
        store.begin()?;

        let opts = WriteOptions::default();
        let result = {
            let mut txn = Txn::new(store.as_mut(), &model, &self.settings, &opts);
            txn.revalidate().and_then(|_| {
                let mut root = txn.require("/", "Registry", "/")?;
                root.system.insert(MODEL_KEY.into(), doc.clone());
                txn.store.put(&root)?;
                txn.cascade.record(Mutation::Update, EntityKind::Registry, "/");
                txn.finish()
            })
        };

        match result {
            Ok(()) => {
                store.commit()?;
                info!(groups = model.groups.len(), "Model updated");
                let rendered = model.to_json();
                guard.model = model;
                Ok(rendered)
            }
            Err(e) => {
                store.rollback()?;
                warn!(error = %e, "Model update rolled back");
                Err(e)
            }
        }
    }
}

fn as_object(doc: &Value) -> Result<Map<String, Value>> {
    match doc {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        _ => Err(RegistryError::bad_request("Body must be a JSON object")),
    }
}

pub(crate) fn not_allowed(method: &str, path: &XPath) -> RegistryError {
    RegistryError::MethodNotAllowed(format!("{} not allowed on \"{}\"", method, path))
}

pub(crate) fn unknown_group_type(plural: &str) -> RegistryError {
    RegistryError::not_found(format!("Unknown Group type: {}", plural))
}

pub(crate) fn unknown_resource_type(plural: &str) -> RegistryError {
    RegistryError::not_found(format!("Unknown Resource type: {}", plural))
}
