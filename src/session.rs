//! Session: one connection and the local working set
//!
//! A [`Session`] is constructed explicitly and passed around by the caller.
//! It holds the configuration, the transport, a snapshot of the knowledge
//! types, the knowledge items known locally, and everything staged for the
//! next [`Session::commit`].

use crate::apps::{AppConfig, AppConfigChanges};
use crate::commit::{CommitEngine, CommitReport};
use crate::config::Configuration;
use crate::error::{DsmsError, Result};
use crate::knowledge::kitem::EntityState;
use crate::knowledge::{Annotation, Column, KItem, KType, KTypeRegistry, Webform};
use crate::transport::{self, routes, Request, Transport};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Handle of an item in a session's working set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KItemKey(pub(crate) u64);

impl fmt::Display for KItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Knowledge type changes staged for the next commit
#[derive(Debug, Clone, Default)]
pub(crate) struct KTypeChanges {
    pub(crate) created: Vec<KType>,
    pub(crate) updated: Vec<KType>,
    pub(crate) deleted: BTreeSet<String>,
}

impl KTypeChanges {
    pub(crate) fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Full-text search request
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub search_term: String,
    pub ktypes: Vec<String>,
    /// Annotation IRIs the hits must carry
    pub annotations: Vec<String>,
    pub limit: usize,
    pub allow_fuzzy: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            search_term: String::new(),
            ktypes: Vec::new(),
            annotations: Vec::new(),
            limit: 10,
            allow_fuzzy: true,
        }
    }
}

impl SearchQuery {
    pub fn new(search_term: impl Into<String>) -> Self {
        Self {
            search_term: search_term.into(),
            ..Self::default()
        }
    }

    fn to_wire(&self) -> Value {
        json!({
            "search_term": self.search_term,
            "ktypes": self.ktypes,
            "annotations": self
                .annotations
                .iter()
                .map(|iri| Annotation::from_iri(iri.as_str()))
                .collect::<Vec<_>>(),
            "limit": self.limit,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchHit {
    pub key: KItemKey,
    pub fuzzy: bool,
}

pub struct Session {
    pub(crate) config: Configuration,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) ktypes: KTypeRegistry,
    pub(crate) ktype_changes: KTypeChanges,
    pub(crate) app_changes: AppConfigChanges,
    pub(crate) kitems: BTreeMap<KItemKey, KItem>,
    pub(crate) pending_deletion: BTreeSet<KItemKey>,
    next_key: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host_url", &self.config.host_url)
            .field("ktypes", &self.ktypes.len())
            .field("kitems", &self.kitems.len())
            .field("pending_deletion", &self.pending_deletion)
            .finish()
    }
}

impl Session {
    /// Connect to the instance described by `config` over HTTP
    #[cfg(feature = "http")]
    pub async fn connect(config: Configuration) -> Result<Self> {
        config
            .validate()
            .map_err(|e| DsmsError::validation("configuration", format!("{:#}", e)))?;
        let transport = transport::HttpTransport::connect(config.clone()).await?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Build a session over any transport, pinging the backend and loading
    /// the knowledge types as configured
    pub async fn with_transport(config: Configuration, transport: Arc<dyn Transport>) -> Result<Self> {
        let mut session = Self {
            config,
            transport,
            ktypes: KTypeRegistry::default(),
            ktype_changes: KTypeChanges::default(),
            app_changes: AppConfigChanges::default(),
            kitems: BTreeMap::new(),
            pending_deletion: BTreeSet::new(),
            next_key: 0,
        };

        if session.config.ping_backend {
            session.ping().await?;
        }
        if session.config.auto_fetch_ktypes {
            session.refresh_ktypes().await?;
        }
        info!("Session ready for {}", session.config.host_url);
        Ok(session)
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Check that the host answers like a DSMS instance
    pub async fn ping(&self) -> Result<()> {
        transport::send(self.transport.as_ref(), Request::get(routes::PING))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                DsmsError::NotFound(_) => DsmsError::Transport(format!(
                    "`{}` does not look like a DSMS instance",
                    self.config.host_url
                )),
                other => other,
            })
    }

    pub fn ktypes(&self) -> &KTypeRegistry {
        &self.ktypes
    }

    pub fn ktype(&self, id: &str) -> Option<Arc<KType>> {
        self.ktypes.get(id)
    }

    /// Replace the knowledge type snapshot with the server's current list and
    /// rebind the webforms of every local item
    pub async fn refresh_ktypes(&mut self) -> Result<()> {
        let response = transport::send(self.transport.as_ref(), Request::get(routes::KTYPES)).await?;
        let listed: Vec<Value> = response.json()?;
        let ktypes = listed
            .iter()
            .map(KType::from_wire)
            .collect::<Result<Vec<_>>>()?;
        debug!("Loaded {} knowledge types", ktypes.len());
        self.ktypes = KTypeRegistry::new(ktypes);

        let strict = self.config.strict_validation;
        for kitem in self.kitems.values_mut() {
            let ktype_id = kitem.ktype_id().to_string();
            let webform = self.ktypes.webform(&ktype_id);
            kitem
                .custom_properties_mut()
                .bind_schema(&ktype_id, webform, strict);
        }
        Ok(())
    }

    /// Webform for `ktype_id`, looking at staged creations first
    fn webform_for(&self, ktype_id: &str) -> Option<Arc<Webform>> {
        self.ktype_changes
            .created
            .iter()
            .chain(self.ktype_changes.updated.iter())
            .rev()
            .find(|ktype| ktype.id == ktype_id)
            .and_then(|ktype| ktype.webform.clone())
            .map(Arc::new)
            .or_else(|| self.ktypes.webform(ktype_id))
    }

    fn ktype_known(&self, ktype_id: &str) -> bool {
        self.ktypes.contains(ktype_id)
            || self.ktype_changes.created.iter().any(|k| k.id == ktype_id)
    }

    fn next_key(&mut self) -> KItemKey {
        self.next_key += 1;
        KItemKey(self.next_key)
    }

    /// Register an item in the working set
    ///
    /// Unsaved items must name a known knowledge type, get their slug derived
    /// and checked, and may only carry custom properties the type declares.
    /// The webform is bound so every later mutation is checked as well.
    pub fn add_kitem(&mut self, mut kitem: KItem) -> Result<KItemKey> {
        if let Some(id) = kitem.id() {
            if self.key_of(id).is_some() {
                return Err(DsmsError::validation(
                    "id",
                    format!("knowledge item `{}` is already in the session", id),
                ));
            }
        }
        let unsaved = !kitem.is_persisted();
        if unsaved && self.config.auto_fetch_ktypes && !self.ktype_known(kitem.ktype_id()) {
            return Err(DsmsError::validation(
                "ktype_id",
                format!("knowledge type `{}` does not exist", kitem.ktype_id()),
            ));
        }
        if unsaved {
            kitem.finalize_slug(self.config.individual_slugs)?;
        }

        let ktype_id = kitem.ktype_id().to_string();
        let webform = self.webform_for(&ktype_id);
        let strict = self.config.strict_validation;
        if strict && unsaved {
            if let Some(webform) = &webform {
                if let Some(label) = kitem
                    .custom_properties()
                    .flatten()
                    .keys()
                    .find(|label| !webform.declares(label))
                {
                    return Err(DsmsError::SchemaViolation {
                        key: label.clone(),
                        ktype: ktype_id,
                    });
                }
            }
        }
        kitem
            .custom_properties_mut()
            .bind_schema(&ktype_id, webform, strict);

        let key = self.next_key();
        debug!("Registered knowledge item `{}` as {}", kitem.name(), key);
        self.kitems.insert(key, kitem);
        Ok(key)
    }

    /// Create a new local item and register it
    pub fn new_kitem(&mut self, name: impl Into<String>, ktype_id: impl Into<String>) -> Result<KItemKey> {
        self.add_kitem(KItem::new(name, ktype_id)?)
    }

    pub fn kitem(&self, key: KItemKey) -> Option<&KItem> {
        self.kitems.get(&key)
    }

    pub fn kitem_mut(&mut self, key: KItemKey) -> Option<&mut KItem> {
        self.kitems.get_mut(&key)
    }

    pub fn key_of(&self, id: Uuid) -> Option<KItemKey> {
        self.kitems
            .iter()
            .find(|(_, kitem)| kitem.id() == Some(id))
            .map(|(key, _)| *key)
    }

    pub fn kitems(&self) -> impl Iterator<Item = (KItemKey, &KItem)> {
        self.kitems.iter().map(|(key, kitem)| (*key, kitem))
    }

    pub fn len(&self) -> usize {
        self.kitems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kitems.is_empty()
    }

    /// Drop an item from the working set without touching the server
    pub fn detach(&mut self, key: KItemKey) -> Option<KItem> {
        self.pending_deletion.remove(&key);
        self.kitems.remove(&key)
    }

    /// Stage an item for deletion on the next commit
    pub fn delete_kitem(&mut self, key: KItemKey) -> Result<()> {
        if !self.kitems.contains_key(&key) {
            return Err(DsmsError::NotFound(format!("knowledge item {}", key)));
        }
        self.pending_deletion.insert(key);
        Ok(())
    }

    /// Withdraw a staged deletion; returns whether one was staged
    pub fn discard_deletion(&mut self, key: KItemKey) -> bool {
        self.pending_deletion.remove(&key)
    }

    pub fn state(&self, key: KItemKey) -> Option<EntityState> {
        let kitem = self.kitems.get(&key)?;
        let state = if self.pending_deletion.contains(&key) {
            EntityState::PendingDeletion
        } else if !kitem.is_persisted() {
            EntityState::Unsaved
        } else if kitem.is_dirty() {
            EntityState::Dirty
        } else {
            EntityState::Clean
        };
        Some(state)
    }

    /// Whether the next commit has anything to send
    pub fn is_dirty(&self) -> bool {
        !self.pending_deletion.is_empty()
            || !self.ktype_changes.is_empty()
            || !self.app_changes.is_empty()
            || self.kitems.values().any(KItem::is_dirty)
    }

    pub fn create_ktype(&mut self, ktype: KType) -> Result<()> {
        ktype.validate()?;
        if self.ktype_known(&ktype.id) {
            return Err(DsmsError::validation(
                "ktype.id",
                format!("knowledge type `{}` already exists", ktype.id),
            ));
        }
        self.ktype_changes.created.push(ktype);
        Ok(())
    }

    pub fn update_ktype(&mut self, ktype: KType) -> Result<()> {
        ktype.validate()?;
        if let Some(staged) = self
            .ktype_changes
            .created
            .iter_mut()
            .find(|k| k.id == ktype.id)
        {
            *staged = ktype;
            return Ok(());
        }
        if !self.ktypes.contains(&ktype.id) {
            return Err(DsmsError::NotFound(format!("knowledge type `{}`", ktype.id)));
        }
        self.ktype_changes.updated.retain(|k| k.id != ktype.id);
        self.ktype_changes.updated.push(ktype);
        Ok(())
    }

    pub fn delete_ktype(&mut self, id: &str) -> Result<()> {
        let staged = self.ktype_changes.created.len();
        self.ktype_changes.created.retain(|k| k.id != id);
        if self.ktype_changes.created.len() != staged {
            return Ok(());
        }
        if !self.ktypes.contains(id) {
            return Err(DsmsError::NotFound(format!("knowledge type `{}`", id)));
        }
        self.ktype_changes.updated.retain(|k| k.id != id);
        self.ktype_changes.deleted.insert(id.to_string());
        Ok(())
    }

    /// Stage a new app configuration; the commit fails it if the name is taken
    pub fn create_app_config(&mut self, app: AppConfig) -> Result<()> {
        app.validate()?;
        let changes = &mut self.app_changes;
        if changes.created.iter().any(|a| a.name == app.name) {
            return Err(DsmsError::validation(
                "app.name",
                format!("app configuration `{}` is already staged", app.name),
            ));
        }
        if changes.deleted.contains(&app.name) {
            // Deleted and recreated in one pass: overwrite instead
            changes.deleted.retain(|name| name != &app.name);
            changes.updated.retain(|a| a.name != app.name);
            changes.updated.push(app);
            return Ok(());
        }
        changes.created.push(app);
        Ok(())
    }

    /// Stage an overwrite of an existing app configuration
    pub fn update_app_config(&mut self, app: AppConfig) -> Result<()> {
        app.validate()?;
        let changes = &mut self.app_changes;
        if changes.deleted.contains(&app.name) {
            return Err(DsmsError::validation(
                "app.name",
                format!("app configuration `{}` is staged for deletion", app.name),
            ));
        }
        if let Some(staged) = changes.created.iter_mut().find(|a| a.name == app.name) {
            *staged = app;
            return Ok(());
        }
        changes.updated.retain(|a| a.name != app.name);
        changes.updated.push(app);
        Ok(())
    }

    pub fn delete_app_config(&mut self, name: &str) -> Result<()> {
        let changes = &mut self.app_changes;
        let staged = changes.created.len();
        changes.created.retain(|a| a.name != name);
        if changes.created.len() != staged {
            return Ok(());
        }
        changes.updated.retain(|a| a.name != name);
        if !changes.deleted.iter().any(|n| n == name) {
            changes.deleted.push(name.to_string());
        }
        Ok(())
    }

    /// App configuration as currently stored on the server
    pub async fn fetch_app_config(&self, name: &str) -> Result<AppConfig> {
        let response =
            transport::send(self.transport.as_ref(), Request::get(routes::app_spec(name))).await?;
        AppConfig::from_definition(name, &response.body)
    }

    /// Run a SPARQL query against the knowledge item repository and return
    /// the result bindings
    pub async fn sparql_query(&self, query: &str) -> Result<Vec<Value>> {
        if query.trim().is_empty() {
            return Err(DsmsError::validation("query", "must not be empty"));
        }
        let request = Request::post(routes::SPARQL_QUERY)
            .form(vec![("query".to_string(), query.to_string())])
            .query("repository", self.config.kitem_repo.clone());
        let response = transport::send(self.transport.as_ref(), request).await?;
        let body: Value = response.json()?;
        match body.pointer("/results/bindings") {
            Some(Value::Array(bindings)) => Ok(bindings.clone()),
            _ => Err(DsmsError::Transport(
                "SPARQL response carried no result bindings".to_string(),
            )),
        }
    }

    /// Run a SPARQL update against the knowledge item repository
    pub async fn sparql_update(&self, update: &str) -> Result<()> {
        if update.trim().is_empty() {
            return Err(DsmsError::validation("update", "must not be empty"));
        }
        let request = Request::post(routes::SPARQL_UPDATE)
            .multipart("file", "update.sparql", update.as_bytes().to_vec())
            .query("repository", self.config.kitem_repo.clone());
        transport::send(self.transport.as_ref(), request).await?;
        Ok(())
    }

    /// Upload an RDF document into the knowledge item repository
    pub async fn insert_rdf(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DsmsError::validation("rdf", "path has no file name"))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DsmsError::validation("rdf", format!("cannot read `{}`: {}", path.display(), e)))?;
        let request = Request::post(routes::ADD_RDF)
            .multipart("file", file_name, bytes)
            .query("repository", self.config.kitem_repo.clone());
        transport::send(self.transport.as_ref(), request).await?;
        debug!("Uploaded RDF from {}", path.display());
        Ok(())
    }

    /// Put a server payload into the working set. A clean local copy is
    /// refreshed; a dirty one is left alone.
    pub(crate) fn hydrate(&mut self, data: &Value) -> Result<KItemKey> {
        let fresh = KItem::from_snapshot(data)?;
        let Some(id) = fresh.id() else {
            return Err(DsmsError::validation("id", "server payload carried no identity"));
        };
        if let Some(key) = self.key_of(id) {
            if let Some(existing) = self.kitems.get_mut(&key) {
                if !existing.is_dirty() {
                    existing.apply_server_snapshot(data)?;
                } else {
                    debug!("Keeping local changes of `{}` over fetched copy", existing.name());
                }
            }
            return Ok(key);
        }
        self.add_kitem(fresh)
    }

    pub async fn fetch_kitem(&mut self, id: Uuid) -> Result<KItemKey> {
        let response = transport::send(self.transport.as_ref(), Request::get(routes::kitem(id))).await?;
        self.hydrate(&response.json::<Value>()?)
    }

    pub async fn fetch_all_kitems(&mut self) -> Result<Vec<KItemKey>> {
        let response = transport::send(self.transport.as_ref(), Request::get(routes::KITEMS)).await?;
        let listed: Vec<Value> = response.json()?;
        listed.iter().map(|data| self.hydrate(data)).collect()
    }

    pub async fn search(&mut self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let request = Request::post(routes::KITEM_SEARCH)
            .json(query.to_wire())
            .query("allow_fuzzy", query.allow_fuzzy.to_string());
        let response = transport::send(self.transport.as_ref(), request).await?;
        let hits: Vec<Value> = response.json()?;
        debug!("Search for `{}` returned {} hits", query.search_term, hits.len());

        hits.iter()
            .map(|hit| {
                Ok(SearchHit {
                    key: self.hydrate(&hit["hit"])?,
                    fuzzy: hit["fuzzy"].as_bool().unwrap_or(false),
                })
            })
            .collect()
    }

    fn persisted_id(&self, key: KItemKey) -> Result<Uuid> {
        self.kitems
            .get(&key)
            .ok_or_else(|| DsmsError::NotFound(format!("knowledge item {}", key)))?
            .id()
            .ok_or_else(|| DsmsError::validation("id", "item has not been committed yet"))
    }

    /// Load the tabular data of an item as its synced dataframe
    ///
    /// Items read from the server need this before their dataframe can be
    /// edited. Unsaved local edits of the table are discarded.
    pub async fn fetch_dataframe(&mut self, key: KItemKey) -> Result<()> {
        let id = self.persisted_id(key)?;
        let columns = match transport::send(self.transport.as_ref(), Request::get(routes::dataframe(id))).await {
            Ok(response) => response.json::<Vec<Value>>()?,
            Err(DsmsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut loaded = Vec::with_capacity(columns.len());
        for column in &columns {
            let column_id = column["column_id"].as_u64().unwrap_or_default() as usize;
            let name = column["name"].as_str().unwrap_or_default().to_string();
            let response = transport::send(
                self.transport.as_ref(),
                Request::get(routes::dataframe_column(id, column_id)),
            )
            .await?;
            let body: Value = response.json()?;
            let values = body["array"].as_array().cloned().unwrap_or_default();
            loaded.push(Column::new(name, values));
        }

        match self.kitems.get_mut(&key) {
            Some(kitem) => kitem.load_dataframe(loaded),
            None => Ok(()),
        }
    }

    pub async fn download_attachment(&self, key: KItemKey, name: &str) -> Result<Vec<u8>> {
        let id = self.persisted_id(key)?;
        let response =
            transport::send(self.transport.as_ref(), Request::get(routes::attachment(id, name))).await?;
        Ok(response.body)
    }

    /// Send every staged change to the server
    ///
    /// The server offers no multi-item transaction: operations run one after
    /// another and whatever failed stays staged for the next call.
    pub async fn commit(&mut self) -> Result<CommitReport> {
        let engine = CommitEngine::new(self);
        engine.run(self).await
    }
}
