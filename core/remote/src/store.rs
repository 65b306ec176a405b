//! Remote store facade.
//!
//! [`RemoteStore`] ties the codec, the push and pull engines and the
//! connection state machine to one database. It is cheap to clone; clones
//! share state.

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use couchsync_common::{Error, RemoteObject, Result};

use crate::codec;
use crate::config::RemoteConfig;
use crate::connection::{ConnectionState, ConnectivityProbe, NoopProbe};
use crate::events::{EventBus, EventNamespace, EventPayload, Handler, MemoryBus};
use crate::pull::{FeedState, PullOutcome};
use crate::retry::RetryPolicy;
use crate::revision::{IdGenerator, UuidGenerator};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::task::Task;
use crate::transport::{Method, RequestOptions, Transport};

pub(crate) struct Inner {
    pub(crate) config: RemoteConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: EventNamespace,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) probe: Arc<dyn ConnectivityProbe>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) policy: RetryPolicy,
    state: Mutex<ConnectionState>,
    feed: Mutex<FeedState>,
}

impl Inner {
    pub(crate) fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn feed(&self) -> MutexGuard<'_, FeedState> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for [`RemoteStore`].
pub struct RemoteStoreBuilder {
    config: RemoteConfig,
    transport: Arc<dyn Transport>,
    bus: Option<Arc<dyn EventBus>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl RemoteStoreBuilder {
    /// Deliver events to `bus` instead of a private in-memory bus.
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Schedule watchdogs and retries on `scheduler`.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Connectivity probe invoked after server and unknown failures.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Source of document and revision ids.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> RemoteStore {
        let bus = self.bus.unwrap_or_else(|| Arc::new(MemoryBus::new()));
        let policy = RetryPolicy::new(self.config.retry_delay());

        RemoteStore {
            inner: Arc::new(Inner {
                events: EventNamespace::new(self.config.name.clone(), bus),
                transport: self.transport,
                scheduler: self.scheduler.unwrap_or_else(|| Arc::new(TokioScheduler)),
                probe: self.probe.unwrap_or_else(|| Arc::new(NoopProbe)),
                ids: self.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
                policy,
                state: Mutex::new(ConnectionState::new()),
                feed: Mutex::new(FeedState::default()),
                config: self.config,
            }),
        }
    }
}

/// Replication client for one remote database.
#[derive(Clone)]
pub struct RemoteStore {
    pub(crate) inner: Arc<Inner>,
}

impl RemoteStore {
    /// Create a store with default collaborators.
    pub fn new(config: RemoteConfig, transport: Arc<dyn Transport>) -> Self {
        Self::builder(config, transport).build()
    }

    pub fn builder(config: RemoteConfig, transport: Arc<dyn Transport>) -> RemoteStoreBuilder {
        RemoteStoreBuilder {
            config,
            transport,
            bus: None,
            scheduler: None,
            probe: None,
            ids: None,
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Document id prefix.
    pub fn prefix(&self) -> &str {
        &self.inner.config.prefix
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.inner.config
    }

    /// `suffix` appended to the store root.
    pub(crate) fn path(&self, suffix: &str) -> String {
        let config = &self.inner.config;
        codec::build_path(&config.name, config.base_url.as_deref(), "", None, None, suffix)
    }

    /// Path of a single document.
    pub(crate) fn document_path(&self, object_type: &str, id: &str) -> String {
        let config = &self.inner.config;
        codec::build_path(
            &config.name,
            config.base_url.as_deref(),
            &config.prefix,
            Some(object_type),
            Some(id),
            "",
        )
    }

    pub(crate) async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        debug!(store = %self.name(), %method, path, "Sending request");
        self.inner
            .transport
            .request(method, path, RequestOptions::json(method, body))
            .await
    }

    /// Issue a raw request relative to the store root.
    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        self.send(method, &self.path(path), body).await
    }

    /// Fetch one object.
    pub async fn find(&self, object_type: &str, id: &str) -> Result<RemoteObject> {
        let doc = self
            .send(Method::Get, &self.document_path(object_type, id), None)
            .await?;
        doc.as_object()
            .and_then(|doc| codec::from_document(doc, self.prefix()))
            .ok_or_else(|| {
                Error::Serialization(format!("Not a {} document: {}/{}", self.name(), object_type, id))
            })
    }

    /// Fetch all objects, optionally of one type. Documents outside the
    /// prefix (design documents, other stores) are skipped.
    pub async fn find_all(&self, object_type: Option<&str>) -> Result<Vec<RemoteObject>> {
        let query = codec::all_docs_query(self.prefix(), object_type);
        let response = self.send(Method::Get, &self.path(&format!("/{}", query)), None).await?;

        let rows = response
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Serialization("Missing rows in _all_docs response".into()))?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get("doc")?.as_object())
            .filter_map(|doc| codec::from_document(doc, self.prefix()))
            .filter(|object| object_type.map_or(true, |t| object.object_type == t))
            .collect())
    }

    /// Find an object, merge `changes` into its attributes and save it.
    pub async fn update(
        &self,
        object_type: &str,
        id: &str,
        changes: &Map<String, Value>,
    ) -> Result<RemoteObject> {
        let mut object = self.find(object_type, id).await?;
        object.merge(changes);
        self.save(object).await
    }

    /// Merge `changes` into every matching object and push them.
    pub async fn update_all(
        &self,
        object_type: Option<&str>,
        changes: &Map<String, Value>,
    ) -> Result<Vec<RemoteObject>> {
        let mut objects = self.find_all(object_type).await?;
        for object in &mut objects {
            object.merge(changes);
        }
        self.push(&objects).await
    }

    /// Mark an object deleted and push the tombstone.
    pub async fn remove(&self, object_type: &str, id: &str) -> Result<RemoteObject> {
        let object = self.find(object_type, id).await?.deleted();
        self.push(std::slice::from_ref(&object))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidInput("Push returned no documents".into()))
    }

    /// Mark every matching object deleted and push the tombstones.
    pub async fn remove_all(&self, object_type: Option<&str>) -> Result<Vec<RemoteObject>> {
        let objects: Vec<RemoteObject> = self
            .find_all(object_type)
            .await?
            .into_iter()
            .map(RemoteObject::deleted)
            .collect();
        self.push(&objects).await
    }

    /// Push `objects`, then pull. A failed push skips the pull.
    pub fn sync(&self, objects: &[RemoteObject]) -> Task<PullOutcome> {
        let push = self.push(objects);
        let store = self.clone();
        Task::spawn(push.cancel_token(), async move {
            push.await?;
            store.pull().await
        })
    }

    /// Subscribe to store events; see [`EventNamespace::on`].
    pub fn on(&self, events: &str, handler: Handler) {
        self.inner.events.on(events, handler);
    }

    pub fn off(&self, events: &str, handler: &Handler) {
        self.inner.events.off(events, handler);
    }

    /// Emit a store event.
    pub fn trigger(&self, event: &str, payload: EventPayload) {
        self.inner.events.trigger(event, payload);
    }

    /// Whether a pull request is outstanding.
    pub fn is_pulling(&self) -> bool {
        self.inner.state().is_pulling()
    }

    /// Whether a push request is outstanding.
    pub fn is_pushing(&self) -> bool {
        self.inner.state().is_pushing()
    }

    /// Whether a pull retry is waiting on the scheduler.
    pub fn has_pending_retry(&self) -> bool {
        self.inner.state().has_pending_retry()
    }
}
