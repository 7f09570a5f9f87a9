//! The sync engine: durable queue drain plus periodic pull/merge.
//!
//! One engine instance owns the operation queue, the data-type registry, and
//! the sync timestamps. Mutations enter through [`SyncEngine::enqueue`]
//! (persisted before the call returns), are pushed to the server by the
//! drain, and server deltas are pulled per type and merged into the cached
//! collection. Connectivity is fed in from outside, either directly via
//! [`SyncEngine::set_online`] or by attaching to an [`EventBus`] that a
//! connection manager publishes on.
//!
//! Lock discipline: the registry (std `RwLock`) is never held across an
//! await; the queue and the two pipeline guards are tokio mutexes. The
//! drain guard and the global-sync guard are acquired with `try_lock` so a
//! second trigger while one is running is a silent no-op instead of a
//! queued duplicate pass.

use crate::conflict::{self, apply_server_changes, lww_resolver};
use crate::events::{EventBus, SyncEvent};
use crate::queue::{OperationKind, OperationQueue, SyncOperation};
use crate::registry::{DataTypeConfig, DataTypeRegistration, TypeStatus};
use crate::remote::{RemoteApi, RemoteError};
use crate::store::{LocalStore, StoreError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("unknown data type: {0}")]
    UnknownType(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Store key holding the persisted operation queue.
    pub queue_key: String,
    /// Store key holding the per-type last-sync timestamps.
    pub timestamps_key: String,
    /// Delivery attempts per operation before it is dropped.
    pub max_retries: u32,
    /// Pause between drain passes while failed operations remain queued.
    pub retry_delay: Duration,
    /// Period of the background full-sync timer.
    pub sync_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_key: "sync/queue".into(),
            timestamps_key: "sync/last_sync".into(),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            sync_interval: Duration::from_secs(60),
        }
    }
}

/// A mutation handed to [`SyncEngine::enqueue`]. `id` and `created_at`
/// default to a fresh UUID and the current time.
pub struct NewOperation {
    pub kind: OperationKind,
    pub data_type: String,
    pub payload: Value,
    pub id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewOperation {
    pub fn new(kind: OperationKind, data_type: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            data_type: data_type.into(),
            payload,
            id: None,
            created_at: None,
        }
    }
}

/// Offline-tolerant sync engine. See the module docs for the moving parts.
pub struct SyncEngine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    registry: RwLock<Vec<DataTypeRegistration>>,
    queue: Mutex<OperationQueue>,
    drain_guard: Mutex<()>,
    sync_guard: Mutex<()>,
    online: AtomicBool,
    authenticated: AtomicBool,
    periodic: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build an engine, restoring any persisted queue from the store.
    pub fn new(
        config: EngineConfig,
        bus: Arc<EventBus>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<Arc<Self>> {
        let queue = OperationQueue::load(store.as_ref(), config.queue_key.clone())?;
        if !queue.is_empty() {
            info!("restored {} pending operation(s) from the store", queue.len());
        }
        Ok(Arc::new(Self {
            config,
            bus,
            store,
            remote,
            registry: RwLock::new(Vec::new()),
            queue: Mutex::new(queue),
            drain_guard: Mutex::new(()),
            sync_guard: Mutex::new(()),
            online: AtomicBool::new(false),
            authenticated: AtomicBool::new(true),
            periodic: StdMutex::new(None),
        }))
    }

    /// Register (or replace) a synchronizable data type. The persisted
    /// last-sync timestamp, if any, is restored so the first pull after a
    /// restart stays incremental.
    pub fn register_data_type(&self, name: &str, config: DataTypeConfig) -> Result<()> {
        if name.is_empty() {
            return Err(EngineError::InvalidRegistration(
                "data type name must not be empty".into(),
            ));
        }
        if config.endpoint.is_empty() || config.cache_key.is_empty() {
            return Err(EngineError::InvalidRegistration(format!(
                "data type '{name}' needs a non-empty endpoint and cache key"
            )));
        }

        let last_sync = self.load_timestamps()?.remove(name);
        let registration = DataTypeRegistration {
            name: name.to_string(),
            endpoint: config.endpoint,
            cache_key: config.cache_key,
            resolver: config.resolver.unwrap_or_else(lww_resolver),
            pre_sync: config.pre_sync,
            post_sync: config.post_sync,
            last_sync,
            status: TypeStatus::Idle,
            last_error: None,
        };

        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = registry.iter_mut().find(|r| r.name == name) {
            debug!(data_type = name, "replacing existing registration");
            *existing = registration;
        } else {
            registry.push(registration);
        }
        Ok(())
    }

    /// Queue a mutation for delivery. The queue is persisted before this
    /// returns, so the operation survives an immediate process kill. When
    /// online, a drain is kicked off in the background.
    pub async fn enqueue(self: &Arc<Self>, op: NewOperation) -> Result<String> {
        if op.data_type.is_empty() {
            return Err(EngineError::InvalidOperation(
                "operation needs a data type".into(),
            ));
        }
        if matches!(op.kind, OperationKind::Update | OperationKind::Delete)
            && conflict::record_id(&op.payload).is_none()
        {
            return Err(EngineError::InvalidOperation(format!(
                "{:?} payload for '{}' carries no record id",
                op.kind, op.data_type
            )));
        }

        let operation = SyncOperation {
            id: op.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind: op.kind,
            data_type: op.data_type,
            payload: op.payload,
            created_at: op.created_at.unwrap_or_else(Utc::now),
            retry_count: 0,
        };
        let id = operation.id.clone();
        let data_type = operation.data_type.clone();

        {
            let mut queue = self.queue.lock().await;
            queue.push_back(operation);
            queue.persist(self.store.as_ref())?;
        }
        debug!(%id, %data_type, "operation queued");
        self.bus.emit(SyncEvent::OperationQueued {
            id: id.clone(),
            data_type,
        });

        if self.is_online() {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.process_queue().await;
            });
        }
        Ok(id)
    }

    /// Drain the operation queue: pop the oldest operation, push it to the
    /// server, repeat. At most one drain runs at a time; a second call while
    /// one is in flight returns immediately. Failed operations keep their
    /// queue position and are retried on a later pass until their retry
    /// budget runs out, at which point they are dropped with a single
    /// `OperationFailed` event.
    pub async fn process_queue(self: &Arc<Self>) {
        let Ok(_guard) = self.drain_guard.try_lock() else {
            debug!("drain already in progress, skipping");
            return;
        };

        let mut retained: Vec<SyncOperation> = Vec::new();
        loop {
            if !self.is_online() {
                // Keep the rest of the queue intact for the next pass.
                let mut queue = self.queue.lock().await;
                while let Some(op) = queue.pop_front() {
                    retained.push(op);
                }
                break;
            }

            let Some(mut op) = self.queue.lock().await.pop_front() else {
                break;
            };

            match self.execute(&op).await {
                Ok(()) => {
                    debug!(id = %op.id, data_type = %op.data_type, "operation delivered");
                    self.persist_queue().await;
                    self.bus.emit(SyncEvent::OperationProcessed { id: op.id });
                }
                Err(err) => {
                    op.retry_count += 1;
                    if op.retry_count >= self.config.max_retries {
                        error!(
                            id = %op.id,
                            data_type = %op.data_type,
                            attempts = op.retry_count,
                            "dropping operation after exhausting retries: {err}"
                        );
                        self.persist_queue().await;
                        self.bus.emit(SyncEvent::OperationFailed {
                            id: op.id,
                            message: err.to_string(),
                        });
                    } else {
                        warn!(
                            id = %op.id,
                            data_type = %op.data_type,
                            attempt = op.retry_count,
                            "operation failed, will retry: {err}"
                        );
                        retained.push(op);
                        // Serialized pause; retries never run in parallel.
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        let remaining = {
            let mut queue = self.queue.lock().await;
            queue.requeue_front(retained);
            if let Err(err) = queue.persist(self.store.as_ref()) {
                error!("failed to persist operation queue: {err}");
            }
            queue.len()
        };

        if remaining > 0 && self.is_online() {
            debug!(remaining, "scheduling retry drain");
            // Longer cool-down between passes to avoid busy-looping.
            let delay = self.config.retry_delay * 2;
            tokio::spawn(Arc::clone(self).drain_after(delay));
        }
    }

    /// Boxed so the drain can re-schedule itself from its own body without
    /// the future's `Send` check recursing through the spawn.
    fn drain_after(self: Arc<Self>, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            self.process_queue().await;
        })
    }

    async fn execute(&self, op: &SyncOperation) -> Result<()> {
        let endpoint = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            registry
                .iter()
                .find(|r| r.name == op.data_type)
                .map(|r| r.endpoint.clone())
        };
        let Some(endpoint) = endpoint else {
            return Err(EngineError::UnknownType(op.data_type.clone()));
        };

        match op.kind {
            OperationKind::Create => self.remote.create(&endpoint, &op.payload).await?,
            OperationKind::Update => {
                let id = conflict::record_id(&op.payload).ok_or_else(|| {
                    EngineError::InvalidOperation("update payload lost its record id".into())
                })?;
                self.remote.update(&endpoint, &id, &op.payload).await?;
            }
            OperationKind::Delete => {
                let id = conflict::record_id(&op.payload).ok_or_else(|| {
                    EngineError::InvalidOperation("delete payload lost its record id".into())
                })?;
                self.remote.delete(&endpoint, &id).await?;
            }
        }
        Ok(())
    }

    async fn persist_queue(&self) {
        let queue = self.queue.lock().await;
        if let Err(err) = queue.persist(self.store.as_ref()) {
            error!("failed to persist operation queue: {err}");
        }
    }

    /// Sync every registered type in registration order. Failures are
    /// isolated per type; one type's error never blocks the rest. A second
    /// call while a cycle is running returns immediately.
    pub async fn sync_all(self: &Arc<Self>) {
        let Ok(_guard) = self.sync_guard.try_lock() else {
            debug!("sync cycle already in progress, skipping");
            return;
        };
        if !self.is_online() {
            debug!("offline, skipping sync cycle");
            return;
        }
        if !self.authenticated.load(Ordering::SeqCst) {
            warn!("not authenticated, stopping periodic sync");
            self.stop_periodic();
            return;
        }

        self.bus.emit(SyncEvent::GlobalSyncStarted);
        let names: Vec<String> = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            registry.iter().map(|r| r.name.clone()).collect()
        };

        let mut synced = 0;
        for name in &names {
            match self.sync_data_type(name, false).await {
                Ok(()) => synced += 1,
                Err(err) => warn!(data_type = %name, "type sync failed: {err}"),
            }
        }
        info!(synced, total = names.len(), "sync cycle complete");
        self.bus.emit(SyncEvent::GlobalSyncCompleted {
            synced_types: synced,
        });
    }

    /// Run the full sync pipeline for one type: pre-sync hook, queue drain,
    /// pull server deltas, merge, cache, post-sync hook. The last-sync
    /// timestamp advances only when every stage succeeded, so a failed pull
    /// is retried over the same window next cycle. `force_full` ignores the
    /// stored timestamp and pulls everything.
    pub async fn sync_data_type(self: &Arc<Self>, name: &str, force_full: bool) -> Result<()> {
        let snapshot = {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            let Some(reg) = registry.iter_mut().find(|r| r.name == name) else {
                return Err(EngineError::UnknownType(name.to_string()));
            };
            if reg.status == TypeStatus::Syncing {
                debug!(data_type = name, "already syncing, skipping");
                return Ok(());
            }
            reg.status = TypeStatus::Syncing;
            reg.clone()
        };

        self.bus.emit(SyncEvent::StatusChanged {
            data_type: name.to_string(),
            status: TypeStatus::Syncing,
        });
        self.bus.emit(SyncEvent::TypeSyncStarted {
            data_type: name.to_string(),
        });

        let started_at = Utc::now();
        let result = self.run_pipeline(&snapshot, force_full).await;

        match result {
            Ok(applied) => {
                {
                    let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(reg) = registry.iter_mut().find(|r| r.name == name) {
                        reg.last_sync = Some(started_at);
                        reg.status = TypeStatus::Idle;
                        reg.last_error = None;
                    }
                }
                self.persist_timestamps()?;
                self.bus.emit(SyncEvent::StatusChanged {
                    data_type: name.to_string(),
                    status: TypeStatus::Idle,
                });
                self.bus.emit(SyncEvent::TypeSyncCompleted {
                    data_type: name.to_string(),
                    applied,
                });
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                {
                    let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(reg) = registry.iter_mut().find(|r| r.name == name) {
                        reg.status = TypeStatus::Error;
                        reg.last_error = Some(message.clone());
                    }
                }
                self.bus.emit(SyncEvent::StatusChanged {
                    data_type: name.to_string(),
                    status: TypeStatus::Error,
                });
                self.bus.emit(SyncEvent::TypeSyncError {
                    data_type: name.to_string(),
                    message,
                });
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        self: &Arc<Self>,
        reg: &DataTypeRegistration,
        force_full: bool,
    ) -> Result<usize> {
        if let Some(hook) = &reg.pre_sync {
            hook();
        }

        // Push before pull so our own mutations aren't clobbered by a pull
        // that predates them.
        self.process_queue().await;

        let since = if force_full { None } else { reg.last_sync };
        let deltas = self.remote.fetch_changes(&reg.endpoint, since).await?;
        debug!(data_type = %reg.name, count = deltas.len(), "fetched server deltas");

        if !deltas.is_empty() {
            let cached = match self.store.get(&reg.cache_key)? {
                Some(Value::Array(records)) => records,
                Some(_) => {
                    warn!(
                        data_type = %reg.name,
                        "cached collection is not an array, starting fresh"
                    );
                    Vec::new()
                }
                None => Vec::new(),
            };

            let merged = apply_server_changes(cached, &deltas, &reg.resolver);
            self.store
                .set(&reg.cache_key, &Value::Array(merged.clone()))?;
            self.bus.emit(SyncEvent::DataUpdated {
                data_type: reg.name.clone(),
                records: merged,
            });
        }

        if let Some(hook) = &reg.post_sync {
            hook(&deltas);
        }
        Ok(deltas.len())
    }

    /// React to connection-manager events: go online and drain on
    /// `Connected`, go offline on `Disconnected` / `ReconnectFailed`. Drop
    /// the returned subscription to detach.
    pub fn attach_connectivity(
        self: &Arc<Self>,
        bus: &Arc<EventBus>,
    ) -> crate::events::Subscription {
        let engine: Weak<SyncEngine> = Arc::downgrade(self);
        let handle = tokio::runtime::Handle::current();
        bus.subscribe(move |event| {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            match event {
                SyncEvent::Connected => {
                    engine.set_online(true);
                    handle.spawn(async move {
                        engine.process_queue().await;
                    });
                }
                SyncEvent::Disconnected { .. } | SyncEvent::ReconnectFailed { .. } => {
                    engine.set_online(false);
                }
                _ => {}
            }
        })
    }

    /// Start the background full-sync timer. The first cycle runs one
    /// interval from now, not immediately.
    pub fn start_periodic(self: &Arc<Self>) {
        let engine: Weak<SyncEngine> = Arc::downgrade(self);
        let interval = self.config.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.sync_all().await;
            }
        });

        let mut periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = periodic.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_periodic(&self) {
        let mut periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = periodic.take() {
            handle.abort();
        }
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Gate periodic sync on the application's auth state. While false,
    /// `sync_all` stops the periodic timer instead of hitting the server.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn type_status(&self, name: &str) -> Option<TypeStatus> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.iter().find(|r| r.name == name).map(|r| r.status)
    }

    pub fn last_error(&self, name: &str) -> Option<String> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.last_error.clone())
    }

    pub fn last_sync(&self, name: &str) -> Option<DateTime<Utc>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.last_sync)
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    fn load_timestamps(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let Some(Value::Object(map)) = self.store.get(&self.config.timestamps_key)? else {
            return Ok(HashMap::new());
        };
        let mut timestamps = HashMap::new();
        for (name, raw) in map {
            let Some(s) = raw.as_str() else { continue };
            match DateTime::parse_from_rfc3339(s) {
                Ok(t) => {
                    timestamps.insert(name, t.with_timezone(&Utc));
                }
                Err(err) => warn!(data_type = %name, "discarding unparseable timestamp: {err}"),
            }
        }
        Ok(timestamps)
    }

    fn persist_timestamps(&self) -> Result<()> {
        let map: serde_json::Map<String, Value> = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            registry
                .iter()
                .filter_map(|r| {
                    r.last_sync
                        .map(|t| (r.name.clone(), Value::String(t.to_rfc3339())))
                })
                .collect()
        };
        self.store
            .set(&self.config.timestamps_key, &Value::Object(map))?;
        Ok(())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop_periodic();
    }
}
