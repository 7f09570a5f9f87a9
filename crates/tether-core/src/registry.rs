//! Data-type registry: one registration per synchronizable entity.
//!
//! A registration names the remote endpoint, the local cache key, and an
//! optional conflict resolver plus pre/post sync hooks. `last_sync` persists
//! across restarts (restored by the engine); `status` is ephemeral.

use crate::conflict::ConflictResolver;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Hook invoked before a type's sync pipeline runs.
pub type PreSyncHook = Arc<dyn Fn() + Send + Sync>;

/// Hook invoked after a successful sync, receiving the applied delta batch.
pub type PostSyncHook = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Ephemeral per-type sync state. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TypeStatus {
    /// Not currently syncing.
    Idle,
    /// A sync pipeline for this type is in flight.
    Syncing,
    /// The last sync attempt failed (message on the registration).
    Error,
}

/// Configuration supplied when registering a data type.
#[derive(Clone)]
pub struct DataTypeConfig {
    /// Base URL of the type's sync endpoint.
    pub endpoint: String,
    /// Local store key holding the cached collection.
    pub cache_key: String,
    /// Conflict resolver; defaults to last-writer-wins with server bias.
    pub resolver: Option<ConflictResolver>,
    /// Optional hook run before each sync of this type.
    pub pre_sync: Option<PreSyncHook>,
    /// Optional hook run after each successful sync of this type.
    pub post_sync: Option<PostSyncHook>,
}

impl DataTypeConfig {
    pub fn new(endpoint: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            cache_key: cache_key.into(),
            resolver: None,
            pre_sync: None,
            post_sync: None,
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_pre_sync(mut self, hook: PreSyncHook) -> Self {
        self.pre_sync = Some(hook);
        self
    }

    pub fn with_post_sync(mut self, hook: PostSyncHook) -> Self {
        self.post_sync = Some(hook);
        self
    }
}

/// A registered synchronizable data type. Owned by the engine.
#[derive(Clone)]
pub(crate) struct DataTypeRegistration {
    pub name: String,
    pub endpoint: String,
    pub cache_key: String,
    pub resolver: ConflictResolver,
    pub pre_sync: Option<PreSyncHook>,
    pub post_sync: Option<PostSyncHook>,
    pub last_sync: Option<DateTime<Utc>>,
    pub status: TypeStatus,
    pub last_error: Option<String>,
}
