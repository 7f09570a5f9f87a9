//! tether-core: offline-tolerant data synchronization engine.
//!
//! This crate provides the client-side sync core:
//! - Durable FIFO operation queue (local mutations survive restarts)
//! - Data-type registry with per-type sync state and pluggable conflict
//!   resolution
//! - Periodic bidirectional sync: push queued mutations, pull server deltas,
//!   merge into the local store
//! - Event bus announcing connection, sync lifecycle, and data updates
//!
//! The engine never talks to a socket directly; connectivity transitions
//! arrive over the [`EventBus`] (see the `tether-daemon` crate for the
//! WebSocket connection manager) and HTTP calls go through the [`RemoteApi`]
//! trait. All collaborators are passed in explicitly — there is no global
//! service registry.

pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod store;

pub use backoff::{ReconnectConfig, reconnect_delay};
pub use conflict::{ConflictResolver, apply_server_changes, lww_resolver};
pub use engine::{EngineConfig, EngineError, NewOperation, SyncEngine};
pub use events::{EventBus, Subscription, SyncEvent};
pub use queue::{OperationKind, OperationQueue, SyncOperation};
pub use registry::{DataTypeConfig, TypeStatus};
pub use remote::{HttpRemote, MockRemote, RemoteApi, RemoteError};
pub use store::{FileStore, LocalStore, MemoryStore, StoreError};
