//! Durable FIFO operation queue.
//!
//! Locally originated mutations wait here until the drain pushes them to the
//! server. The full queue is persisted as a JSON array after every change so
//! queued operations survive a process kill. Operations for the same record
//! execute in enqueue order; failed operations re-enter at the front to
//! preserve that order.

use crate::store::{LocalStore, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::debug;

/// The kind of mutation a queued operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// A locally originated mutation awaiting delivery.
///
/// Owned exclusively by the engine's queue; only `retry_count` is ever
/// mutated. Destroyed on successful execution or when the retry budget is
/// exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Globally unique id.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Name of the data type this operation belongs to.
    pub data_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

/// FIFO queue of [`SyncOperation`]s backed by the local store.
pub struct OperationQueue {
    key: String,
    ops: VecDeque<SyncOperation>,
}

impl OperationQueue {
    /// Load the persisted queue from the store, or start empty.
    pub fn load(store: &dyn LocalStore, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let ops = match store.get(&key)? {
            Some(value) => {
                let ops: Vec<SyncOperation> = serde_json::from_value(value)?;
                debug!("restored {} queued operation(s)", ops.len());
                ops.into()
            }
            None => VecDeque::new(),
        };
        Ok(Self { key, ops })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append an operation at the back.
    pub fn push_back(&mut self, op: SyncOperation) {
        self.ops.push_back(op);
    }

    /// Take the oldest operation.
    pub fn pop_front(&mut self) -> Option<SyncOperation> {
        self.ops.pop_front()
    }

    /// Push operations back to the front, preserving their relative order.
    pub fn requeue_front(&mut self, ops: Vec<SyncOperation>) {
        for op in ops.into_iter().rev() {
            self.ops.push_front(op);
        }
    }

    /// Persist the full queue state.
    pub fn persist(&self, store: &dyn LocalStore) -> Result<()> {
        let value = serde_json::to_value(self.ops.iter().collect::<Vec<_>>())?;
        store.set(&self.key, &value)
    }

    /// Snapshot of the queued operations, oldest first.
    pub fn snapshot(&self) -> Vec<SyncOperation> {
        self.ops.iter().cloned().collect()
    }
}
