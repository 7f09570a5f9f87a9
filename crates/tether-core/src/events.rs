//! Event infrastructure.
//!
//! Provides the closed [`SyncEvent`] union announced on the process-wide
//! [`EventBus`]: connection transitions, sync lifecycle, queue progress, and
//! per-type data updates. Application messages that don't fit a variant ride
//! in `Custom`. Subscribers hold a [`Subscription`] and drop it to
//! unsubscribe (disposer pattern).

use crate::registry::TypeStatus;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the connection manager and sync engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    /// The realtime connection is established.
    Connected,
    /// The realtime connection ended without a pending reconnect.
    Disconnected {
        code: u16,
        reason: String,
    },
    /// A transport-level error. Does not itself change connection state.
    ConnectionError {
        message: String,
    },
    /// Reconnection gave up after exhausting its attempt budget.
    ReconnectFailed {
        attempts: u32,
    },
    /// A full sync cycle over all registered types began.
    GlobalSyncStarted,
    /// A full sync cycle finished (failures are isolated per type).
    GlobalSyncCompleted {
        synced_types: usize,
    },
    TypeSyncStarted {
        data_type: String,
    },
    TypeSyncCompleted {
        data_type: String,
        /// Number of server deltas applied.
        applied: usize,
    },
    TypeSyncError {
        data_type: String,
        message: String,
    },
    /// A mutation entered the durable queue.
    OperationQueued {
        id: String,
        data_type: String,
    },
    /// A queued mutation reached the server.
    OperationProcessed {
        id: String,
    },
    /// A queued mutation was dropped after exhausting its retry budget.
    OperationFailed {
        id: String,
        message: String,
    },
    StatusChanged {
        data_type: String,
        status: TypeStatus,
    },
    /// A type's local collection changed; carries the full collection, not a
    /// diff, so consumers can't partially apply.
    DataUpdated {
        data_type: String,
        records: Vec<Value>,
    },
    /// Escape hatch for application-defined messages.
    Custom {
        name: String,
        payload: Value,
    },
}

impl SyncEvent {
    /// Topic string for logging and interop with string-keyed consumers.
    pub fn topic(&self) -> String {
        match self {
            SyncEvent::Connected => "connection:connected".into(),
            SyncEvent::Disconnected { .. } => "connection:disconnected".into(),
            SyncEvent::ConnectionError { .. } => "connection:error".into(),
            SyncEvent::ReconnectFailed { .. } => "connection:reconnect_failed".into(),
            SyncEvent::GlobalSyncStarted => "sync:global_started".into(),
            SyncEvent::GlobalSyncCompleted { .. } => "sync:global_completed".into(),
            SyncEvent::TypeSyncStarted { data_type } => format!("sync:{data_type}_started"),
            SyncEvent::TypeSyncCompleted { data_type, .. } => {
                format!("sync:{data_type}_completed")
            }
            SyncEvent::TypeSyncError { data_type, .. } => format!("sync:{data_type}_error"),
            SyncEvent::OperationQueued { .. } => "sync:queued".into(),
            SyncEvent::OperationProcessed { .. } => "sync:operation_processed".into(),
            SyncEvent::OperationFailed { .. } => "sync:operation_failed".into(),
            SyncEvent::StatusChanged { .. } => "sync:status_changed".into(),
            SyncEvent::DataUpdated { data_type, .. } => format!("data:{data_type}_updated"),
            SyncEvent::Custom { name, .. } => name.clone(),
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing [`SyncEvent`]s to subscribers.
///
/// Thread-safe; wrap in `Arc` to enable subscriptions. Subscribers are
/// invoked in registration order on the emitting thread.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(SyncEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns a [`Subscription`] that unsubscribes on
    /// drop. Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write avoids deadlock if a Drop runs while emit holds the
        // read lock during panic unwinding.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the callback list so a callback may subscribe without
        // deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(SyncEvent::Connected);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(SyncEvent::GlobalSyncStarted);
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(SyncEvent::GlobalSyncStarted);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn multiple_subscribers_all_receive() {
        let bus = Arc::new(EventBus::new());
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count1);
        let c2 = Arc::clone(&count2);
        let _sub1 = bus.subscribe(move |_| {
            c1.fetch_add(1, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |_| {
            c2.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(SyncEvent::Connected);

        assert_eq!(count1.load(Ordering::Relaxed), 1);
        assert_eq!(count2.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn topics_render_legacy_strings() {
        assert_eq!(SyncEvent::Connected.topic(), "connection:connected");
        assert_eq!(
            SyncEvent::TypeSyncStarted {
                data_type: "tasks".into()
            }
            .topic(),
            "sync:tasks_started"
        );
        assert_eq!(
            SyncEvent::DataUpdated {
                data_type: "projects".into(),
                records: vec![]
            }
            .topic(),
            "data:projects_updated"
        );
        assert_eq!(
            SyncEvent::Custom {
                name: "connection:task_assigned".into(),
                payload: Value::Null
            }
            .topic(),
            "connection:task_assigned"
        );
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_string(&SyncEvent::OperationQueued {
            id: "op-1".into(),
            data_type: "tasks".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"operationQueued\""));
        assert!(json.contains("\"dataType\":\"tasks\""));

        let json =
            serde_json::to_string(&SyncEvent::GlobalSyncCompleted { synced_types: 2 }).unwrap();
        assert!(json.contains("\"type\":\"globalSyncCompleted\""));
        assert!(json.contains("\"syncedTypes\":2"));
    }
}
