//! Registry change notifications and the subscriber list that receives them.
//!
//! The [`ChangeHub`] is created alongside the registry and handed to whoever
//! needs to subscribe. Delivery is synchronous: [`ChangeHub::publish`]
//! returns only after every matching listener has run. A listener that
//! returns an error or panics is logged and skipped; the remaining listeners
//! still run and the publisher never sees the failure.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error};

use crate::device::{DeviceRecord, DeviceStatus};

/// A single registry change.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// The device went online or offline.
    StatusChanged {
        device: DeviceRecord,
        old: DeviceStatus,
        new: DeviceStatus,
    },
    /// The device reported a new payload.
    DataReported { device: DeviceRecord, payload: String },
}

impl Notification {
    pub fn kind(&self) -> ListenerKind {
        match self {
            Self::StatusChanged { .. } => ListenerKind::Status,
            Self::DataReported { .. } => ListenerKind::Data,
        }
    }

    pub fn device(&self) -> &DeviceRecord {
        match self {
            Self::StatusChanged { device, .. } | Self::DataReported { device, .. } => device,
        }
    }
}

/// Which notifications a listener wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerKind {
    Status,
    Data,
}

/// Handle returned by a subscription, used to remove it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Failure reported by a listener. Logged by the hub, never propagated.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),
    #[error("listener target is gone")]
    Detached,
}

type Callback = Arc<dyn Fn(&Notification) -> Result<(), ListenerError> + Send + Sync>;

struct Subscription {
    id: ListenerId,
    kind: ListenerKind,
    callback: Callback,
}

/// Ordered list of notification subscribers.
pub struct ChangeHub {
    listeners: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener. Listeners run in registration order.
    pub fn subscribe<F>(&self, kind: ListenerKind, callback: F) -> ListenerId
    where
        F: Fn(&Notification) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Subscription {
            id,
            kind,
            callback: Arc::new(callback),
        });
        debug!(listener = id.0, ?kind, "listener subscribed");
        id
    }

    /// Remove a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|s| s.id != id);
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver a notification to every listener of its kind.
    ///
    /// Returns the number of listeners that handled it successfully.
    pub fn publish(&self, notification: &Notification) -> usize {
        let kind = notification.kind();
        // Snapshot so listeners may (un)subscribe without deadlocking.
        let targets: Vec<(ListenerId, Callback)> = self
            .listeners
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.id, Arc::clone(&s.callback)))
            .collect();

        let mut delivered = 0;
        for (id, callback) in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(notification))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(
                        listener = id.0,
                        device_id = %notification.device().id,
                        error = %e,
                        "notification listener failed"
                    );
                }
                Err(panic) => {
                    let msg = panic.downcast_ref::<&str>().map_or_else(
                        || {
                            panic.downcast_ref::<String>().map_or_else(
                                || "unknown panic".to_string(),
                                std::string::ToString::to_string,
                            )
                        },
                        std::string::ToString::to_string,
                    );
                    error!(
                        listener = id.0,
                        device_id = %notification.device().id,
                        panic = %msg,
                        "notification listener panicked"
                    );
                }
            }
        }
        delivered
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}
