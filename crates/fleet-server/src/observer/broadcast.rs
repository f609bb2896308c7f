//! Fan-out of registry notifications to connected observers.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use fleet_core::{DeviceRegistry, ListenerError, ListenerId, Notification, ObserverId};
use tracing::{debug, info, warn};

use super::connection::ObserverConnection;
use super::messages::PushMessage;

/// Turns registry notifications into pushes to every observer.
///
/// Subscribes to the registry's hub on [`attach`](Self::attach) and
/// unsubscribes on drop. The hub holds only a weak reference, so dropping
/// the last `Arc<Broadcaster>` detaches it.
pub struct Broadcaster {
    observers: DashMap<ObserverId, Arc<ObserverConnection>>,
    registry: Arc<DeviceRegistry>,
    listeners: Vec<ListenerId>,
}

impl Broadcaster {
    pub fn attach(registry: Arc<DeviceRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let on_status = {
                let this = this.clone();
                registry.add_status_listener(move |n| forward(&this, n))
            };
            let on_data = {
                let this = this.clone();
                registry.add_data_listener(move |n| forward(&this, n))
            };
            Self {
                observers: DashMap::new(),
                registry,
                listeners: vec![on_status, on_data],
            }
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn add_observer(&self, observer: Arc<ObserverConnection>) {
        info!(observer_id = %observer.id, "observer attached");
        let _ = self.observers.insert(observer.id.clone(), observer);
    }

    pub fn remove_observer(&self, id: &ObserverId) -> bool {
        let removed = self.observers.remove(id).is_some();
        if removed {
            info!(observer_id = %id, "observer detached");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Current device list, ordered by device id.
    pub fn snapshot_all(&self) -> PushMessage {
        let mut devices = self.registry.list_all();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        PushMessage::device_list(&devices)
    }

    /// Push a fresh device list to every observer.
    pub fn broadcast_device_list(&self) -> usize {
        self.push(&self.snapshot_all())
    }

    /// Queue a message for one observer.
    pub fn send_to(&self, id: &ObserverId, message: &PushMessage) -> bool {
        let Some(observer) = self.observers.get(id).map(|o| Arc::clone(o.value())) else {
            return false;
        };
        match serde_json::to_string(message) {
            Ok(json) => observer.send(Arc::new(json)),
            Err(e) => {
                warn!(message_type = message.type_name(), error = %e, "failed to serialize push");
                false
            }
        }
    }

    /// Queue a message for every active observer.
    ///
    /// Serializes once. An observer whose queue is full or closed misses
    /// this message; the others are unaffected. Returns the number of
    /// observers the message was queued for.
    pub fn push(&self, message: &PushMessage) -> usize {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(message_type = message.type_name(), error = %e, "failed to serialize push");
                return 0;
            }
        };
        let targets: Vec<Arc<ObserverConnection>> =
            self.observers.iter().map(|o| Arc::clone(o.value())).collect();

        let mut delivered = 0;
        for observer in &targets {
            if !observer.is_active() {
                continue;
            }
            if observer.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                warn!(
                    observer_id = %observer.id,
                    message_type = message.type_name(),
                    dropped = observer.drop_count(),
                    "observer queue full, message dropped"
                );
            }
        }
        debug!(
            message_type = message.type_name(),
            recipients = delivered,
            "push to observers"
        );
        delivered
    }

    fn on_notification(&self, notification: &Notification) {
        match notification {
            Notification::StatusChanged { device, old, new } => {
                let _ = self.push(&PushMessage::status_change(device, *old, *new));
                let _ = self.broadcast_device_list();
            }
            Notification::DataReported { device, payload } => {
                let _ = self.push(&PushMessage::data_update(device, payload));
            }
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        for id in self.listeners.drain(..) {
            let _ = self.registry.remove_listener(id);
        }
    }
}

fn forward(this: &Weak<Broadcaster>, notification: &Notification) -> Result<(), ListenerError> {
    let this = this.upgrade().ok_or(ListenerError::Detached)?;
    this.on_notification(notification);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{DeviceLink, DeviceStatus, Registration};
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn observer(
        bc: &Broadcaster,
        capacity: usize,
    ) -> (Arc<ObserverConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(ObserverConnection::new(ObserverId::new(), tx));
        bc.add_observer(Arc::clone(&conn));
        (conn, rx)
    }

    fn register(registry: &DeviceRegistry, id: &str) -> DeviceLink {
        let link = DeviceLink::new("127.0.0.1:4000".parse().unwrap());
        let _ = registry.register_online(
            Registration {
                id: id.into(),
                name: format!("{id}-name"),
                kind: "sensor".into(),
                address: "127.0.0.1".into(),
                port: 4000,
            },
            link.clone(),
        );
        link
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    fn types(msgs: &[Value]) -> Vec<&str> {
        msgs.iter().map(|m| m["type"].as_str().unwrap()).collect()
    }

    #[test]
    fn status_change_pushes_change_then_list() {
        let registry = Arc::new(DeviceRegistry::default());
        let bc = Broadcaster::attach(Arc::clone(&registry));
        let (_conn, mut rx) = observer(&bc, 16);

        let _ = register(&registry, "dev1");

        let msgs = drain(&mut rx);
        assert_eq!(types(&msgs), vec!["DEVICE_STATUS_CHANGE", "DEVICE_LIST_UPDATE"]);
        assert_eq!(msgs[0]["oldStatus"], "OFFLINE");
        assert_eq!(msgs[0]["newStatus"], "ONLINE");
        assert_eq!(msgs[1]["devices"][0]["deviceId"], "dev1");
        assert_eq!(msgs[1]["devices"][0]["status"], "ONLINE");
    }

    #[test]
    fn data_report_pushes_update_only() {
        let registry = Arc::new(DeviceRegistry::default());
        let bc = Broadcaster::attach(Arc::clone(&registry));
        let _ = register(&registry, "dev1");
        let (_conn, mut rx) = observer(&bc, 16);

        let _ = registry.record_data("dev1", r#"{"t":1}"#);

        let msgs = drain(&mut rx);
        assert_eq!(types(&msgs), vec!["DEVICE_DATA_UPDATE"]);
        assert_eq!(msgs[0]["data"], r#"{"t":1}"#);
        assert_eq!(msgs[0]["deviceName"], "dev1-name");
    }

    #[test]
    fn every_observer_receives_pushes() {
        let registry = Arc::new(DeviceRegistry::default());
        let bc = Broadcaster::attach(Arc::clone(&registry));
        let (_a, mut rx_a) = observer(&bc, 16);
        let (_b, mut rx_b) = observer(&bc, 16);

        let _ = register(&registry, "dev1");

        assert_eq!(drain(&mut rx_a).len(), 2);
        assert_eq!(drain(&mut rx_b).len(), 2);
    }

    #[test]
    fn full_observer_does_not_block_others() {
        let registry = Arc::new(DeviceRegistry::default());
        let bc = Broadcaster::attach(Arc::clone(&registry));
        let (slow, _slow_rx) = observer(&bc, 1);
        let (_fast, mut fast_rx) = observer(&bc, 16);

        let _ = register(&registry, "dev1");
        let _ = registry.record_data("dev1", "x");

        assert_eq!(drain(&mut fast_rx).len(), 3);
        assert_eq!(slow.drop_count(), 2);
    }

    #[test]
    fn closed_observer_is_skipped() {
        let registry = Arc::new(DeviceRegistry::default());
        let bc = Broadcaster::attach(Arc::clone(&registry));
        let (gone, rx) = observer(&bc, 4);
        drop(rx);

        assert_eq!(bc.broadcast_device_list(), 0);
        assert_eq!(gone.drop_count(), 0);
    }

    #[test]
    fn removed_observer_gets_nothing() {
        let registry = Arc::new(DeviceRegistry::default());
        let bc = Broadcaster::attach(Arc::clone(&registry));
        let (conn, mut rx) = observer(&bc, 16);
        assert_eq!(bc.observer_count(), 1);

        assert!(bc.remove_observer(&conn.id));
        assert!(!bc.remove_observer(&conn.id));
        assert_eq!(bc.observer_count(), 0);

        let _ = register(&registry, "dev1");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn snapshot_is_sorted_and_detached() {
        let registry = Arc::new(DeviceRegistry::default());
        let bc = Broadcaster::attach(Arc::clone(&registry));
        for id in ["c", "a", "b"] {
            let _ = register(&registry, id);
        }
        let _ = registry.mark_offline("b");

        let snapshot = bc.snapshot_all();
        let _ = registry.mark_offline("a");

        let PushMessage::DeviceListUpdate { devices, .. } = snapshot else {
            panic!("expected list update");
        };
        let ids: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(devices[0].status, DeviceStatus::Online);
        assert_eq!(devices[1].status, DeviceStatus::Offline);
        assert!(!devices[1].disconnect_time.is_empty());
    }

    #[test]
    fn send_to_targets_one_observer() {
        let registry = Arc::new(DeviceRegistry::default());
        let bc = Broadcaster::attach(Arc::clone(&registry));
        let (a, mut rx_a) = observer(&bc, 16);
        let (_b, mut rx_b) = observer(&bc, 16);

        assert!(bc.send_to(&a.id, &bc.snapshot_all()));
        assert!(!bc.send_to(&ObserverId::new(), &bc.snapshot_all()));

        assert_eq!(types(&drain(&mut rx_a)), vec!["DEVICE_LIST_UPDATE"]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn drop_unsubscribes_from_hub() {
        let registry = Arc::new(DeviceRegistry::default());
        let bc = Broadcaster::attach(Arc::clone(&registry));
        assert_eq!(registry.hub().listener_count(), 2);
        drop(bc);
        assert_eq!(registry.hub().listener_count(), 0);

        // Registry keeps working with no broadcaster attached.
        let _ = register(&registry, "dev1");
        assert!(registry.get("dev1").unwrap().is_online());
    }
}
