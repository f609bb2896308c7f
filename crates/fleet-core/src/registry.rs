//! The device registry: the one place device state is mutated.
//!
//! Every mutation that changes what observers should see publishes a
//! [`Notification`] on the registry's [`ChangeHub`]. Publication happens
//! after the map shard guard is dropped, so listeners are free to read the
//! registry back (the broadcaster does, to build list snapshots).

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Local;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::device::{DeviceRecord, DeviceStatus};
use crate::ids::LinkId;
use crate::notify::{ChangeHub, ListenerError, ListenerId, ListenerKind, Notification};

/// Handle to the transport currently serving a device.
///
/// Cloning is cheap; all clones share the same close token.
#[derive(Clone, Debug)]
pub struct DeviceLink {
    id: LinkId,
    peer: SocketAddr,
    close: CancellationToken,
}

impl DeviceLink {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: LinkId::new(),
            peer,
            close: CancellationToken::new(),
        }
    }

    /// Link whose close token is a child of `parent`, so cancelling the
    /// parent closes this link too.
    pub fn with_parent(peer: SocketAddr, parent: &CancellationToken) -> Self {
        Self {
            id: LinkId::new(),
            peer,
            close: parent.child_token(),
        }
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Ask the owning session to close its transport.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }
}

/// Arguments of a successful `REGISTER`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub address: String,
    pub port: u16,
}

struct DeviceEntry {
    record: DeviceRecord,
    link: Option<DeviceLink>,
}

/// Concurrent map from device id to device record.
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceEntry>,
    hub: Arc<ChangeHub>,
}

impl DeviceRegistry {
    pub fn new(hub: Arc<ChangeHub>) -> Self {
        Self {
            devices: DashMap::new(),
            hub,
        }
    }

    pub fn hub(&self) -> &Arc<ChangeHub> {
        &self.hub
    }

    /// Create or replace the record for `reg.id`, mark it online and bind
    /// `link` to it.
    ///
    /// A different link previously bound to the same id is asked to close.
    pub fn register_online(&self, reg: Registration, link: DeviceLink) -> DeviceRecord {
        let now = Local::now();
        let mut record = DeviceRecord::new(reg.id.clone(), reg.name, reg.kind);
        record.remote_address = reg.address;
        record.remote_port = reg.port;
        record.status = DeviceStatus::Online;
        record.connected_at = Some(now);
        record.last_heartbeat_at = Some(now);

        let link_id = link.id().clone();
        let previous = self.devices.insert(
            reg.id.clone(),
            DeviceEntry {
                record: record.clone(),
                link: Some(link),
            },
        );

        let old = match previous {
            Some(prev) => {
                if let Some(stale) = prev.link.filter(|l| l.id() != &link_id) {
                    info!(
                        device_id = %reg.id,
                        stale_link = %stale.id(),
                        link_id = %link_id,
                        "device re-registered, closing superseded link"
                    );
                    stale.close();
                }
                prev.record.status
            }
            None => DeviceStatus::Offline,
        };

        info!(device_id = %reg.id, link_id = %link_id, %old, "device online");
        let _ = self.hub.publish(&Notification::StatusChanged {
            device: record.clone(),
            old,
            new: DeviceStatus::Online,
        });
        record
    }

    /// Mark a device offline and unbind its transport. No-op for unknown ids.
    pub fn mark_offline(&self, id: &str) -> Option<DeviceRecord> {
        self.offline_if(id, |_| true)
    }

    /// Mark a device offline, but only while `link` is still the transport
    /// bound to it. Returns whether the device was marked offline.
    pub fn release(&self, id: &str, link: &LinkId) -> bool {
        let released = self
            .offline_if(id, |e| e.link.as_ref().is_some_and(|l| l.id() == link))
            .is_some();
        if !released {
            debug!(device_id = %id, link_id = %link, "release from unbound link ignored");
        }
        released
    }

    fn offline_if(&self, id: &str, owns: impl FnOnce(&DeviceEntry) -> bool) -> Option<DeviceRecord> {
        let (record, old) = {
            let mut entry = self.devices.get_mut(id)?;
            if !owns(entry.value()) {
                return None;
            }
            let old = entry.record.status;
            entry.record.status = DeviceStatus::Offline;
            entry.record.disconnected_at = Some(Local::now());
            entry.link = None;
            (entry.record.clone(), old)
        };

        info!(device_id = %id, %old, "device offline");
        let _ = self.hub.publish(&Notification::StatusChanged {
            device: record.clone(),
            old,
            new: DeviceStatus::Offline,
        });
        Some(record)
    }

    /// Refresh the heartbeat timestamp. Returns `false` for unknown ids.
    pub fn touch_heartbeat(&self, id: &str) -> bool {
        match self.devices.get_mut(id) {
            Some(mut entry) => {
                entry.record.last_heartbeat_at = Some(Local::now());
                true
            }
            None => false,
        }
    }

    /// Store the latest payload and notify data listeners.
    pub fn record_data(&self, id: &str, payload: &str) -> Option<DeviceRecord> {
        let record = {
            let mut entry = self.devices.get_mut(id)?;
            entry.record.last_payload = Some(payload.to_string());
            entry.record.last_payload_at = Some(Local::now());
            entry.record.clone()
        };

        let _ = self.hub.publish(&Notification::DataReported {
            device: record.clone(),
            payload: payload.to_string(),
        });
        Some(record)
    }

    pub fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.get(id).map(|e| e.record.clone())
    }

    /// Snapshot of every record.
    pub fn list_all(&self) -> Vec<DeviceRecord> {
        self.devices.iter().map(|e| e.record.clone()).collect()
    }

    pub fn list_by_status(&self, status: DeviceStatus) -> Vec<DeviceRecord> {
        self.devices
            .iter()
            .filter(|e| e.record.status == status)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Transport currently bound to `id`, if the device is online.
    pub fn link(&self, id: &str) -> Option<DeviceLink> {
        self.devices.get(id).and_then(|e| e.link.clone())
    }

    pub fn total_count(&self) -> usize {
        self.devices.len()
    }

    pub fn online_count(&self) -> usize {
        self.devices.iter().filter(|e| e.record.is_online()).count()
    }

    pub fn offline_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|e| e.record.status == DeviceStatus::Offline)
            .count()
    }

    pub fn add_status_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Notification) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.hub.subscribe(ListenerKind::Status, f)
    }

    pub fn add_data_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Notification) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.hub.subscribe(ListenerKind::Data, f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(Arc::new(ChangeHub::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn reg(id: &str) -> Registration {
        Registration {
            id: id.into(),
            name: format!("{id}-name"),
            kind: "sensor".into(),
            address: "127.0.0.1".into(),
            port: 40000,
        }
    }

    /// Registry plus a log of every notification it publishes.
    fn recorded() -> (DeviceRegistry, Arc<Mutex<Vec<Notification>>>) {
        let registry = DeviceRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let _ = registry.add_status_listener(move |n| {
            l.lock().push(n.clone());
            Ok(())
        });
        let l = Arc::clone(&log);
        let _ = registry.add_data_listener(move |n| {
            l.lock().push(n.clone());
            Ok(())
        });
        (registry, log)
    }

    #[test]
    fn register_sets_online_and_notifies_once() {
        let (registry, log) = recorded();
        let rec = registry.register_online(reg("dev1"), DeviceLink::new(peer()));

        assert_eq!(rec.status, DeviceStatus::Online);
        assert!(rec.connected_at.is_some());
        assert!(rec.last_heartbeat_at.is_some());
        let stored = registry.get("dev1").unwrap();
        assert_eq!(stored.status, DeviceStatus::Online);
        assert_eq!(stored.remote_port, 40000);

        let log = log.lock();
        assert_eq!(log.len(), 1);
        match &log[0] {
            Notification::StatusChanged { old, new, device } => {
                assert_eq!(*old, DeviceStatus::Offline);
                assert_eq!(*new, DeviceStatus::Online);
                assert_eq!(device.id, "dev1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reregister_reports_prior_status() {
        let (registry, log) = recorded();
        let _ = registry.register_online(reg("dev1"), DeviceLink::new(peer()));
        let _ = registry.register_online(reg("dev1"), DeviceLink::new(peer()));

        let log = log.lock();
        assert!(matches!(
            log[1],
            Notification::StatusChanged {
                old: DeviceStatus::Online,
                new: DeviceStatus::Online,
                ..
            }
        ));
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn reregister_closes_superseded_link() {
        let registry = DeviceRegistry::default();
        let first = DeviceLink::new(peer());
        let second = DeviceLink::new(peer());
        let _ = registry.register_online(reg("dev1"), first.clone());
        let _ = registry.register_online(reg("dev1"), second.clone());

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.link("dev1").unwrap().id(), second.id());
    }

    #[test]
    fn reregister_same_link_keeps_it_open() {
        let registry = DeviceRegistry::default();
        let link = DeviceLink::new(peer());
        let _ = registry.register_online(reg("dev1"), link.clone());
        let _ = registry.register_online(reg("dev1"), link.clone());
        assert!(!link.is_closed());
    }

    #[test]
    fn release_from_superseded_link_is_ignored() {
        let registry = DeviceRegistry::default();
        let first = DeviceLink::new(peer());
        let second = DeviceLink::new(peer());
        let _ = registry.register_online(reg("dev1"), first.clone());
        let _ = registry.register_online(reg("dev1"), second.clone());

        assert!(!registry.release("dev1", first.id()));
        assert!(registry.get("dev1").unwrap().is_online());

        assert!(registry.release("dev1", second.id()));
        assert_eq!(registry.get("dev1").unwrap().status, DeviceStatus::Offline);
    }

    #[test]
    fn mark_offline_twice_is_idempotent_and_notifies_twice() {
        let (registry, log) = recorded();
        let _ = registry.register_online(reg("dev1"), DeviceLink::new(peer()));

        let a = registry.mark_offline("dev1").unwrap();
        let b = registry.mark_offline("dev1").unwrap();
        assert_eq!(a.status, DeviceStatus::Offline);
        assert_eq!(b.status, DeviceStatus::Offline);
        assert!(b.disconnected_at.is_some());
        assert!(registry.link("dev1").is_none());

        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert!(matches!(
            log[2],
            Notification::StatusChanged {
                old: DeviceStatus::Offline,
                new: DeviceStatus::Offline,
                ..
            }
        ));
    }

    #[test]
    fn unknown_ids_are_noops() {
        let (registry, log) = recorded();
        assert!(!registry.touch_heartbeat("nonexistent"));
        assert!(registry.record_data("nonexistent", "x").is_none());
        assert!(registry.mark_offline("nonexistent").is_none());
        assert!(!registry.release("nonexistent", &LinkId::new()));
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.total_count(), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn heartbeat_updates_timestamp_without_notifying() {
        let (registry, log) = recorded();
        let rec = registry.register_online(reg("dev1"), DeviceLink::new(peer()));
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(registry.touch_heartbeat("dev1"));

        let after = registry.get("dev1").unwrap();
        assert!(after.last_heartbeat_at > rec.last_heartbeat_at);
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn record_data_overwrites_payload_and_notifies() {
        let (registry, log) = recorded();
        let _ = registry.register_online(reg("dev1"), DeviceLink::new(peer()));
        let _ = registry.record_data("dev1", "first").unwrap();
        let rec = registry.record_data("dev1", "second").unwrap();

        assert_eq!(rec.last_payload.as_deref(), Some("second"));
        assert!(rec.last_payload_at.is_some());
        let log = log.lock();
        assert!(matches!(
            &log[2],
            Notification::DataReported { payload, .. } if payload == "second"
        ));
    }

    #[test]
    fn status_notification_precedes_data_notification() {
        let (registry, log) = recorded();
        let _ = registry.register_online(reg("dev1"), DeviceLink::new(peer()));
        let _ = registry.record_data("dev1", "{\"t\":1}");

        let kinds: Vec<_> = log.lock().iter().map(Notification::kind).collect();
        assert_eq!(kinds, vec![ListenerKind::Status, ListenerKind::Data]);
    }

    #[test]
    fn snapshots_and_counts() {
        let registry = DeviceRegistry::default();
        for i in 0..5 {
            let _ = registry.register_online(reg(&format!("dev{i}")), DeviceLink::new(peer()));
        }
        let _ = registry.mark_offline("dev1");
        let _ = registry.mark_offline("dev3");

        let all = registry.list_all();
        assert_eq!(all.len(), 5);
        let offline = registry.list_by_status(DeviceStatus::Offline);
        assert_eq!(offline.len(), 2);
        assert!(offline.iter().all(|d| d.disconnected_at.is_some()));
        assert_eq!(registry.online_count(), 3);
        assert_eq!(registry.offline_count(), 2);
        assert_eq!(registry.total_count(), 5);

        // Snapshots are detached from later mutations.
        let _ = registry.mark_offline("dev0");
        assert_eq!(all.iter().filter(|d| d.is_online()).count(), 3);
    }

    #[test]
    fn listener_can_read_registry_during_publish() {
        let registry = Arc::new(DeviceRegistry::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::downgrade(&registry);
        let s = Arc::clone(&seen);
        let _ = registry.add_status_listener(move |_| {
            let registry = r.upgrade().ok_or(ListenerError::Detached)?;
            s.lock().push(registry.list_all().len());
            Ok(())
        });

        let _ = registry.register_online(reg("dev1"), DeviceLink::new(peer()));
        let _ = registry.register_online(reg("dev2"), DeviceLink::new(peer()));
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn failing_listener_does_not_abort_mutation() {
        let registry = DeviceRegistry::default();
        let _ = registry.add_status_listener(|_| Err(ListenerError::Failed("nope".into())));
        let rec = registry.register_online(reg("dev1"), DeviceLink::new(peer()));
        assert!(rec.is_online());
        assert!(registry.get("dev1").unwrap().is_online());
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let (registry, _) = recorded();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let id = registry.add_status_listener(move |_| {
            *h.lock() += 1;
            Ok(())
        });
        let _ = registry.register_online(reg("dev1"), DeviceLink::new(peer()));
        assert!(registry.remove_listener(id));
        let _ = registry.mark_offline("dev1");
        assert_eq!(*hits.lock(), 1);
    }

    #[tokio::test]
    async fn link_closed_resolves_after_close() {
        let link = DeviceLink::new(peer());
        let waiter = link.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });
        link.close();
        handle.await.unwrap();
        assert!(link.is_closed());
    }

    #[test]
    fn child_link_closes_with_parent() {
        let parent = CancellationToken::new();
        let link = DeviceLink::with_parent(peer(), &parent);
        parent.cancel();
        assert!(link.is_closed());
    }
}
