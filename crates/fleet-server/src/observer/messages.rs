//! JSON messages exchanged with observers.

use chrono::{DateTime, Local, Utc};
use fleet_core::{DeviceRecord, DeviceStatus};
use serde::{Deserialize, Serialize};

/// Type tag of the one request observers may send.
pub const REQUEST_DEVICE_LIST: &str = "REQUEST_DEVICE_LIST";

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Server-to-observer push.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushMessage {
    #[serde(rename = "DEVICE_STATUS_CHANGE", rename_all = "camelCase")]
    DeviceStatusChange {
        device_id: String,
        device_name: String,
        device_type: String,
        old_status: DeviceStatus,
        new_status: DeviceStatus,
        timestamp: i64,
    },
    #[serde(rename = "DEVICE_DATA_UPDATE", rename_all = "camelCase")]
    DeviceDataUpdate {
        device_id: String,
        device_name: String,
        data: String,
        timestamp: i64,
    },
    #[serde(rename = "DEVICE_LIST_UPDATE")]
    DeviceListUpdate {
        devices: Vec<DeviceListEntry>,
        timestamp: i64,
    },
}

impl PushMessage {
    pub fn status_change(device: &DeviceRecord, old: DeviceStatus, new: DeviceStatus) -> Self {
        Self::DeviceStatusChange {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            device_type: device.kind.clone(),
            old_status: old,
            new_status: new,
            timestamp: now_millis(),
        }
    }

    pub fn data_update(device: &DeviceRecord, payload: &str) -> Self {
        Self::DeviceDataUpdate {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            data: payload.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn device_list(devices: &[DeviceRecord]) -> Self {
        Self::DeviceListUpdate {
            devices: devices.iter().map(DeviceListEntry::from).collect(),
            timestamp: now_millis(),
        }
    }

    /// Wire name of the `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DeviceStatusChange { .. } => "DEVICE_STATUS_CHANGE",
            Self::DeviceDataUpdate { .. } => "DEVICE_DATA_UPDATE",
            Self::DeviceListUpdate { .. } => "DEVICE_LIST_UPDATE",
        }
    }
}

/// One row of a `DEVICE_LIST_UPDATE`.
///
/// Unset timestamps and payloads render as empty strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListEntry {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub status: DeviceStatus,
    pub ip_address: String,
    pub port: u16,
    pub connect_time: String,
    pub last_heartbeat: String,
    pub disconnect_time: String,
    pub last_data: String,
    pub last_data_time: String,
}

impl From<&DeviceRecord> for DeviceListEntry {
    fn from(d: &DeviceRecord) -> Self {
        Self {
            device_id: d.id.clone(),
            device_name: d.name.clone(),
            device_type: d.kind.clone(),
            status: d.status,
            ip_address: d.remote_address.clone(),
            port: d.remote_port,
            connect_time: format_time(d.connected_at),
            last_heartbeat: format_time(d.last_heartbeat_at),
            disconnect_time: format_time(d.disconnected_at),
            last_data: d.last_payload.clone().unwrap_or_default(),
            last_data_time: format_time(d.last_payload_at),
        }
    }
}

fn format_time(t: Option<DateTime<Local>>) -> String {
    t.map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// What to do with a text frame from an observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Push a fresh device list to every observer.
    RequestDeviceList,
    /// Reply to the sender with this text.
    Echo(String),
    /// JSON we do not understand.
    Ignored,
}

/// Classify observer text. Never fails; unknown input is echoed or ignored.
pub fn classify(text: &str) -> Inbound {
    if text.contains(r#""type":"REQUEST_DEVICE_LIST""#) {
        return Inbound::RequestDeviceList;
    }
    if text.trim_start().starts_with('{') {
        let requested = serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == REQUEST_DEVICE_LIST))
            .unwrap_or(false);
        return if requested {
            Inbound::RequestDeviceList
        } else {
            Inbound::Ignored
        };
    }
    Inbound::Echo(format!("message received: {text}"))
}
