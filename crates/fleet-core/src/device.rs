//! Device record and status.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Connection status of a device.
///
/// Only `Online` and `Offline` are produced by the registry. `Connecting`
/// and `Disconnecting` are kept so the wire enumeration stays stable for
/// dashboards; nothing transitions into them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
    Connecting,
    Disconnecting,
}

impl DeviceStatus {
    /// Wire name, as rendered in observer messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Connecting => "CONNECTING",
            Self::Disconnecting => "DISCONNECTING",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the server knows about one device id.
///
/// Records are never deleted; an offline device stays listed with its
/// last known state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub remote_address: String,
    pub remote_port: u16,
    pub status: DeviceStatus,
    pub connected_at: Option<DateTime<Local>>,
    pub disconnected_at: Option<DateTime<Local>>,
    pub last_heartbeat_at: Option<DateTime<Local>>,
    pub last_payload: Option<String>,
    pub last_payload_at: Option<DateTime<Local>>,
}

impl DeviceRecord {
    /// A fresh, never-connected record.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            remote_address: String::new(),
            remote_port: 0,
            status: DeviceStatus::Offline,
            connected_at: None,
            disconnected_at: None,
            last_heartbeat_at: None,
            last_payload: None,
            last_payload_at: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }
}
