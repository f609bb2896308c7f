//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may name only the fields it wants to change.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Longest accepted idle or ping interval, one day.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Root settings type for the fleet hub.
///
/// ```json
/// {
///   "device": { "port": 9000, "readIdleSecs": 120 },
///   "observer": { "path": "/live" },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FleetSettings {
    /// Device-facing TCP listener.
    pub device: DeviceSettings,
    /// Observer-facing WebSocket/HTTP listener.
    pub observer: ObserverSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl FleetSettings {
    /// Reject values the servers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.device.read_idle_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "device.readIdleSecs must be > 0".into(),
            ));
        }
        if self.device.write_idle_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "device.writeIdleSecs must be > 0".into(),
            ));
        }
        for (name, secs) in [
            ("device.readIdleSecs", self.device.read_idle_secs),
            ("device.writeIdleSecs", self.device.write_idle_secs),
            ("observer.pingIntervalSecs", self.observer.ping_interval_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(SettingsError::InvalidValue(format!(
                    "{name} must be <= {MAX_INTERVAL_SECS}, got {secs}"
                )));
            }
        }
        if self.device.max_line_length == 0 {
            return Err(SettingsError::InvalidValue(
                "device.maxLineLength must be > 0".into(),
            ));
        }
        if self.observer.send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "observer.sendQueue must be > 0".into(),
            ));
        }
        if self.observer.ping_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "observer.pingIntervalSecs must be > 0".into(),
            ));
        }
        if !self.observer.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "observer.path must start with '/', got {:?}",
                self.observer.path
            )));
        }
        Ok(())
    }
}

/// Device listener and per-connection watchdog settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSettings {
    /// Bind address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Seconds without inbound bytes before the connection is closed.
    pub read_idle_secs: u64,
    /// Seconds without outbound bytes before a `PING` is sent.
    pub write_idle_secs: u64,
    /// Longest accepted protocol line, in bytes, excluding the newline.
    pub max_line_length: usize,
    /// Line sent to every device right after it connects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

impl DeviceSettings {
    pub fn read_idle(&self) -> Duration {
        Duration::from_secs(self.read_idle_secs)
    }

    pub fn write_idle(&self) -> Duration {
        Duration::from_secs(self.write_idle_secs)
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            read_idle_secs: 60,
            write_idle_secs: 30,
            max_line_length: 8192,
            greeting: None,
        }
    }
}

/// Observer listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObserverSettings {
    /// Bind address.
    pub host: String,
    /// HTTP port serving the WebSocket upgrade and the JSON endpoints.
    pub port: u16,
    /// WebSocket upgrade path.
    pub path: String,
    /// Per-observer outbound queue capacity. Messages beyond it are dropped.
    pub send_queue: usize,
    /// Interval between WebSocket pings.
    pub ping_interval_secs: u64,
}

impl ObserverSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8889,
            path: "/ws".to_string(),
            send_queue: 256,
            ping_interval_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter level (`trace`..`error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
