//! `/health` endpoint.

use fleet_core::DeviceRegistry;
use serde::Serialize;
use std::time::Instant;

/// Device tallies at the time of the check.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct DeviceCounts {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    pub devices: DeviceCounts,
    /// Connected observer count.
    pub observers: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, registry: &DeviceRegistry, observers: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        devices: DeviceCounts {
            total: registry.total_count(),
            online: registry.online_count(),
            offline: registry.offline_count(),
        },
        observers,
    }
}
