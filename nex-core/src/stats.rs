//! Host telemetry snapshot
//!
//! Serialized once per tick and shipped verbatim as the single argument of a
//! `stats` event.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub swap_bytes: u64,
    pub swap_limit_bytes: u64,
    /// Global CPU usage in percent
    pub cpu_absolute: f64,
    /// Degrees Celsius
    pub cpu_temp: f64,
    pub network: NetworkStats,
    /// Seconds since boot
    pub uptime: u64,
    pub state: String,
    pub disk_bytes: u64,
    pub disk_total: u64,
    pub audio: Vec<AudioState>,
    pub wifi: WifiState,
    pub ip: String,
    pub battery: BatteryState,
    pub volume: i32,
    pub backlight: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One media player as seen by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioState {
    pub id: String,
    pub name: String,
    pub playing: bool,
    pub artist: String,
    pub title: String,
    pub album: String,
    pub art_url: String,
    /// Playback position in seconds
    pub timestamp: i64,
    /// Track length in seconds
    pub duration: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiState {
    pub ssid: String,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
    pub percentage: i32,
    pub plugged_in: bool,
}

impl Default for BatteryState {
    /// Hosts without a battery report as fully charged mains power
    fn default() -> Self {
        Self {
            percentage: 100,
            plugged_in: true,
        }
    }
}
