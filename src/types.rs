use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Default number of historical samples saved per dump (10 hours at 1 Hz)
pub const DEFAULT_DOWNLOAD_BUFFER_SIZE: usize = 36_000;

/// Firmware versions reported by the strap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Main MCU firmware version
    pub harvard: String,
    /// Sensor MCU firmware version
    pub boylston: String,
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "harvard {} / boylston {}", self.harvard, self.boylston)
    }
}

/// Wear and charge flags from the hello report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HelloHarvard {
    /// Strap is on the charger
    pub charging: bool,
    /// Strap is on the wrist
    pub is_worn: bool,
}

/// Polled device status
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceState {
    /// Battery level in percent
    pub battery_level: Option<f64>,
    /// Strap clock in unix seconds
    pub clock: Option<u32>,
    /// Strap is on the wrist
    pub is_worn: bool,
    /// Strap is charging
    pub charging: bool,
    /// Firmware versions
    pub version_info: Option<VersionInfo>,
    /// Real-time heart rate streaming is on
    pub realtime_heart_rate_enabled: bool,
}

/// Session-level flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceSessionState {
    /// A historical download pipeline is running
    pub downloading_historical_data: bool,
    /// Console log packets are decoded instead of dropped
    pub logs_from_strap_enabled: bool,
}

/// One real-time heart rate reading.
///
/// A `None` bpm is appended once when streaming is switched off, marking
/// where the stream stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateEvent {
    /// Time the reading was received
    pub date: SystemTime,
    /// Beats per minute
    pub bpm: Option<u8>,
}

/// One line of firmware console output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Time the log packet was received
    pub date: SystemTime,
    /// Decoded text
    pub message: String,
}

/// One stored heart rate sample downloaded from the strap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalDataPacket {
    /// Milliseconds since the unix epoch
    pub timestamp_ms: u64,
    /// Beats per minute
    pub heart_rate: u8,
    /// RR intervals in milliseconds (0-4 entries)
    pub rr: Vec<u16>,
    /// Undeciphered field
    pub unknown: u32,
}

/// A chunk of downloaded samples as handed to storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalDataDump {
    /// Name of the strap the samples came from
    pub device_name: String,
    /// Timestamp of the last sample in milliseconds
    pub date_ms: u64,
    /// The samples
    pub data_dump: Vec<HistoricalDataPacket>,
}

/// A strap seen by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Transport specific identifier
    pub id: String,
    /// Advertised name
    pub name: String,
}

/// A strap remembered by storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    /// Transport specific identifier
    pub device_id: String,
    /// Advertised name
    pub device_name: String,
    /// Last connection time in milliseconds
    pub last_connected_ms: u64,
}

/// Last successful sync for a strap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Strap name
    pub device_name: String,
    /// Timestamp of the newest synced sample in milliseconds
    pub last_synced_ms: u64,
}

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between device state polls in milliseconds
    pub polling_interval_ms: u64,
    /// Upper bound on waiting for a command response; `None` waits forever
    pub response_timeout_ms: Option<u64>,
    /// Capacity of each decoded packet broadcast channel
    pub broadcast_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 5_000,
            response_timeout_ms: None,
            broadcast_capacity: 1024,
        }
    }
}

/// BLE transport parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 5_000,
            connect_timeout_ms: 30_000,
        }
    }
}

/// Milliseconds since the unix epoch for `time`, saturating at zero
#[must_use]
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
