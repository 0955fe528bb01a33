//! Persistence seam.
//!
//! The SDK never talks to a database directly. It hands dumps, derived
//! series, known devices and sync markers to a [`Storage`] implementation.
//! [`MemoryStorage`] keeps everything in memory, storing dumps as text under
//! the same keys a key-value backend would use.

use crate::{
    analysis::AnalysedDataPoint,
    error::{Result, StrapError},
    types::{HistoricalDataDump, HistoricalDataPacket, KnownDevice, SyncStatus},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Prefix of every data dump storage key
pub const DATA_DUMP_KEY_PREFIX: &str = "datadump";

/// Optional device and inclusive time range filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataQuery {
    /// Only records from this device
    pub device_name: Option<String>,
    /// Only records at or after this time
    pub from_ms: Option<u64>,
    /// Only records at or before this time
    pub to_ms: Option<u64>,
}

impl DataQuery {
    /// Query matching everything
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Query matching one device
    #[must_use]
    pub fn device(device_name: &str) -> Self {
        Self {
            device_name: Some(device_name.to_string()),
            ..Self::default()
        }
    }

    /// Restrict to records at or after `from_ms`
    #[must_use]
    pub fn since(mut self, from_ms: u64) -> Self {
        self.from_ms = Some(from_ms);
        self
    }

    /// Restrict to records at or before `to_ms`
    #[must_use]
    pub fn until(mut self, to_ms: u64) -> Self {
        self.to_ms = Some(to_ms);
        self
    }

    /// Whether a record of `device_name` at `timestamp_ms` passes the filter
    #[must_use]
    pub fn matches(&self, device_name: &str, timestamp_ms: u64) -> bool {
        self.device_name.as_deref().is_none_or(|name| name == device_name)
            && self.from_ms.is_none_or(|from| timestamp_ms >= from)
            && self.to_ms.is_none_or(|to| timestamp_ms <= to)
    }
}

/// Derived heart rate series kept by storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesKind {
    /// One-minute rolling average
    Avg1Min,
    /// Two-minute rolling average
    Avg2Min,
    /// Five-minute rolling average
    Avg5Min,
    /// 24 hour resting heart rate
    Rhr24h,
}

impl SeriesKind {
    /// Every series, in analysis order
    pub const ALL: [Self; 4] = [Self::Avg1Min, Self::Avg2Min, Self::Avg5Min, Self::Rhr24h];
}

/// A derived heart rate value tagged with its device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Strap name
    pub device_name: String,
    /// Milliseconds since the unix epoch
    pub timestamp_ms: u64,
    /// Beats per minute
    pub heart_rate: f64,
}

/// Persistence backend used by the SDK
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store a dump, replacing any dump with the same device and date
    async fn save_historical_data_dump(&self, dump: &HistoricalDataDump) -> Result<()>;

    /// Dumps matching `query` by device and dump date, oldest first
    async fn get_historical_data_dumps(&self, query: &DataQuery)
        -> Result<Vec<HistoricalDataDump>>;

    /// Delete dumps matching `query` by device and dump date
    async fn delete_historical_data_dumps_in_range(&self, query: &DataQuery) -> Result<()>;

    /// Delete one dump
    async fn delete_historical_data_dump(&self, dump: &HistoricalDataDump) -> Result<()>;

    /// Store individual samples, replacing samples with the same timestamp
    async fn save_historical_data_packets(
        &self,
        device_name: &str,
        packets: &[HistoricalDataPacket],
    ) -> Result<()>;

    /// Individual samples matching `query`, oldest first
    async fn get_historical_data_packets(
        &self,
        query: &DataQuery,
    ) -> Result<Vec<HistoricalDataPacket>>;

    /// Store derived values, replacing values with the same device and time
    async fn save_heart_rate_series(&self, kind: SeriesKind, points: &[SeriesPoint])
        -> Result<()>;

    /// Derived values matching `query`, oldest first
    async fn get_heart_rate_series(
        &self,
        kind: SeriesKind,
        query: &DataQuery,
    ) -> Result<Vec<AnalysedDataPoint>>;

    /// Delete derived values matching `query`
    async fn delete_heart_rate_series(&self, kind: SeriesKind, query: &DataQuery) -> Result<()>;

    /// Remember a strap
    async fn save_known_device(&self, device: &KnownDevice) -> Result<()>;

    /// Every remembered strap
    async fn get_known_devices(&self) -> Result<Vec<KnownDevice>>;

    /// The strap connected most recently
    async fn get_last_connected_device(&self) -> Result<Option<KnownDevice>>;

    /// Forget one strap
    async fn delete_known_device(&self, device_id: &str) -> Result<()>;

    /// Forget every strap
    async fn delete_known_devices(&self) -> Result<()>;

    /// Record the newest synced sample of a strap
    async fn save_sync_status(&self, status: &SyncStatus) -> Result<()>;

    /// Sync marker of a strap
    async fn get_sync_status(&self, device_name: &str) -> Result<Option<SyncStatus>>;

    /// Clear the sync marker of a strap
    async fn delete_sync_status(&self, device_name: &str) -> Result<()>;
}

/// Storage key of a dump: `datadump_{device}_{date ms}`.
///
/// The date is zero padded to 13 digits so keys sort chronologically.
#[must_use]
pub fn generate_data_dump_storage_key(device_name: &str, date_ms: u64) -> String {
    format!("{DATA_DUMP_KEY_PREFIX}_{device_name}_{date_ms:013}")
}

/// Split a dump key into device name and date; `None` for foreign keys
#[must_use]
pub fn parse_data_dump_storage_key(key: &str) -> Option<(String, u64)> {
    let parts: Vec<&str> = key.split('_').collect();
    let [prefix, device_name, date] = parts.as_slice() else {
        return None;
    };
    if *prefix != DATA_DUMP_KEY_PREFIX {
        return None;
    }
    let date_ms = date.parse().ok()?;
    Some(((*device_name).to_string(), date_ms))
}

/// Dump keys matching `query`, sorted
#[must_use]
pub fn filter_data_dump_storage_keys<'a, I>(keys: I, query: &DataQuery) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut matching: Vec<String> = keys
        .into_iter()
        .filter(|key| {
            parse_data_dump_storage_key(key)
                .is_some_and(|(device_name, date_ms)| query.matches(&device_name, date_ms))
        })
        .map(str::to_string)
        .collect();
    matching.sort();
    matching
}

/// Wrap samples in a dump dated by the last sample; `None` if there are none
#[must_use]
pub fn make_historical_data_dump(
    device_name: &str,
    data_dump: Vec<HistoricalDataPacket>,
) -> Option<HistoricalDataDump> {
    let date_ms = data_dump.last()?.timestamp_ms;
    Some(HistoricalDataDump {
        device_name: device_name.to_string(),
        date_ms,
        data_dump,
    })
}

/// Concatenate dumps in date order into one dated by the newest
#[must_use]
pub fn merge_historical_data_dumps(
    mut dumps: Vec<HistoricalDataDump>,
) -> Option<HistoricalDataDump> {
    dumps.sort_by_key(|dump| dump.date_ms);
    let device_name = dumps.first()?.device_name.clone();
    let date_ms = dumps.last()?.date_ms;
    let data_dump = dumps.into_iter().flat_map(|dump| dump.data_dump).collect();
    Some(HistoricalDataDump {
        device_name,
        date_ms,
        data_dump,
    })
}

/// Whether a sample lies in the inclusive range
#[must_use]
pub fn filter_historical_data_packet(
    packet: &HistoricalDataPacket,
    from_ms: Option<u64>,
    to_ms: Option<u64>,
) -> bool {
    from_ms.is_none_or(|from| packet.timestamp_ms >= from)
        && to_ms.is_none_or(|to| packet.timestamp_ms <= to)
}

/// One sample as `timestampMs heartRate [rr,..] unknown`
#[must_use]
pub fn serialize_historical_data_packet(packet: &HistoricalDataPacket) -> String {
    let rr = packet
        .rr
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{} {} [{}] {}",
        packet.timestamp_ms, packet.heart_rate, rr, packet.unknown
    )
}

/// Parse one sample line
///
/// # Errors
///
/// Returns [`StrapError::Storage`] if the line is not a valid sample.
pub fn deserialize_historical_data_packet(line: &str) -> Result<HistoricalDataPacket> {
    let invalid = || StrapError::Storage(format!("Invalid historical data packet: {line}"));

    let fields: Vec<&str> = line.split(' ').collect();
    let [timestamp_ms, heart_rate, rr, unknown] = fields.as_slice() else {
        return Err(invalid());
    };

    let rr = rr
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(invalid)?;
    let rr = if rr.is_empty() {
        Vec::new()
    } else {
        rr.split(',')
            .map(|value| value.trim().parse().map_err(|_| invalid()))
            .collect::<Result<Vec<u16>>>()?
    };

    Ok(HistoricalDataPacket {
        timestamp_ms: timestamp_ms.parse().map_err(|_| invalid())?,
        heart_rate: heart_rate.parse().map_err(|_| invalid())?,
        rr,
        unknown: unknown.parse().map_err(|_| invalid())?,
    })
}

/// A dump as text: device name line, date line, then one sample per line
#[must_use]
pub fn serialize_historical_data_dump(dump: &HistoricalDataDump) -> String {
    let mut out = format!("{}\n{}", dump.device_name, dump.date_ms);
    for packet in &dump.data_dump {
        let _ = write!(out, "\n{}", serialize_historical_data_packet(packet));
    }
    out
}

/// Parse a dump written by [`serialize_historical_data_dump`].
///
/// Sample lines that do not parse are skipped.
///
/// # Errors
///
/// Returns [`StrapError::Storage`] if the header lines are missing or the
/// date is not a number.
pub fn deserialize_historical_data_dump(text: &str) -> Result<HistoricalDataDump> {
    let mut lines = text.split('\n');
    let device_name = lines
        .next()
        .ok_or_else(|| StrapError::Storage("Empty data dump".to_string()))?;
    let date_ms = lines
        .next()
        .and_then(|line| line.trim().parse().ok())
        .ok_or_else(|| StrapError::Storage("Data dump has no valid date".to_string()))?;

    let data_dump = lines
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match deserialize_historical_data_packet(line) {
            Ok(packet) => Some(packet),
            Err(e) => {
                debug!("Skipping sample line: {}", e);
                None
            }
        })
        .collect();

    Ok(HistoricalDataDump {
        device_name: device_name.to_string(),
        date_ms,
        data_dump,
    })
}

/// In-memory [`Storage`]
#[derive(Debug, Default)]
pub struct MemoryStorage {
    dumps: RwLock<BTreeMap<String, String>>,
    packets: RwLock<HashMap<String, BTreeMap<u64, HistoricalDataPacket>>>,
    series: RwLock<HashMap<SeriesKind, BTreeMap<(String, u64), f64>>>,
    known_devices: RwLock<HashMap<String, KnownDevice>>,
    sync_status: RwLock<HashMap<String, SyncStatus>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail, or stop doing so
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stored dump keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        self.dumps.read().await.keys().cloned().collect()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StrapError::Storage("Writes are disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_historical_data_dump(&self, dump: &HistoricalDataDump) -> Result<()> {
        self.check_writable()?;
        let key = generate_data_dump_storage_key(&dump.device_name, dump.date_ms);
        debug!("Saving {} samples under {}", dump.data_dump.len(), key);
        self.dumps
            .write()
            .await
            .insert(key, serialize_historical_data_dump(dump));
        Ok(())
    }

    async fn get_historical_data_dumps(
        &self,
        query: &DataQuery,
    ) -> Result<Vec<HistoricalDataDump>> {
        let dumps = self.dumps.read().await;
        let keys = filter_data_dump_storage_keys(dumps.keys().map(String::as_str), query);

        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(text) = dumps.get(&key) else {
                continue;
            };
            match deserialize_historical_data_dump(text) {
                Ok(dump) => result.push(dump),
                Err(e) => warn!("Unreadable data dump {}: {}", key, e),
            }
        }
        Ok(result)
    }

    async fn delete_historical_data_dumps_in_range(&self, query: &DataQuery) -> Result<()> {
        let mut dumps = self.dumps.write().await;
        let keys = filter_data_dump_storage_keys(dumps.keys().map(String::as_str), query);
        for key in keys {
            dumps.remove(&key);
            debug!("Deleted data dump {}", key);
        }
        Ok(())
    }

    async fn delete_historical_data_dump(&self, dump: &HistoricalDataDump) -> Result<()> {
        let key = generate_data_dump_storage_key(&dump.device_name, dump.date_ms);
        self.dumps.write().await.remove(&key);
        Ok(())
    }

    async fn save_historical_data_packets(
        &self,
        device_name: &str,
        packets: &[HistoricalDataPacket],
    ) -> Result<()> {
        self.check_writable()?;
        let mut stored = self.packets.write().await;
        let device = stored.entry(device_name.to_string()).or_default();
        for packet in packets {
            device.insert(packet.timestamp_ms, packet.clone());
        }
        Ok(())
    }

    async fn get_historical_data_packets(
        &self,
        query: &DataQuery,
    ) -> Result<Vec<HistoricalDataPacket>> {
        let stored = self.packets.read().await;
        let mut result: Vec<HistoricalDataPacket> = stored
            .iter()
            .flat_map(|(device_name, packets)| {
                packets
                    .values()
                    .filter(move |p| query.matches(device_name, p.timestamp_ms))
            })
            .cloned()
            .collect();
        result.sort_by_key(|p| p.timestamp_ms);
        Ok(result)
    }

    async fn save_heart_rate_series(
        &self,
        kind: SeriesKind,
        points: &[SeriesPoint],
    ) -> Result<()> {
        self.check_writable()?;
        let mut series = self.series.write().await;
        let stored = series.entry(kind).or_default();
        for point in points {
            stored.insert(
                (point.device_name.clone(), point.timestamp_ms),
                point.heart_rate,
            );
        }
        debug!("Saved {} {:?} points", points.len(), kind);
        Ok(())
    }

    async fn get_heart_rate_series(
        &self,
        kind: SeriesKind,
        query: &DataQuery,
    ) -> Result<Vec<AnalysedDataPoint>> {
        let series = self.series.read().await;
        let mut result: Vec<AnalysedDataPoint> = series
            .get(&kind)
            .into_iter()
            .flatten()
            .filter(|((device_name, timestamp_ms), _)| query.matches(device_name, *timestamp_ms))
            .map(|((_, timestamp_ms), heart_rate)| AnalysedDataPoint {
                timestamp_ms: *timestamp_ms,
                heart_rate: *heart_rate,
            })
            .collect();
        result.sort_by_key(|p| p.timestamp_ms);
        Ok(result)
    }

    async fn delete_heart_rate_series(&self, kind: SeriesKind, query: &DataQuery) -> Result<()> {
        if let Some(stored) = self.series.write().await.get_mut(&kind) {
            stored.retain(|(device_name, timestamp_ms), _| {
                !query.matches(device_name, *timestamp_ms)
            });
        }
        Ok(())
    }

    async fn save_known_device(&self, device: &KnownDevice) -> Result<()> {
        self.check_writable()?;
        self.known_devices
            .write()
            .await
            .insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn get_known_devices(&self) -> Result<Vec<KnownDevice>> {
        let mut devices: Vec<KnownDevice> =
            self.known_devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| b.last_connected_ms.cmp(&a.last_connected_ms));
        Ok(devices)
    }

    async fn get_last_connected_device(&self) -> Result<Option<KnownDevice>> {
        Ok(self
            .known_devices
            .read()
            .await
            .values()
            .max_by_key(|d| d.last_connected_ms)
            .cloned())
    }

    async fn delete_known_device(&self, device_id: &str) -> Result<()> {
        self.known_devices.write().await.remove(device_id);
        Ok(())
    }

    async fn delete_known_devices(&self) -> Result<()> {
        self.known_devices.write().await.clear();
        Ok(())
    }

    async fn save_sync_status(&self, status: &SyncStatus) -> Result<()> {
        self.check_writable()?;
        self.sync_status
            .write()
            .await
            .insert(status.device_name.clone(), status.clone());
        Ok(())
    }

    async fn get_sync_status(&self, device_name: &str) -> Result<Option<SyncStatus>> {
        Ok(self.sync_status.read().await.get(device_name).cloned())
    }

    async fn delete_sync_status(&self, device_name: &str) -> Result<()> {
        self.sync_status.write().await.remove(device_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn packet(timestamp_ms: u64, heart_rate: u8) -> HistoricalDataPacket {
        HistoricalDataPacket {
            timestamp_ms,
            heart_rate,
            rr: vec![800, 812],
            unknown: 3,
        }
    }

    fn dump(device_name: &str, timestamps: &[u64]) -> HistoricalDataDump {
        make_historical_data_dump(
            device_name,
            timestamps.iter().map(|&t| packet(t, 60)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_storage_key_round_trip() {
        let key = generate_data_dump_storage_key("WHOOP 4A0000000", 1_700_000_000_500);
        assert_eq!(key, "datadump_WHOOP 4A0000000_1700000000500");
        assert_eq!(
            parse_data_dump_storage_key(&key),
            Some(("WHOOP 4A0000000".to_string(), 1_700_000_000_500))
        );
    }

    #[test]
    fn test_storage_key_sorts_chronologically() {
        let early = generate_data_dump_storage_key("A", 999_999_999_999);
        let late = generate_data_dump_storage_key("A", 1_000_000_000_000);
        assert!(early < late);
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert_eq!(parse_data_dump_storage_key("knowndevice_A_1"), None);
        assert_eq!(parse_data_dump_storage_key("datadump_A_notadate"), None);
        assert_eq!(parse_data_dump_storage_key("datadump_A_B_1"), None);
        assert_eq!(parse_data_dump_storage_key("datadump"), None);
    }

    #[test]
    fn test_filter_keys() {
        let keys = [
            generate_data_dump_storage_key("B", 3000),
            generate_data_dump_storage_key("A", 2000),
            generate_data_dump_storage_key("A", 1000),
            "settings".to_string(),
            generate_data_dump_storage_key("A", 4000),
        ];
        let keys_ref = keys.iter().map(String::as_str);

        let filtered =
            filter_data_dump_storage_keys(keys_ref, &DataQuery::device("A").since(1000).until(2000));
        assert_eq!(
            filtered,
            vec![
                generate_data_dump_storage_key("A", 1000),
                generate_data_dump_storage_key("A", 2000),
            ]
        );

        let all = filter_data_dump_storage_keys(keys.iter().map(String::as_str), &DataQuery::all());
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_make_dump_dated_by_last_packet() {
        let dump = dump("A", &[1000, 2000, 3000]);
        assert_eq!(dump.date_ms, 3000);
        assert!(make_historical_data_dump("A", Vec::new()).is_none());
    }

    #[test]
    fn test_merge_dumps_in_date_order() {
        let merged = merge_historical_data_dumps(vec![
            dump("A", &[3000, 4000]),
            dump("A", &[1000, 2000]),
        ])
        .unwrap();

        assert_eq!(merged.date_ms, 4000);
        let timestamps: Vec<u64> = merged.data_dump.iter().map(|p| p.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1000, 2000, 3000, 4000]);
        assert!(merge_historical_data_dumps(Vec::new()).is_none());
    }

    #[test]
    fn test_filter_packet_bounds_inclusive() {
        let p = packet(2000, 60);
        assert!(filter_historical_data_packet(&p, Some(2000), Some(2000)));
        assert!(filter_historical_data_packet(&p, None, None));
        assert!(!filter_historical_data_packet(&p, Some(2001), None));
        assert!(!filter_historical_data_packet(&p, None, Some(1999)));
    }

    #[test]
    fn test_packet_text_format() {
        let line = serialize_historical_data_packet(&packet(1_700_000_000_500, 75));
        assert_eq!(line, "1700000000500 75 [800,812] 3");
        assert_eq!(
            deserialize_historical_data_packet(&line).unwrap(),
            packet(1_700_000_000_500, 75)
        );

        let empty_rr = deserialize_historical_data_packet("1000 61 [] 0").unwrap();
        assert!(empty_rr.rr.is_empty());

        assert!(deserialize_historical_data_packet("1000 61 800 0").is_err());
        assert!(deserialize_historical_data_packet("1000 abc [] 0").is_err());
        assert!(deserialize_historical_data_packet("1000 61 []").is_err());
    }

    #[test]
    fn test_dump_text_skips_bad_lines() {
        let text = "WHOOP A\n3000\n1000 60 [800] 0\ngarbage\n\n3000 62 [] 1";
        let dump = deserialize_historical_data_dump(text).unwrap();

        assert_eq!(dump.device_name, "WHOOP A");
        assert_eq!(dump.date_ms, 3000);
        assert_eq!(dump.data_dump.len(), 2);
        assert_eq!(dump.data_dump[1].heart_rate, 62);

        assert!(deserialize_historical_data_dump("WHOOP A\nyesterday").is_err());
    }

    #[test]
    fn test_dump_text_preserves_dump() {
        let original = dump("WHOOP A", &[1000, 2000]);
        let text = serialize_historical_data_dump(&original);
        assert_eq!(deserialize_historical_data_dump(&text).unwrap(), original);
    }

    #[tokio::test]
    async fn test_memory_storage_dumps() {
        let storage = MemoryStorage::new();
        assert_ok!(storage.save_historical_data_dump(&dump("A", &[1000, 2000])).await);
        assert_ok!(storage.save_historical_data_dump(&dump("A", &[3000])).await);
        assert_ok!(storage.save_historical_data_dump(&dump("B", &[1500])).await);

        let a = storage
            .get_historical_data_dumps(&DataQuery::device("A"))
            .await
            .unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].date_ms, 2000);

        let ranged = storage
            .get_historical_data_dumps(&DataQuery::all().since(1500).until(2500))
            .await
            .unwrap();
        assert_eq!(ranged.len(), 2);

        assert_ok!(
            storage
                .delete_historical_data_dumps_in_range(&DataQuery::device("A").until(2000))
                .await
        );
        assert_ok!(storage.delete_historical_data_dump(&dump("B", &[1500])).await);
        assert_eq!(
            storage.keys().await,
            vec![generate_data_dump_storage_key("A", 3000)]
        );
    }

    #[tokio::test]
    async fn test_memory_storage_packets() {
        let storage = MemoryStorage::new();
        assert_ok!(
            storage
                .save_historical_data_packets("A", &[packet(2000, 61), packet(1000, 60)])
                .await
        );
        assert_ok!(storage.save_historical_data_packets("A", &[packet(2000, 70)]).await);

        let packets = storage
            .get_historical_data_packets(&DataQuery::device("A"))
            .await
            .unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].timestamp_ms, 1000);
        assert_eq!(packets[1].heart_rate, 70);
    }

    #[tokio::test]
    async fn test_memory_storage_series() {
        let storage = MemoryStorage::new();
        let points: Vec<SeriesPoint> = [(1000, 60.0), (2000, 62.5)]
            .iter()
            .map(|&(timestamp_ms, heart_rate)| SeriesPoint {
                device_name: "A".to_string(),
                timestamp_ms,
                heart_rate,
            })
            .collect();
        assert_ok!(storage.save_heart_rate_series(SeriesKind::Avg1Min, &points).await);

        let stored = storage
            .get_heart_rate_series(SeriesKind::Avg1Min, &DataQuery::device("A"))
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert!(storage
            .get_heart_rate_series(SeriesKind::Rhr24h, &DataQuery::all())
            .await
            .unwrap()
            .is_empty());

        assert_ok!(
            storage
                .delete_heart_rate_series(SeriesKind::Avg1Min, &DataQuery::all().since(1500))
                .await
        );
        let remaining = storage
            .get_heart_rate_series(SeriesKind::Avg1Min, &DataQuery::all())
            .await
            .unwrap();
        assert_eq!(remaining, vec![AnalysedDataPoint { timestamp_ms: 1000, heart_rate: 60.0 }]);
    }

    #[tokio::test]
    async fn test_memory_storage_known_devices_and_sync() {
        let storage = MemoryStorage::new();
        for (id, ms) in [("a", 1000), ("b", 3000), ("c", 2000)] {
            let device = KnownDevice {
                device_id: id.to_string(),
                device_name: format!("WHOOP {id}"),
                last_connected_ms: ms,
            };
            assert_ok!(storage.save_known_device(&device).await);
        }

        let last = storage.get_last_connected_device().await.unwrap().unwrap();
        assert_eq!(last.device_id, "b");
        let ids: Vec<String> = storage
            .get_known_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        assert_ok!(storage.delete_known_device("b").await);
        assert_eq!(storage.get_known_devices().await.unwrap().len(), 2);
        assert_ok!(storage.delete_known_devices().await);
        assert!(storage.get_last_connected_device().await.unwrap().is_none());

        let status = SyncStatus {
            device_name: "WHOOP a".to_string(),
            last_synced_ms: 5000,
        };
        assert_ok!(storage.save_sync_status(&status).await);
        assert_eq!(storage.get_sync_status("WHOOP a").await.unwrap(), Some(status));
        assert_ok!(storage.delete_sync_status("WHOOP a").await);
        assert!(storage.get_sync_status("WHOOP a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        let err = storage
            .save_historical_data_dump(&dump("A", &[1000]))
            .await
            .unwrap_err();
        assert!(matches!(err, StrapError::Storage(_)));
    }
}
