use crate::{
    analysis::{analyse_data, AnalysedDataPoint, AnalysedDataResult},
    command::{Command, CommandResponse},
    device::DeviceSession,
    download::download_historical_data,
    error::{Result, StrapError},
    storage::{
        filter_historical_data_packet, merge_historical_data_dumps, DataQuery, SeriesKind,
        SeriesPoint, Storage,
    },
    transport::Transport,
    types::{
        unix_millis, DiscoveredDevice, HistoricalDataDump, KnownDevice, SessionConfig, SyncStatus,
    },
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::SystemTime,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Connected sessions keyed by device id
pub type SessionRegistry = HashMap<String, Arc<DeviceSession>>;

/// Entry point owning every strap session.
///
/// The SDK connects straps through a [`Transport`], keeps one
/// [`DeviceSession`] per connected device id, and persists downloads and
/// analysis results through a [`Storage`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use strapkit::{mock::MockTransport, storage::MemoryStorage, Sdk};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let sdk = Sdk::new(
///         Arc::new(MockTransport::with_device("strap-1", "WHOOP 4A0000000")),
///         Arc::new(MemoryStorage::new()),
///     );
///
///     let session = sdk.connect_to_device("strap-1", || {}).await?;
///     let dumps = sdk.download_historical_data(session.id(), 3600).await?;
///     println!("Saved {} dumps", dumps.len());
///
///     sdk.destroy().await;
///     Ok(())
/// }
/// ```
pub struct Sdk {
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    config: SessionConfig,
    sessions: Arc<watch::Sender<SessionRegistry>>,
    destroyed: AtomicBool,
}

impl Sdk {
    /// Create an SDK with the default session configuration
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, storage: Arc<dyn Storage>) -> Self {
        Self::with_config(transport, storage, SessionConfig::default())
    }

    /// Create an SDK whose sessions use `config`
    #[must_use]
    pub fn with_config(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        config: SessionConfig,
    ) -> Self {
        info!("SDK initialized");
        Self {
            transport,
            storage,
            config,
            sessions: Arc::new(watch::Sender::new(HashMap::new())),
            destroyed: AtomicBool::new(false),
        }
    }

    /// The storage backend
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Straps the transport can currently see
    ///
    /// # Errors
    ///
    /// Returns the transport error if scanning fails.
    pub async fn get_devices(&self) -> Result<Vec<DiscoveredDevice>> {
        debug!("Listing devices");
        self.transport.get_devices().await
    }

    /// Connect to a strap and register its session.
    ///
    /// If a session for `id` already exists it is returned and no new
    /// connection is made. When the link later drops, `on_disconnect` runs,
    /// then the session is removed from the registry and destroyed.
    ///
    /// # Errors
    ///
    /// Returns the transport error if connecting fails.
    pub async fn connect_to_device<F>(&self, id: &str, on_disconnect: F) -> Result<Arc<DeviceSession>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Some(existing) = self.session(id) {
            info!("Session already exists for device {}", id);
            return Ok(existing);
        }

        let sessions = self.sessions.clone();
        let device_id = id.to_string();
        let wrapper = move || {
            info!("Device {} disconnected, cleaning up its session", device_id);
            on_disconnect();
            release_session(&sessions, &device_id);
        };

        let connection = self
            .transport
            .connect_to_device(id, Box::new(wrapper))
            .await?;
        let session = DeviceSession::new(connection, self.config.clone());

        self.sessions.send_modify(|registry| {
            registry.insert(id.to_string(), session.clone());
        });
        info!("Device {} connected as {}", id, session.name());

        let known = KnownDevice {
            device_id: id.to_string(),
            device_name: session.name().to_string(),
            last_connected_ms: unix_millis(SystemTime::now()),
        };
        if let Err(e) = self.storage.save_known_device(&known).await {
            warn!("Failed to remember device {}: {}", id, e);
        }

        Ok(session)
    }

    /// Observe the session registry; the current map is replayed
    #[must_use]
    pub fn observe_connected_devices(&self) -> watch::Receiver<SessionRegistry> {
        self.sessions.subscribe()
    }

    /// The session for `device_id`, if connected
    #[must_use]
    pub fn session(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.borrow().get(device_id).cloned()
    }

    fn require_session(&self, device_id: &str) -> Result<Arc<DeviceSession>> {
        self.session(device_id).ok_or_else(|| {
            error!("No device session found for device {}", device_id);
            StrapError::NoSession(device_id.to_string())
        })
    }

    /// Send a command to a connected strap
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::NoSession`] for an unknown device id, otherwise
    /// see [`DeviceSession::send_command`].
    pub async fn send_command(&self, device_id: &str, command: Command) -> Result<CommandResponse> {
        self.require_session(device_id)?
            .send_command(command)
            .await
    }

    /// Download all historical data of a strap into storage.
    ///
    /// Samples are saved in dumps of `buffer_size`; see
    /// [`download_historical_data`]. After a successful run the timestamp of
    /// the newest sample is recorded as the strap's sync status.
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::NoSession`] for an unknown device id,
    /// [`StrapError::DownloadInProgress`] if one is already running, or the
    /// first transfer or storage error.
    pub async fn download_historical_data(
        &self,
        device_id: &str,
        buffer_size: usize,
    ) -> Result<Vec<HistoricalDataDump>> {
        let session = self.require_session(device_id)?;
        let device_name = session.name().to_string();
        info!("Downloading historical data for {} ({})", device_id, device_name);

        let stream = session.historical_data_stream()?;
        let storage = self.storage.clone();
        let dumps = download_historical_data(
            device_id,
            &device_name,
            stream,
            move |dump| {
                let storage = storage.clone();
                async move { storage.save_historical_data_dump(&dump).await }
            },
            buffer_size,
        )
        .await?;

        if let Some(last) = dumps.last() {
            let status = SyncStatus {
                device_name,
                last_synced_ms: last.date_ms,
            };
            if let Err(e) = self.storage.save_sync_status(&status).await {
                warn!("Failed to record sync status for {}: {}", device_id, e);
            }
        }

        Ok(dumps)
    }

    /// Ask the running download of a strap to stop at the next page
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::NoSession`] for an unknown device id.
    pub fn abort_download(&self, device_id: &str) -> Result<()> {
        self.require_session(device_id)?.abort_download();
        Ok(())
    }

    /// Disconnect a strap and drop its session
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::NoSession`] for an unknown device id or the
    /// transport error if disconnecting fails.
    pub async fn disconnect_from_device(&self, device_id: &str) -> Result<()> {
        info!("Disconnecting from device {}", device_id);
        let session = self.require_session(device_id)?;
        self.sessions.send_modify(|registry| {
            registry.remove(device_id);
        });
        session.destroy().await
    }

    /// Every stored sample of `device_name` in the inclusive range, merged
    /// into one dump.
    ///
    /// Returns `None` when storage holds no dump for the device in range.
    ///
    /// # Errors
    ///
    /// Returns the storage error if loading fails.
    pub async fn merged_historical_data_dump(
        &self,
        device_name: &str,
        from_ms: Option<u64>,
        to_ms: Option<u64>,
    ) -> Result<Option<HistoricalDataDump>> {
        // A dump is dated by its newest sample, so only the lower bound can
        // be applied to dump dates
        let mut query = DataQuery::device(device_name);
        query.from_ms = from_ms;

        let dumps = self.storage.get_historical_data_dumps(&query).await?;
        debug!("Merging {} dumps for {}", dumps.len(), device_name);

        Ok(merge_historical_data_dumps(dumps).map(|mut merged| {
            merged
                .data_dump
                .retain(|packet| filter_historical_data_packet(packet, from_ms, to_ms));
            merged
        }))
    }

    /// Analyse stored samples of `device_name` and persist the results.
    ///
    /// With `erase_existing` every stored series value of the device in the
    /// range is deleted before the new values are saved.
    ///
    /// # Errors
    ///
    /// Returns the first storage error.
    pub async fn analyse_device_data(
        &self,
        device_name: &str,
        from_ms: Option<u64>,
        to_ms: Option<u64>,
        erase_existing: bool,
    ) -> Result<AnalysedDataResult> {
        info!("Analysing data for {}", device_name);

        let samples: Vec<AnalysedDataPoint> = self
            .merged_historical_data_dump(device_name, from_ms, to_ms)
            .await?
            .map(|dump| dump.data_dump.iter().map(AnalysedDataPoint::from).collect())
            .unwrap_or_default();
        let result = analyse_data(&samples);

        let query = DataQuery {
            device_name: Some(device_name.to_string()),
            from_ms,
            to_ms,
        };

        for kind in SeriesKind::ALL {
            if erase_existing {
                self.storage.delete_heart_rate_series(kind, &query).await?;
            }

            let points: Vec<SeriesPoint> = series_of(&result, kind)
                .iter()
                .map(|p| SeriesPoint {
                    device_name: device_name.to_string(),
                    timestamp_ms: p.timestamp_ms,
                    heart_rate: p.heart_rate,
                })
                .collect();
            self.storage.save_heart_rate_series(kind, &points).await?;
        }

        info!(
            "Analysis for {} done: {} samples, {} resting heart rate points",
            device_name,
            samples.len(),
            result.rhr_24h.len()
        );
        Ok(result)
    }

    /// Pause polling on every session
    pub fn pause(&self) {
        info!("Pausing all sessions");
        for session in self.sessions.borrow().values() {
            session.pause();
        }
    }

    /// Resume polling on every session
    pub fn resume(&self) {
        info!("Resuming all sessions");
        for session in self.sessions.borrow().values() {
            session.resume();
        }
    }

    /// Release the transport and every session.
    ///
    /// Calling this more than once is a no-op.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Destroying SDK");

        if let Err(e) = self.transport.destroy().await {
            warn!("Failed to release transport: {}", e);
        }

        let sessions: Vec<Arc<DeviceSession>> = self
            .sessions
            .send_replace(HashMap::new())
            .into_values()
            .collect();
        for session in sessions {
            info!("Releasing session for device {}", session.id());
            if let Err(e) = session.destroy().await {
                warn!("Failed to release session {}: {}", session.id(), e);
            }
        }
    }
}

impl std::fmt::Debug for Sdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sdk")
            .field("sessions", &self.sessions.borrow().keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn release_session(sessions: &watch::Sender<SessionRegistry>, device_id: &str) {
    let mut removed = None;
    sessions.send_if_modified(|registry| {
        removed = registry.remove(device_id);
        removed.is_some()
    });

    let Some(session) = removed else {
        return;
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = session.destroy().await {
                    debug!("Releasing session {} failed: {}", session.id(), e);
                }
            });
        }
        // Dropping the last handle still stops the session's tasks
        Err(_) => drop(session),
    }
}

fn series_of(result: &AnalysedDataResult, kind: SeriesKind) -> &[AnalysedDataPoint] {
    match kind {
        SeriesKind::Avg1Min => &result.hr_avg_1min,
        SeriesKind::Avg2Min => &result.hr_avg_2min,
        SeriesKind::Avg5Min => &result.hr_avg_5min,
        SeriesKind::Rhr24h => &result.rhr_24h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::MS_1MIN,
        mock::{historical_packet, MockStrapConfig, MockTransport},
        storage::MemoryStorage,
        transport::StrapLink,
        types::HistoricalDataPacket,
    };
    use std::{sync::atomic::AtomicUsize, time::Duration};
    use tokio_test::{assert_err, assert_ok};

    const BASE: u64 = 28_333_340 * MS_1MIN;

    fn sample(i: u64) -> HistoricalDataPacket {
        HistoricalDataPacket {
            timestamp_ms: BASE + i * 10_000,
            heart_rate: 60 + u8::try_from(i % 20).unwrap(),
            rr: vec![],
            unknown: 0,
        }
    }

    fn setup(config: MockStrapConfig) -> (Arc<MockTransport>, Arc<MemoryStorage>, Sdk) {
        let transport = Arc::new(MockTransport::new(config).device("strap-1", "WHOOP A"));
        let storage = Arc::new(MemoryStorage::new());
        let sdk = Sdk::with_config(
            transport.clone(),
            storage.clone(),
            SessionConfig {
                polling_interval_ms: 3_600_000,
                ..SessionConfig::default()
            },
        );
        (transport, storage, sdk)
    }

    fn history(pages: u64, per_page: u64) -> MockStrapConfig {
        MockStrapConfig {
            history_pages: (0..pages)
                .map(|p| (p * per_page..(p + 1) * per_page).map(sample).collect())
                .collect(),
            ..MockStrapConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_registers_session_once() {
        let (_transport, storage, sdk) = setup(MockStrapConfig::default());

        let devices = sdk.get_devices().await.unwrap();
        assert_eq!(devices.len(), 1);

        let first = sdk.connect_to_device("strap-1", || {}).await.unwrap();
        let second = sdk.connect_to_device("strap-1", || {}).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sdk.observe_connected_devices().borrow().len(), 1);

        let known = storage.get_last_connected_device().await.unwrap().unwrap();
        assert_eq!(known.device_id, "strap-1");
        assert_eq!(known.device_name, "WHOOP A");
    }

    #[tokio::test]
    async fn test_connect_unknown_device() {
        let (_transport, _storage, sdk) = setup(MockStrapConfig::default());
        let err = sdk.connect_to_device("nope", || {}).await.unwrap_err();
        assert!(matches!(err, StrapError::DeviceNotFound));
        assert!(sdk.observe_connected_devices().borrow().is_empty());
    }

    #[tokio::test]
    async fn test_no_session_errors() {
        let (_transport, _storage, sdk) = setup(MockStrapConfig::default());

        assert!(matches!(
            sdk.send_command("ghost", Command::GetClock).await,
            Err(StrapError::NoSession(ref id)) if id == "ghost"
        ));
        assert!(matches!(
            sdk.download_historical_data("ghost", 10).await,
            Err(StrapError::NoSession(_))
        ));
        assert!(matches!(
            sdk.disconnect_from_device("ghost").await,
            Err(StrapError::NoSession(_))
        ));
        assert!(matches!(
            sdk.abort_download("ghost"),
            Err(StrapError::NoSession(_))
        ));
    }

    #[tokio::test]
    async fn test_send_command() {
        let (_transport, _storage, sdk) = setup(MockStrapConfig::default());
        sdk.connect_to_device("strap-1", || {}).await.unwrap();

        let response = sdk
            .send_command("strap-1", Command::GetClock)
            .await
            .unwrap();
        assert_eq!(response, CommandResponse::Clock(1_700_000_000));
    }

    #[tokio::test]
    async fn test_download_saves_dumps_and_sync_status() {
        let (_transport, storage, sdk) = setup(history(2, 5));
        sdk.connect_to_device("strap-1", || {}).await.unwrap();

        let dumps = sdk.download_historical_data("strap-1", 4).await.unwrap();
        let sizes: Vec<usize> = dumps.iter().map(|d| d.data_dump.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let stored = storage
            .get_historical_data_dumps(&DataQuery::device("WHOOP A"))
            .await
            .unwrap();
        assert_eq!(stored, dumps);

        let status = storage.get_sync_status("WHOOP A").await.unwrap().unwrap();
        assert_eq!(status.last_synced_ms, sample(9).timestamp_ms);
    }

    #[tokio::test]
    async fn test_download_storage_failure() {
        let (_transport, storage, sdk) = setup(history(1, 3));
        sdk.connect_to_device("strap-1", || {}).await.unwrap();
        storage.set_fail_writes(true);

        let err = sdk
            .download_historical_data("strap-1", 2)
            .await
            .unwrap_err();
        assert!(matches!(err, StrapError::Storage(_)));
    }

    #[tokio::test]
    async fn test_merged_dump_filters_range() {
        let (_transport, _storage, sdk) = setup(history(1, 12));
        sdk.connect_to_device("strap-1", || {}).await.unwrap();
        sdk.download_historical_data("strap-1", 5).await.unwrap();

        let merged = sdk
            .merged_historical_data_dump(
                "WHOOP A",
                Some(sample(3).timestamp_ms),
                Some(sample(8).timestamp_ms),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.data_dump, (3..=8).map(sample).collect::<Vec<_>>());

        assert!(sdk
            .merged_historical_data_dump("WHOOP B", None, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_analyse_device_data_persists_series() {
        let (_transport, storage, sdk) = setup(history(3, 12));
        sdk.connect_to_device("strap-1", || {}).await.unwrap();
        sdk.download_historical_data("strap-1", 100).await.unwrap();

        let stale = SeriesPoint {
            device_name: "WHOOP A".to_string(),
            timestamp_ms: BASE + 30_000,
            heart_rate: 1.0,
        };
        assert_ok!(storage.save_heart_rate_series(SeriesKind::Avg1Min, &[stale]).await);

        let result = sdk
            .analyse_device_data("WHOOP A", None, None, true)
            .await
            .unwrap();
        assert!(!result.hr_avg_1min.is_empty());

        let stored = storage
            .get_heart_rate_series(SeriesKind::Avg1Min, &DataQuery::device("WHOOP A"))
            .await
            .unwrap();
        assert_eq!(stored, result.hr_avg_1min);
        assert!(storage
            .get_heart_rate_series(SeriesKind::Rhr24h, &DataQuery::all())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_link_drop_releases_session() {
        let (transport, _storage, sdk) = setup(MockStrapConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        sdk.connect_to_device("strap-1", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        let mut registry = sdk.observe_connected_devices();
        transport.strap("strap-1").unwrap().drop_link();

        assert_ok!(
            tokio::time::timeout(Duration::from_secs(1), registry.wait_for(HashMap::is_empty))
                .await
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sdk.session("strap-1").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_from_device() {
        let (transport, _storage, sdk) = setup(MockStrapConfig::default());
        let session = sdk.connect_to_device("strap-1", || {}).await.unwrap();

        assert_ok!(sdk.disconnect_from_device("strap-1").await);
        assert!(sdk.session("strap-1").is_none());
        assert!(!session.is_connected());
        assert!(!transport.strap("strap-1").unwrap().is_connected());
        assert_err!(sdk.disconnect_from_device("strap-1").await);
    }

    #[tokio::test]
    async fn test_disconnect_interrupts_download() {
        let (transport, storage, sdk) = setup(MockStrapConfig {
            stream_history: false,
            ..MockStrapConfig::default()
        });
        sdk.connect_to_device("strap-1", || {}).await.unwrap();
        let strap = transport.strap("strap-1").unwrap();

        let (download, disconnect) = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(sdk.download_historical_data("strap-1", 10), async {
                strap.push_data_packet(&historical_packet(&sample(0)));
                tokio::time::sleep(Duration::from_millis(20)).await;
                sdk.disconnect_from_device("strap-1").await
            })
        })
        .await
        .unwrap();

        assert_ok!(disconnect);
        assert!(matches!(download, Err(StrapError::Transport(_))));
        assert!(storage
            .get_historical_data_dumps(&DataQuery::all())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume_forwarded() {
        let (_transport, _storage, sdk) = setup(MockStrapConfig::default());
        let session = sdk.connect_to_device("strap-1", || {}).await.unwrap();

        sdk.pause();
        assert!(!session.is_polling());
        sdk.resume();
        assert!(session.is_polling());
    }

    #[tokio::test]
    async fn test_destroy_releases_everything() {
        let (transport, _storage, sdk) = setup(MockStrapConfig::default());
        let session = sdk.connect_to_device("strap-1", || {}).await.unwrap();

        sdk.destroy().await;
        sdk.destroy().await;

        assert!(transport.is_destroyed());
        assert!(sdk.observe_connected_devices().borrow().is_empty());
        assert!(!session.is_connected());
    }
}
