use crate::{
    command::{Command, CommandResponse},
    error::{Result, StrapError, StreamFault},
    protocol::{
        is_console_logs, parse_historical_data_packet, parse_log_data, MetadataType, Packet,
        PacketType, METADATA_TRIM_OFFSET, REALTIME_BPM_OFFSET,
    },
    queue::TaskQueue,
    transport::{ByteStream, StrapLink, TransportConnection},
    types::{
        DeviceSessionState, DeviceState, HeartRateEvent, HelloHarvard, HistoricalDataPacket,
        LogEvent, SessionConfig, VersionInfo,
    },
};
use futures::stream::{BoxStream, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

/// Item carried on the decoded packet broadcast channels
pub type PacketResult = std::result::Result<Packet, StreamFault>;

/// Stream of decoded historical samples produced by a download run
pub type HistoricalDataStream = BoxStream<'static, Result<HistoricalDataPacket>>;

/// Lossless feed of history and metadata packets into the running download
type DownloadTap = Arc<Mutex<Option<mpsc::UnboundedSender<PacketResult>>>>;

/// Live session with one connected strap.
///
/// `DeviceSession` owns the decoded packet streams of a strap, the task queue
/// that keeps command/response cycles strictly one at a time, the polling
/// loop that keeps [`DeviceState`] fresh, and the historical download
/// pipeline.
///
/// # Packet flow
///
/// One reader task per transport channel decodes raw frames and fans the
/// packets out over a broadcast channel. Console log frames on the data
/// channel are dropped before decoding unless log capture is enabled.
/// While a download runs, the data reader also hands every historical and
/// metadata packet straight to it over an unbounded channel, so a slow
/// consumer never loses samples the way a lagging broadcast receiver would.
///
/// # Ordering
///
/// Every command sent through [`DeviceSession::send_command`] runs on the
/// session's [`TaskQueue`]. Responses are matched on command number only,
/// so the queue is what keeps two requests for the same number from being
/// in flight together. [`DeviceSession::reboot_strap`] deliberately skips
/// the queue so a reboot can go out while the queue is stuck.
///
/// # Examples
///
/// ```no_run
/// use strapkit::{mock::MockTransport, transport::Transport, DeviceSession, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = MockTransport::with_device("strap-1", "WHOOP 4A0000000");
///     let connection = transport
///         .connect_to_device("strap-1", Box::new(|| {}))
///         .await?;
///     let session = DeviceSession::new(connection, SessionConfig::default());
///
///     println!("Battery: {:.1}%", session.battery_level().await?);
///     session.destroy().await?;
///     Ok(())
/// }
/// ```
pub struct DeviceSession {
    id: String,
    name: String,
    link: Arc<dyn StrapLink>,
    config: SessionConfig,
    queue: TaskQueue,
    command_packets: broadcast::Sender<PacketResult>,
    event_packets: broadcast::Sender<PacketResult>,
    data_packets: broadcast::Sender<PacketResult>,
    device_state: watch::Sender<DeviceState>,
    session_state: watch::Sender<DeviceSessionState>,
    heart_rate: watch::Sender<Vec<HeartRateEvent>>,
    logs: watch::Sender<Vec<LogEvent>>,
    most_recent_historical: watch::Sender<Option<HistoricalDataPacket>>,
    download_tap: DownloadTap,
    realtime_hr_enabled: AtomicBool,
    abort_requested: AtomicBool,
    destroyed: AtomicBool,
    stream_tasks: Mutex<Vec<JoinHandle<()>>>,
    polling_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceSession {
    /// Wrap a transport connection in a session and start polling.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(connection: TransportConnection, config: SessionConfig) -> Arc<Self> {
        let TransportConnection {
            id,
            name,
            link,
            command_stream,
            event_stream,
            data_stream,
        } = connection;

        info!("Creating session for device {} ({})", id, name);

        let capacity = config.broadcast_capacity.max(1);
        let (command_packets, _) = broadcast::channel(capacity);
        let (event_packets, _) = broadcast::channel(capacity);
        let (data_packets, _) = broadcast::channel(capacity);

        let session = Arc::new(Self {
            id,
            name,
            link,
            config,
            queue: TaskQueue::new(),
            command_packets,
            event_packets,
            data_packets,
            device_state: watch::Sender::new(DeviceState::default()),
            session_state: watch::Sender::new(DeviceSessionState::default()),
            heart_rate: watch::Sender::new(Vec::new()),
            logs: watch::Sender::new(Vec::new()),
            most_recent_historical: watch::Sender::new(None),
            download_tap: Arc::new(Mutex::new(None)),
            realtime_hr_enabled: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            stream_tasks: Mutex::new(Vec::new()),
            polling_task: Mutex::new(None),
        });

        // Subscribe before the readers start so no early packet is missed
        let data_rx = session.data_packets.subscribe();
        let tasks = vec![
            tokio::spawn(pump_channel(
                "command",
                command_stream,
                session.command_packets.clone(),
                None,
                None,
            )),
            tokio::spawn(pump_channel(
                "event",
                event_stream,
                session.event_packets.clone(),
                None,
                None,
            )),
            tokio::spawn(pump_channel(
                "data",
                data_stream,
                session.data_packets.clone(),
                Some(session.session_state.subscribe()),
                Some(session.download_tap.clone()),
            )),
            tokio::spawn(dispatch_realtime_data(
                data_rx,
                session.heart_rate.clone(),
                session.logs.clone(),
                session.session_state.subscribe(),
            )),
        ];
        lock(&session.stream_tasks).extend(tasks);

        session.start_polling();
        session
    }

    /// Transport specific device id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Advertised device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the transport still reports the strap as connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Observe the polled device state; the current value is replayed
    #[must_use]
    pub fn device_state(&self) -> watch::Receiver<DeviceState> {
        self.device_state.subscribe()
    }

    /// Observe session flags
    #[must_use]
    pub fn session_state(&self) -> watch::Receiver<DeviceSessionState> {
        self.session_state.subscribe()
    }

    /// Observe received real-time heart rate events
    #[must_use]
    pub fn heart_rate_events(&self) -> watch::Receiver<Vec<HeartRateEvent>> {
        self.heart_rate.subscribe()
    }

    /// Observe captured console logs
    #[must_use]
    pub fn log_events(&self) -> watch::Receiver<Vec<LogEvent>> {
        self.logs.subscribe()
    }

    /// Observe the latest sample of the running download
    #[must_use]
    pub fn most_recent_historical_data_packet(
        &self,
    ) -> watch::Receiver<Option<HistoricalDataPacket>> {
        self.most_recent_historical.subscribe()
    }

    /// Subscribe to decoded packets from the event channel
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<PacketResult> {
        self.event_packets.subscribe()
    }

    /// Whether console log packets are being decoded
    #[must_use]
    pub fn is_logs_from_strap_enabled(&self) -> bool {
        self.session_state.borrow().logs_from_strap_enabled
    }

    /// Turn console log capture on or off
    pub fn set_logs_from_strap_enabled(&self, enabled: bool) {
        info!("Console log capture for {}: {}", self.id, enabled);
        self.session_state
            .send_modify(|state| state.logs_from_strap_enabled = enabled);
    }

    /// Send a command and wait for its parsed response.
    ///
    /// The command is queued behind every previously submitted one.
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::NotConnected`] if the strap is disconnected,
    /// [`StrapError::Timeout`] if a response timeout is configured and
    /// exceeded, or any transport and parse error.
    pub async fn send_command(&self, command: Command) -> Result<CommandResponse> {
        debug!("Queueing {:?} for device {}", command, self.id);
        self.queue
            .add_task(self.send_command_internal(&command))
            .await
    }

    /// Write a command and correlate its response, bypassing the queue
    async fn send_command_internal(&self, command: &Command) -> Result<CommandResponse> {
        if !self.link.is_connected() {
            return Err(StrapError::NotConnected);
        }

        let packet = command.make_packet();
        let frame = packet.framed()?;

        // Subscribe before writing so a fast response cannot slip past
        let mut responses = self.command_packets.subscribe();

        debug!("Sending {:?} to {}: {}", command, self.id, packet);
        self.link.write(frame).await?;

        if !command.with_response() {
            return command.parse_response(&packet);
        }

        let cmd = packet.cmd;
        let wait = next_matching(&mut responses, |p| p.cmd == cmd);
        let response = match self.config.response_timeout_ms {
            Some(timeout_ms) => timeout(Duration::from_millis(timeout_ms), wait)
                .await
                .map_err(|_| StrapError::Timeout { timeout_ms })??,
            None => wait.await?,
        };

        let result = command.parse_response(&response)?;
        debug!("Parsed response for {:?}: {:?}", command, result);
        Ok(result)
    }

    /// Battery level in percent
    ///
    /// # Errors
    ///
    /// See [`DeviceSession::send_command`].
    pub async fn battery_level(&self) -> Result<f64> {
        self.send_command(Command::GetBatteryLevel)
            .await?
            .into_battery_level()
    }

    /// Strap clock in unix seconds
    ///
    /// # Errors
    ///
    /// See [`DeviceSession::send_command`].
    pub async fn clock(&self) -> Result<u32> {
        self.send_command(Command::GetClock).await?.into_clock()
    }

    /// Charging and wrist flags
    ///
    /// # Errors
    ///
    /// See [`DeviceSession::send_command`].
    pub async fn hello_harvard(&self) -> Result<HelloHarvard> {
        self.send_command(Command::GetHelloHarvard)
            .await?
            .into_hello_harvard()
    }

    /// Firmware versions
    ///
    /// # Errors
    ///
    /// See [`DeviceSession::send_command`].
    pub async fn version_info(&self) -> Result<VersionInfo> {
        self.send_command(Command::ReportVersionInfo)
            .await?
            .into_version_info()
    }

    /// Flip real-time heart rate streaming and return the new setting.
    ///
    /// The toggle expects no response and skips the task queue, so it takes
    /// effect even while a download or an unanswered command holds the
    /// queue. Switching off appends a `None` bpm event marking where the
    /// stream stopped.
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::NotConnected`] or any transport error.
    pub async fn toggle_realtime_hr(&self) -> Result<bool> {
        let enabled = !self.realtime_hr_enabled.load(Ordering::SeqCst);
        self.send_command_internal(&Command::ToggleRealtimeHr(enabled))
            .await?;

        self.realtime_hr_enabled.store(enabled, Ordering::SeqCst);
        self.device_state
            .send_modify(|state| state.realtime_heart_rate_enabled = enabled);

        if !enabled {
            self.heart_rate.send_modify(|events| {
                events.push(HeartRateEvent {
                    date: SystemTime::now(),
                    bpm: None,
                });
            });
        }

        info!("Real-time heart rate for {}: {}", self.id, enabled);
        Ok(enabled)
    }

    /// Reboot the strap, skipping the task queue
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::NotConnected`] or any transport error.
    pub async fn reboot_strap(&self) -> Result<()> {
        info!("Rebooting strap {}", self.id);
        self.send_command_internal(&Command::RebootStrap).await?;
        Ok(())
    }

    /// Start the historical download pipeline.
    ///
    /// The returned stream yields every sample as it arrives, ends when the
    /// strap reports the transfer complete or an abort is honoured, and ends
    /// with an `Err` item if the transfer fails.
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::DownloadInProgress`] if a download is already
    /// running on this session.
    pub fn historical_data_stream(self: &Arc<Self>) -> Result<HistoricalDataStream> {
        let guard = DownloadGuard::acquire(self.clone())?;

        // An abort requested from here on applies to this run, even while it
        // still waits behind other queued work
        self.abort_requested.store(false, Ordering::SeqCst);

        // Tap the data reader now so samples sent right after the start
        // command are kept
        let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
        *lock(&self.download_tap) = Some(tap_tx);

        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.clone();

        tokio::spawn(async move {
            let outcome = session
                .queue
                .add_task(session.run_download(&mut tap_rx, &tx))
                .await;

            match outcome {
                Ok(()) => info!("Historical download for {} finished", session.id),
                Err(e) => {
                    error!("Historical download for {} failed: {}", session.id, e);
                    let _ = tx.send(Err(e));
                }
            }

            // Clear the flag before the consumer sees the stream end
            drop(guard);
            drop(tx);
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    /// Download every historical sample into memory
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::DownloadInProgress`] or the first error the
    /// transfer hits.
    pub async fn historical_data_packets(self: &Arc<Self>) -> Result<Vec<HistoricalDataPacket>> {
        let mut stream = self.historical_data_stream()?;
        let mut packets = Vec::new();
        while let Some(item) = stream.next().await {
            packets.push(item?);
        }
        Ok(packets)
    }

    /// Ask the running download to stop at the next page boundary
    pub fn abort_download(&self) {
        info!("Abort requested for historical download on {}", self.id);
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    async fn run_download(
        &self,
        data_rx: &mut mpsc::UnboundedReceiver<PacketResult>,
        tx: &mpsc::UnboundedSender<Result<HistoricalDataPacket>>,
    ) -> Result<()> {
        self.most_recent_historical.send_replace(None);

        info!("Starting historical download for {}", self.id);
        self.send_command_internal(&Command::SendHistoricalData)
            .await?;

        let mut pages = 0usize;
        loop {
            let packet = next_data_packet(data_rx).await?;

            match packet.kind() {
                Some(PacketType::HistoricalData) => match parse_historical_data_packet(&packet) {
                    Ok(sample) => {
                        self.most_recent_historical.send_replace(Some(sample.clone()));
                        if tx.send(Ok(sample)).is_err() {
                            debug!("Download consumer for {} went away", self.id);
                            self.abort_requested.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => warn!("Skipping historical packet {}: {}", packet, e),
                },
                Some(PacketType::Metadata) => {
                    let metadata = packet.metadata_type();
                    if !matches!(
                        metadata,
                        Some(MetadataType::HistoryEnd | MetadataType::HistoryComplete)
                    ) {
                        continue;
                    }

                    if self.abort_requested.load(Ordering::SeqCst) {
                        info!("Historical download for {} aborted after {} pages", self.id, pages);
                        break;
                    }

                    if metadata == Some(MetadataType::HistoryComplete) {
                        info!("History complete for {} after {} pages", self.id, pages);
                        break;
                    }

                    let trim = packet.payload_u32_le(METADATA_TRIM_OFFSET)?;
                    pages += 1;
                    debug!("History page {} ended for {}, trim {}", pages, self.id, trim);
                    self.send_command_internal(&Command::SendHistoricalDataNextBatch { trim })
                        .await?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn start_polling(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.polling_interval_ms);
        let handle = tokio::spawn(poll_device_state(weak, interval));

        if let Some(previous) = lock(&self.polling_task).replace(handle) {
            previous.abort();
        }
    }

    async fn refresh_version_info(&self) -> Result<()> {
        let version_info = self.version_info().await?;
        info!("Device {} firmware: {}", self.id, version_info);
        self.device_state
            .send_modify(|state| state.version_info = Some(version_info));
        Ok(())
    }

    async fn refresh_device_state(&self) -> Result<()> {
        // Line up behind whatever is already queued
        self.queue.barrier().await;
        debug!("Polling device state for {}", self.id);

        let battery_level = self.battery_level().await?;
        let hello = self.hello_harvard().await?;
        let clock = self.clock().await?;

        self.device_state.send_modify(|state| {
            state.battery_level = Some(battery_level);
            state.is_worn = hello.is_worn;
            state.charging = hello.charging;
            state.clock = Some(clock);
        });
        Ok(())
    }

    /// Stop polling without tearing the session down
    pub fn pause(&self) {
        if let Some(handle) = lock(&self.polling_task).take() {
            info!("Pausing device state polling for {}", self.id);
            handle.abort();
        }
    }

    /// Restart polling, beginning with a fresh version report
    pub fn resume(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if lock(&self.polling_task).is_none() {
            info!("Resuming device state polling for {}", self.id);
            self.start_polling();
        }
    }

    /// Whether the polling loop is running
    #[must_use]
    pub fn is_polling(&self) -> bool {
        lock(&self.polling_task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Disconnect the strap and stop every background task.
    ///
    /// Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error if disconnecting fails.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Destroying session for device {}", self.id);

        self.stop_tasks();
        self.fail_pending_waits();
        self.link.disconnect().await
    }

    /// End every command wait and the running download with a fault
    fn fail_pending_waits(&self) {
        let fault = StreamFault::Transport("session destroyed".to_string());
        for packets in [&self.command_packets, &self.event_packets, &self.data_packets] {
            let _ = packets.send(Err(fault.clone()));
        }
        if let Some(tap) = lock(&self.download_tap).as_ref() {
            let _ = tap.send(Err(fault));
        }
    }

    fn stop_tasks(&self) {
        if let Some(handle) = lock(&self.polling_task).take() {
            handle.abort();
        }
        for handle in lock(&self.stream_tasks).drain(..) {
            handle.abort();
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("session_state", &*self.session_state.borrow())
            .finish_non_exhaustive()
    }
}

/// Resets `downloading_historical_data` however the pipeline exits
struct DownloadGuard(Arc<DeviceSession>);

impl DownloadGuard {
    fn acquire(session: Arc<DeviceSession>) -> Result<Self> {
        let acquired = session.session_state.send_if_modified(|state| {
            if state.downloading_historical_data {
                false
            } else {
                state.downloading_historical_data = true;
                true
            }
        });

        if acquired {
            Ok(Self(session))
        } else {
            Err(StrapError::DownloadInProgress)
        }
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        lock(&self.0.download_tap).take();
        self.0
            .session_state
            .send_modify(|state| state.downloading_historical_data = false);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Decode one transport channel onto its broadcast channel
async fn pump_channel(
    channel: &'static str,
    mut stream: ByteStream,
    packets: broadcast::Sender<PacketResult>,
    log_filter: Option<watch::Receiver<DeviceSessionState>>,
    download_tap: Option<DownloadTap>,
) {
    while let Some(item) = stream.next().await {
        let decoded = match item {
            Ok(raw) => {
                if let Some(state) = &log_filter {
                    if !state.borrow().logs_from_strap_enabled && is_console_logs(&raw) {
                        continue;
                    }
                }
                Packet::from_bytes(&raw).map_err(|e| StreamFault::Malformed(fault_reason(e)))
            }
            Err(e) => Err(StreamFault::Transport(e.to_string())),
        };

        if let Err(fault) = &decoded {
            warn!("Fault on {} channel: {:?}", channel, fault);
        }

        if let Some(tap) = &download_tap {
            forward_to_download(tap, &decoded);
        }
        // No receivers is fine
        let _ = packets.send(decoded);
    }

    debug!("{} channel closed", channel);
    let closed = Err(StreamFault::Transport(format!("{channel} stream closed")));
    if let Some(tap) = &download_tap {
        forward_to_download(tap, &closed);
    }
    let _ = packets.send(closed);
}

fn forward_to_download(tap: &DownloadTap, item: &PacketResult) {
    let wanted = match item {
        Ok(packet) => matches!(
            packet.kind(),
            Some(PacketType::HistoricalData | PacketType::Metadata)
        ),
        Err(_) => true,
    };
    if !wanted {
        return;
    }
    if let Some(sender) = lock(tap).as_ref() {
        let _ = sender.send(item.clone());
    }
}

fn fault_reason(error: StrapError) -> String {
    match error {
        StrapError::MalformedPacket(reason) => reason,
        other => other.to_string(),
    }
}

/// Turn real-time data and console logs into observable events
async fn dispatch_realtime_data(
    mut data_rx: broadcast::Receiver<PacketResult>,
    heart_rate: watch::Sender<Vec<HeartRateEvent>>,
    logs: watch::Sender<Vec<LogEvent>>,
    session_state: watch::Receiver<DeviceSessionState>,
) {
    loop {
        let packet = match data_rx.recv().await {
            Ok(Ok(packet)) => packet,
            Ok(Err(_)) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Real-time dispatcher lagged, skipped {} packets", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match packet.kind() {
            Some(PacketType::RealtimeData) => match packet.payload_u8(REALTIME_BPM_OFFSET) {
                Ok(bpm) => {
                    debug!("Heart rate event received from strap: {} bpm", bpm);
                    heart_rate.send_modify(|events| {
                        events.push(HeartRateEvent {
                            date: SystemTime::now(),
                            bpm: Some(bpm),
                        });
                    });
                }
                Err(e) => warn!("Bad real-time packet: {}", e),
            },
            Some(PacketType::ConsoleLogs) if session_state.borrow().logs_from_strap_enabled => {
                let message = parse_log_data(&packet.payload);
                debug!("Log event received from strap: {}", message);
                logs.send_modify(|events| {
                    events.push(LogEvent {
                        date: SystemTime::now(),
                        message,
                    });
                });
            }
            _ => {}
        }
    }
}

async fn poll_device_state(session: Weak<DeviceSession>, interval: Duration) {
    {
        let Some(session) = session.upgrade() else {
            return;
        };
        if let Err(e) = session.refresh_version_info().await {
            warn!("Failed to read version info for {}: {}", session.id, e);
        }
    }

    loop {
        {
            let Some(session) = session.upgrade() else {
                return;
            };
            if let Err(e) = session.refresh_device_state().await {
                warn!("Error monitoring device state for {}: {}", session.id, e);
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// First decoded packet satisfying `predicate`
async fn next_matching(
    rx: &mut broadcast::Receiver<PacketResult>,
    predicate: impl Fn(&Packet) -> bool,
) -> Result<Packet> {
    loop {
        match rx.recv().await {
            Ok(Ok(packet)) if predicate(&packet) => return Ok(packet),
            Ok(Ok(_)) => {}
            Ok(Err(fault)) => return Err(fault.into()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Response listener lagged, skipped {} packets", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return Err(StrapError::NotConnected),
        }
    }
}

/// Next history or metadata packet handed to the download
async fn next_data_packet(rx: &mut mpsc::UnboundedReceiver<PacketResult>) -> Result<Packet> {
    match rx.recv().await {
        Some(Ok(packet)) => Ok(packet),
        Some(Err(fault)) => Err(fault.into()),
        None => Err(StrapError::NotConnected),
    }
}
