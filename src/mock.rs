//! Scripted in-memory transport.
//!
//! [`MockTransport`] stands in for the BLE stack in tests and demos. Every
//! connected [`MockStrap`] answers the status commands with canned values,
//! serves [`MockStrapConfig::history_pages`] as a paged historical transfer,
//! and records every frame written to it.

use crate::{
    error::{Result, StrapError},
    protocol::{historical_data_payload, CommandNumber, MetadataType, Packet, PacketType},
    transport::{ByteStream, DisconnectCallback, StrapLink, Transport, TransportConnection},
    types::{DiscoveredDevice, HistoricalDataPacket},
};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::debug;

/// Canned behaviour of a mock strap
#[derive(Debug, Clone)]
pub struct MockStrapConfig {
    /// Battery level in tenths of a percent
    pub battery_raw: u16,
    /// Strap clock in unix seconds
    pub clock: u32,
    /// Charging flag in the hello report
    pub charging: bool,
    /// Wrist flag in the hello report
    pub is_worn: bool,
    /// Main MCU version words
    pub harvard: [u32; 4],
    /// Sensor MCU version words
    pub boylston: [u32; 4],
    /// Heart rate sent once real-time streaming is switched on
    pub realtime_bpm: u8,
    /// Pages served by the historical transfer
    pub history_pages: Vec<Vec<HistoricalDataPacket>>,
    /// Answer status commands
    pub responding: bool,
    /// Serve history pages when a transfer is requested
    pub stream_history: bool,
}

impl Default for MockStrapConfig {
    fn default() -> Self {
        Self {
            battery_raw: 875,
            clock: 1_700_000_000,
            charging: false,
            is_worn: true,
            harvard: [41, 16, 5, 0],
            boylston: [17, 2, 2, 0],
            realtime_bpm: 72,
            history_pages: Vec::new(),
            responding: true,
            stream_history: true,
        }
    }
}

/// In-memory [`Transport`]
#[derive(Default)]
pub struct MockTransport {
    config: MockStrapConfig,
    devices: Mutex<Vec<DiscoveredDevice>>,
    straps: Mutex<HashMap<String, Arc<MockStrap>>>,
    destroyed: AtomicBool,
}

impl MockTransport {
    /// Transport whose straps all behave per `config`
    #[must_use]
    pub fn new(config: MockStrapConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Transport with one default strap
    #[must_use]
    pub fn with_device(id: &str, name: &str) -> Self {
        Self::new(MockStrapConfig::default()).device(id, name)
    }

    /// Add a discoverable strap
    #[must_use]
    pub fn device(self, id: &str, name: &str) -> Self {
        lock(&self.devices).push(DiscoveredDevice {
            id: id.to_string(),
            name: name.to_string(),
        });
        self
    }

    /// The strap behind the most recent connection to `id`
    #[must_use]
    pub fn strap(&self, id: &str) -> Option<Arc<MockStrap>> {
        lock(&self.straps).get(id).cloned()
    }

    /// Whether [`Transport::destroy`] was called
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_devices(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok(lock(&self.devices).clone())
    }

    async fn connect_to_device(
        &self,
        id: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<TransportConnection> {
        let device = lock(&self.devices)
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(StrapError::DeviceNotFound)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let strap = Arc::new(MockStrap {
            config: self.config.clone(),
            connected: AtomicBool::new(true),
            responding: AtomicBool::new(self.config.responding),
            next_page: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            command_tx,
            event_tx,
            data_tx,
            on_disconnect: Mutex::new(Some(on_disconnect)),
        });
        lock(&self.straps).insert(device.id.clone(), strap.clone());
        debug!("Mock strap {} connected", device.id);

        Ok(TransportConnection {
            id: device.id,
            name: device.name,
            link: strap,
            command_stream: receiver_stream(command_rx),
            event_stream: receiver_stream(event_rx),
            data_stream: receiver_stream(data_rx),
        })
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One connected mock strap
pub struct MockStrap {
    config: MockStrapConfig,
    connected: AtomicBool,
    responding: AtomicBool,
    next_page: AtomicUsize,
    written: Mutex<Vec<Packet>>,
    command_tx: mpsc::UnboundedSender<Result<Bytes>>,
    event_tx: mpsc::UnboundedSender<Result<Bytes>>,
    data_tx: mpsc::UnboundedSender<Result<Bytes>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl MockStrap {
    /// Every packet written so far
    #[must_use]
    pub fn written(&self) -> Vec<Packet> {
        lock(&self.written).clone()
    }

    /// Command numbers written so far
    #[must_use]
    pub fn written_commands(&self) -> Vec<u8> {
        lock(&self.written).iter().map(|p| p.cmd).collect()
    }

    /// Stop or restart automatic answers
    pub fn set_responding(&self, responding: bool) {
        self.responding.store(responding, Ordering::SeqCst);
    }

    /// Deliver a raw frame on the command-in channel
    pub fn push_command_frame(&self, frame: Bytes) {
        let _ = self.command_tx.send(Ok(frame));
    }

    /// Deliver a packet on the event-in channel
    pub fn push_event_packet(&self, packet: &Packet) {
        emit(&self.event_tx, packet);
    }

    /// Deliver a packet on the data-in channel
    pub fn push_data_packet(&self, packet: &Packet) {
        emit(&self.data_tx, packet);
    }

    /// Deliver a transport error on the data-in channel
    pub fn fail_data_stream(&self, reason: &str) {
        let _ = self
            .data_tx
            .send(Err(StrapError::Transport(reason.to_string())));
    }

    /// Simulate the radio link dropping
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let callback = lock(&self.on_disconnect).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn respond(&self, request: &Packet) {
        let responding = self.responding.load(Ordering::SeqCst);
        match request.command_number() {
            Some(CommandNumber::GetBatteryLevel) if responding => {
                let mut payload = vec![0u8; 2];
                payload.extend_from_slice(&self.config.battery_raw.to_le_bytes());
                self.answer(request.cmd, payload);
            }
            Some(CommandNumber::GetClock) if responding => {
                let mut payload = vec![0u8; 2];
                payload.extend_from_slice(&self.config.clock.to_le_bytes());
                self.answer(request.cmd, payload);
            }
            Some(CommandNumber::GetHelloHarvard) if responding => {
                let mut payload = vec![0u8; 120];
                payload[7] = u8::from(self.config.charging);
                payload[116] = u8::from(self.config.is_worn);
                self.answer(request.cmd, payload);
            }
            Some(CommandNumber::ReportVersionInfo) if responding => {
                let mut payload = vec![0u8; 3];
                for word in self.config.harvard.iter().chain(&self.config.boylston) {
                    payload.extend_from_slice(&word.to_le_bytes());
                }
                payload.resize(3 + 16 * 4, 0);
                self.answer(request.cmd, payload);
            }
            Some(CommandNumber::ToggleRealtimeHr)
                if responding && request.payload.first() == Some(&1) =>
            {
                let mut payload = vec![0u8; 8];
                payload[5] = self.config.realtime_bpm;
                emit(
                    &self.data_tx,
                    &Packet::new(PacketType::RealtimeData, 0, 0, payload),
                );
            }
            Some(CommandNumber::SendHistoricalData) if self.serves_history() => {
                self.next_page.store(0, Ordering::SeqCst);
                self.serve_page(0);
            }
            Some(CommandNumber::HistoricalDataResult) if self.serves_history() => {
                let page = self.next_page.fetch_add(1, Ordering::SeqCst) + 1;
                self.serve_page(page);
            }
            _ => {}
        }
    }

    fn serves_history(&self) -> bool {
        self.config.stream_history && self.responding.load(Ordering::SeqCst)
    }

    fn answer(&self, cmd: u8, payload: Vec<u8>) {
        emit(
            &self.command_tx,
            &Packet::new(PacketType::CommandResponse, 0, cmd, payload),
        );
    }

    fn serve_page(&self, index: usize) {
        let Some(page) = self.config.history_pages.get(index) else {
            emit(&self.data_tx, &metadata_packet(MetadataType::HistoryComplete, 0));
            return;
        };

        for sample in page {
            emit(&self.data_tx, &historical_packet(sample));
        }
        let trim = u32::try_from(index + 1).unwrap_or(u32::MAX);
        emit(&self.data_tx, &metadata_packet(MetadataType::HistoryEnd, trim));
    }
}

#[async_trait]
impl StrapLink for MockStrap {
    async fn write(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(StrapError::NotConnected);
        }
        let packet = Packet::from_bytes(&data)?;
        lock(&self.written).push(packet.clone());
        self.respond(&packet);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.drop_link();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Metadata packet carrying `trim` at the offset the session reads it from
#[must_use]
pub fn metadata_packet(metadata: MetadataType, trim: u32) -> Packet {
    let mut payload = BytesMut::with_capacity(14);
    payload.put_bytes(0, 10);
    payload.put_u32_le(trim);
    Packet::new(PacketType::Metadata, 0, metadata as u8, payload.freeze())
}

/// Historical data packet for `sample`
#[must_use]
pub fn historical_packet(sample: &HistoricalDataPacket) -> Packet {
    Packet::new(PacketType::HistoricalData, 0, 0, historical_data_payload(sample))
}

fn emit(channel: &mpsc::UnboundedSender<Result<Bytes>>, packet: &Packet) {
    if let Ok(frame) = packet.framed() {
        let _ = channel.send(Ok(frame));
    }
}

fn receiver_stream(rx: mpsc::UnboundedReceiver<Result<Bytes>>) -> ByteStream {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::Command, protocol::parse_historical_data_packet};

    async fn next_packet(stream: &mut ByteStream) -> Packet {
        let frame = stream.next().await.unwrap().unwrap();
        Packet::from_bytes(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let transport = MockTransport::with_device("a", "WHOOP A");
        let err = transport
            .connect_to_device("b", Box::new(|| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, StrapError::DeviceNotFound));
    }

    #[tokio::test]
    async fn test_answers_battery_request() {
        let transport = MockTransport::with_device("a", "WHOOP A");
        let mut connection = transport
            .connect_to_device("a", Box::new(|| {}))
            .await
            .unwrap();

        let request = Command::GetBatteryLevel.make_packet();
        connection
            .link
            .write(request.framed().unwrap())
            .await
            .unwrap();

        let response = next_packet(&mut connection.command_stream).await;
        assert_eq!(response.cmd, CommandNumber::GetBatteryLevel as u8);
        assert_eq!(
            Command::GetBatteryLevel.parse_response(&response).unwrap(),
            crate::command::CommandResponse::BatteryLevel(87.5)
        );
        assert_eq!(
            transport.strap("a").unwrap().written_commands(),
            vec![CommandNumber::GetBatteryLevel as u8]
        );
    }

    #[tokio::test]
    async fn test_serves_pages_then_complete() {
        let sample = HistoricalDataPacket {
            timestamp_ms: 1_700_000_000_000,
            heart_rate: 61,
            rr: vec![],
            unknown: 0,
        };
        let transport = MockTransport::new(MockStrapConfig {
            history_pages: vec![vec![sample.clone()]],
            ..MockStrapConfig::default()
        })
        .device("a", "WHOOP A");
        let mut connection = transport
            .connect_to_device("a", Box::new(|| {}))
            .await
            .unwrap();

        let start = Command::SendHistoricalData.make_packet().framed().unwrap();
        connection.link.write(start).await.unwrap();

        let data = next_packet(&mut connection.data_stream).await;
        assert_eq!(parse_historical_data_packet(&data).unwrap(), sample);
        let end = next_packet(&mut connection.data_stream).await;
        assert_eq!(end.metadata_type(), Some(MetadataType::HistoryEnd));
        assert_eq!(end.payload_u32_le(10).unwrap(), 1);

        let next = Command::SendHistoricalDataNextBatch { trim: 1 }
            .make_packet()
            .framed()
            .unwrap();
        connection.link.write(next).await.unwrap();
        let complete = next_packet(&mut connection.data_stream).await;
        assert_eq!(complete.metadata_type(), Some(MetadataType::HistoryComplete));
    }

    #[tokio::test]
    async fn test_disconnect_fires_callback_once() {
        let transport = MockTransport::with_device("a", "WHOOP A");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let connection = transport
            .connect_to_device(
                "a",
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        connection.link.disconnect().await.unwrap();
        connection.link.disconnect().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!connection.link.is_connected());

        let write = connection.link.write(Bytes::from_static(&[0xAA])).await;
        assert!(matches!(write, Err(StrapError::NotConnected)));
    }
}
