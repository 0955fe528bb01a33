use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        ValueNotification, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, StrapError},
    transport::{ByteStream, DisconnectCallback, StrapLink, Transport, TransportConnection},
    types::{ConnectionParams, DiscoveredDevice},
    CMD_FROM_STRAP_UUID, CMD_TO_STRAP_UUID, DATA_FROM_STRAP_UUID, EVENTS_FROM_STRAP_UUID,
    STRAP_SERVICE_UUID,
};

/// Name prefix straps advertise with
const STRAP_NAME_PREFIX: &str = "whoop";

/// Characteristic UUIDs of the strap service
#[derive(Debug, Clone, Copy)]
struct StrapUuids {
    service: Uuid,
    cmd_to_strap: Uuid,
    cmd_from_strap: Uuid,
    events_from_strap: Uuid,
    data_from_strap: Uuid,
}

impl StrapUuids {
    fn parse() -> Result<Self> {
        Ok(Self {
            service: parse_uuid(STRAP_SERVICE_UUID, "service")?,
            cmd_to_strap: parse_uuid(CMD_TO_STRAP_UUID, "command-out characteristic")?,
            cmd_from_strap: parse_uuid(CMD_FROM_STRAP_UUID, "command-in characteristic")?,
            events_from_strap: parse_uuid(EVENTS_FROM_STRAP_UUID, "event characteristic")?,
            data_from_strap: parse_uuid(DATA_FROM_STRAP_UUID, "data characteristic")?,
        })
    }
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| StrapError::Protocol(format!("Invalid {what} UUID: {e}")))
}

/// [`Transport`] backed by the host's Bluetooth Low Energy adapter
pub struct BleTransport {
    manager: Manager,
    params: ConnectionParams,
    uuids: StrapUuids,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BleTransport {
    /// Create a transport with default connection parameters
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        Self::with_params(ConnectionParams::default()).await
    }

    /// Create a transport with custom connection parameters
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn with_params(params: ConnectionParams) -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            params,
            uuids: StrapUuids::parse()?,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        })
    }

    async fn central(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(StrapError::DeviceNotFound)
    }

    /// Check if the advertisement looks like a strap
    async fn is_strap(&self, peripheral: &Peripheral) -> bool {
        let Ok(Some(properties)) = peripheral.properties().await else {
            return false;
        };

        properties.services.contains(&self.uuids.service)
            || properties
                .local_name
                .is_some_and(|name| name.to_lowercase().starts_with(STRAP_NAME_PREFIX))
    }

    /// Discover the strap service, subscribe to its notify characteristics
    /// and open the notification and adapter event streams
    async fn prepare_link(&self, peripheral: &Peripheral) -> Result<LinkSetup> {
        peripheral.discover_services().await?;

        let cmd_to_strap =
            self.find_characteristic(peripheral, self.uuids.cmd_to_strap, "Command-out")?;
        for (uuid, what) in [
            (self.uuids.cmd_from_strap, "Command-in"),
            (self.uuids.events_from_strap, "Event"),
            (self.uuids.data_from_strap, "Data"),
        ] {
            let characteristic = self.find_characteristic(peripheral, uuid, what)?;
            peripheral.subscribe(&characteristic).await?;
        }

        Ok(LinkSetup {
            cmd_to_strap,
            notifications: peripheral.notifications().await?,
            events: self.central().await?.events().await?,
        })
    }

    fn find_characteristic(
        &self,
        peripheral: &Peripheral,
        uuid: Uuid,
        what: &str,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == self.uuids.service && c.uuid == uuid)
            .ok_or_else(|| StrapError::Protocol(format!("{what} characteristic not found")))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn get_devices(&self) -> Result<Vec<DiscoveredDevice>> {
        info!("Starting scan for straps...");

        let central = self.central().await?;
        let scan_filter = ScanFilter {
            services: vec![self.uuids.service],
        };

        central.start_scan(scan_filter).await?;
        tokio::time::sleep(Duration::from_millis(self.params.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            if !self.is_strap(&peripheral).await {
                continue;
            }

            let id = peripheral.address().to_string();
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name)
                .unwrap_or_else(|| "Unknown strap".to_string());

            info!("Found strap: {} ({})", name, id);
            self.peripherals.lock().await.insert(id.clone(), peripheral);
            devices.push(DiscoveredDevice { id, name });
        }

        info!("Scan completed. Found {} strap(s)", devices.len());
        Ok(devices)
    }

    async fn connect_to_device(
        &self,
        id: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<TransportConnection> {
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or(StrapError::DeviceNotFound)?;
        let name = peripheral
            .properties()
            .await?
            .and_then(|p| p.local_name)
            .unwrap_or_else(|| id.to_string());

        info!("Connecting to strap: {}", name);

        let timeout_ms = self.params.connect_timeout_ms;
        timeout(Duration::from_millis(timeout_ms), peripheral.connect())
            .await
            .map_err(|_| StrapError::Timeout { timeout_ms })?
            .map_err(|e| StrapError::Transport(format!("Connection failed: {e}")))?;

        let setup = self.prepare_link(&peripheral).await;
        let LinkSetup {
            cmd_to_strap,
            notifications,
            events,
        } = disconnect_on_error(setup, async {
            warn!("Setting up {} failed, disconnecting", name);
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect after failed setup: {}", e);
            }
        })
        .await?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let routes = NotificationRoutes {
            command: (self.uuids.cmd_from_strap, command_tx),
            event: (self.uuids.events_from_strap, event_tx),
            data: (self.uuids.data_from_strap, data_tx),
        };

        let connected = Arc::new(AtomicBool::new(true));

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(route_notifications(notifications, routes)));
        tasks.push(tokio::spawn(watch_disconnect(
            events,
            peripheral.clone(),
            connected.clone(),
            on_disconnect,
        )));

        info!("Successfully connected to {}", name);

        Ok(TransportConnection {
            id: id.to_string(),
            name,
            link: Arc::new(BleLink {
                peripheral,
                cmd_to_strap,
                connected,
            }),
            command_stream: receiver_stream(command_rx),
            event_stream: receiver_stream(event_rx),
            data_stream: receiver_stream(data_rx),
        })
    }

    async fn destroy(&self) -> Result<()> {
        info!("Releasing BLE transport");
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.peripherals.lock().await.clear();
        Ok(())
    }
}

/// What a freshly connected peripheral needs before it becomes a link
struct LinkSetup {
    cmd_to_strap: Characteristic,
    notifications: BoxStream<'static, ValueNotification>,
    events: BoxStream<'static, CentralEvent>,
}

/// Await `disconnect` before handing back a failed setup result
async fn disconnect_on_error<T>(
    result: Result<T>,
    disconnect: impl Future<Output = ()>,
) -> Result<T> {
    if result.is_err() {
        disconnect.await;
    }
    result
}

/// Write side of a connected strap
struct BleLink {
    peripheral: Peripheral,
    cmd_to_strap: Characteristic,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl StrapLink for BleLink {
    async fn write(&self, data: Bytes) -> Result<()> {
        debug!("Writing frame: {:02X?}", &data[..]);
        self.peripheral
            .write(&self.cmd_to_strap, &data, WriteType::WithoutResponse)
            .await
            .map_err(|e| StrapError::Transport(format!("Failed to write frame: {e}")))
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.peripheral.disconnect().await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct NotificationRoutes {
    command: (Uuid, mpsc::UnboundedSender<Result<Bytes>>),
    event: (Uuid, mpsc::UnboundedSender<Result<Bytes>>),
    data: (Uuid, mpsc::UnboundedSender<Result<Bytes>>),
}

impl NotificationRoutes {
    fn route(&self, notification: ValueNotification) -> bool {
        let Some((_, channel)) = [&self.command, &self.event, &self.data]
            .into_iter()
            .find(|(uuid, _)| *uuid == notification.uuid)
        else {
            debug!("Ignoring notification from {}", notification.uuid);
            return true;
        };
        channel.send(Ok(Bytes::from(notification.value))).is_ok()
    }
}

/// Split the peripheral's notification stream into the three strap channels
async fn route_notifications(
    mut notifications: BoxStream<'static, ValueNotification>,
    routes: NotificationRoutes,
) {
    while let Some(notification) = notifications.next().await {
        if !routes.route(notification) {
            debug!("Notification receiver dropped, stopping router");
            break;
        }
    }
    debug!("Notification stream ended");
}

/// Run `on_disconnect` once the adapter reports the peripheral gone
async fn watch_disconnect(
    mut events: BoxStream<'static, CentralEvent>,
    peripheral: Peripheral,
    connected: Arc<AtomicBool>,
    on_disconnect: DisconnectCallback,
) {
    let id = peripheral.id();
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(gone) = event {
            if gone == id {
                warn!("Strap {} disconnected", peripheral.address());
                connected.store(false, Ordering::SeqCst);
                on_disconnect();
                return;
            }
        }
    }
}

fn receiver_stream(rx: mpsc::UnboundedReceiver<Result<Bytes>>) -> ByteStream {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}
