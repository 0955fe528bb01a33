//! Boundary to the wireless link.
//!
//! The core never touches BLE APIs directly. A [`Transport`] discovers and
//! connects straps, and hands back a [`TransportConnection`]: three inbound
//! byte streams plus a [`StrapLink`] for writes and lifecycle.

use crate::{error::Result, types::DiscoveredDevice};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Stream of raw frames from one strap channel
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Callback invoked by the transport once the link drops
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;

/// Write side and lifecycle of a connected strap
#[async_trait]
pub trait StrapLink: Send + Sync {
    /// Write one frame to the command-out channel
    async fn write(&self, data: Bytes) -> Result<()>;

    /// Tear down the link
    async fn disconnect(&self) -> Result<()>;

    /// Whether the link is still up
    fn is_connected(&self) -> bool;
}

/// A freshly connected strap
pub struct TransportConnection {
    /// Transport specific identifier
    pub id: String,
    /// Advertised name
    pub name: String,
    /// Write side and lifecycle
    pub link: Arc<dyn StrapLink>,
    /// Command-in channel
    pub command_stream: ByteStream,
    /// Event-in channel
    pub event_stream: ByteStream,
    /// Data-in channel
    pub data_stream: ByteStream,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connected", &self.link.is_connected())
            .finish_non_exhaustive()
    }
}

/// Discovery and connection of straps
#[async_trait]
pub trait Transport: Send + Sync {
    /// Straps currently visible
    async fn get_devices(&self) -> Result<Vec<DiscoveredDevice>>;

    /// Connect to the strap with the given id
    async fn connect_to_device(
        &self,
        id: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<TransportConnection>;

    /// Release transport resources
    async fn destroy(&self) -> Result<()>;
}
