#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Strapkit
//!
//! A Rust SDK for wrist-worn heart rate straps that speak the framed
//! `0xAA` protocol over Bluetooth Low Energy.
//!
//! The crate reads battery, clock, wear state and firmware versions, streams
//! real-time heart rate, downloads the strap's stored history in pages, and
//! turns that history into rolling averages and a 24 hour resting heart rate.
//!
//! ## Layers
//!
//! - **Packet codec** ([`protocol`]): frames with a CRC-8 over the length
//!   field and a CRC-32 over the body
//! - **Commands** ([`command`]): each request knows its encoding and how to
//!   read its answer
//! - **Device session** ([`device`]): one connected strap, with a FIFO
//!   [`queue::TaskQueue`] keeping command/response cycles one at a time
//! - **SDK** ([`sdk`]): session registry plus the bridge to [`storage`]
//! - **Analysis** ([`analysis`]): rolling averages and resting heart rate
//!
//! The wireless link sits behind the [`transport::Transport`] trait.
//! [`ble::BleTransport`] drives a real adapter through `btleplug`;
//! [`mock::MockTransport`] simulates a strap in memory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use strapkit::{ble::BleTransport, storage::MemoryStorage, Sdk};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sdk = Sdk::new(
//!         Arc::new(BleTransport::new().await?),
//!         Arc::new(MemoryStorage::new()),
//!     );
//!
//!     let devices = sdk.get_devices().await?;
//!     let strap = devices.first().ok_or("no strap in range")?;
//!     let session = sdk.connect_to_device(&strap.id, || {}).await?;
//!
//!     println!("Battery: {:.1}%", session.battery_level().await?);
//!
//!     // Pull everything the strap has stored, 10 hours per dump
//!     let dumps = sdk
//!         .download_historical_data(&strap.id, strapkit::DEFAULT_DOWNLOAD_BUFFER_SIZE)
//!         .await?;
//!     println!("Downloaded {} dumps", dumps.len());
//!
//!     let analysis = sdk.analyse_device_data(session.name(), None, None, true).await?;
//!     println!("{} one-minute averages", analysis.hr_avg_1min.len());
//!
//!     sdk.destroy().await;
//!     Ok(())
//! }
//! ```

/// Heart rate analysis
pub mod analysis;
/// Bluetooth Low Energy transport
pub mod ble;
/// Strap command catalogue
pub mod command;
/// Connected strap sessions
pub mod device;
/// Historical download buffering
pub mod download;
/// Error types and handling
pub mod error;
pub mod mock;
/// Packet framing and payload parsing
pub mod protocol;
/// FIFO task sequencing
pub mod queue;
/// SDK entry point
pub mod sdk;
pub mod storage;
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use analysis::{analyse_data, AnalysedDataPoint, AnalysedDataResult};
pub use command::{Command, CommandResponse};
pub use device::DeviceSession;
pub use error::{Result, StrapError};
pub use protocol::{CommandNumber, MetadataType, Packet, PacketType};
pub use sdk::Sdk;
pub use types::{
    ConnectionParams, DeviceSessionState, DeviceState, HeartRateEvent, HelloHarvard,
    HistoricalDataDump, HistoricalDataPacket, LogEvent, SessionConfig, VersionInfo,
    DEFAULT_DOWNLOAD_BUFFER_SIZE,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Strap BLE service UUID
pub const STRAP_SERVICE_UUID: &str = "61080001-8d6d-82b8-614a-1c8cb0f8dcc6";

/// Characteristic the app writes command frames to
pub const CMD_TO_STRAP_UUID: &str = "61080002-8d6d-82b8-614a-1c8cb0f8dcc6";

/// Characteristic carrying command responses
pub const CMD_FROM_STRAP_UUID: &str = "61080003-8d6d-82b8-614a-1c8cb0f8dcc6";

/// Characteristic carrying strap events
pub const EVENTS_FROM_STRAP_UUID: &str = "61080004-8d6d-82b8-614a-1c8cb0f8dcc6";

/// Characteristic carrying real-time, historical and console log data
pub const DATA_FROM_STRAP_UUID: &str = "61080005-8d6d-82b8-614a-1c8cb0f8dcc6";
