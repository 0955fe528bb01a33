use thiserror::Error;

/// Errors that can occur when talking to a strap
#[derive(Error, Debug)]
pub enum StrapError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Strap not found")]
    DeviceNotFound,

    /// A frame failed SOF, length or checksum validation
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// The transport reports the strap as disconnected
    #[error("Device is not connected")]
    NotConnected,

    /// No session is registered for the given device id
    #[error("No device session found for device {0}")]
    NoSession(String),

    /// A historical download is already running on this session
    #[error("Historical data download already in progress")]
    DownloadInProgress,

    /// Response wait exceeded the configured timeout
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Failure surfaced by the transport collaborator
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failure surfaced by the storage collaborator
    #[error("Storage error: {0}")]
    Storage(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for strap operations
pub type Result<T> = std::result::Result<T, StrapError>;

impl StrapError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::NotConnected | Self::DeviceNotFound | Self::Transport(_)
        )
    }

    /// Check if retrying the same call may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::MalformedPacket(_) | Self::DownloadInProgress
        )
    }
}

/// Cloneable fault carried on packet broadcast channels.
///
/// Broadcast receivers need `Clone` items, which [`StrapError`] cannot offer
/// because it wraps foreign error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    /// A raw frame failed to decode
    Malformed(String),
    /// The underlying byte stream reported an error
    Transport(String),
}

impl From<StreamFault> for StrapError {
    fn from(fault: StreamFault) -> Self {
        match fault {
            StreamFault::Malformed(reason) => Self::MalformedPacket(reason),
            StreamFault::Transport(reason) => Self::Transport(reason),
        }
    }
}
