use crate::{
    error::{Result, StrapError},
    protocol::{CommandNumber, Packet},
    types::{HelloHarvard, VersionInfo},
};
use bytes::{BufMut, Bytes, BytesMut};

/// Payload offset of the battery level (u16 LE, tenths of a percent)
const BATTERY_LEVEL_OFFSET: usize = 2;
/// Payload offset of the clock (u32 LE, unix seconds)
const CLOCK_OFFSET: usize = 2;
/// Payload offset of the charging flag in the hello report
const CHARGING_OFFSET: usize = 7;
/// Payload offset of the wrist flag in the hello report
const IS_WORN_OFFSET: usize = 116;
/// Header bytes preceding the version words
const VERSION_HEADER_SIZE: usize = 3;
/// Number of u32 words in the version report
const VERSION_WORDS: usize = 16;

/// Requests understood by the strap.
///
/// Each variant knows its command number, whether the strap answers it, how
/// to build its packet and how to read the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Battery level in percent
    GetBatteryLevel,
    /// Strap clock in unix seconds
    GetClock,
    /// Charging and wrist flags
    GetHelloHarvard,
    /// Firmware versions
    ReportVersionInfo,
    /// Switch real-time heart rate streaming on or off
    ToggleRealtimeHr(bool),
    /// Reboot the strap
    RebootStrap,
    /// Start a historical data transfer
    SendHistoricalData,
    /// Acknowledge a historical page and ask for the next one
    SendHistoricalDataNextBatch {
        /// Trim value taken from the previous HISTORY_END metadata packet
        trim: u32,
    },
    /// Any other command, sent as-is
    Raw {
        /// Command number
        cmd: CommandNumber,
        /// Request payload
        payload: Bytes,
        /// Wait for a command-response packet
        with_response: bool,
    },
}

/// Parsed answer to a [`Command`]
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    /// Battery level in percent
    BatteryLevel(f64),
    /// Unix seconds
    Clock(u32),
    /// Charging and wrist flags
    HelloHarvard(HelloHarvard),
    /// Firmware versions
    VersionInfo(VersionInfo),
    /// The command carries no answer
    Ack,
    /// Unparsed response packet of a [`Command::Raw`]
    Raw(Packet),
}

impl Command {
    /// Command number used to correlate the response
    #[must_use]
    pub const fn number(&self) -> CommandNumber {
        match self {
            Self::GetBatteryLevel => CommandNumber::GetBatteryLevel,
            Self::GetClock => CommandNumber::GetClock,
            Self::GetHelloHarvard => CommandNumber::GetHelloHarvard,
            Self::ReportVersionInfo => CommandNumber::ReportVersionInfo,
            Self::ToggleRealtimeHr(_) => CommandNumber::ToggleRealtimeHr,
            Self::RebootStrap => CommandNumber::RebootStrap,
            Self::SendHistoricalData => CommandNumber::SendHistoricalData,
            Self::SendHistoricalDataNextBatch { .. } => CommandNumber::HistoricalDataResult,
            Self::Raw { cmd, .. } => *cmd,
        }
    }

    /// Whether the strap sends a command-response packet
    #[must_use]
    pub const fn with_response(&self) -> bool {
        match self {
            Self::GetBatteryLevel
            | Self::GetClock
            | Self::GetHelloHarvard
            | Self::ReportVersionInfo => true,
            Self::ToggleRealtimeHr(_)
            | Self::RebootStrap
            | Self::SendHistoricalData
            | Self::SendHistoricalDataNextBatch { .. } => false,
            Self::Raw { with_response, .. } => *with_response,
        }
    }

    /// Build the request packet
    #[must_use]
    pub fn make_packet(&self) -> Packet {
        let payload = match self {
            Self::ToggleRealtimeHr(enabled) => Bytes::from(vec![u8::from(*enabled)]),
            Self::SendHistoricalDataNextBatch { trim } => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u8(1);
                buf.put_u32_le(*trim);
                buf.put_u32_le(0);
                buf.freeze()
            }
            Self::Raw { payload, .. } => payload.clone(),
            _ => Bytes::from_static(&[0x00]),
        };
        Packet::command(self.number(), payload)
    }

    /// Parse the response packet.
    ///
    /// For commands without a response this receives the packet that was just
    /// sent and yields [`CommandResponse::Ack`].
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::MalformedPacket`] if the payload is too short for
    /// the expected layout.
    pub fn parse_response(&self, packet: &Packet) -> Result<CommandResponse> {
        match self {
            Self::GetBatteryLevel => {
                let raw = packet.payload_u16_le(BATTERY_LEVEL_OFFSET)?;
                Ok(CommandResponse::BatteryLevel(f64::from(raw) / 10.0))
            }
            Self::GetClock => Ok(CommandResponse::Clock(packet.payload_u32_le(CLOCK_OFFSET)?)),
            Self::GetHelloHarvard => Ok(CommandResponse::HelloHarvard(HelloHarvard {
                charging: packet.payload_u8(CHARGING_OFFSET)? != 0,
                is_worn: packet.payload_u8(IS_WORN_OFFSET)? != 0,
            })),
            Self::ReportVersionInfo => parse_version_info(packet).map(CommandResponse::VersionInfo),
            Self::Raw {
                with_response: true,
                ..
            } => Ok(CommandResponse::Raw(packet.clone())),
            _ => Ok(CommandResponse::Ack),
        }
    }
}

fn parse_version_info(packet: &Packet) -> Result<VersionInfo> {
    let words = (0..VERSION_WORDS)
        .map(|i| packet.payload_u32_le(VERSION_HEADER_SIZE + i * 4))
        .collect::<Result<Vec<_>>>()?;

    let join = |w: &[u32]| {
        w.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    };

    Ok(VersionInfo {
        harvard: join(&words[0..4]),
        boylston: join(&words[4..8]),
    })
}

impl CommandResponse {
    /// Unwrap a battery level answer
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::Protocol`] for any other variant.
    pub fn into_battery_level(self) -> Result<f64> {
        match self {
            Self::BatteryLevel(level) => Ok(level),
            other => Err(unexpected("battery level", &other)),
        }
    }

    /// Unwrap a clock answer
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::Protocol`] for any other variant.
    pub fn into_clock(self) -> Result<u32> {
        match self {
            Self::Clock(clock) => Ok(clock),
            other => Err(unexpected("clock", &other)),
        }
    }

    /// Unwrap a hello report
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::Protocol`] for any other variant.
    pub fn into_hello_harvard(self) -> Result<HelloHarvard> {
        match self {
            Self::HelloHarvard(hello) => Ok(hello),
            other => Err(unexpected("hello report", &other)),
        }
    }

    /// Unwrap a version report
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::Protocol`] for any other variant.
    pub fn into_version_info(self) -> Result<VersionInfo> {
        match self {
            Self::VersionInfo(info) => Ok(info),
            other => Err(unexpected("version info", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &CommandResponse) -> StrapError {
    StrapError::Protocol(format!("Expected {expected} response, got {got:?}"))
}
