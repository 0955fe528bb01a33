use crate::{
    error::{Result, StrapError},
    types::HistoricalDataPacket,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC, CRC_8_SMBUS};
use std::fmt;
use tracing::warn;

/// Start-of-frame marker opening every frame
pub const SOF: u8 = 0xAA;

/// Smallest frame the decoder accepts: SOF + length + CRC8 + CRC32
pub const MIN_FRAME_SIZE: usize = 8;

/// Smallest value the length field may carry
pub const MIN_DECLARED_LENGTH: usize = 8;

/// Size of the CRC32 trailer
pub const CRC32_SIZE: usize = 4;

/// Offset of the body (type byte) inside a frame
const BODY_OFFSET: usize = 4;

/// Offset of the `u32` trim value inside a metadata payload
pub const METADATA_TRIM_OFFSET: usize = 10;

/// Offset of the bpm byte inside a real-time heart-rate payload
pub const REALTIME_BPM_OFFSET: usize = 5;

/// Minimum historical payload: everything up to the fourth rr interval
pub const HISTORICAL_PAYLOAD_MIN: usize = 24;

/// Size of the historical payload as emitted by the strap
pub const HISTORICAL_PAYLOAD_SIZE: usize = 27;

/// Byte sequence the firmware sprinkles through console log text
const LOG_NOISE: [u8; 3] = [0x34, 0x00, 0x01];

/// CRC-8 over the length field: polynomial 0x07, MSB first, init 0, no final xor
const LENGTH_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// CRC-32 over the body: reflected 0xEDB88320, init 0xFFFFFFFF, final NOT
const BODY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Packet types carried in the first body byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Request sent from the app to the strap
    Command = 35,
    /// Strap answer to a [`PacketType::Command`]
    CommandResponse = 36,
    /// Real-time heart rate sample
    RealtimeData = 40,
    /// Real-time raw sensor data
    RealtimeRawData = 43,
    /// One stored historical sample
    HistoricalData = 47,
    /// Strap event notification
    Event = 48,
    /// Historical transfer progress marker
    Metadata = 49,
    /// Firmware console output
    ConsoleLogs = 50,
    /// Real-time IMU stream
    RealtimeImuDataStream = 51,
    /// Historical IMU stream
    HistoricalImuDataStream = 52,
}

impl PacketType {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            35 => Some(Self::Command),
            36 => Some(Self::CommandResponse),
            40 => Some(Self::RealtimeData),
            43 => Some(Self::RealtimeRawData),
            47 => Some(Self::HistoricalData),
            48 => Some(Self::Event),
            49 => Some(Self::Metadata),
            50 => Some(Self::ConsoleLogs),
            51 => Some(Self::RealtimeImuDataStream),
            52 => Some(Self::HistoricalImuDataStream),
            _ => None,
        }
    }
}

/// Sub-codes carried in the `cmd` byte of metadata packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataType {
    /// A page of historical data is about to start
    HistoryStart = 1,
    /// A page ended; more data remains on the strap
    HistoryEnd = 2,
    /// The whole transfer is done
    HistoryComplete = 3,
}

impl MetadataType {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::HistoryStart),
            2 => Some(Self::HistoryEnd),
            3 => Some(Self::HistoryComplete),
            _ => None,
        }
    }
}

/// Command numbers understood by the strap firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandNumber {
    /// Link liveness check
    LinkValid = 1,
    /// Highest supported protocol version
    GetMaxProtocolVersion = 2,
    /// Enable/disable real-time heart rate streaming
    ToggleRealtimeHr = 3,
    /// Firmware version report
    ReportVersionInfo = 7,
    /// Set the strap clock
    SetClock = 10,
    /// Read the strap clock
    GetClock = 11,
    /// Toggle the generic BLE heart rate profile
    ToggleGenericHrProfile = 14,
    /// Toggle R7 data collection
    ToggleR7DataCollection = 16,
    /// Run a haptic pattern
    RunHapticPatternMaverick = 19,
    /// Abort historical transmits
    AbortHistoricalTransmits = 20,
    /// Start sending historical data
    SendHistoricalData = 22,
    /// Acknowledge a historical page and request the next one
    HistoricalDataResult = 23,
    /// Force a trim of stored data
    ForceTrim = 25,
    /// Read the battery level
    GetBatteryLevel = 26,
    /// Reboot the strap
    RebootStrap = 29,
    /// Power cycle the strap
    PowerCycleStrap = 32,
    /// Move the historical read pointer
    SetReadPointer = 33,
    /// Stored data range
    GetDataRange = 34,
    /// Status report including charging and wrist state
    GetHelloHarvard = 35,
    /// Begin a firmware load
    StartFirmwareLoad = 36,
    /// Firmware data chunk
    LoadFirmwareData = 37,
    /// Process a loaded firmware image
    ProcessFirmwareImage = 38,
    /// Set LED drive
    SetLedDrive = 39,
    /// Get LED drive
    GetLedDrive = 40,
    /// Set TIA gain
    SetTiaGain = 41,
    /// Get TIA gain
    GetTiaGain = 42,
    /// Set bias offset
    SetBiasOffset = 43,
    /// Get bias offset
    GetBiasOffset = 44,
    /// Enter BLE DFU mode
    EnterBleDfu = 45,
    /// Set DP type
    SetDpType = 52,
    /// Force DP type
    ForceDpType = 53,
    /// Send R10/R11 in real time
    SendR10R11Realtime = 63,
    /// Set alarm time
    SetAlarmTime = 66,
    /// Get alarm time
    GetAlarmTime = 67,
    /// Run the alarm
    RunAlarm = 68,
    /// Disable the alarm
    DisableAlarm = 69,
    /// Get advertising name
    GetAdvertisingNameHarvard = 76,
    /// Set advertising name
    SetAdvertisingNameHarvard = 77,
    /// Run a haptics pattern
    RunHapticsPattern = 79,
    /// List haptics patterns
    GetAllHapticsPattern = 80,
    /// Start raw data
    StartRawData = 81,
    /// Stop raw data
    StopRawData = 82,
    /// Verify a firmware image
    VerifyFirmwareImage = 83,
    /// Body location and status
    GetBodyLocationAndStatus = 84,
    /// Enter high frequency sync
    EnterHighFreqSync = 96,
    /// Exit high frequency sync
    ExitHighFreqSync = 97,
    /// Extended battery information
    GetExtendedBatteryInfo = 98,
    /// Reset the fuel gauge
    ResetFuelGauge = 99,
    /// Calibrate capsense
    CalibrateCapsense = 100,
    /// Toggle historical IMU mode
    ToggleImuModeHistorical = 105,
    /// Toggle IMU mode
    ToggleImuMode = 106,
    /// Enable optical data
    EnableOpticalData = 107,
    /// Toggle optical mode
    ToggleOpticalMode = 108,
    /// Start device config key exchange
    StartDeviceConfigKeyExchange = 115,
    /// Next device config
    SendNextDeviceConfig = 116,
    /// Start FF key exchange
    StartFfKeyExchange = 117,
    /// Next FF
    SendNextFf = 118,
    /// Set device config value
    SetDeviceConfigValue = 119,
    /// Set FF value
    SetFfValue = 120,
    /// Get device config value
    GetDeviceConfigValue = 121,
    /// Stop haptics
    StopHaptics = 122,
    /// Select wrist
    SelectWrist = 123,
    /// Toggle labrador data generation
    ToggleLabradorDataGeneration = 124,
    /// Toggle labrador raw save
    ToggleLabradorRawSave = 125,
    /// Get FF value
    GetFfValue = 128,
    /// Set research packet
    SetResearchPacket = 131,
    /// Get research packet
    GetResearchPacket = 132,
    /// Toggle labrador filtered
    ToggleLabradorFiltered = 139,
    /// Set advertising name
    SetAdvertisingName = 140,
    /// Get advertising name
    GetAdvertisingName = 141,
    /// Begin a firmware load (new flow)
    StartFirmwareLoadNew = 142,
    /// Firmware data chunk (new flow)
    LoadFirmwareDataNew = 143,
    /// Process firmware image (new flow)
    ProcessFirmwareImageNew = 144,
    /// Hello
    GetHello = 145,
}

impl CommandNumber {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::LinkValid),
            2 => Some(Self::GetMaxProtocolVersion),
            3 => Some(Self::ToggleRealtimeHr),
            7 => Some(Self::ReportVersionInfo),
            10 => Some(Self::SetClock),
            11 => Some(Self::GetClock),
            14 => Some(Self::ToggleGenericHrProfile),
            16 => Some(Self::ToggleR7DataCollection),
            19 => Some(Self::RunHapticPatternMaverick),
            20 => Some(Self::AbortHistoricalTransmits),
            22 => Some(Self::SendHistoricalData),
            23 => Some(Self::HistoricalDataResult),
            25 => Some(Self::ForceTrim),
            26 => Some(Self::GetBatteryLevel),
            29 => Some(Self::RebootStrap),
            32 => Some(Self::PowerCycleStrap),
            33 => Some(Self::SetReadPointer),
            34 => Some(Self::GetDataRange),
            35 => Some(Self::GetHelloHarvard),
            36 => Some(Self::StartFirmwareLoad),
            37 => Some(Self::LoadFirmwareData),
            38 => Some(Self::ProcessFirmwareImage),
            39 => Some(Self::SetLedDrive),
            40 => Some(Self::GetLedDrive),
            41 => Some(Self::SetTiaGain),
            42 => Some(Self::GetTiaGain),
            43 => Some(Self::SetBiasOffset),
            44 => Some(Self::GetBiasOffset),
            45 => Some(Self::EnterBleDfu),
            52 => Some(Self::SetDpType),
            53 => Some(Self::ForceDpType),
            63 => Some(Self::SendR10R11Realtime),
            66 => Some(Self::SetAlarmTime),
            67 => Some(Self::GetAlarmTime),
            68 => Some(Self::RunAlarm),
            69 => Some(Self::DisableAlarm),
            76 => Some(Self::GetAdvertisingNameHarvard),
            77 => Some(Self::SetAdvertisingNameHarvard),
            79 => Some(Self::RunHapticsPattern),
            80 => Some(Self::GetAllHapticsPattern),
            81 => Some(Self::StartRawData),
            82 => Some(Self::StopRawData),
            83 => Some(Self::VerifyFirmwareImage),
            84 => Some(Self::GetBodyLocationAndStatus),
            96 => Some(Self::EnterHighFreqSync),
            97 => Some(Self::ExitHighFreqSync),
            98 => Some(Self::GetExtendedBatteryInfo),
            99 => Some(Self::ResetFuelGauge),
            100 => Some(Self::CalibrateCapsense),
            105 => Some(Self::ToggleImuModeHistorical),
            106 => Some(Self::ToggleImuMode),
            107 => Some(Self::EnableOpticalData),
            108 => Some(Self::ToggleOpticalMode),
            115 => Some(Self::StartDeviceConfigKeyExchange),
            116 => Some(Self::SendNextDeviceConfig),
            117 => Some(Self::StartFfKeyExchange),
            118 => Some(Self::SendNextFf),
            119 => Some(Self::SetDeviceConfigValue),
            120 => Some(Self::SetFfValue),
            121 => Some(Self::GetDeviceConfigValue),
            122 => Some(Self::StopHaptics),
            123 => Some(Self::SelectWrist),
            124 => Some(Self::ToggleLabradorDataGeneration),
            125 => Some(Self::ToggleLabradorRawSave),
            128 => Some(Self::GetFfValue),
            131 => Some(Self::SetResearchPacket),
            132 => Some(Self::GetResearchPacket),
            139 => Some(Self::ToggleLabradorFiltered),
            140 => Some(Self::SetAdvertisingName),
            141 => Some(Self::GetAdvertisingName),
            142 => Some(Self::StartFirmwareLoadNew),
            143 => Some(Self::LoadFirmwareDataNew),
            144 => Some(Self::ProcessFirmwareImageNew),
            145 => Some(Self::GetHello),
            _ => None,
        }
    }
}

/// One decoded frame.
///
/// Frame layout on the wire:
/// - Byte 0: SOF (`0xAA`)
/// - Bytes 1-2: length (u16 little-endian) = body length + 4
/// - Byte 3: CRC-8 of the two length bytes
/// - Body: type, seq, cmd, payload
/// - Last 4 bytes: CRC-32 of the body (u32 little-endian)
///
/// The raw type and command bytes are kept so that packets the firmware adds
/// later still decode; use [`Packet::kind`] and friends for typed access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type byte
    pub packet_type: u8,
    /// Sequence number
    pub seq: u8,
    /// Command (or metadata/event sub-code) byte
    pub cmd: u8,
    /// Payload following the three header bytes
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet from typed header values
    pub fn new(packet_type: PacketType, seq: u8, cmd: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type: packet_type as u8,
            seq,
            cmd,
            payload: payload.into(),
        }
    }

    /// Create a command packet with sequence number 0
    pub fn command(cmd: CommandNumber, payload: impl Into<Bytes>) -> Self {
        Self::new(PacketType::Command, 0, cmd as u8, payload)
    }

    /// Typed packet type, if known
    #[must_use]
    pub const fn kind(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    /// Typed command number, if known
    #[must_use]
    pub const fn command_number(&self) -> Option<CommandNumber> {
        CommandNumber::from_u8(self.cmd)
    }

    /// Typed metadata sub-code, if known
    #[must_use]
    pub const fn metadata_type(&self) -> Option<MetadataType> {
        MetadataType::from_u8(self.cmd)
    }

    /// Check whether this packet is of the given type
    #[must_use]
    pub fn is(&self, packet_type: PacketType) -> bool {
        self.packet_type == packet_type as u8
    }

    fn body(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(3 + self.payload.len());
        body.put_u8(self.packet_type);
        body.put_u8(self.seq);
        body.put_u8(self.cmd);
        body.extend_from_slice(&self.payload);
        body
    }

    /// Serialize the packet into a complete frame
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::Protocol`] if the payload does not fit the
    /// 16-bit length field.
    pub fn framed(&self) -> Result<Bytes> {
        let body = self.body();
        let length = u16::try_from(body.len() + CRC32_SIZE).map_err(|_| {
            StrapError::Protocol(format!("Payload too large: {} bytes", self.payload.len()))
        })?;
        let length_bytes = length.to_le_bytes();

        let mut frame = BytesMut::with_capacity(BODY_OFFSET + body.len() + CRC32_SIZE);
        frame.put_u8(SOF);
        frame.extend_from_slice(&length_bytes);
        frame.put_u8(crc8(&length_bytes));
        frame.extend_from_slice(&body);
        frame.put_u32_le(crc32(&body));

        Ok(frame.freeze())
    }

    /// Decode a frame
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::MalformedPacket`] if the buffer is shorter than
    /// [`MIN_FRAME_SIZE`], does not start with [`SOF`], fails either checksum,
    /// or declares a length outside the buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_FRAME_SIZE {
            return Err(StrapError::MalformedPacket(format!(
                "Packet too short: {} bytes",
                data.len()
            )));
        }

        if data[0] != SOF {
            return Err(StrapError::MalformedPacket(format!(
                "Invalid SOF: {}",
                to_hex(data)
            )));
        }

        let length_bytes = &data[1..3];
        let expected_crc8 = data[3];
        let calculated_crc8 = crc8(length_bytes);
        if expected_crc8 != calculated_crc8 {
            return Err(StrapError::MalformedPacket(format!(
                "Header CRC8 mismatch: expected {expected_crc8:02X}, calculated {calculated_crc8:02X}"
            )));
        }

        let length = usize::from(u16::from_le_bytes([data[1], data[2]]));
        if length < MIN_DECLARED_LENGTH || length + CRC32_SIZE > data.len() {
            return Err(StrapError::MalformedPacket(format!(
                "Invalid packet length {length} for {} byte buffer",
                data.len()
            )));
        }

        let body = &data[BODY_OFFSET..length];
        let mut trailer = &data[length..length + CRC32_SIZE];
        let expected_crc32 = trailer.get_u32_le();
        let calculated_crc32 = crc32(body);
        if expected_crc32 != calculated_crc32 {
            return Err(StrapError::MalformedPacket(format!(
                "Body CRC32 mismatch: expected {expected_crc32:08X}, calculated {calculated_crc32:08X}"
            )));
        }

        Ok(Self {
            packet_type: body[0],
            seq: body[1],
            cmd: body[2],
            payload: Bytes::copy_from_slice(&body[3..]),
        })
    }

    /// Read a little-endian `u32` from the payload
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::MalformedPacket`] if the payload is too short.
    pub fn payload_u32_le(&self, offset: usize) -> Result<u32> {
        let bytes = self.payload_slice(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a little-endian `u16` from the payload
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::MalformedPacket`] if the payload is too short.
    pub fn payload_u16_le(&self, offset: usize) -> Result<u16> {
        let bytes = self.payload_slice(offset, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read one payload byte
    ///
    /// # Errors
    ///
    /// Returns [`StrapError::MalformedPacket`] if the payload is too short.
    pub fn payload_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.payload_slice(offset, 1)?[0])
    }

    fn payload_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.payload.get(offset..offset + len).ok_or_else(|| {
            StrapError::MalformedPacket(format!(
                "Payload of {} bytes too short to read {len} bytes at offset {offset}",
                self.payload.len()
            ))
        })
    }

    /// Hex dump of the payload
    #[must_use]
    pub fn to_hex(&self) -> String {
        to_hex(&self.payload)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet {{ type: 0x{:02X}, seq: {}, cmd: 0x{:02X}, payload: {} }}",
            self.packet_type,
            self.seq,
            self.cmd,
            self.to_hex()
        )
    }
}

/// CRC-8 of the length field
#[inline]
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    LENGTH_CRC.checksum(data)
}

/// CRC-32 of the packet body
#[inline]
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    BODY_CRC.checksum(data)
}

/// Space separated upper-case hex
#[must_use]
pub fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cheap check for console log frames, done before paying for a full decode
#[must_use]
pub fn is_console_logs(raw: &[u8]) -> bool {
    raw.len() >= 5 && raw[0] == SOF && raw[4] == PacketType::ConsoleLogs as u8
}

/// Parse a historical data payload
///
/// Payload layout:
/// - Bytes 4-7: unix seconds (u32 LE)
/// - Bytes 8-9: fraction of a second in 1/32768 units (u16 LE)
/// - Bytes 10-13: unknown (u32 LE)
/// - Byte 14: heart rate
/// - Byte 15: number of rr intervals (0-4)
/// - Bytes 16-23: four rr intervals (u16 LE), only the first `count` used
///
/// # Errors
///
/// Returns [`StrapError::MalformedPacket`] if the payload is shorter than
/// [`HISTORICAL_PAYLOAD_MIN`].
pub fn parse_historical_data_packet(packet: &Packet) -> Result<HistoricalDataPacket> {
    if packet.payload.len() < HISTORICAL_PAYLOAD_MIN {
        return Err(StrapError::MalformedPacket(format!(
            "Historical payload too short: {} bytes",
            packet.payload.len()
        )));
    }

    let mut buf = &packet.payload[4..];
    let unix = u64::from(buf.get_u32_le());
    let subsec = u64::from(buf.get_u16_le());
    let unknown = buf.get_u32_le();
    let heart_rate = buf.get_u8();
    let rr_count = buf.get_u8();

    let mut rr_slots = [0u16; 4];
    for slot in &mut rr_slots {
        *slot = buf.get_u16_le();
    }

    let rr = if rr_count <= 4 {
        rr_slots[..usize::from(rr_count)].to_vec()
    } else {
        warn!("Unexpected rr count {} in historical packet", rr_count);
        Vec::new()
    };

    Ok(HistoricalDataPacket {
        timestamp_ms: unix * 1000 + subsec * 1000 / 32768,
        heart_rate,
        rr,
        unknown,
    })
}

/// Build a historical data payload in the layout the strap emits.
///
/// Inverse of [`parse_historical_data_packet`]; at most four rr intervals
/// are written.
#[must_use]
pub fn historical_data_payload(sample: &HistoricalDataPacket) -> Bytes {
    let unix = u32::try_from(sample.timestamp_ms / 1000).unwrap_or(u32::MAX);
    let millis = sample.timestamp_ms % 1000;
    // Round up so the decoder's floor lands back on the same millisecond
    let subsec = u16::try_from((millis * 32768).div_ceil(1000)).unwrap_or(u16::MAX);
    let rr = &sample.rr[..sample.rr.len().min(4)];

    let mut buf = BytesMut::with_capacity(HISTORICAL_PAYLOAD_SIZE);
    buf.put_u32_le(0);
    buf.put_u32_le(unix);
    buf.put_u16_le(subsec);
    buf.put_u32_le(sample.unknown);
    buf.put_u8(sample.heart_rate);
    buf.put_u8(u8::try_from(rr.len()).unwrap_or(4));
    for slot in 0..4 {
        buf.put_u16_le(rr.get(slot).copied().unwrap_or(0));
    }
    buf.resize(HISTORICAL_PAYLOAD_SIZE, 0);
    buf.freeze()
}

/// Extract the text of a console log payload
#[must_use]
pub fn parse_log_data(payload: &[u8]) -> String {
    if payload.len() < 8 {
        return String::new();
    }
    let sliced = &payload[7..payload.len() - 1];

    let mut cleaned = Vec::with_capacity(sliced.len());
    let mut i = 0;
    while i < sliced.len() {
        if sliced[i..].starts_with(&LOG_NOISE) {
            i += LOG_NOISE.len();
        } else {
            cleaned.push(sliced[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&cleaned).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet::command(CommandNumber::GetBatteryLevel, vec![0x00u8])
    }

    #[test]
    fn test_crc_check_values() {
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_frame_layout() {
        let frame = sample_packet().framed().unwrap();

        // SOF + length(2) + crc8 + type/seq/cmd + 1 payload byte + crc32
        assert_eq!(frame.len(), 12);
        assert_eq!(frame[0], SOF);
        assert_eq!(u16::from_le_bytes([frame[1], frame[2]]), 8);
        assert_eq!(frame[3], crc8(&frame[1..3]));
        assert_eq!(frame[4], PacketType::Command as u8);
        assert_eq!(frame[5], 0);
        assert_eq!(frame[6], CommandNumber::GetBatteryLevel as u8);
        assert_eq!(frame[7], 0x00);
        let trailer = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
        assert_eq!(trailer, crc32(&frame[4..8]));
    }

    #[test]
    fn test_round_trip() {
        let packets = vec![
            sample_packet(),
            Packet {
                packet_type: 0xFF,
                seq: 200,
                cmd: 0x7F,
                payload: Bytes::from(vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9]),
            },
            Packet::new(PacketType::Metadata, 3, 2, vec![0u8; 300]),
        ];

        for packet in packets {
            let decoded = Packet::from_bytes(&packet.framed().unwrap()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut frame = sample_packet().framed().unwrap().to_vec();
        frame.extend_from_slice(&[0xDE, 0xAD]);
        assert_eq!(Packet::from_bytes(&frame).unwrap(), sample_packet());
    }

    #[test]
    fn test_rejects_single_bit_flips() {
        let frame = Packet::command(CommandNumber::GetClock, vec![0x00u8, 0x11, 0x22])
            .framed()
            .unwrap()
            .to_vec();
        let len = frame.len();

        // Length field, CRC8 byte and CRC32 trailer
        let positions: Vec<usize> = [1, 2, 3].into_iter().chain(len - 4..len).collect();
        for pos in positions {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[pos] ^= 1 << bit;
                assert!(
                    matches!(
                        Packet::from_bytes(&corrupted),
                        Err(StrapError::MalformedPacket(_))
                    ),
                    "flip of bit {bit} at byte {pos} was accepted"
                );
            }
        }
    }

    #[test]
    fn test_rejects_short_and_bad_sof() {
        let frame = sample_packet().framed().unwrap();

        for n in 0..MIN_FRAME_SIZE {
            assert!(Packet::from_bytes(&frame[..n]).is_err());
        }

        let mut bad_sof = frame.to_vec();
        bad_sof[0] = 0xAB;
        let err = Packet::from_bytes(&bad_sof).unwrap_err();
        assert!(err.to_string().contains("SOF"));
    }

    #[test]
    fn test_rejects_length_below_floor() {
        // Declared length 4 with a valid CRC8 still fails
        let length = 4u16.to_le_bytes();
        let frame = [SOF, length[0], length[1], crc8(&length), 0, 0, 0, 0, 0];
        assert!(Packet::from_bytes(&frame).is_err());
    }

    #[test]
    fn test_rejects_truncated_body() {
        let frame = Packet::command(CommandNumber::GetClock, vec![0u8; 10])
            .framed()
            .unwrap();
        assert!(Packet::from_bytes(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn test_is_console_logs() {
        let logs = Packet::new(PacketType::ConsoleLogs, 0, 0, vec![0u8; 4])
            .framed()
            .unwrap();
        assert!(is_console_logs(&logs));

        let data = Packet::new(PacketType::HistoricalData, 0, 0, vec![0u8; 4])
            .framed()
            .unwrap();
        assert!(!is_console_logs(&data));
        assert!(!is_console_logs(&[SOF, 0, 0, 0]));
    }

    #[test]
    fn test_parse_historical_packet_scenario() {
        let mut payload = vec![0u8; HISTORICAL_PAYLOAD_SIZE];
        payload[4..8].copy_from_slice(&1_700_000_000u32.to_le_bytes());
        payload[8..10].copy_from_slice(&16384u16.to_le_bytes());
        payload[10..14].copy_from_slice(&42u32.to_le_bytes());
        payload[14] = 75;
        payload[15] = 2;
        payload[16..18].copy_from_slice(&800u16.to_le_bytes());
        payload[18..20].copy_from_slice(&810u16.to_le_bytes());

        let packet = Packet::new(PacketType::HistoricalData, 0, 0, payload);
        let parsed = parse_historical_data_packet(&packet).unwrap();

        assert_eq!(parsed.timestamp_ms, 1_700_000_000_500);
        assert_eq!(parsed.heart_rate, 75);
        assert_eq!(parsed.rr, vec![800, 810]);
        assert_eq!(parsed.unknown, 42);
    }

    #[test]
    fn test_parse_historical_packet_bad_rr_count() {
        let mut payload = vec![0u8; HISTORICAL_PAYLOAD_SIZE];
        payload[15] = 9;
        let packet = Packet::new(PacketType::HistoricalData, 0, 0, payload);
        assert!(parse_historical_data_packet(&packet).unwrap().rr.is_empty());

        let short = Packet::new(PacketType::HistoricalData, 0, 0, vec![0u8; 10]);
        assert!(parse_historical_data_packet(&short).is_err());
    }

    #[test]
    fn test_historical_payload_matches_strap_layout() {
        let sample = HistoricalDataPacket {
            timestamp_ms: 1_700_000_000_123,
            heart_rate: 64,
            rr: vec![910, 905, 899],
            unknown: 7,
        };
        let payload = historical_data_payload(&sample);
        assert_eq!(payload.len(), HISTORICAL_PAYLOAD_SIZE);
        assert_eq!(payload[14], 64);
        assert_eq!(payload[15], 3);

        let packet = Packet::new(PacketType::HistoricalData, 0, 0, payload);
        assert_eq!(parse_historical_data_packet(&packet).unwrap(), sample);
    }

    #[test]
    fn test_parse_log_data() {
        let mut payload = vec![0u8; 7];
        payload.extend_from_slice(b"boot");
        payload.extend_from_slice(&LOG_NOISE);
        payload.extend_from_slice(b" ok");
        payload.push(0x00);

        assert_eq!(parse_log_data(&payload), "boot ok");
        assert_eq!(parse_log_data(&[1, 2, 3]), "");
    }

    #[test]
    fn test_payload_readers() {
        let packet = Packet::command(CommandNumber::GetClock, vec![0u8, 0, 0x10, 0x27, 0, 0]);
        assert_eq!(packet.payload_u16_le(2).unwrap(), 10_000);
        assert_eq!(packet.payload_u32_le(2).unwrap(), 10_000);
        assert!(packet.payload_u32_le(4).is_err());
    }

    #[test]
    fn test_typed_accessors() {
        let packet = Packet::new(PacketType::Metadata, 0, MetadataType::HistoryEnd as u8, Bytes::new());
        assert_eq!(packet.kind(), Some(PacketType::Metadata));
        assert_eq!(packet.metadata_type(), Some(MetadataType::HistoryEnd));
        assert!(packet.is(PacketType::Metadata));
        assert_eq!(PacketType::from_u8(99), None);
        assert_eq!(CommandNumber::from_u8(26), Some(CommandNumber::GetBatteryLevel));
    }
}
