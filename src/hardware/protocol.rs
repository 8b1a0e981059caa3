//! Ring telemetry wire protocol.
//!
//! Two directions share the Nordic UART service:
//!
//! - **Commands** (host → device) are written to [`UART_RX_CHAR_UUID`]. Every command is
//!   exactly 16 bytes: an opcode body zero-padded to 15 bytes, followed by a checksum
//!   byte equal to the sum of the first 15 bytes modulo 256.
//! - **Telemetry** (device → host) arrives as notifications on [`UART_TX_CHAR_UUID`].
//!   Only the accelerometer report (`0xA1 0x03`) is decoded here. PPG and SpO2 reports
//!   share the channel and are ignored.
//!
//! # Accelerometer frame layout
//!
//! ```text
//! byte  0    1    2      3      4      5      6      7      8 ..
//!      A1   03   y_hi  y_lo*  z_hi  z_lo*  x_hi  x_lo*   (unused)
//! ```
//!
//! `*` only the low nibble is significant. Each axis is a 12-bit two's-complement
//! value `(hi << 4) | (lo & 0xF)`.

use std::fmt;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{AppResult, MotionError};

/// Nordic UART service.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E);

/// Write characteristic for commands.
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E40_0002_B5A3_F393_E0A9_E50E_24DC_CA9E);

/// Notify characteristic carrying telemetry frames.
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E40_0003_B5A3_F393_E0A9_E50E_24DC_CA9E);

/// Report type for raw sensor data.
pub const SENSOR_REPORT: u8 = 0xA1;

/// Sensor report subtype carrying accelerometer data.
pub const ACCELEROMETER_SUBTYPE: u8 = 0x03;

/// Shortest frame that can carry an accelerometer report.
pub const MIN_FRAME_LEN: usize = 10;

/// Length of every command packet.
pub const COMMAND_LEN: usize = 16;

const COMMAND_BODY_LEN: usize = COMMAND_LEN - 1;

/// One decoded accelerometer reading.
///
/// Axis naming follows the hardware orientation: `y` runs through the charging contact,
/// `z` through the ring barrel and `x` is the remaining orthogonal axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelerometerSample {
    /// Sign-extended 12-bit reading
    pub x: i16,
    /// Sign-extended 12-bit reading
    pub y: i16,
    /// Sign-extended 12-bit reading
    pub z: i16,
    /// Arrival time on the host
    pub timestamp: Instant,
}

impl AccelerometerSample {
    /// Euclidean norm of the acceleration vector.
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        let (x, y, z) = (f64::from(self.x), f64::from(self.y), f64::from(self.z));
        (x * x + y * y + z * z).sqrt()
    }
}

/// Sign-extend a 12-bit two's-complement value.
#[must_use]
pub fn sign_extend_12(raw: u16) -> i16 {
    let raw = (raw & 0x0FFF) as i16;
    if raw & 0x800 != 0 {
        raw - 4096
    } else {
        raw
    }
}

fn unpack_axis(hi: u8, lo: u8) -> i16 {
    sign_extend_12((u16::from(hi) << 4) | u16::from(lo & 0x0F))
}

/// Decode a notification frame, stamping it with the current instant.
///
/// Returns `None` for anything that is not an accelerometer report, including
/// truncated frames. That is normal traffic on a shared channel, not an error.
#[must_use]
pub fn decode_frame(frame: &[u8]) -> Option<AccelerometerSample> {
    decode_frame_at(frame, Instant::now())
}

/// Decode a notification frame with an explicit timestamp.
#[must_use]
pub fn decode_frame_at(frame: &[u8], timestamp: Instant) -> Option<AccelerometerSample> {
    if frame.len() < MIN_FRAME_LEN
        || frame[0] != SENSOR_REPORT
        || frame[1] != ACCELEROMETER_SUBTYPE
    {
        return None;
    }

    Some(AccelerometerSample {
        y: unpack_axis(frame[2], frame[3]),
        z: unpack_axis(frame[4], frame[5]),
        x: unpack_axis(frame[6], frame[7]),
        timestamp,
    })
}

/// Build an accelerometer frame as the ring would send it.
///
/// Used by the motion simulator and tests. Values are truncated to 12 bits.
#[must_use]
pub fn encode_accelerometer_frame(x: i16, y: i16, z: i16) -> [u8; COMMAND_LEN] {
    fn pack(value: i16) -> (u8, u8) {
        let raw = (value as u16) & 0x0FFF;
        ((raw >> 4) as u8, (raw & 0x0F) as u8)
    }

    let mut frame = [0u8; COMMAND_LEN];
    frame[0] = SENSOR_REPORT;
    frame[1] = ACCELEROMETER_SUBTYPE;
    (frame[2], frame[3]) = pack(y);
    (frame[4], frame[5]) = pack(z);
    (frame[6], frame[7]) = pack(x);
    frame
}

/// A framed, checksummed 16-byte command.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket([u8; COMMAND_LEN]);

impl CommandPacket {
    /// Frame an opcode body: zero-pad to 15 bytes and append the checksum.
    pub fn new(body: &[u8]) -> AppResult<Self> {
        if body.len() > COMMAND_BODY_LEN {
            return Err(MotionError::InvalidCommand(format!(
                "body is {} bytes, at most {COMMAND_BODY_LEN} allowed",
                body.len()
            )));
        }

        let mut bytes = [0u8; COMMAND_LEN];
        bytes[..body.len()].copy_from_slice(body);
        bytes[COMMAND_BODY_LEN] = checksum(&bytes[..COMMAND_BODY_LEN]);
        Ok(Self(bytes))
    }

    /// Frame a body given as a hex string such as `"a104"`.
    pub fn from_hex(hex: &str) -> AppResult<Self> {
        Self::new(&parse_hex(hex)?)
    }

    /// Raw bytes as written to the command characteristic.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }

    /// The trailing checksum byte.
    #[must_use]
    pub fn checksum(&self) -> u8 {
        self.0[COMMAND_BODY_LEN]
    }
}

impl fmt::Debug for CommandPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandPacket({self})")
    }
}

impl fmt::Display for CommandPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Parse a hex string (`"a1 04"`, `"A104"`) into bytes. Whitespace is ignored.
pub fn parse_hex(hex: &str) -> AppResult<Vec<u8>> {
    let digits: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(MotionError::InvalidCommand(format!(
            "hex '{hex}' has an odd number of digits"
        )));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| MotionError::InvalidCommand(format!("invalid hex '{hex}'")))
        })
        .collect()
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Commands understood by the ring firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCommand {
    /// Restart the firmware
    Reboot,
    /// Blink the LED twice, for identifying a ring
    BlinkTwice,
    /// Start accelerometer notifications
    EnableStreaming,
    /// Stop accelerometer notifications
    DisableStreaming,
}

impl DeviceCommand {
    /// All known commands.
    pub const ALL: [DeviceCommand; 4] = [
        DeviceCommand::Reboot,
        DeviceCommand::BlinkTwice,
        DeviceCommand::EnableStreaming,
        DeviceCommand::DisableStreaming,
    ];

    /// Opcode body before padding.
    #[must_use]
    pub fn opcode(self) -> &'static [u8] {
        match self {
            DeviceCommand::Reboot => &[0x08, 0x01],
            DeviceCommand::BlinkTwice => &[0x10],
            DeviceCommand::EnableStreaming => &[0xA1, 0x04],
            DeviceCommand::DisableStreaming => &[0xA1, 0x02],
        }
    }

    /// Framed packet for this command.
    #[must_use]
    pub fn packet(self) -> CommandPacket {
        let opcode = self.opcode();
        let mut bytes = [0u8; COMMAND_LEN];
        bytes[..opcode.len()].copy_from_slice(opcode);
        bytes[COMMAND_BODY_LEN] = checksum(opcode);
        CommandPacket(bytes)
    }

    /// Kebab-case name used on the command line.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            DeviceCommand::Reboot => "reboot",
            DeviceCommand::BlinkTwice => "blink-twice",
            DeviceCommand::EnableStreaming => "enable-streaming",
            DeviceCommand::DisableStreaming => "disable-streaming",
        }
    }

    /// Look a command up by its [`name`](Self::name).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_raw_axes(y: u16, z: u16, x: u16) -> Vec<u8> {
        let mut frame = vec![SENSOR_REPORT, ACCELEROMETER_SUBTYPE];
        for raw in [y, z, x] {
            frame.push((raw >> 4) as u8);
            // high nibble of the low byte is noise the decoder must ignore
            frame.push(0xF0 | (raw & 0x0F) as u8);
        }
        frame.extend_from_slice(&[0, 0]);
        frame
    }

    #[test]
    fn sign_extension_boundaries() {
        assert_eq!(sign_extend_12(2047), 2047);
        assert_eq!(sign_extend_12(2048), -2048);
        assert_eq!(sign_extend_12(4095), -1);
        assert_eq!(sign_extend_12(0), 0);
    }

    #[test]
    fn decodes_axes_in_hardware_order() {
        let frame = frame_with_raw_axes(100, 4095, 2048);
        let sample = decode_frame(&frame).unwrap();
        assert_eq!(sample.y, 100);
        assert_eq!(sample.z, -1);
        assert_eq!(sample.x, -2048);
    }

    #[test]
    fn ignores_other_report_types() {
        let mut frame = frame_with_raw_axes(1, 2, 3);
        frame[0] = 0xA2;
        assert!(decode_frame(&frame).is_none());

        let mut frame = frame_with_raw_axes(1, 2, 3);
        frame[1] = 0x01; // PPG
        assert!(decode_frame(&frame).is_none());
    }

    #[test]
    fn truncated_frame_is_ignored() {
        let frame = frame_with_raw_axes(1, 2, 3);
        assert!(decode_frame(&frame[..MIN_FRAME_LEN - 1]).is_none());
        assert!(decode_frame(&[]).is_none());
    }

    #[test]
    fn encoder_matches_decoder() {
        let frame = encode_accelerometer_frame(-300, 1200, -2048);
        let sample = decode_frame(&frame).unwrap();
        assert_eq!((sample.x, sample.y, sample.z), (-300, 1200, -2048));
    }

    #[test]
    fn magnitude_is_euclidean_norm() {
        let sample = AccelerometerSample {
            x: 3,
            y: 4,
            z: 12,
            timestamp: Instant::now(),
        };
        assert!((sample.magnitude() - 13.0).abs() < f64::EPSILON);
    }

    #[test]
    fn enable_streaming_packet_checksum() {
        let packet = DeviceCommand::EnableStreaming.packet();
        let mut expected = [0u8; 16];
        expected[0] = 0xA1;
        expected[1] = 0x04;
        expected[15] = 0xA5;
        assert_eq!(packet.as_bytes(), &expected);
        assert_eq!(packet.checksum(), 0xA5);
    }

    #[test]
    fn named_commands_match_hex_bodies() {
        assert_eq!(CommandPacket::from_hex("0801").unwrap(), DeviceCommand::Reboot.packet());
        assert_eq!(CommandPacket::from_hex("10").unwrap(), DeviceCommand::BlinkTwice.packet());
        assert_eq!(
            CommandPacket::from_hex("A102").unwrap(),
            DeviceCommand::DisableStreaming.packet()
        );
    }

    #[test]
    fn checksum_wraps_modulo_256() {
        let packet = CommandPacket::new(&[0xFF, 0xFF, 0x03]).unwrap();
        assert_eq!(packet.checksum(), 0x01);
    }

    #[test]
    fn rejects_bad_command_bodies() {
        assert!(CommandPacket::new(&[0u8; 16]).is_err());
        assert!(CommandPacket::new(&[0u8; 15]).is_ok());
        assert!(CommandPacket::from_hex("a1f").is_err());
        assert!(CommandPacket::from_hex("zz").is_err());
    }

    #[test]
    fn command_names_round_trip() {
        for cmd in DeviceCommand::ALL {
            assert_eq!(DeviceCommand::from_name(cmd.name()), Some(cmd));
        }
        assert_eq!(DeviceCommand::from_name("self-destruct"), None);
    }

    #[test]
    fn packet_displays_as_hex() {
        let text = DeviceCommand::BlinkTwice.packet().to_string();
        assert!(text.starts_with("10 00"));
        assert!(text.ends_with(" 10"));
    }
}
