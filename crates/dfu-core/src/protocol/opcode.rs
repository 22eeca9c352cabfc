//! Control point commands and device notifications.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! host -> device   [opcode] [fields...]
//! device -> host   [0x10] [request opcode] [status]
//!                  [0x11] [bytes received: u32]
//!                  [0x12] [offset: u32] [crc32: u32]
//! ```

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::constants::*;
use crate::firmware::PartKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty packet")]
    Empty,

    #[error("Unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("Unknown response status 0x{0:02X}")]
    UnknownStatus(u8),

    #[error("Unknown image type 0x{0:02X}")]
    UnknownImageType(u8),

    #[error("Truncated {what}: {len} bytes")]
    Truncated { what: &'static str, len: usize },
}

/// Control point request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    EnterDfuMode = OP_ENTER_DFU_MODE,
    InitPacket = OP_INIT_PACKET,
    ReceiveFirmware = OP_RECEIVE_FIRMWARE,
    Validate = OP_VALIDATE,
    ActivateAndReset = OP_ACTIVATE_AND_RESET,
    Reset = OP_RESET,
    CalculateChecksum = OP_CALCULATE_CHECKSUM,
    PacketReceiptRequest = OP_PACKET_RECEIPT_REQUEST,
    StartPart = OP_START_PART,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        Ok(match byte {
            OP_ENTER_DFU_MODE => Opcode::EnterDfuMode,
            OP_INIT_PACKET => Opcode::InitPacket,
            OP_RECEIVE_FIRMWARE => Opcode::ReceiveFirmware,
            OP_VALIDATE => Opcode::Validate,
            OP_ACTIVATE_AND_RESET => Opcode::ActivateAndReset,
            OP_RESET => Opcode::Reset,
            OP_CALCULATE_CHECKSUM => Opcode::CalculateChecksum,
            OP_PACKET_RECEIPT_REQUEST => Opcode::PacketReceiptRequest,
            OP_START_PART => Opcode::StartPart,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::EnterDfuMode => "ENTER_DFU_MODE",
            Opcode::InitPacket => "INIT_PACKET",
            Opcode::ReceiveFirmware => "RECEIVE_FIRMWARE",
            Opcode::Validate => "VALIDATE",
            Opcode::ActivateAndReset => "ACTIVATE_AND_RESET",
            Opcode::Reset => "RESET",
            Opcode::CalculateChecksum => "CALCULATE_CHECKSUM",
            Opcode::PacketReceiptRequest => "PRN_REQUEST",
            Opcode::StartPart => "START_PART",
        };
        f.write_str(name)
    }
}

/// Response status codes reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl ResponseStatus {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        Ok(match byte {
            0x01 => ResponseStatus::Success,
            0x02 => ResponseStatus::InvalidState,
            0x03 => ResponseStatus::NotSupported,
            0x04 => ResponseStatus::DataSizeExceedsLimit,
            0x05 => ResponseStatus::CrcError,
            0x06 => ResponseStatus::OperationFailed,
            other => return Err(ProtocolError::UnknownStatus(other)),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResponseStatus::Success)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "Operation successful",
            ResponseStatus::InvalidState => "Invalid state for this operation",
            ResponseStatus::NotSupported => "Operation not supported",
            ResponseStatus::DataSizeExceedsLimit => "Data size exceeds limit",
            ResponseStatus::CrcError => "CRC validation failed",
            ResponseStatus::OperationFailed => "Operation failed",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Commands written to the control point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Switch the peripheral into its bootloader for the given image type.
    EnterDfuMode { kind: PartKind },
    /// Request a packet receipt notification every `interval` data writes.
    /// Zero disables receipts.
    PacketReceiptRequest { interval: u16 },
    /// Announce the next part and its payload size.
    StartPart { kind: PartKind, size: u32 },
    /// Announce an init packet of `len` bytes on the packet channel.
    InitPacket { len: u32 },
    /// Subsequent data writes are firmware payload.
    ReceiveFirmware,
    /// Ask for the offset and CRC32 of a received part.
    CalculateChecksum { part: u8 },
    Validate,
    ActivateAndReset,
    /// Cancel the update and reboot into the previous firmware.
    Reset,
}

impl ControlCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlCommand::EnterDfuMode { .. } => Opcode::EnterDfuMode,
            ControlCommand::PacketReceiptRequest { .. } => Opcode::PacketReceiptRequest,
            ControlCommand::StartPart { .. } => Opcode::StartPart,
            ControlCommand::InitPacket { .. } => Opcode::InitPacket,
            ControlCommand::ReceiveFirmware => Opcode::ReceiveFirmware,
            ControlCommand::CalculateChecksum { .. } => Opcode::CalculateChecksum,
            ControlCommand::Validate => Opcode::Validate,
            ControlCommand::ActivateAndReset => Opcode::ActivateAndReset,
            ControlCommand::Reset => Opcode::Reset,
        }
    }

    /// Encode for the control point.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode().as_byte()];
        match self {
            ControlCommand::EnterDfuMode { kind } => buf.push(kind.as_byte()),
            ControlCommand::PacketReceiptRequest { interval } => put_u16(&mut buf, *interval),
            ControlCommand::StartPart { kind, size } => {
                buf.push(kind.as_byte());
                put_u32(&mut buf, *size);
            }
            ControlCommand::InitPacket { len } => put_u32(&mut buf, *len),
            ControlCommand::CalculateChecksum { part } => buf.push(*part),
            ControlCommand::ReceiveFirmware
            | ControlCommand::Validate
            | ControlCommand::ActivateAndReset
            | ControlCommand::Reset => {}
        }
        buf
    }

    /// Decode a control point write. Used by device simulators and packet logs.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&op, rest) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        let mut cursor = Cursor::new(rest);
        let truncated = |what| ProtocolError::Truncated {
            what,
            len: bytes.len(),
        };

        Ok(match Opcode::from_byte(op)? {
            Opcode::EnterDfuMode => {
                let kind = cursor.read_u8().map_err(|_| truncated("ENTER_DFU_MODE"))?;
                ControlCommand::EnterDfuMode {
                    kind: PartKind::from_byte(kind)?,
                }
            }
            Opcode::PacketReceiptRequest => ControlCommand::PacketReceiptRequest {
                interval: cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| truncated("PRN_REQUEST"))?,
            },
            Opcode::StartPart => {
                let kind = cursor.read_u8().map_err(|_| truncated("START_PART"))?;
                let size = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| truncated("START_PART"))?;
                ControlCommand::StartPart {
                    kind: PartKind::from_byte(kind)?,
                    size,
                }
            }
            Opcode::InitPacket => ControlCommand::InitPacket {
                len: cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| truncated("INIT_PACKET"))?,
            },
            Opcode::CalculateChecksum => ControlCommand::CalculateChecksum {
                part: cursor
                    .read_u8()
                    .map_err(|_| truncated("CALCULATE_CHECKSUM"))?,
            },
            Opcode::ReceiveFirmware => ControlCommand::ReceiveFirmware,
            Opcode::Validate => ControlCommand::Validate,
            Opcode::ActivateAndReset => ControlCommand::ActivateAndReset,
            Opcode::Reset => ControlCommand::Reset,
        })
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::EnterDfuMode { kind } => write!(f, "ENTER_DFU_MODE({kind})"),
            ControlCommand::PacketReceiptRequest { interval } => {
                write!(f, "PRN_REQUEST({interval})")
            }
            ControlCommand::StartPart { kind, size } => write!(f, "START_PART({kind}, {size}B)"),
            ControlCommand::InitPacket { len } => write!(f, "INIT_PACKET({len}B)"),
            ControlCommand::CalculateChecksum { part } => write!(f, "CALCULATE_CHECKSUM({part})"),
            other => write!(f, "{}", other.opcode()),
        }
    }
}

/// Notifications received on the control point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Completion of a request.
    Response {
        request: Opcode,
        status: ResponseStatus,
    },
    /// Periodic acknowledgement of firmware bytes received for the current part.
    PacketReceipt { bytes: u32 },
    /// Answer to `CalculateChecksum`.
    Checksum { offset: u32, crc: u32 },
}

impl Notification {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&op, rest) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        let mut cursor = Cursor::new(rest);
        let truncated = |what| ProtocolError::Truncated {
            what,
            len: bytes.len(),
        };

        match op {
            OP_RESPONSE => {
                let request = cursor.read_u8().map_err(|_| truncated("response"))?;
                let status = cursor.read_u8().map_err(|_| truncated("response"))?;
                Ok(Notification::Response {
                    request: Opcode::from_byte(request)?,
                    status: ResponseStatus::from_byte(status)?,
                })
            }
            OP_PACKET_RECEIPT => Ok(Notification::PacketReceipt {
                bytes: cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| truncated("packet receipt"))?,
            }),
            OP_CHECKSUM => {
                let offset = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| truncated("checksum"))?;
                let crc = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| truncated("checksum"))?;
                Ok(Notification::Checksum { offset, crc })
            }
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Notification::Response { request, status } => {
                vec![OP_RESPONSE, request.as_byte(), *status as u8]
            }
            Notification::PacketReceipt { bytes } => {
                let mut buf = vec![OP_PACKET_RECEIPT];
                put_u32(&mut buf, *bytes);
                buf
            }
            Notification::Checksum { offset, crc } => {
                let mut buf = vec![OP_CHECKSUM];
                put_u32(&mut buf, *offset);
                put_u32(&mut buf, *crc);
                buf
            }
        }
    }

    /// Shorthand for a successful response to `request`.
    pub fn success(request: Opcode) -> Self {
        Notification::Response {
            request,
            status: ResponseStatus::Success,
        }
    }
}

// Writes into a Vec cannot fail.
fn put_u16(buf: &mut Vec<u8>, value: u16) {
    let _ = buf.write_u16::<LittleEndian>(value);
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    let _ = buf.write_u32::<LittleEndian>(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_part_layout() {
        let cmd = ControlCommand::StartPart {
            kind: PartKind::Application,
            size: 0x0001_0203,
        };
        assert_eq!(cmd.encode(), vec![OP_START_PART, 0x04, 0x03, 0x02, 0x01, 0x00]);
        assert_eq!(ControlCommand::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn test_prn_request_layout() {
        let cmd = ControlCommand::PacketReceiptRequest { interval: 12 };
        assert_eq!(cmd.encode(), vec![OP_PACKET_RECEIPT_REQUEST, 12, 0]);
    }

    #[test]
    fn test_decode_response() {
        let n = Notification::decode(&[OP_RESPONSE, OP_VALIDATE, 0x05]).unwrap();
        assert_eq!(
            n,
            Notification::Response {
                request: Opcode::Validate,
                status: ResponseStatus::CrcError,
            }
        );
    }

    #[test]
    fn test_notification_layout() {
        let receipt = Notification::PacketReceipt { bytes: 0x0102_0304 };
        assert_eq!(receipt.encode(), vec![OP_PACKET_RECEIPT, 0x04, 0x03, 0x02, 0x01]);

        let checksum = Notification::Checksum {
            offset: 0x50,
            crc: 0xDEAD_BEEF,
        };
        assert_eq!(
            checksum.encode(),
            vec![OP_CHECKSUM, 0x50, 0, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE]
        );
        assert_eq!(
            ControlCommand::InitPacket { len: 300 }.encode(),
            vec![OP_INIT_PACKET, 0x2C, 0x01, 0, 0]
        );
    }

    #[test]
    fn test_decode_checksum() {
        let n = Notification::Checksum {
            offset: 100,
            crc: 0xDEAD_BEEF,
        };
        assert_eq!(Notification::decode(&n.encode()).unwrap(), n);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Notification::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(
            Notification::decode(&[0x7F]),
            Err(ProtocolError::UnknownOpcode(0x7F))
        );
        assert!(matches!(
            Notification::decode(&[OP_PACKET_RECEIPT, 0x01]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert_eq!(
            Notification::decode(&[OP_RESPONSE, OP_VALIDATE, 0x42]),
            Err(ProtocolError::UnknownStatus(0x42))
        );
    }

    #[test]
    fn test_command_display() {
        assert_eq!(ControlCommand::Validate.to_string(), "VALIDATE");
        assert_eq!(
            ControlCommand::EnterDfuMode {
                kind: PartKind::Application
            }
            .to_string(),
            "ENTER_DFU_MODE(application)"
        );
    }
}
