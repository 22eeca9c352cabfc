//! Protocol constants for Nordic-style BLE DFU.
//!
//! Service identifiers come from the legacy (SDK 11 and older) and secure
//! (SDK 12+) bootloaders. Opcodes follow the legacy control point layout;
//! the part/checksum opcodes are this crate's extensions of it.

use uuid::Uuid;

// ============================================================================
// GATT Services
// ============================================================================

/// Legacy DFU service.
pub const LEGACY_DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1530_1212_efde_1523_785f_eabc_d123);
/// Legacy DFU control point (write with response, notify).
pub const LEGACY_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_1531_1212_efde_1523_785f_eabc_d123);
/// Legacy DFU packet characteristic (write without response).
pub const LEGACY_PACKET_UUID: Uuid = Uuid::from_u128(0x0000_1532_1212_efde_1523_785f_eabc_d123);

/// Secure DFU service (16-bit 0xFE59).
pub const SECURE_DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fe59_0000_1000_8000_0080_5f9b_34fb);
/// Secure DFU control point.
pub const SECURE_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x8ec9_0001_f315_4f60_9fb8_8388_30da_ea50);
/// Secure DFU packet characteristic.
pub const SECURE_PACKET_UUID: Uuid = Uuid::from_u128(0x8ec9_0002_f315_4f60_9fb8_8388_30da_ea50);

/// Heart Rate service. Legacy buttonless sample apps advertise this instead
/// of the DFU service.
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

// ============================================================================
// Link
// ============================================================================

/// Default ATT MTU before any exchange.
pub const DEFAULT_MTU: usize = 23;
/// ATT write header (opcode + handle).
pub const ATT_HEADER_SIZE: usize = 3;

// ============================================================================
// Session defaults
// ============================================================================

/// Mode switch is re-sent this many times after the first attempt.
pub const DEFAULT_MODE_SWITCH_RETRIES: u32 = 3;
/// Time to wait for any control point notification.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5000;
/// Chunks between packet receipt notifications.
pub const DEFAULT_PACKET_RECEIPT_INTERVAL: u16 = 4;

// ============================================================================
// Control point opcodes (host -> device)
// ============================================================================

pub const OP_ENTER_DFU_MODE: u8 = 0x01;
pub const OP_INIT_PACKET: u8 = 0x02;
pub const OP_RECEIVE_FIRMWARE: u8 = 0x03;
pub const OP_VALIDATE: u8 = 0x04;
pub const OP_ACTIVATE_AND_RESET: u8 = 0x05;
pub const OP_RESET: u8 = 0x06;
pub const OP_CALCULATE_CHECKSUM: u8 = 0x07;
pub const OP_PACKET_RECEIPT_REQUEST: u8 = 0x08;
pub const OP_START_PART: u8 = 0x09;

// ============================================================================
// Notification opcodes (device -> host)
// ============================================================================

pub const OP_RESPONSE: u8 = 0x10;
pub const OP_PACKET_RECEIPT: u8 = 0x11;
pub const OP_CHECKSUM: u8 = 0x12;
