//! Protocol module - control point commands, notifications and identifiers.

pub mod constants;
pub mod opcode;

pub use constants::*;
pub use opcode::{ControlCommand, Notification, Opcode, ProtocolError, ResponseStatus};
