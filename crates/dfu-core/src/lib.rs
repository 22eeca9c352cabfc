//! DFU-Core: BLE Device Firmware Update engine in Rust.
//!
//! This crate drives a firmware update of a Nordic-style bootloader over a
//! GATT link: switch the device into DFU mode, stream every firmware part
//! in MTU-sized chunks with periodic packet receipts, verify CRCs, then
//! activate the new firmware.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: UUIDs, control point commands and notifications
//! - **Firmware**: zip package / raw binary loading and validation
//! - **Transport**: GATT channel abstraction (btleplug, mock)
//! - **State**: State machine and phase handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Progress**: Percent and speed figures
//! - **Session**: One update attempt on one transport
//! - **Controller**: Thread-safe start/pause/resume/abort facade
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dfu_core::{FirmwareImage, MockTransport, SessionConfig, SessionController, SharedTransport, TracingObserver};
//!
//! let image = FirmwareImage::load(std::path::Path::new("app_dfu_package.zip")).expect("bad package");
//! let transport = SharedTransport::new(MockTransport::new());
//!
//! let controller = SessionController::new(SessionConfig::default());
//! controller.register(Arc::new(TracingObserver));
//! controller.start(&transport, image).expect("not ready");
//! controller.wait().expect("DFU failed");
//! ```

pub mod controller;
pub mod events;
pub mod firmware;
pub mod peripheral;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use controller::SessionController;
pub use events::{
    DfuEvent, DfuObserver, ErrorCode, LogLevel, NullObserver, ObserverSet, PacketDirection,
    TracingObserver,
};
pub use firmware::{FirmwareImage, FirmwarePart, ImageError, ImageSource, PartKind};
pub use peripheral::{DfuVariant, DiscoveredPeripherals, PeripheralRef};
pub use progress::{ProgressSample, ProgressTracker};
pub use protocol::{ControlCommand, Notification, ProtocolError};
pub use session::{
    DfuSession, SessionCommand, SessionConfig, SessionError, SessionHandle, SessionStatus,
};
pub use state::DfuState;
#[cfg(feature = "ble")]
pub use transport::BleTransport;
pub use transport::{DfuTransport, MockTransport, SharedTransport, TransportError};
