//! Transport layer module.

#[cfg(feature = "ble")]
pub mod ble;
pub mod mock;
pub mod traits;

#[cfg(feature = "ble")]
pub use ble::{BleTransport, scan};
pub use mock::{MockBehavior, MockTransport};
pub use traits::{
    Channel, DfuTransport, Notifications, ReceivedPacket, SharedTransport, TransportError,
    TransportLease,
};
