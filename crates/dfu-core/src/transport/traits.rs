//! BLE transport layer abstraction.
//!
//! Defines the `DfuTransport` trait for the two DFU channels,
//! allowing different implementations (btleplug, mock, etc.).

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::peripheral::DfuVariant;
use crate::protocol::{ControlCommand, Notification, ProtocolError};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Payload of {len} bytes exceeds {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// The two DFU characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Control point: commands out, notifications in.
    Control,
    /// Packet characteristic: firmware and init packet bytes.
    Data,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => write!(f, "CTRL"),
            Channel::Data => write!(f, "DATA"),
        }
    }
}

/// Raw inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub channel: Channel,
    pub data: Vec<u8>,
}

/// Abstract DFU transport interface.
///
/// The link is owned by the caller and is expected to be connected before a
/// session starts. `connect` is idempotent and reports the negotiated MTU.
///
/// `send_command` and `read_response` frame commands with the default
/// control point encoding; a transport that speaks a different framing
/// overrides them.
pub trait DfuTransport: Send + Sync {
    /// Prepare both channels and return the ATT MTU.
    fn connect(&self) -> Result<usize, TransportError>;

    fn is_connected(&self) -> bool;

    /// ATT MTU negotiated at connect time.
    fn mtu(&self) -> usize;

    /// Write to the control point (acknowledged by the link layer).
    fn write_control(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Write to the packet characteristic. `data` must fit in one ATT write.
    fn write_data(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next notification.
    fn recv_notification(&self, timeout: Duration) -> Result<ReceivedPacket, TransportError>;

    fn disconnect(&self) -> Result<(), TransportError>;

    /// Bootloader variant behind this link.
    fn variant(&self) -> DfuVariant {
        DfuVariant::Legacy
    }

    fn send_command(&self, command: &ControlCommand) -> Result<(), TransportError> {
        self.write_control(&command.encode())
    }

    fn read_response(&self, timeout: Duration) -> Result<Notification, TransportError> {
        match self.notifications(timeout).next() {
            Some(Ok(packet)) => Ok(Notification::decode(&packet.data)?),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Inbound notifications, polled every `poll`.
    fn notifications(&self, poll: Duration) -> Notifications<'_, Self> {
        Notifications {
            transport: self,
            poll,
            done: false,
        }
    }
}

/// Lazy stream of inbound notifications.
///
/// Yields `Err(Timeout)` for every quiet poll interval while the link is up.
/// Ends for good once the link drops or a non-timeout error was yielded.
pub struct Notifications<'a, T: ?Sized> {
    transport: &'a T,
    poll: Duration,
    done: bool,
}

impl<T: DfuTransport + ?Sized> Iterator for Notifications<'_, T> {
    type Item = Result<ReceivedPacket, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || !self.transport.is_connected() {
            self.done = true;
            return None;
        }

        match self.transport.recv_notification(self.poll) {
            Ok(packet) => Some(Ok(packet)),
            Err(e @ TransportError::Timeout { .. }) => Some(Err(e)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<T: DfuTransport + ?Sized> std::iter::FusedIterator for Notifications<'_, T> {}

/// Transport that admits one session at a time.
pub struct SharedTransport<T> {
    inner: T,
    active: AtomicBool,
}

impl<T: DfuTransport> SharedTransport<T> {
    pub fn new(inner: T) -> Arc<Self> {
        Arc::new(Self {
            inner,
            active: AtomicBool::new(false),
        })
    }

    /// Claim the transport for a session. `None` while another lease lives.
    pub fn lease(self: &Arc<Self>) -> Option<TransportLease<T>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TransportLease {
                shared: Arc::clone(self),
            })
    }

    pub fn is_leased(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Direct access for link setup and inspection outside a session.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

/// Exclusive use of a [`SharedTransport`], released on drop.
pub struct TransportLease<T: DfuTransport> {
    shared: Arc<SharedTransport<T>>,
}

impl<T: DfuTransport> Deref for TransportLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.shared.inner
    }
}

impl<T: DfuTransport> Drop for TransportLease<T> {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        tracing::debug!("Transport released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, ResponseStatus};
    use crate::transport::MockTransport;

    #[test]
    fn test_single_lease() {
        let shared = SharedTransport::new(MockTransport::new());

        let lease = shared.lease().unwrap();
        assert!(shared.is_leased());
        assert!(shared.lease().is_none());

        drop(lease);
        assert!(!shared.is_leased());
        assert!(shared.lease().is_some());
    }

    #[test]
    fn test_read_response_decodes() {
        let mock = MockTransport::new();
        mock.queue_notification(&Notification::success(Opcode::Validate));

        let response = mock.read_response(Duration::from_millis(10)).unwrap();
        assert_eq!(
            response,
            Notification::Response {
                request: Opcode::Validate,
                status: ResponseStatus::Success,
            }
        );
        assert!(matches!(
            mock.read_response(Duration::from_millis(10)),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_notifications_end_on_disconnect() {
        let mock = MockTransport::new();
        mock.queue_notification(&Notification::PacketReceipt { bytes: 20 });

        let mut stream = mock.notifications(Duration::from_millis(10));
        assert!(matches!(stream.next(), Some(Ok(_))));
        assert!(matches!(
            stream.next(),
            Some(Err(TransportError::Timeout { .. }))
        ));

        mock.disconnect().unwrap();
        assert!(stream.next().is_none());

        mock.reconnect();
        assert!(stream.next().is_none());
    }
}
