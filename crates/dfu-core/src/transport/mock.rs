//! Mock BLE transport for testing.
//!
//! Behaves like a lossless bootloader: it decodes control point writes and
//! queues the notifications a real device would send back.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::traits::{Channel, DfuTransport, ReceivedPacket, TransportError};
use crate::firmware::{PartKind, crc32};
use crate::peripheral::DfuVariant;
use crate::protocol::{
    ATT_HEADER_SIZE, ControlCommand, DEFAULT_MTU, Notification, Opcode, ResponseStatus,
};

/// Fault injection knobs.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Never answer `EnterDfuMode`.
    pub drop_mode_acks: bool,
    /// Hold back the acknowledgement of the first N `EnterDfuMode` writes
    /// until the next one arrives, as a slow device would.
    pub late_mode_acks: u32,
    /// Never send packet receipts.
    pub drop_receipts: bool,
    /// Lose the link after this many firmware data writes.
    pub disconnect_after_chunks: Option<usize>,
    /// Flip bits in every reported checksum.
    pub corrupt_checksum: bool,
    pub mtu: usize,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            drop_mode_acks: false,
            late_mode_acks: 0,
            drop_receipts: false,
            disconnect_after_chunks: None,
            corrupt_checksum: false,
            mtu: DEFAULT_MTU,
        }
    }
}

#[derive(Debug, Default)]
struct Device {
    connected: bool,
    receipt_interval: u16,
    part: Option<(PartKind, usize)>,
    buffer: Vec<u8>,
    receiving: bool,
    chunks_since_receipt: u16,
    init_remaining: usize,
    init_data: Vec<u8>,
    /// Completed parts, in upload order.
    received: Vec<Vec<u8>>,
    init_packets: Vec<Vec<u8>>,
    mode_requests: u32,
    held_mode_acks: u32,
    firmware_writes: usize,
}

/// Mock transport for unit testing state machine logic.
pub struct MockTransport {
    behavior: MockBehavior,
    variant: DfuVariant,
    device: Mutex<Device>,
    /// Queued notifications to return on read.
    notifications: Mutex<VecDeque<Vec<u8>>>,
    /// Captured writes.
    write_log: Mutex<Vec<(Channel, Vec<u8>)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            variant: DfuVariant::Legacy,
            device: Mutex::new(Device {
                connected: true,
                ..Device::default()
            }),
            notifications: Mutex::new(VecDeque::new()),
            write_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_variant(mut self, variant: DfuVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Queue a notification to be returned on next read.
    pub fn queue_notification(&self, notification: &Notification) {
        lock(&self.notifications).push_back(notification.encode());
    }

    /// Queue raw notification bytes.
    pub fn queue_raw(&self, data: &[u8]) {
        lock(&self.notifications).push_back(data.to_vec());
    }

    /// Get all captured control point writes.
    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        self.writes_on(Channel::Control)
    }

    /// Get all captured packet characteristic writes.
    pub fn data_writes(&self) -> Vec<Vec<u8>> {
        self.writes_on(Channel::Data)
    }

    /// Decoded control point writes.
    pub fn commands(&self) -> Vec<ControlCommand> {
        self.control_writes()
            .iter()
            .filter_map(|w| ControlCommand::decode(w).ok())
            .collect()
    }

    /// Firmware payloads the device has fully received.
    pub fn received_parts(&self) -> Vec<Vec<u8>> {
        lock(&self.device).received.clone()
    }

    pub fn received_init_packets(&self) -> Vec<Vec<u8>> {
        lock(&self.device).init_packets.clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        lock(&self.write_log).clear();
    }

    /// Simulate link restore.
    pub fn reconnect(&self) {
        lock(&self.device).connected = true;
    }

    fn writes_on(&self, channel: Channel) -> Vec<Vec<u8>> {
        lock(&self.write_log)
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, data)| data.clone())
            .collect()
    }

    fn reply(&self, notification: Notification) {
        self.queue_notification(&notification);
    }

    fn handle_command(&self, command: ControlCommand) {
        let mut device = lock(&self.device);
        match command {
            ControlCommand::EnterDfuMode { .. } => {
                if self.behavior.drop_mode_acks {
                    return;
                }
                device.mode_requests += 1;
                if device.mode_requests <= self.behavior.late_mode_acks {
                    device.held_mode_acks += 1;
                    return;
                }
                for _ in 0..=std::mem::take(&mut device.held_mode_acks) {
                    self.reply(Notification::success(Opcode::EnterDfuMode));
                }
            }
            ControlCommand::PacketReceiptRequest { interval } => {
                device.receipt_interval = interval;
            }
            ControlCommand::StartPart { kind, size } => {
                device.part = Some((kind, size as usize));
                device.buffer.clear();
                device.receiving = false;
                self.reply(Notification::success(Opcode::StartPart));
            }
            ControlCommand::InitPacket { len } => {
                device.init_remaining = len as usize;
                device.init_data.clear();
            }
            ControlCommand::ReceiveFirmware => {
                if device.part.is_some() {
                    device.receiving = true;
                    device.chunks_since_receipt = 0;
                } else {
                    self.reply(Notification::Response {
                        request: Opcode::ReceiveFirmware,
                        status: ResponseStatus::InvalidState,
                    });
                }
            }
            ControlCommand::CalculateChecksum { part } => {
                match device.received.get(part as usize) {
                    Some(data) => {
                        let mut crc = crc32(data);
                        if self.behavior.corrupt_checksum {
                            crc ^= 0xFFFF_FFFF;
                        }
                        self.reply(Notification::Checksum {
                            offset: data.len() as u32,
                            crc,
                        });
                    }
                    None => self.reply(Notification::Response {
                        request: Opcode::CalculateChecksum,
                        status: ResponseStatus::InvalidState,
                    }),
                }
            }
            ControlCommand::Validate => self.reply(Notification::success(Opcode::Validate)),
            ControlCommand::ActivateAndReset => {
                self.reply(Notification::success(Opcode::ActivateAndReset))
            }
            ControlCommand::Reset => {
                device.receiving = false;
                device.part = None;
            }
        }
    }

    fn handle_data(&self, data: &[u8]) {
        let mut device = lock(&self.device);

        if device.init_remaining > 0 {
            let take = data.len().min(device.init_remaining);
            device.init_data.extend_from_slice(&data[..take]);
            device.init_remaining -= take;
            if device.init_remaining == 0 {
                let init = std::mem::take(&mut device.init_data);
                device.init_packets.push(init);
                self.reply(Notification::success(Opcode::InitPacket));
            }
            return;
        }

        let Some((_, size)) = device.part else {
            return;
        };
        if !device.receiving {
            return;
        }

        device.buffer.extend_from_slice(data);
        device.chunks_since_receipt += 1;
        device.firmware_writes += 1;
        if self
            .behavior
            .disconnect_after_chunks
            .is_some_and(|n| device.firmware_writes >= n)
        {
            device.connected = false;
        }

        if device.buffer.len() >= size {
            let part = std::mem::take(&mut device.buffer);
            device.received.push(part);
            device.receiving = false;
            device.part = None;
            self.reply(Notification::success(Opcode::ReceiveFirmware));
        } else if device.receipt_interval > 0
            && device.chunks_since_receipt >= device.receipt_interval
            && !self.behavior.drop_receipts
        {
            device.chunks_since_receipt = 0;
            self.reply(Notification::PacketReceipt {
                bytes: device.buffer.len() as u32,
            });
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if lock(&self.device).connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuTransport for MockTransport {
    fn connect(&self) -> Result<usize, TransportError> {
        lock(&self.device).connected = true;
        Ok(self.behavior.mtu)
    }

    fn is_connected(&self) -> bool {
        lock(&self.device).connected
    }

    fn mtu(&self) -> usize {
        self.behavior.mtu
    }

    fn write_control(&self, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        lock(&self.write_log).push((Channel::Control, data.to_vec()));

        let command = ControlCommand::decode(data)?;
        self.handle_command(command);
        Ok(())
    }

    fn write_data(&self, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let max = self.behavior.mtu.saturating_sub(ATT_HEADER_SIZE);
        if data.len() > max {
            return Err(TransportError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }
        lock(&self.write_log).push((Channel::Data, data.to_vec()));

        self.handle_data(data);
        Ok(())
    }

    fn recv_notification(&self, timeout: Duration) -> Result<ReceivedPacket, TransportError> {
        self.ensure_connected()?;
        lock(&self.notifications)
            .pop_front()
            .map(|data| ReceivedPacket {
                channel: Channel::Control,
                data,
            })
            .ok_or(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        lock(&self.device).connected = false;
        Ok(())
    }

    fn variant(&self) -> DfuVariant {
        self.variant
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(mock: &MockTransport) -> Notification {
        mock.read_response(Duration::from_millis(1)).unwrap()
    }

    #[test]
    fn test_mock_answers_mode_switch() {
        let mock = MockTransport::new();
        mock.send_command(&ControlCommand::EnterDfuMode {
            kind: PartKind::Application,
        })
        .unwrap();

        assert_eq!(read(&mock), Notification::success(Opcode::EnterDfuMode));
    }

    #[test]
    fn test_mock_drops_mode_acks() {
        let mock = MockTransport::with_behavior(MockBehavior {
            drop_mode_acks: true,
            ..MockBehavior::default()
        });
        mock.send_command(&ControlCommand::EnterDfuMode {
            kind: PartKind::Application,
        })
        .unwrap();

        assert!(matches!(
            mock.read_response(Duration::from_millis(1)),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mock_late_mode_ack() {
        let mock = MockTransport::with_behavior(MockBehavior {
            late_mode_acks: 1,
            ..MockBehavior::default()
        });
        let enter = ControlCommand::EnterDfuMode {
            kind: PartKind::Application,
        };

        mock.send_command(&enter).unwrap();
        assert!(mock.read_response(Duration::from_millis(1)).is_err());

        mock.send_command(&enter).unwrap();
        assert_eq!(read(&mock), Notification::success(Opcode::EnterDfuMode));
        assert_eq!(read(&mock), Notification::success(Opcode::EnterDfuMode));
    }

    #[test]
    fn test_mock_link_loss_after_chunks() {
        let mock = MockTransport::with_behavior(MockBehavior {
            disconnect_after_chunks: Some(2),
            ..MockBehavior::default()
        });
        mock.send_command(&ControlCommand::StartPart {
            kind: PartKind::Application,
            size: 100,
        })
        .unwrap();
        read(&mock);
        mock.send_command(&ControlCommand::ReceiveFirmware).unwrap();

        mock.write_data(&[1; 20]).unwrap();
        mock.write_data(&[2; 20]).unwrap();
        assert!(!mock.is_connected());
        assert!(matches!(
            mock.write_data(&[3; 20]),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_mock_part_receipts() {
        let mock = MockTransport::new();
        mock.send_command(&ControlCommand::PacketReceiptRequest { interval: 2 })
            .unwrap();
        mock.send_command(&ControlCommand::StartPart {
            kind: PartKind::Application,
            size: 50,
        })
        .unwrap();
        assert_eq!(read(&mock), Notification::success(Opcode::StartPart));
        mock.send_command(&ControlCommand::ReceiveFirmware).unwrap();

        mock.write_data(&[1; 20]).unwrap();
        mock.write_data(&[2; 20]).unwrap();
        assert_eq!(read(&mock), Notification::PacketReceipt { bytes: 40 });

        mock.write_data(&[3; 10]).unwrap();
        assert_eq!(read(&mock), Notification::success(Opcode::ReceiveFirmware));

        mock.send_command(&ControlCommand::CalculateChecksum { part: 0 })
            .unwrap();
        let Notification::Checksum { offset, crc } = read(&mock) else {
            panic!("expected checksum");
        };
        assert_eq!(offset, 50);
        assert_eq!(crc, crc32(&mock.received_parts()[0]));
    }

    #[test]
    fn test_mock_init_packet() {
        let mock = MockTransport::new();
        mock.send_command(&ControlCommand::StartPart {
            kind: PartKind::Application,
            size: 4,
        })
        .unwrap();
        read(&mock);
        mock.send_command(&ControlCommand::InitPacket { len: 3 })
            .unwrap();
        mock.write_data(&[0xAA, 0xBB, 0xCC]).unwrap();

        assert_eq!(read(&mock), Notification::success(Opcode::InitPacket));
        assert_eq!(mock.received_init_packets(), vec![vec![0xAA, 0xBB, 0xCC]]);
    }

    #[test]
    fn test_mock_rejects_oversized_write() {
        let mock = MockTransport::new();
        assert!(matches!(
            mock.write_data(&[0; 21]),
            Err(TransportError::PayloadTooLarge { len: 21, max: 20 })
        ));
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect().unwrap();
        assert!(!mock.is_connected());
        assert!(matches!(
            mock.write_control(&[0x04]),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.send_command(&ControlCommand::Validate).unwrap();
        mock.write_data(b"data").unwrap();

        assert_eq!(mock.commands(), vec![ControlCommand::Validate]);
        assert_eq!(mock.data_writes(), vec![b"data".to_vec()]);

        mock.clear_writes();
        assert!(mock.control_writes().is_empty());
    }
}
