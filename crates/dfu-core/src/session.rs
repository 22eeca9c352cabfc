//! DFU session: configuration, errors and the run loop.
//!
//! A [`DfuSession`] owns one firmware image and a lease on one transport.
//! [`DfuSession::run`] drives the state machine on the calling thread and
//! picks up [`SessionCommand`]s from its [`SessionHandle`] at safe points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::{DfuEvent, DfuObserver, ErrorCode, LogLevel, PacketDirection};
use crate::firmware::{FirmwareImage, ImageError};
use crate::progress::ProgressTracker;
use crate::protocol::constants::*;
use crate::protocol::{ControlCommand, Notification, Opcode, ResponseStatus};
use crate::state::handlers::{HandlerContext, run_machine};
use crate::state::machine::{DfuState, StateMachineContext};
use crate::transport::{
    Channel, DfuTransport, ReceivedPacket, SharedTransport, TransportError, TransportLease,
};

/// Configuration for a DFU session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Extra `EnterDfuMode` attempts after the first one times out.
    pub mode_switch_retries: u32,
    /// How long to wait for any control point notification.
    pub response_timeout_ms: u64,
    /// Data writes between packet receipts. 0 checks only at part boundaries.
    pub packet_receipt_interval: u16,
    /// Bytes of each ATT write taken by the protocol header.
    pub att_overhead: usize,
    /// Level at which every packet is logged.
    pub packet_log_level: LogLevel,
    /// Drop the link once the firmware is activated.
    pub disconnect_on_complete: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode_switch_retries: DEFAULT_MODE_SWITCH_RETRIES,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            packet_receipt_interval: DEFAULT_PACKET_RECEIPT_INTERVAL,
            att_overhead: ATT_HEADER_SIZE,
            packet_log_level: LogLevel::Trace,
            disconnect_on_complete: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Payload bytes per data write for the given MTU.
    pub fn chunk_size(&self, mtu: usize) -> usize {
        mtu.saturating_sub(self.att_overhead).max(1)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("A session is already running on this transport")]
    AlreadyRunning,

    #[error("Device did not enter DFU mode after {attempts} attempts")]
    DeviceUnresponsive { attempts: u32 },

    #[error("Part {part} failed integrity check: {reason}")]
    IntegrityCheckFailed { part: usize, reason: String },

    #[error("Packet receipt reported {reported} bytes, {expected} sent")]
    ReceiptMismatch { expected: usize, reported: u32 },

    #[error("Aborted by user")]
    Aborted,

    #[error("Device rejected {request}: {status}")]
    Remote {
        request: Opcode,
        status: ResponseStatus,
    },

    #[error("Expected response to {expected}, got {got}")]
    UnexpectedNotification { expected: Opcode, got: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: DfuState, to: DfuState },

    #[error("Session worker panicked")]
    WorkerPanicked,
}

impl SessionError {
    /// Code reported in [`DfuEvent::Error`].
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotReady(_) => ErrorCode::NotReady,
            SessionError::AlreadyRunning => ErrorCode::AlreadyRunning,
            SessionError::DeviceUnresponsive { .. } => ErrorCode::DeviceUnresponsive,
            SessionError::IntegrityCheckFailed { .. } | SessionError::ReceiptMismatch { .. } => {
                ErrorCode::IntegrityCheckFailed
            }
            SessionError::Aborted
            | SessionError::IllegalTransition { .. }
            | SessionError::WorkerPanicked => ErrorCode::Aborted,
            SessionError::Remote { .. } | SessionError::UnexpectedNotification { .. } => {
                ErrorCode::RemoteError
            }
            SessionError::Transport(TransportError::Timeout { .. }) => ErrorCode::TransportTimeout,
            SessionError::Transport(TransportError::NotConnected) => ErrorCode::NotConnected,
            SessionError::Transport(TransportError::Protocol(_)) => ErrorCode::RemoteError,
            SessionError::Transport(_) => ErrorCode::TransportFailure,
            SessionError::Image(ImageError::ChecksumMismatch { .. }) => ErrorCode::ChecksumMismatch,
            SessionError::Image(_) => ErrorCode::InvalidFormat,
        }
    }
}

/// User commands, applied in order at the next safe point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Pause,
    Resume,
    Abort,
}

/// State shared between a running session and its handles.
#[derive(Debug, Default)]
pub struct SessionStatus {
    state: Mutex<DfuState>,
    paused: AtomicBool,
}

impl SessionStatus {
    pub fn state(&self) -> DfuState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: DfuState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.paused
            .store(state == DfuState::Paused, Ordering::Release);
    }
}

/// Cloneable remote control for one session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
    status: Arc<SessionStatus>,
}

impl SessionHandle {
    /// Queue a command. `false` once the session has finished.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn state(&self) -> DfuState {
        self.status.state()
    }

    pub fn is_paused(&self) -> bool {
        self.status.is_paused()
    }

    /// Record the end of a session whose worker died without reporting.
    pub(crate) fn mark_aborted(&self) {
        self.status.set_state(DfuState::Aborted);
    }
}

/// DFU Session - drives one image through one transport.
pub struct DfuSession<T: DfuTransport, O: DfuObserver> {
    config: SessionConfig,
    lease: TransportLease<T>,
    observer: O,
    image: FirmwareImage,
    commands: Receiver<SessionCommand>,
    status: Arc<SessionStatus>,
}

impl<T: DfuTransport, O: DfuObserver> DfuSession<T, O> {
    /// Check preconditions and claim the transport.
    ///
    /// Fails before any I/O with `NotReady` if the link is down,
    /// `AlreadyRunning` if another session holds the transport, and
    /// `InvalidFormat` if a secure bootloader would get a part without an
    /// init packet.
    pub fn new(
        transport: &Arc<SharedTransport<T>>,
        image: FirmwareImage,
        config: SessionConfig,
        observer: O,
    ) -> Result<(Self, SessionHandle), SessionError> {
        if !transport.inner().is_connected() {
            return Err(SessionError::NotReady(
                "transport is not connected to a peripheral".into(),
            ));
        }
        let lease = transport.lease().ok_or(SessionError::AlreadyRunning)?;

        let variant = lease.variant();
        if variant.requires_init_packet() && !image.has_init_packets() {
            return Err(ImageError::InvalidFormat(format!(
                "{variant} requires an init packet for every part"
            ))
            .into());
        }

        let (tx, rx) = mpsc::channel();
        let status = Arc::new(SessionStatus::default());
        let handle = SessionHandle {
            commands: tx,
            status: Arc::clone(&status),
        };

        Ok((
            Self {
                config,
                lease,
                observer,
                image,
                commands: rx,
                status,
            },
            handle,
        ))
    }

    /// Run the session to a terminal state.
    ///
    /// Emits exactly one terminal event and releases the transport before
    /// returning.
    #[instrument(skip(self), fields(image = %self.image.id(), parts = self.image.part_count()))]
    pub fn run(self) -> Result<(), SessionError> {
        let DfuSession {
            config,
            lease,
            observer,
            image,
            commands,
            status,
        } = self;

        let transport = ObservableTransport {
            inner: &*lease,
            observer: &observer,
            level: config.packet_log_level,
        };
        let mut state = StateMachineContext::new();
        let mut ctx = HandlerContext {
            transport: &transport,
            observer: &observer,
            state: &mut state,
            image: &image,
            config: &config,
            commands: &commands,
            progress: ProgressTracker::new(image.part_count()),
            status: &status,
        };

        info!(size = image.total_size(), "Starting DFU");
        let result = run_machine(&mut ctx);

        match &result {
            Ok(()) => {
                info!("DFU finished");
                ctx.emit(DfuEvent::Completed);
            }
            Err(err) => {
                warn!(error = %err, "DFU failed");
                if transport.is_connected() {
                    if let Err(e) = transport.send_command(&ControlCommand::Reset) {
                        debug!(error = %e, "Reset not delivered");
                    }
                    if let Err(e) = transport.disconnect() {
                        debug!(error = %e, "Disconnect failed");
                    }
                }
                ctx.transition(DfuState::Aborted);
                ctx.emit(DfuEvent::Error {
                    code: err.code(),
                    message: err.to_string(),
                });
            }
        }

        drop(lease);
        result
    }
}

/// Transport wrapper that logs and emits packet events.
struct ObservableTransport<'a, T: DfuTransport, O: DfuObserver> {
    inner: &'a T,
    observer: &'a O,
    level: LogLevel,
}

impl<T: DfuTransport, O: DfuObserver> ObservableTransport<'_, T, O> {
    fn record(&self, direction: PacketDirection, channel: Channel, summary: String, data: &[u8]) {
        match self.level {
            LogLevel::Trace => tracing::trace!(dir = %direction, channel = %channel, len = data.len(), "{}", summary),
            LogLevel::Debug => tracing::debug!(dir = %direction, channel = %channel, len = data.len(), "{}", summary),
            LogLevel::Info => tracing::info!(dir = %direction, channel = %channel, len = data.len(), "{}", summary),
            LogLevel::Warn => tracing::warn!(dir = %direction, channel = %channel, len = data.len(), "{}", summary),
            LogLevel::Error => tracing::error!(dir = %direction, channel = %channel, len = data.len(), "{}", summary),
        }

        self.observer.on_event(&DfuEvent::Packet {
            direction,
            channel,
            summary,
            length: data.len(),
            data: Some(data.iter().take(32).cloned().collect()),
        });
    }
}

impl<T: DfuTransport, O: DfuObserver> DfuTransport for ObservableTransport<'_, T, O> {
    fn connect(&self) -> Result<usize, TransportError> {
        self.inner.connect()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn mtu(&self) -> usize {
        self.inner.mtu()
    }

    fn write_control(&self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write_control(data)?;
        let summary = ControlCommand::decode(data)
            .map(|c| c.to_string())
            .unwrap_or_else(|_| "raw control write".into());
        self.record(PacketDirection::Tx, Channel::Control, summary, data);
        Ok(())
    }

    fn write_data(&self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write_data(data)?;
        self.record(
            PacketDirection::Tx,
            Channel::Data,
            format!("DATA({}B)", data.len()),
            data,
        );
        Ok(())
    }

    fn recv_notification(&self, timeout: Duration) -> Result<ReceivedPacket, TransportError> {
        let packet = self.inner.recv_notification(timeout)?;
        let summary = Notification::decode(&packet.data)
            .map(|n| format!("{n:?}"))
            .unwrap_or_else(|e| format!("undecodable notification: {e}"));
        self.record(PacketDirection::Rx, packet.channel, summary, &packet.data);
        Ok(packet)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.disconnect()
    }

    fn variant(&self) -> crate::peripheral::DfuVariant {
        self.inner.variant()
    }

    fn send_command(&self, command: &ControlCommand) -> Result<(), TransportError> {
        self.inner.send_command(command)?;
        self.record(
            PacketDirection::Tx,
            Channel::Control,
            command.to_string(),
            &command.encode(),
        );
        Ok(())
    }

    fn read_response(&self, timeout: Duration) -> Result<Notification, TransportError> {
        let notification = self.inner.read_response(timeout)?;
        self.record(
            PacketDirection::Rx,
            Channel::Control,
            format!("{notification:?}"),
            &notification.encode(),
        );
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::firmware::{FirmwarePart, PartKind};
    use crate::transport::MockTransport;

    fn image() -> FirmwareImage {
        FirmwareImage::from_bin("app.bin", vec![0x5A; 64]).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.mode_switch_retries, 3);
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.packet_receipt_interval, 4);
        assert_eq!(config.chunk_size(23), 20);
        assert_eq!(config.chunk_size(2), 1);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dfu.toml");

        let config = SessionConfig {
            packet_receipt_interval: 12,
            packet_log_level: LogLevel::Debug,
            ..SessionConfig::default()
        };
        config.save_to_file(&path).unwrap();

        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig =
            toml::from_str("mode_switch_retries = 1\npacket_log_level = \"info\"\n").unwrap();
        assert_eq!(config.mode_switch_retries, 1);
        assert_eq!(config.packet_log_level, LogLevel::Info);
        assert_eq!(config.response_timeout_ms, DEFAULT_RESPONSE_TIMEOUT_MS);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SessionError::Transport(TransportError::Timeout { timeout_ms: 1 }).code(),
            ErrorCode::TransportTimeout
        );
        assert_eq!(
            SessionError::Image(ImageError::ChecksumMismatch {
                part: PartKind::Application,
                field: "crc32",
                declared: 1,
                computed: 2,
            })
            .code(),
            ErrorCode::ChecksumMismatch
        );
        assert_eq!(
            SessionError::Image(ImageError::Empty).code(),
            ErrorCode::InvalidFormat
        );
        assert_eq!(
            SessionError::ReceiptMismatch {
                expected: 80,
                reported: 60,
            }
            .code(),
            ErrorCode::IntegrityCheckFailed
        );
    }

    #[test]
    fn test_run_on_calling_thread() {
        let transport = SharedTransport::new(MockTransport::new());
        let config = SessionConfig {
            packet_receipt_interval: 0,
            ..SessionConfig::default()
        };

        let (session, handle) = DfuSession::new(&transport, image(), config, NullObserver).unwrap();
        assert!(transport.is_leased());
        session.run().unwrap();

        assert_eq!(handle.state(), DfuState::Completed);
        assert!(!handle.send(SessionCommand::Abort));
        assert!(!transport.is_leased());
        assert!(
            transport
                .inner()
                .commands()
                .contains(&ControlCommand::PacketReceiptRequest { interval: 0 })
        );
    }

    #[test]
    fn test_abort_queued_before_run() {
        let transport = SharedTransport::new(MockTransport::new());
        let (session, handle) =
            DfuSession::new(&transport, image(), SessionConfig::default(), NullObserver).unwrap();

        assert!(handle.send(SessionCommand::Abort));
        assert!(matches!(session.run(), Err(SessionError::Aborted)));

        assert_eq!(handle.state(), DfuState::Aborted);
        assert_eq!(transport.inner().commands(), vec![ControlCommand::Reset]);
    }

    /// Device that under-reports every packet receipt by one byte.
    struct ShortReceipts(MockTransport);

    impl DfuTransport for ShortReceipts {
        fn connect(&self) -> Result<usize, TransportError> {
            self.0.connect()
        }

        fn is_connected(&self) -> bool {
            self.0.is_connected()
        }

        fn mtu(&self) -> usize {
            self.0.mtu()
        }

        fn write_control(&self, data: &[u8]) -> Result<(), TransportError> {
            self.0.write_control(data)
        }

        fn write_data(&self, data: &[u8]) -> Result<(), TransportError> {
            self.0.write_data(data)
        }

        fn recv_notification(&self, timeout: Duration) -> Result<ReceivedPacket, TransportError> {
            let mut packet = self.0.recv_notification(timeout)?;
            if let Ok(Notification::PacketReceipt { bytes }) = Notification::decode(&packet.data) {
                packet.data = Notification::PacketReceipt { bytes: bytes - 1 }.encode();
            }
            Ok(packet)
        }

        fn disconnect(&self) -> Result<(), TransportError> {
            self.0.disconnect()
        }
    }

    #[test]
    fn test_receipt_mismatch_is_fatal() {
        let transport = SharedTransport::new(ShortReceipts(MockTransport::new()));
        let part = FirmwarePart::new(PartKind::Application, vec![1; 200]);
        let image = FirmwareImage::from_parts("app", vec![part]).unwrap();
        let (session, _handle) =
            DfuSession::new(&transport, image, SessionConfig::default(), NullObserver).unwrap();

        assert!(matches!(
            session.run(),
            Err(SessionError::ReceiptMismatch {
                expected: 80,
                reported: 79,
            })
        ));
        assert_eq!(transport.inner().0.data_writes().len(), 4);
    }
}
