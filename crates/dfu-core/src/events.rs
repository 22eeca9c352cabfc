//! Event system for UI decoupling.
//!
//! Front ends subscribe to session events through [`DfuObserver`] without
//! touching the state machine. Delivery is synchronous on the session
//! thread, so observers must return quickly.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::progress::ProgressSample;
use crate::state::DfuState;
use crate::transport::Channel;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Error codes carried by [`DfuEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotReady,
    DeviceUnresponsive,
    IntegrityCheckFailed,
    Aborted,
    TransportTimeout,
    InvalidFormat,
    ChecksumMismatch,
    AlreadyRunning,
    NotConnected,
    TransportFailure,
    RemoteError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a DFU session.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// State machine moved to a new state.
    StateChanged {
        from: DfuState,
        to: DfuState,
        description: &'static str,
    },
    /// Emitted on every chunk boundary while uploading.
    Progress(ProgressSample),
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Session failed or was aborted. Terminal.
    Error { code: ErrorCode, message: String },
    /// Packet written to or received from the peripheral.
    Packet {
        direction: PacketDirection,
        channel: Channel,
        summary: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Firmware activated. Terminal.
    Completed,
}

impl DfuEvent {
    /// Every session ends with exactly one terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DfuEvent::Completed | DfuEvent::Error { .. })
    }
}

/// Observer trait for receiving DFU events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

impl<T: DfuObserver + ?Sized> DfuObserver for Arc<T> {
    fn on_event(&self, event: &DfuEvent) {
        (**self).on_event(event)
    }
}

/// Fan-out to several observers in registration order.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn DfuObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn DfuObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl DfuObserver for ObserverSet {
    fn on_event(&self, event: &DfuEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::StateChanged {
                from,
                to,
                description,
            } => {
                tracing::info!(from = %from, to = %to, "{}", description);
            }
            DfuEvent::Progress(sample) => {
                tracing::debug!(
                    part = sample.part,
                    total = sample.total_parts,
                    progress = %format!("{}%", sample.percent),
                    "{}",
                    sample
                );
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::Error { code, message } => {
                tracing::error!(code = %code, "Error: {}", message);
            }
            DfuEvent::Packet {
                direction,
                channel,
                summary,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    channel = %channel,
                    len = length,
                    "{}",
                    summary
                );
            }
            DfuEvent::Completed => {
                tracing::info!("DFU complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        tag: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    impl DfuObserver for Recorder {
        fn on_event(&self, _event: &DfuEvent) {
            self.seen.lock().unwrap().push(self.tag);
        }
    }

    #[test]
    fn test_observer_set_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut set = ObserverSet::new();
        for tag in ["first", "second", "third"] {
            set.register(Arc::new(Recorder {
                tag,
                seen: seen.clone(),
            }));
        }

        set.on_event(&DfuEvent::Completed);
        set.on_event(&DfuEvent::Completed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first", "second", "third", "first", "second", "third"]
        );
    }

    #[test]
    fn test_terminal_events() {
        assert!(DfuEvent::Completed.is_terminal());
        assert!(
            DfuEvent::Error {
                code: ErrorCode::Aborted,
                message: "aborted".into(),
            }
            .is_terminal()
        );
        assert!(
            !DfuEvent::Log {
                level: LogLevel::Info,
                message: "hello".into(),
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_log_level_serde_names() {
        assert_eq!(
            serde_json::to_string(&LogLevel::Trace).unwrap(),
            "\"trace\""
        );
        assert_eq!(
            serde_json::from_str::<LogLevel>("\"warn\"").unwrap(),
            LogLevel::Warn
        );
    }
}
