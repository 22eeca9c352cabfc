//! State machine implementation for a DFU session.

use std::fmt;

use crate::firmware::ChunkState;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DfuState {
    #[default]
    Idle,
    Connecting,
    EnablingDfuMode,
    Uploading,
    Paused,
    Validating,
    Disconnecting,
    Completed,
    Aborted,
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::Idle => write!(f, "IDLE"),
            DfuState::Connecting => write!(f, "CONNECTING"),
            DfuState::EnablingDfuMode => write!(f, "ENABLING_DFU_MODE"),
            DfuState::Uploading => write!(f, "UPLOADING"),
            DfuState::Paused => write!(f, "PAUSED"),
            DfuState::Validating => write!(f, "VALIDATING"),
            DfuState::Disconnecting => write!(f, "DISCONNECTING"),
            DfuState::Completed => write!(f, "COMPLETED"),
            DfuState::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl DfuState {
    /// Human-readable description for status displays.
    pub fn description(&self) -> &'static str {
        match self {
            DfuState::Idle => "Idle",
            DfuState::Connecting => "Connecting to the device",
            DfuState::EnablingDfuMode => "Switching the device into DFU mode",
            DfuState::Uploading => "Uploading firmware",
            DfuState::Paused => "Upload paused",
            DfuState::Validating => "Validating firmware",
            DfuState::Disconnecting => "Activating firmware and disconnecting",
            DfuState::Completed => "Firmware update completed",
            DfuState::Aborted => "Firmware update aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DfuState::Completed | DfuState::Aborted)
    }

    /// Whether `self -> to` is an edge of the session graph.
    ///
    /// `Uploading -> Uploading` is the part boundary.
    pub fn can_transition(&self, to: DfuState) -> bool {
        use DfuState::*;

        if to == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Idle, Connecting)
                | (Connecting, EnablingDfuMode)
                | (EnablingDfuMode, Uploading)
                | (Uploading, Uploading)
                | (Uploading, Paused)
                | (Paused, Uploading)
                | (Uploading, Validating)
                | (Validating, Disconnecting)
                | (Disconnecting, Completed)
        )
    }
}

/// State machine context holding all runtime state.
#[derive(Debug, Default)]
pub struct StateMachineContext {
    /// Current session state.
    pub state: DfuState,
    /// Index of the part being uploaded.
    pub part_index: usize,
    /// Cursor into the current part. `None` between parts.
    pub chunks: Option<ChunkState>,
    /// Payload bytes written for the current part.
    pub bytes_sent: usize,
    /// Data writes since the last packet receipt.
    pub chunks_since_receipt: u16,
    /// Negotiated MTU.
    pub mtu: usize,
    /// Pause requested outside `Uploading`, applied at the next chunk boundary.
    pub pause_requested: bool,
}

impl StateMachineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state. Illegal edges are refused.
    pub fn goto_state(&mut self, new_state: DfuState) -> bool {
        if !self.state.can_transition(new_state) {
            tracing::warn!(from = %self.state, to = %new_state, "Illegal state transition");
            return false;
        }
        if self.state != new_state {
            tracing::info!(from = %self.state, to = %new_state, "State transition");
        }
        self.state = new_state;
        true
    }

    /// Move to the next part.
    pub fn advance_part(&mut self) {
        self.part_index += 1;
        self.chunks = None;
        self.bytes_sent = 0;
        self.chunks_since_receipt = 0;
    }

    pub fn is_paused(&self) -> bool {
        self.state == DfuState::Paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_edges() {
        let mut ctx = StateMachineContext::new();
        for next in [
            DfuState::Connecting,
            DfuState::EnablingDfuMode,
            DfuState::Uploading,
            DfuState::Paused,
            DfuState::Uploading,
            DfuState::Uploading,
            DfuState::Validating,
            DfuState::Disconnecting,
            DfuState::Completed,
        ] {
            assert!(ctx.goto_state(next), "refused {next}");
        }
        assert!(ctx.state.is_terminal());
    }

    #[test]
    fn test_illegal_edges_refused() {
        let mut ctx = StateMachineContext::new();
        assert!(!ctx.goto_state(DfuState::Uploading));
        assert_eq!(ctx.state, DfuState::Idle);

        assert!(!DfuState::Connecting.can_transition(DfuState::Paused));
        assert!(!DfuState::Validating.can_transition(DfuState::Uploading));
    }

    #[test]
    fn test_abort_from_any_non_terminal() {
        for state in [
            DfuState::Idle,
            DfuState::Connecting,
            DfuState::EnablingDfuMode,
            DfuState::Uploading,
            DfuState::Paused,
            DfuState::Validating,
            DfuState::Disconnecting,
        ] {
            assert!(state.can_transition(DfuState::Aborted), "{state}");
        }
        assert!(!DfuState::Completed.can_transition(DfuState::Aborted));
        assert!(!DfuState::Aborted.can_transition(DfuState::Aborted));
    }

    #[test]
    fn test_advance_part_resets_counters() {
        let mut ctx = StateMachineContext::new();
        ctx.chunks = Some(ChunkState::new(100, 20));
        ctx.bytes_sent = 100;
        ctx.chunks_since_receipt = 3;

        ctx.advance_part();
        assert_eq!(ctx.part_index, 1);
        assert!(ctx.chunks.is_none());
        assert_eq!(ctx.bytes_sent, 0);
        assert_eq!(ctx.chunks_since_receipt, 0);
    }
}
