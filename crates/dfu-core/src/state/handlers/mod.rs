//! State handlers - one function per session phase.
//!
//! This module is split into submodules by functionality:
//! - `mode`: mode switch and transfer setup
//! - `upload`: per-part chunk streaming with packet receipts
//! - `validate`: checksum verification and activation

mod mode;
mod upload;
mod validate;

use std::sync::mpsc::Receiver;

use tracing::{debug, info};

use crate::events::{DfuEvent, DfuObserver, LogLevel};
use crate::firmware::FirmwareImage;
use crate::progress::ProgressTracker;
use crate::protocol::{ControlCommand, Notification, Opcode};
use crate::session::{SessionCommand, SessionConfig, SessionError, SessionStatus};
use crate::state::machine::{DfuState, StateMachineContext};
use crate::transport::DfuTransport;

/// Next state requested by a handler.
pub type HandleResult = Result<DfuState, SessionError>;

/// Handler context containing all resources of a running session.
pub struct HandlerContext<'a, T: DfuTransport, O: DfuObserver> {
    pub transport: &'a T,
    pub observer: &'a O,
    pub state: &'a mut StateMachineContext,
    pub image: &'a FirmwareImage,
    pub config: &'a SessionConfig,
    /// User commands, in the order they were issued.
    pub commands: &'a Receiver<SessionCommand>,
    pub progress: ProgressTracker,
    pub status: &'a SessionStatus,
}

impl<'a, T: DfuTransport, O: DfuObserver> HandlerContext<'a, T, O> {
    pub(crate) fn emit(&self, event: DfuEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DfuEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Move the machine and tell observers. The part boundary self-loop is
    /// silent.
    pub(crate) fn transition(&mut self, to: DfuState) -> bool {
        let from = self.state.state;
        if !self.state.goto_state(to) {
            return false;
        }
        self.status.set_state(to);
        if from != to {
            self.emit(DfuEvent::StateChanged {
                from,
                to,
                description: to.description(),
            });
        }
        true
    }

    /// Apply queued user commands.
    ///
    /// Called between chunks and between waits, never during a write.
    /// Blocks while paused; only `Resume` or `Abort` get it going again.
    pub(crate) fn checkpoint(&mut self) -> Result<(), SessionError> {
        if self.state.state.is_terminal() {
            return Ok(());
        }
        loop {
            if self.state.pause_requested && self.state.state == DfuState::Uploading {
                self.state.pause_requested = false;
                self.transition(DfuState::Paused);
                self.log(
                    LogLevel::Info,
                    format!(
                        "Paused at byte {} of part {}",
                        self.state.bytes_sent,
                        self.state.part_index + 1
                    ),
                );
            }

            let command = if self.state.is_paused() {
                // Nobody can resume a session whose controller is gone.
                self.commands.recv().map_err(|_| SessionError::Aborted)?
            } else {
                match self.commands.try_recv() {
                    Ok(command) => command,
                    Err(_) => return Ok(()),
                }
            };

            debug!(?command, state = %self.state.state, "Command");
            match command {
                SessionCommand::Pause => self.state.pause_requested = true,
                SessionCommand::Resume => {
                    self.state.pause_requested = false;
                    if self.state.is_paused() {
                        self.transition(DfuState::Uploading);
                        self.progress.resume();
                        self.log(LogLevel::Info, "Resumed");
                    }
                }
                SessionCommand::Abort => {
                    info!(state = %self.state.state, "Abort requested");
                    return Err(SessionError::Aborted);
                }
            }
        }
    }

    pub(crate) fn send(&self, command: ControlCommand) -> Result<(), SessionError> {
        self.transport.send_command(&command)?;
        Ok(())
    }

    /// Next device notification.
    ///
    /// Past CONNECTING, a mode switch acknowledgement can only answer an
    /// attempt that already timed out, so it is dropped.
    pub(crate) fn read_notification(&self) -> Result<Notification, SessionError> {
        loop {
            let notification = self.transport.read_response(self.config.response_timeout())?;
            match notification {
                Notification::Response {
                    request: Opcode::EnterDfuMode,
                    status,
                } if self.state.state != DfuState::Connecting => {
                    debug!(%status, "Ignoring late mode switch response");
                }
                other => return Ok(other),
            }
        }
    }

    /// Wait for a successful response to `request`.
    pub(crate) fn expect_response(&self, request: Opcode) -> Result<(), SessionError> {
        match self.read_notification()? {
            Notification::Response {
                request: answered,
                status,
            } if answered == request => {
                if status.is_success() {
                    Ok(())
                } else {
                    Err(SessionError::Remote { request, status })
                }
            }
            other => Err(SessionError::UnexpectedNotification {
                expected: request,
                got: format!("{other:?}"),
            }),
        }
    }
}

/// Drive the machine from its current state to `Completed`.
pub fn run_machine<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), SessionError> {
    loop {
        match ctx.state.state {
            DfuState::Completed => return Ok(()),
            DfuState::Aborted => return Err(SessionError::Aborted),
            _ => ctx.checkpoint()?,
        }

        let next = match ctx.state.state {
            DfuState::Idle => DfuState::Connecting,
            DfuState::Connecting => mode::enter_dfu_mode(ctx)?,
            DfuState::EnablingDfuMode => mode::prepare_transfer(ctx)?,
            DfuState::Uploading | DfuState::Paused => upload::upload_parts(ctx)?,
            DfuState::Validating => validate::verify_parts(ctx)?,
            DfuState::Disconnecting => validate::activate(ctx)?,
            DfuState::Completed => return Ok(()),
            DfuState::Aborted => return Err(SessionError::Aborted),
        };

        let from = ctx.state.state;
        if !ctx.transition(next) {
            return Err(SessionError::IllegalTransition { from, to: next });
        }
    }
}
