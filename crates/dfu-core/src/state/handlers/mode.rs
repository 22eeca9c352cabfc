//! Mode switch and transfer setup.

use tracing::{debug, info, warn};

use crate::events::{DfuObserver, LogLevel};
use crate::firmware::PartKind;
use crate::protocol::{ControlCommand, Notification, Opcode};
use crate::session::SessionError;
use crate::state::machine::DfuState;
use crate::transport::{DfuTransport, TransportError};

use super::{HandleResult, HandlerContext};

/// CONNECTING - switch the peripheral into its bootloader.
///
/// An unanswered request is re-sent `mode_switch_retries` times.
pub fn enter_dfu_mode<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> HandleResult {
    let mtu = ctx.transport.connect()?;
    ctx.state.mtu = mtu;
    debug!(mtu, variant = %ctx.transport.variant(), "Link ready");

    let kind = ctx
        .image
        .parts()
        .first()
        .map_or(PartKind::Application, |p| p.kind());
    let attempts = ctx.config.mode_switch_retries.saturating_add(1);

    for attempt in 1..=attempts {
        ctx.checkpoint()?;
        ctx.send(ControlCommand::EnterDfuMode { kind })?;

        match ctx.read_notification() {
            Ok(Notification::Response {
                request: Opcode::EnterDfuMode,
                status,
            }) => {
                if !status.is_success() {
                    return Err(SessionError::Remote {
                        request: Opcode::EnterDfuMode,
                        status,
                    });
                }
                info!(attempt, "DFU mode enabled");
                ctx.log(LogLevel::Info, "Device is in DFU mode");
                return Ok(DfuState::EnablingDfuMode);
            }
            Ok(other) => {
                return Err(SessionError::UnexpectedNotification {
                    expected: Opcode::EnterDfuMode,
                    got: format!("{other:?}"),
                });
            }
            Err(SessionError::Transport(TransportError::Timeout { timeout_ms })) => {
                warn!(attempt, attempts, timeout_ms, "No response to mode switch");
                ctx.log(
                    LogLevel::Warn,
                    format!("No response to mode switch (attempt {attempt}/{attempts})"),
                );
            }
            Err(e) => return Err(e),
        }
    }

    Err(SessionError::DeviceUnresponsive { attempts })
}

/// ENABLING_DFU_MODE - set the packet receipt cadence.
pub fn prepare_transfer<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> HandleResult {
    let interval = ctx.config.packet_receipt_interval;
    ctx.send(ControlCommand::PacketReceiptRequest { interval })?;

    let chunk_size = ctx.config.chunk_size(ctx.state.mtu);
    ctx.log(
        LogLevel::Debug,
        format!("Packet receipt every {interval} chunks of {chunk_size} bytes"),
    );
    Ok(DfuState::Uploading)
}
