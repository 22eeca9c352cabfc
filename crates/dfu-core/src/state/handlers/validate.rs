//! Checksum verification and activation.

use tracing::{debug, error, info};

use crate::events::{DfuObserver, LogLevel};
use crate::firmware::ImageError;
use crate::protocol::{ControlCommand, Notification, Opcode, ResponseStatus};
use crate::session::SessionError;
use crate::state::machine::DfuState;
use crate::transport::DfuTransport;

use super::{HandleResult, HandlerContext};

/// VALIDATING - compare the device's view of every part with ours.
///
/// A mismatch is final: the device content is untrusted and only a new
/// session can fix it.
pub fn verify_parts<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> HandleResult {
    let image = ctx.image;

    for (index, part) in image.parts().iter().enumerate() {
        ctx.checkpoint()?;
        let wire_index = u8::try_from(index).map_err(|_| {
            ImageError::InvalidFormat(format!("part index {index} does not fit in one byte"))
        })?;
        ctx.send(ControlCommand::CalculateChecksum { part: wire_index })?;

        match ctx.read_notification()? {
            Notification::Checksum { offset, crc } => {
                if offset as usize != part.len() || crc != part.crc() {
                    let reason = format!(
                        "expected {} bytes / CRC {:08X}, device has {} bytes / CRC {:08X}",
                        part.len(),
                        part.crc(),
                        offset,
                        crc
                    );
                    error!(part = index + 1, "{}", reason);
                    ctx.log(LogLevel::Error, format!("Part {}: {}", index + 1, reason));
                    return Err(SessionError::IntegrityCheckFailed {
                        part: index + 1,
                        reason,
                    });
                }
                debug!(part = index + 1, crc = %format!("{crc:08X}"), "Checksum verified");
            }
            Notification::Response { request, status } => {
                return Err(SessionError::Remote { request, status });
            }
            other => {
                return Err(SessionError::UnexpectedNotification {
                    expected: Opcode::CalculateChecksum,
                    got: format!("{other:?}"),
                });
            }
        }
    }

    ctx.send(ControlCommand::Validate)?;
    match ctx.expect_response(Opcode::Validate) {
        Err(SessionError::Remote {
            status: ResponseStatus::CrcError,
            ..
        }) => Err(SessionError::IntegrityCheckFailed {
            part: image.part_count(),
            reason: "device rejected the image CRC".into(),
        }),
        Err(e) => Err(e),
        Ok(()) => {
            ctx.log(LogLevel::Info, "Firmware validated");
            Ok(DfuState::Disconnecting)
        }
    }
}

/// DISCONNECTING - activate the new firmware and drop the link.
pub fn activate<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> HandleResult {
    ctx.send(ControlCommand::ActivateAndReset)?;
    ctx.expect_response(Opcode::ActivateAndReset)?;

    if ctx.config.disconnect_on_complete {
        ctx.transport.disconnect()?;
    }
    info!("Firmware activated");
    Ok(DfuState::Completed)
}
