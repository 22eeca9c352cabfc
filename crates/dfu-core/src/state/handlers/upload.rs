//! Firmware upload.

use tracing::{info, trace};

use crate::events::{DfuEvent, DfuObserver, LogLevel};
use crate::firmware::{ChunkState, FirmwarePart, ImageError};
use crate::protocol::{ControlCommand, Notification, Opcode};
use crate::session::SessionError;
use crate::state::machine::DfuState;
use crate::transport::DfuTransport;

use super::{HandleResult, HandlerContext};

/// UPLOADING - stream every remaining part.
///
/// Picks up at `part_index` and at the cursor of a part in progress.
pub fn upload_parts<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> HandleResult {
    let image = ctx.image;

    while ctx.state.part_index < image.part_count() {
        let index = ctx.state.part_index;
        let part = &image.parts()[index];

        if ctx.state.chunks.is_none() {
            begin_part(ctx, index, part)?;
        }
        send_chunks(ctx, part)?;

        info!(part = index + 1, size = part.len(), "Part uploaded");
        ctx.state.advance_part();
        if ctx.state.part_index < image.part_count() {
            ctx.transition(DfuState::Uploading);
        }
    }

    Ok(DfuState::Validating)
}

fn begin_part<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
    index: usize,
    part: &FirmwarePart,
) -> Result<(), SessionError> {
    let chunk_size = ctx.config.chunk_size(ctx.state.mtu);
    ctx.log(
        LogLevel::Info,
        format!(
            "Uploading part {}/{}: {} ({} bytes)",
            index + 1,
            ctx.image.part_count(),
            part.kind(),
            part.len()
        ),
    );

    ctx.send(ControlCommand::StartPart {
        kind: part.kind(),
        size: wire_len(part.len())?,
    })?;
    ctx.expect_response(Opcode::StartPart)?;

    if let Some(init) = part.init_packet() {
        ctx.send(ControlCommand::InitPacket {
            len: wire_len(init.len())?,
        })?;
        for chunk in init.chunks(chunk_size) {
            ctx.transport.write_data(chunk)?;
        }
        ctx.expect_response(Opcode::InitPacket)?;
    }

    ctx.send(ControlCommand::ReceiveFirmware)?;

    ctx.state.chunks = Some(ChunkState::new(part.len(), chunk_size));
    ctx.state.bytes_sent = 0;
    ctx.state.chunks_since_receipt = 0;
    ctx.progress.begin_part(index, part.len());
    Ok(())
}

fn send_chunks<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
    part: &FirmwarePart,
) -> Result<(), SessionError> {
    let interval = ctx.config.packet_receipt_interval;

    loop {
        ctx.checkpoint()?;

        let Some(cursor) = ctx.state.chunks.as_mut() else {
            return Ok(());
        };
        let Some(chunk) = cursor.next_chunk(part.data()) else {
            return Ok(());
        };
        let part_done = cursor.is_done();

        ctx.transport.write_data(chunk)?;
        ctx.state.bytes_sent += chunk.len();
        ctx.state.chunks_since_receipt += 1;

        let sample = ctx.progress.record(chunk.len());
        ctx.emit(DfuEvent::Progress(sample));

        if part_done {
            return ctx.expect_response(Opcode::ReceiveFirmware);
        }
        if interval > 0 && ctx.state.chunks_since_receipt >= interval {
            await_receipt(ctx)?;
        }
    }
}

/// Length field of a control point command.
fn wire_len(len: usize) -> Result<u32, SessionError> {
    u32::try_from(len).map_err(|_| {
        SessionError::from(ImageError::InvalidFormat(format!(
            "{len} bytes exceed a 32-bit length field"
        )))
    })
}

/// The receipt must account for every byte written so far.
fn await_receipt<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), SessionError> {
    match ctx.read_notification()? {
        Notification::PacketReceipt { bytes } => {
            if bytes as usize != ctx.state.bytes_sent {
                return Err(SessionError::ReceiptMismatch {
                    expected: ctx.state.bytes_sent,
                    reported: bytes,
                });
            }
            trace!(bytes, "Packet receipt");
            ctx.state.chunks_since_receipt = 0;
            Ok(())
        }
        Notification::Response { request, status } if !status.is_success() => {
            Err(SessionError::Remote { request, status })
        }
        other => Err(SessionError::UnexpectedNotification {
            expected: Opcode::ReceiveFirmware,
            got: format!("{other:?}"),
        }),
    }
}
