//! Receiver: reads requests off the client socket, slices them into
//! block-aligned I/O operations, and submits them to the ring.
//!
//! The slicing/validation logic is factored into free functions that take
//! no socket or ring so it is directly unit-testable, mirroring the
//! teacher's split of `request_flow` (pure parsing/batching) from
//! `io_thread` (the only module that touches a live connection).

use std::io::Read;
use std::net::TcpStream;

use crate::constants::{
    BLOCK_SIZE, NBD_CMD_DISC, NBD_CMD_FLUSH, NBD_CMD_READ, NBD_CMD_TRIM, NBD_CMD_WRITE, NBD_EINVAL, NBD_EPERM,
    NBD_REQUEST_MAGIC,
};
use crate::error::{FatalError, FatalResult};
use crate::iot::{IoOpcode, Iot, NO_MOTHER};
use crate::nrt::Nrt;
use crate::protocol::{self, RequestHeader};
use crate::scr::SubmitRing;

/// A request the server recognises enough to acquire an NRT slot for. `Err`
/// carries the NBD error number a malformed-but-framable request should be
/// reported with (command flags set, unsupported command, write against a
/// read-only export).
fn validate_command(cmd_type: u16, command_flags: u16, read_only: bool) -> Result<(), u32> {
    if command_flags != 0 {
        return Err(NBD_EINVAL);
    }
    match cmd_type {
        NBD_CMD_READ | NBD_CMD_FLUSH | NBD_CMD_TRIM | NBD_CMD_DISC => Ok(()),
        NBD_CMD_WRITE if read_only => Err(NBD_EPERM),
        NBD_CMD_WRITE => Ok(()),
        _ => Err(NBD_EINVAL),
    }
}

/// Slice `[offset, offset + length)` into `BLOCK_SIZE`-aligned chunks, each
/// small enough to fit one IOT slot's arena buffer. The chunks do not
/// overlap each other and together cover the whole range.
fn chunk_plan(offset: u64, length: u32) -> Vec<(u64, u32)> {
    if length == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::with_capacity((length as usize).div_ceil(BLOCK_SIZE));
    let mut remaining = length as u64;
    let mut cursor = offset;
    while remaining > 0 {
        let chunk_len = remaining.min(BLOCK_SIZE as u64) as u32;
        chunks.push((cursor, chunk_len));
        cursor += chunk_len as u64;
        remaining -= chunk_len as u64;
    }
    chunks
}

fn read_header(stream: &mut TcpStream) -> FatalResult<RequestHeader> {
    let mut buf = [0u8; crate::config::REQUEST_HEADER_SIZE];
    stream.read_exact(&mut buf).map_err(FatalError::Transport)?;
    protocol::parse_request_header(&buf)
        .map_err(|_| FatalError::Protocol(format!("bad request magic, expected {NBD_REQUEST_MAGIC:#x}")))
}

/// Drives the Receiver side of one connection until `NBD_CMD_DISC` or a
/// fatal transport/protocol error. Returns `Ok(())` on a clean soft
/// disconnect.
pub fn run<R: SubmitRing>(
    stream: &mut TcpStream,
    nrt: &Nrt,
    iot: &Iot,
    arena: &crate::arena::Arena,
    ring: &mut R,
    read_only: bool,
) -> FatalResult<()> {
    loop {
        let hdr = read_header(stream)?;

        if hdr.cmd_type == NBD_CMD_DISC {
            // No reply is ever sent for DISC, so this claims no NRT slot —
            // just a wakeup NOP so the Sender's blocking wait on the ring
            // notices the connection is done even with nothing else in
            // flight.
            let iot_idx = iot.acquire(NO_MOTHER, IoOpcode::Nop, 0, 0, 0);
            ring.submit_nop(iot_idx as u32, false);
            return Ok(());
        }

        match validate_command(hdr.cmd_type, hdr.command_flags, read_only) {
            Err(error) => {
                // WRITE payload must still be drained off the wire even
                // though the request is rejected, or the stream desyncs.
                if hdr.cmd_type == NBD_CMD_WRITE && hdr.length > 0 {
                    let mut sink = vec![0u8; hdr.length as usize];
                    stream.read_exact(&mut sink).map_err(FatalError::Transport)?;
                }
                let nrt_idx = nrt.acquire(hdr.cmd_type, hdr.handle, hdr.offset, hdr.length, error);
                let iot_idx = iot.acquire(nrt_idx, IoOpcode::Nop, hdr.offset, hdr.length, 0);
                nrt.set_pending(nrt_idx, 1);
                ring.submit_nop(iot_idx as u32, false);
            }
            Ok(()) => submit_request(stream, hdr, nrt, iot, arena, ring)?,
        }
    }
}

fn submit_request<R: SubmitRing>(
    stream: &mut TcpStream,
    hdr: RequestHeader,
    nrt: &Nrt,
    iot: &Iot,
    arena: &crate::arena::Arena,
    ring: &mut R,
) -> FatalResult<()> {
    let is_write = hdr.cmd_type == NBD_CMD_WRITE;
    let nrt_idx = nrt.acquire(hdr.cmd_type, hdr.handle, hdr.offset, hdr.length, 0);

    // A drain barrier is only needed once per request: it orders this
    // request's first submitted op after every overlapping in-flight op
    // already in the ring: this request's own chunks never overlap each
    // other.
    let mut needs_drain = nrt.overlaps(nrt_idx, is_write, hdr.offset, hdr.length);
    if needs_drain {
        crate::metrics::inc_drain_barrier();
    }

    match hdr.cmd_type {
        NBD_CMD_FLUSH => {
            let iot_idx = iot.acquire(nrt_idx, IoOpcode::Fsync, hdr.offset, 0, 0);
            nrt.set_pending(nrt_idx, 1);
            ring.submit_fsync(iot_idx as u32);
        }
        NBD_CMD_TRIM => {
            // Discard is a Non-goal: acknowledged as a successful no-op.
            let iot_idx = iot.acquire(nrt_idx, IoOpcode::Nop, hdr.offset, hdr.length, 0);
            nrt.set_pending(nrt_idx, 1);
            ring.submit_nop(iot_idx as u32, needs_drain);
        }
        NBD_CMD_READ => {
            let chunks = chunk_plan(hdr.offset, hdr.length);
            nrt.set_pending(nrt_idx, chunks.len() as u32);
            for (chunk_offset, chunk_len) in chunks {
                let iot_idx = iot.acquire(nrt_idx, IoOpcode::ReadFixed, chunk_offset, chunk_len, 0);
                let buf_ptr = arena.slot_mut(iot_idx).as_mut_ptr();
                ring.submit_read_fixed(iot_idx as u32, chunk_offset, chunk_len, buf_ptr, iot_idx as u16, needs_drain);
                needs_drain = false;
            }
        }
        NBD_CMD_WRITE => {
            let chunks = chunk_plan(hdr.offset, hdr.length);
            nrt.set_pending(nrt_idx, chunks.len() as u32);
            for (chunk_offset, chunk_len) in chunks {
                let iot_idx = iot.acquire(nrt_idx, IoOpcode::WriteFixed, chunk_offset, chunk_len, 0);
                stream
                    .read_exact(&mut arena.slot_mut(iot_idx)[..chunk_len as usize])
                    .map_err(FatalError::Transport)?;
                let buf_ptr = arena.slot(iot_idx).as_ptr();
                ring.submit_write_fixed(iot_idx as u32, chunk_offset, chunk_len, buf_ptr, iot_idx as u16, needs_drain);
                needs_drain = false;
            }
        }
        _ => unreachable!("validate_command already rejected unsupported command types"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_known_commands() {
        assert_eq!(validate_command(NBD_CMD_READ, 0, false), Ok(()));
        assert_eq!(validate_command(NBD_CMD_WRITE, 0, false), Ok(()));
        assert_eq!(validate_command(NBD_CMD_FLUSH, 0, false), Ok(()));
        assert_eq!(validate_command(NBD_CMD_TRIM, 0, false), Ok(()));
    }

    #[test]
    fn validate_rejects_write_on_read_only_export() {
        assert_eq!(validate_command(NBD_CMD_WRITE, 0, true), Err(NBD_EPERM));
    }

    #[test]
    fn validate_rejects_nonzero_command_flags() {
        assert_eq!(validate_command(NBD_CMD_READ, 1, false), Err(NBD_EINVAL));
    }

    #[test]
    fn validate_rejects_unknown_command() {
        assert_eq!(validate_command(99, 0, false), Err(NBD_EINVAL));
    }

    #[test]
    fn chunk_plan_covers_whole_range_block_aligned() {
        let chunks = chunk_plan(0, (BLOCK_SIZE * 3) as u32);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (0, BLOCK_SIZE as u32));
        assert_eq!(chunks[1], (BLOCK_SIZE as u64, BLOCK_SIZE as u32));
        assert_eq!(chunks[2], (2 * BLOCK_SIZE as u64, BLOCK_SIZE as u32));
    }

    #[test]
    fn chunk_plan_handles_partial_final_chunk() {
        let chunks = chunk_plan(0, (BLOCK_SIZE + 100) as u32);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], (BLOCK_SIZE as u64, 100));
    }

    #[test]
    fn chunk_plan_respects_nonzero_start_offset() {
        let chunks = chunk_plan(4096, 4096);
        assert_eq!(chunks, vec![(4096, 4096)]);
    }

    #[test]
    fn chunk_plan_empty_for_zero_length() {
        assert!(chunk_plan(0, 0).is_empty());
    }
}
