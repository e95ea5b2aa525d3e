//! Sender: reaps ring completions, retires IOT/NRT slots, and emits replies.
//!
//! Owns the only mutable state this module needs beyond the shared tables:
//! a per-request reassembly buffer for the simple-reply (non-structured)
//! READ fallback, since that wire format needs one contiguous data blob
//! rather than the independently-orderable chunks structured replies allow.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arena::Arena;
use crate::constants::{NBD_CMD_READ, NBD_EINVAL};
use crate::error::{FatalError, FatalResult};
use crate::iot::{self, IoOpcode, Iot};
use crate::nrt::{Nrt, NrtEntry};
use crate::protocol;
use crate::scr::CompleteRing;

/// Per-request reassembly state for the simple-reply READ path, keyed by
/// NRT slot index. Not needed at all once a client has negotiated
/// structured replies.
#[derive(Default)]
struct Assembly {
    buffers: HashMap<usize, Vec<u8>>,
}

impl Assembly {
    fn buffer_for(&mut self, nrt_idx: usize, total_len: u32) -> &mut Vec<u8> {
        self.buffers.entry(nrt_idx).or_insert_with(|| vec![0u8; total_len as usize])
    }

    fn take(&mut self, nrt_idx: usize) -> Option<Vec<u8>> {
        self.buffers.remove(&nrt_idx)
    }
}

/// Drives the Sender side of one connection. `shutdown` is set by the
/// orchestrator once the Receiver has seen `NBD_CMD_DISC`; the Sender keeps
/// draining in-flight completions until the NRT is idle, then returns.
pub fn run<C: CompleteRing>(
    stream: &mut TcpStream,
    nrt: &Nrt,
    iot: &Iot,
    arena: &Arena,
    ring: &mut C,
    structured_reply: bool,
    shutdown: &AtomicBool,
) -> FatalResult<()> {
    let mut assembly = Assembly::default();

    loop {
        if shutdown.load(Ordering::Acquire) && nrt.idle() {
            return Ok(());
        }

        ring.wait(1).map_err(FatalError::Ring)?;

        for completion in ring.reap() {
            let iot_idx = completion.iot_idx as usize;
            let iot_entry = iot.get(iot_idx);
            let mother = iot_entry.mother;

            // A wakeup-only NOP (e.g. DISC) owns no NRT entry; just free
            // its IOT slot and move on.
            if mother == iot::NO_MOTHER {
                iot.release(iot_idx);
                continue;
            }

            if completion.result < 0 {
                nrt.set_error_if_absent(mother, NBD_EINVAL);
                if iot_entry.opcode == IoOpcode::ReadFixed && structured_reply {
                    let handle = nrt.get(mother).handle;
                    let chunk = protocol::encode_error_offset_chunk(handle, NBD_EINVAL, iot_entry.offset);
                    stream.write_all(&chunk).map_err(FatalError::Transport)?;
                }
            } else if iot_entry.opcode == IoOpcode::ReadFixed {
                let n = completion.result as usize;
                let data = &arena.slot(iot_idx)[..n.min(iot_entry.length as usize)];
                if structured_reply {
                    let handle = nrt.get(mother).handle;
                    let chunk = protocol::encode_offset_data_chunk(handle, iot_entry.offset, data);
                    stream.write_all(&chunk).map_err(FatalError::Transport)?;
                } else {
                    let nrt_entry = nrt.get(mother);
                    let rel_off = (iot_entry.offset - nrt_entry.offset) as usize;
                    let buf = assembly.buffer_for(mother, nrt_entry.length);
                    buf[rel_off..rel_off + data.len()].copy_from_slice(data);
                }
            }

            iot.release(iot_idx);
            if nrt.dec_pending(mother) == 0 {
                send_final_reply(stream, mother, nrt.get(mother), structured_reply, &mut assembly)?;
                nrt.release(mother);
            }
        }
    }
}

fn send_final_reply(
    stream: &mut TcpStream,
    nrt_idx: usize,
    entry: NrtEntry,
    structured_reply: bool,
    assembly: &mut Assembly,
) -> FatalResult<()> {
    if structured_reply {
        if entry.error != 0 {
            let chunk = protocol::encode_error_offset_chunk(entry.handle, entry.error, entry.offset);
            stream.write_all(&chunk).map_err(FatalError::Transport)?;
        }
        let done = protocol::encode_done_chunk(entry.handle);
        stream.write_all(&done).map_err(FatalError::Transport)?;
    } else {
        let header = protocol::encode_simple_reply_header(entry.handle, entry.error);
        stream.write_all(&header).map_err(FatalError::Transport)?;
        if entry.cmd_type == NBD_CMD_READ && entry.error == 0 {
            if let Some(buf) = assembly.take(nrt_idx) {
                stream.write_all(&buf).map_err(FatalError::Transport)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NBD_CMD_WRITE;
    use crate::scr::{FakeRing, SubmitRing};
    use std::net::{TcpListener, TcpStream};

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn write_completion_drains_table_and_sends_simple_reply() {
        let nrt = Nrt::new(2);
        let iot = Iot::new(2);
        let arena = Arena::new(2);
        let mut fake = FakeRing::new();

        let nrt_idx = nrt.acquire(NBD_CMD_WRITE, 77, 0, 4096, 0);
        nrt.set_pending(nrt_idx, 1);
        let iot_idx = iot.acquire(nrt_idx, IoOpcode::WriteFixed, 0, 4096, 0);
        fake.submit_write_fixed(iot_idx as u32, 0, 4096, std::ptr::null(), iot_idx as u16, false);

        let (mut server, mut client) = loopback_pair();
        let shutdown = AtomicBool::new(true);

        // `shutdown` is already true and the table already holds exactly the
        // one completion scripted above, so `run` drains it and returns
        // without blocking — safe to call inline rather than from a thread.
        run(&mut server, &nrt, &iot, &arena, &mut fake, false, &shutdown).expect("sender run failed");
        assert!(nrt.idle());

        let mut reply = [0u8; 16];
        use std::io::Read;
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply[8..16], &77u64.to_be_bytes());
        assert_eq!(&reply[4..8], &0u32.to_be_bytes());
    }
}
