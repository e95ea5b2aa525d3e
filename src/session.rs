//! Session: per-connection orchestrator. Runs the handshake, then drives the
//! Receiver on a dedicated thread and the Sender on the calling thread,
//! sharing one NRT/IOT/SCR triple scoped to this connection.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::arena::Arena;
use crate::config::SessionConfig;
use crate::error::{FatalError, FatalResult};
use crate::export::Export;
use crate::iot::Iot;
use crate::negotiation::{self, AbortRequested};
use crate::nrt::Nrt;
use crate::receiver;
use crate::scr;
use crate::sender;
use crate::socket_opts;

/// Negotiate and then run one client connection to completion (clean
/// `NBD_CMD_DISC`, `NBD_OPT_ABORT` during negotiation, or a fatal error).
pub fn handle_connection(stream: TcpStream, export: &Export, config: &SessionConfig) -> FatalResult<()> {
    socket_opts::tune(&stream).map_err(FatalError::Transport)?;

    let mut handshake_stream = stream;
    let negotiated = match negotiation::handshake(&mut handshake_stream, export)? {
        Ok(session) => session,
        Err(AbortRequested) => return Ok(()),
    };

    let arena = Arena::leak_new(config.max_io);
    let nrt = Arc::new(Nrt::new(config.max_nbd));
    let iot = Arc::new(Iot::new(config.max_io));
    let (mut submit_side, mut complete_side) =
        scr::open(config.ring_entries, export.fd(), &arena.iovecs()).map_err(FatalError::Ring)?;
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut receiver_stream = handshake_stream.try_clone().map_err(FatalError::Transport)?;
    let mut sender_stream = handshake_stream;

    let receiver_nrt = Arc::clone(&nrt);
    let receiver_iot = Arc::clone(&iot);
    let receiver_shutdown = Arc::clone(&shutdown);
    let read_only = export.read_only();

    let receiver_handle = thread::Builder::new()
        .name("nbd-receiver".into())
        .spawn(move || {
            let result = receiver::run(
                &mut receiver_stream,
                &receiver_nrt,
                &receiver_iot,
                arena,
                &mut submit_side,
                read_only,
            );
            receiver_shutdown.store(true, Ordering::Release);
            result
        })
        .map_err(FatalError::Transport)?;

    let sender_result = sender::run(
        &mut sender_stream,
        &nrt,
        &iot,
        arena,
        &mut complete_side,
        negotiated.structured_reply,
        &shutdown,
    );

    let receiver_result = receiver_handle.join().unwrap_or_else(|panic| {
        std::panic::resume_unwind(panic);
    });

    receiver_result?;
    sender_result
}
