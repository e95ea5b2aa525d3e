//! Per-connection socket tuning: TCP keepalive and `TCP_USER_TIMEOUT`.
//!
//! Grounded on the teacher's `create_listener`, which reaches for `socket2`
//! for everything it covers and drops to a raw `setsockopt` only for the one
//! option (`SO_REUSEPORT`) `socket2` doesn't expose. `TCP_USER_TIMEOUT` is in
//! the same boat here.

use std::io;
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use socket2::{Socket, TcpKeepalive};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(1);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const KEEPALIVE_RETRIES: u32 = 4;
const USER_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply the session's TCP keepalive (1s idle / 1s interval / 4 probes) and
/// `TCP_USER_TIMEOUT` (5s) to a freshly accepted connection.
pub fn tune(stream: &TcpStream) -> io::Result<()> {
    let socket = Socket::from(stream.try_clone()?);

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);
    socket.set_tcp_keepalive(&keepalive)?;

    set_user_timeout(&socket, USER_TIMEOUT)?;

    // `socket` owns a dup of `stream`'s fd (from `try_clone`); dropping it
    // here closes only that duplicate, not `stream`'s own fd.
    Ok(())
}

fn set_user_timeout(socket: &Socket, timeout: Duration) -> io::Result<()> {
    let millis = timeout.as_millis() as libc::c_uint;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_USER_TIMEOUT,
            &millis as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_uint>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
