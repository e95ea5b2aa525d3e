//! Fixed-newstyle handshake and option haggling.
//!
//! Runs once per connection, on a plain blocking `TcpStream`, before the
//! session hands the socket's fd over to the SCR for the transmission
//! phase. Kept separate from `session` so the wire format is testable
//! without a live ring.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::constants::{
    NBD_FLAG_CLIENT_FIXED_NEWSTYLE, NBD_FLAG_FIXED_NEWSTYLE, NBD_FLAG_HAS_FLAGS, NBD_FLAG_NO_ZEROES,
    NBD_FLAG_READ_ONLY, NBD_FLAG_SEND_FLUSH, NBD_INFO_EXPORT, NBD_INIT_PASSWD, NBD_OPTS_MAGIC, NBD_OPT_ABORT,
    NBD_OPT_EXPORT_NAME, NBD_OPT_GO, NBD_OPT_INFO, NBD_OPT_LIST, NBD_OPT_STRUCTURED_REPLY, NBD_REP_ACK,
    NBD_REP_ERR_UNSUP, NBD_REP_INFO, NBD_REP_MAGIC, NBD_REP_SERVER,
};
use crate::error::{FatalError, FatalResult};
use crate::export::Export;

/// Outcome of a completed handshake: whether the client negotiated
/// structured replies (`NBD_OPT_STRUCTURED_REPLY`), which gates whether the
/// Sender emits structured reply chunks or falls back to simple replies.
pub struct NegotiatedSession {
    pub structured_reply: bool,
}

/// Client asked to abort rather than proceed to an export.
pub struct AbortRequested;

fn io_err(e: std::io::Error) -> FatalError {
    FatalError::Transport(e)
}

fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> FatalResult<()> {
    stream.read_exact(buf).map_err(io_err)
}

fn write_all(stream: &mut TcpStream, buf: &[u8]) -> FatalResult<()> {
    stream.write_all(buf).map_err(io_err)
}

fn read_u32(stream: &mut TcpStream) -> FatalResult<u32> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(stream: &mut TcpStream) -> FatalResult<u64> {
    let mut buf = [0u8; 8];
    read_exact(stream, &mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_bytes(stream: &mut TcpStream, len: usize) -> FatalResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact(stream, &mut buf)?;
    Ok(buf)
}

fn transmission_flags(export: &Export) -> u16 {
    let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;
    if export.read_only() {
        flags |= NBD_FLAG_READ_ONLY;
    }
    flags
}

fn write_export_info(stream: &mut TcpStream, export: &Export, zero_pad: bool) -> FatalResult<()> {
    write_all(stream, &export.size().to_be_bytes())?;
    write_all(stream, &transmission_flags(export).to_be_bytes())?;
    if zero_pad {
        write_all(stream, &[0u8; 124])?;
    }
    Ok(())
}

fn write_option_reply(stream: &mut TcpStream, option: u32, reply_type: u32, data: &[u8]) -> FatalResult<()> {
    write_all(stream, &NBD_REP_MAGIC.to_be_bytes())?;
    write_all(stream, &option.to_be_bytes())?;
    write_all(stream, &reply_type.to_be_bytes())?;
    write_all(stream, &(data.len() as u32).to_be_bytes())?;
    write_all(stream, data)?;
    Ok(())
}

/// Run the fixed-newstyle handshake and option haggling loop for a freshly
/// accepted connection. Returns once the client has sent `NBD_OPT_EXPORT_NAME`
/// or `NBD_OPT_GO` and the transmission phase can begin, or `Err` on a
/// framing failure, or `Ok` carrying an abort marker if the client sent
/// `NBD_OPT_ABORT`.
pub fn handshake(stream: &mut TcpStream, export: &Export) -> FatalResult<Result<NegotiatedSession, AbortRequested>> {
    write_all(stream, &NBD_INIT_PASSWD.to_be_bytes())?;
    write_all(stream, &NBD_OPTS_MAGIC.to_be_bytes())?;
    write_all(stream, &(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES).to_be_bytes())?;

    let client_flags = read_u32(stream)?;
    if client_flags & NBD_FLAG_CLIENT_FIXED_NEWSTYLE == 0 {
        return Err(FatalError::Negotiation(
            "client did not acknowledge fixed-newstyle handshake".into(),
        ));
    }

    let mut structured_reply = false;

    loop {
        let magic = read_u64(stream)?;
        if magic != NBD_OPTS_MAGIC {
            return Err(FatalError::Negotiation(format!("bad option magic {magic:#x}")));
        }
        let option = read_u32(stream)?;
        let len = read_u32(stream)? as usize;

        match option {
            NBD_OPT_EXPORT_NAME => {
                let _name = read_bytes(stream, len)?;
                write_export_info(stream, export, true)?;
                return Ok(Ok(NegotiatedSession { structured_reply }));
            }
            NBD_OPT_ABORT => {
                let _ = read_bytes(stream, len)?;
                write_option_reply(stream, option, NBD_REP_ACK, &[])?;
                return Ok(Err(AbortRequested));
            }
            NBD_OPT_LIST => {
                let _ = read_bytes(stream, len)?;
                let name = b"default";
                let mut body = Vec::with_capacity(4 + name.len());
                body.extend_from_slice(&(name.len() as u32).to_be_bytes());
                body.extend_from_slice(name);
                write_option_reply(stream, option, NBD_REP_SERVER, &body)?;
                write_option_reply(stream, option, NBD_REP_ACK, &[])?;
            }
            NBD_OPT_INFO | NBD_OPT_GO => {
                let payload = read_bytes(stream, len)?;
                if payload.len() < 4 {
                    return Err(FatalError::Negotiation("truncated INFO/GO payload".into()));
                }
                let name_len = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
                if payload.len() < 4 + name_len + 2 {
                    return Err(FatalError::Negotiation("truncated INFO/GO payload".into()));
                }
                // Information-request list (ignored: we always send NBD_INFO_EXPORT).

                let mut info_body = Vec::with_capacity(12);
                info_body.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                info_body.extend_from_slice(&export.size().to_be_bytes());
                info_body.extend_from_slice(&transmission_flags(export).to_be_bytes());
                write_option_reply(stream, option, NBD_REP_INFO, &info_body)?;
                write_option_reply(stream, option, NBD_REP_ACK, &[])?;

                if option == NBD_OPT_GO {
                    return Ok(Ok(NegotiatedSession { structured_reply }));
                }
            }
            NBD_OPT_STRUCTURED_REPLY => {
                let _ = read_bytes(stream, len)?;
                structured_reply = true;
                write_option_reply(stream, option, NBD_REP_ACK, &[])?;
            }
            _ => {
                let _ = read_bytes(stream, len)?;
                write_option_reply(stream, option, NBD_REP_ERR_UNSUP, &[])?;
            }
        }
    }
}
