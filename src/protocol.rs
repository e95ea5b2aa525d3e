//! NBD wire framing: request header parsing and reply chunk encoding.
//!
//! Kept free of sockets/io_uring so it is directly unit-testable, mirroring
//! the teacher's split of protocol framing from the one module that actually
//! touches the kernel.

use crate::config::{REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE};
use crate::constants::{
    NBD_REPLY_FLAG_DONE, NBD_REPLY_TYPE_ERROR_OFFSET, NBD_REPLY_TYPE_NONE, NBD_REPLY_TYPE_OFFSET_DATA,
    NBD_REQUEST_MAGIC, NBD_SIMPLE_REPLY_MAGIC, NBD_STRUCTURED_REPLY_MAGIC,
};

/// Parsed 28-byte transmission-phase request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub command_flags: u16,
    pub cmd_type: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

/// Bad magic is the one request-parsing failure that is fatal (hard
/// disconnect, no reply emitted) rather than recorded as a per-request
/// `EINVAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadMagic;

/// Parse a 28-byte big-endian request header. Everything except the magic
/// check is left to the caller: an unsupported command type or nonzero
/// command flags is a per-request error, not a framing failure.
pub fn parse_request_header(buf: &[u8; REQUEST_HEADER_SIZE]) -> Result<RequestHeader, BadMagic> {
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != NBD_REQUEST_MAGIC {
        return Err(BadMagic);
    }
    Ok(RequestHeader {
        command_flags: u16::from_be_bytes(buf[4..6].try_into().unwrap()),
        cmd_type: u16::from_be_bytes(buf[6..8].try_into().unwrap()),
        handle: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
        length: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
    })
}

/// Encode a structured-reply `OFFSET_DATA` chunk: header + 8-byte offset +
/// `data`.
pub fn encode_offset_data_chunk(handle: u64, offset: u64, data: &[u8]) -> Vec<u8> {
    let payload_len = 8 + data.len() as u32;
    let mut out = Vec::with_capacity(REPLY_HEADER_SIZE + 8 + data.len());
    out.extend_from_slice(&NBD_STRUCTURED_REPLY_MAGIC.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // flags: not DONE
    out.extend_from_slice(&NBD_REPLY_TYPE_OFFSET_DATA.to_be_bytes());
    out.extend_from_slice(&handle.to_be_bytes());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Encode a structured-reply `ERROR_OFFSET` chunk: header + 4-byte error +
/// 2-byte message length (always 0, no message) + 8-byte offset.
pub fn encode_error_offset_chunk(handle: u64, error: u32, offset: u64) -> Vec<u8> {
    let payload_len: u32 = 4 + 2 + 8;
    let mut out = Vec::with_capacity(REPLY_HEADER_SIZE + payload_len as usize);
    out.extend_from_slice(&NBD_STRUCTURED_REPLY_MAGIC.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&NBD_REPLY_TYPE_ERROR_OFFSET.to_be_bytes());
    out.extend_from_slice(&handle.to_be_bytes());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(&error.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out
}

/// Encode the terminal structured-reply chunk: type `NONE`, flag `DONE`,
/// zero-length payload.
pub fn encode_done_chunk(handle: u64) -> [u8; REPLY_HEADER_SIZE] {
    let mut out = [0u8; REPLY_HEADER_SIZE];
    out[0..4].copy_from_slice(&NBD_STRUCTURED_REPLY_MAGIC.to_be_bytes());
    out[4..6].copy_from_slice(&NBD_REPLY_FLAG_DONE.to_be_bytes());
    out[6..8].copy_from_slice(&NBD_REPLY_TYPE_NONE.to_be_bytes());
    out[8..16].copy_from_slice(&handle.to_be_bytes());
    out[16..20].copy_from_slice(&0u32.to_be_bytes());
    out
}

/// Encode a 16-byte simple reply (the fallback path for clients that never
/// negotiated structured replies). READ data, if any, follows immediately
/// and is appended by the caller.
pub fn encode_simple_reply_header(handle: u64, error: u32) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
    out[4..8].copy_from_slice(&error.to_be_bytes());
    out[8..16].copy_from_slice(&handle.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{NBD_CMD_READ, NBD_EINVAL};

    fn request_bytes(magic: u32, flags: u16, cmd: u16, handle: u64, offset: u64, length: u32) -> [u8; 28] {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&magic.to_be_bytes());
        buf[4..6].copy_from_slice(&flags.to_be_bytes());
        buf[6..8].copy_from_slice(&cmd.to_be_bytes());
        buf[8..16].copy_from_slice(&handle.to_be_bytes());
        buf[16..24].copy_from_slice(&offset.to_be_bytes());
        buf[24..28].copy_from_slice(&length.to_be_bytes());
        buf
    }

    #[test]
    fn parses_well_formed_header() {
        let buf = request_bytes(NBD_REQUEST_MAGIC, 0, NBD_CMD_READ, 1, 0x1000, 0x1000);
        let hdr = parse_request_header(&buf).expect("should parse");
        assert_eq!(hdr.command_flags, 0);
        assert_eq!(hdr.cmd_type, NBD_CMD_READ);
        assert_eq!(hdr.handle, 1);
        assert_eq!(hdr.offset, 0x1000);
        assert_eq!(hdr.length, 0x1000);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = request_bytes(0xDEAD_BEEF, 0, NBD_CMD_READ, 1, 0, 0);
        assert_eq!(parse_request_header(&buf), Err(BadMagic));
    }

    #[test]
    fn offset_data_chunk_matches_scenario_1() {
        let data = [0xAAu8; 4096];
        let chunk = encode_offset_data_chunk(1, 0, &data);
        assert_eq!(&chunk[0..4], &NBD_STRUCTURED_REPLY_MAGIC.to_be_bytes());
        assert_eq!(&chunk[4..6], &0u16.to_be_bytes());
        assert_eq!(&chunk[6..8], &NBD_REPLY_TYPE_OFFSET_DATA.to_be_bytes());
        assert_eq!(&chunk[8..16], &1u64.to_be_bytes());
        assert_eq!(&chunk[16..20], &(4096u32 + 8).to_be_bytes());
        assert_eq!(&chunk[20..28], &0u64.to_be_bytes());
        assert_eq!(&chunk[28..], &data[..]);
    }

    #[test]
    fn done_chunk_has_done_flag_and_none_type() {
        let chunk = encode_done_chunk(42);
        assert_eq!(&chunk[4..6], &NBD_REPLY_FLAG_DONE.to_be_bytes());
        assert_eq!(&chunk[6..8], &NBD_REPLY_TYPE_NONE.to_be_bytes());
        assert_eq!(&chunk[16..20], &0u32.to_be_bytes());
    }

    #[test]
    fn error_offset_chunk_matches_scenario_6() {
        let chunk = encode_error_offset_chunk(7, NBD_EINVAL, 0);
        assert_eq!(chunk.len(), 20 + 14);
        assert_eq!(&chunk[6..8], &NBD_REPLY_TYPE_ERROR_OFFSET.to_be_bytes());
        assert_eq!(&chunk[20..24], &NBD_EINVAL.to_be_bytes());
        assert_eq!(&chunk[24..26], &0u16.to_be_bytes());
        assert_eq!(&chunk[26..34], &0u64.to_be_bytes());
    }
}
