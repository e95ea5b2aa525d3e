//! Minimal manual test client: negotiates fixed-newstyle, optionally
//! requests structured replies, then round-trips a single WRITE/READ pair
//! and disconnects. Not a general-purpose NBD client — just enough to poke
//! a running server by hand.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::ExitCode;

use clap::Parser;

const NBD_INIT_PASSWD: u64 = 0x4e42_444d_4147_4943;
const NBD_OPTS_MAGIC: u64 = 0x4948_4156_454f_5054;
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const NBD_FLAG_CLIENT_FIXED_NEWSTYLE: u32 = 1 << 0;
const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_STRUCTURED_REPLY: u32 = 8;
const NBD_REP_MAGIC: u64 = 0x3e88_9045_7ac0_15e2;
const NBD_REP_ACK: u32 = 1;

const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_DISC: u16 = 2;

#[derive(Parser)]
#[command(about = "Manual smoke-test client for the NBD server")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(long, default_value_t = 10809)]
    port: u16,

    /// Offset to exercise
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Number of bytes to write and read back
    #[arg(long, default_value_t = 4096)]
    length: u32,

    /// Ask the server for structured replies
    #[arg(long)]
    structured_reply: bool,
}

fn write_u16(stream: &mut TcpStream, v: u16) -> std::io::Result<()> {
    stream.write_all(&v.to_be_bytes())
}

fn write_u32(stream: &mut TcpStream, v: u32) -> std::io::Result<()> {
    stream.write_all(&v.to_be_bytes())
}

fn write_u64(stream: &mut TcpStream, v: u64) -> std::io::Result<()> {
    stream.write_all(&v.to_be_bytes())
}

fn read_u16(stream: &mut TcpStream) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(stream: &mut TcpStream) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(stream: &mut TcpStream) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn handshake(stream: &mut TcpStream, structured_reply: bool) -> std::io::Result<()> {
    let mut passwd = [0u8; 8];
    stream.read_exact(&mut passwd)?;
    assert_eq!(u64::from_be_bytes(passwd), NBD_INIT_PASSWD, "bad init passwd");

    let mut opts_magic = [0u8; 8];
    stream.read_exact(&mut opts_magic)?;
    assert_eq!(u64::from_be_bytes(opts_magic), NBD_OPTS_MAGIC, "bad opts magic");

    let server_flags = read_u16(stream)?;
    assert_ne!(server_flags & NBD_FLAG_FIXED_NEWSTYLE, 0, "server refused fixed-newstyle");

    write_u32(stream, NBD_FLAG_CLIENT_FIXED_NEWSTYLE)?;

    if structured_reply {
        write_u64(stream, NBD_OPTS_MAGIC)?;
        write_u32(stream, NBD_OPT_STRUCTURED_REPLY)?;
        write_u32(stream, 0)?;

        let reply_magic = read_u64(stream)?;
        assert_eq!(reply_magic, NBD_REP_MAGIC, "bad option reply magic");
        let _option = read_u32(stream)?;
        let reply_type = read_u32(stream)?;
        assert_eq!(reply_type, NBD_REP_ACK, "server rejected structured reply negotiation");
        let len = read_u32(stream)?;
        assert_eq!(len, 0);
    }

    write_u64(stream, NBD_OPTS_MAGIC)?;
    write_u32(stream, NBD_OPT_EXPORT_NAME)?;
    write_u32(stream, 0)?;

    let mut export_size = [0u8; 8];
    stream.read_exact(&mut export_size)?;
    let mut flags = [0u8; 2];
    stream.read_exact(&mut flags)?;
    let mut zeroes = [0u8; 124];
    stream.read_exact(&mut zeroes)?;

    println!(
        "negotiated: export size {} bytes, flags {:#06x}",
        u64::from_be_bytes(export_size),
        u16::from_be_bytes(flags)
    );
    Ok(())
}

fn send_request(stream: &mut TcpStream, cmd_type: u16, handle: u64, offset: u64, length: u32) -> std::io::Result<()> {
    write_u32(stream, NBD_REQUEST_MAGIC)?;
    write_u16(stream, 0)?;
    write_u16(stream, cmd_type)?;
    write_u64(stream, handle)?;
    write_u64(stream, offset)?;
    write_u32(stream, length)?;
    Ok(())
}

fn read_simple_reply(stream: &mut TcpStream) -> std::io::Result<(u32, u64)> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic)?;
    assert_eq!(u32::from_be_bytes(magic), NBD_SIMPLE_REPLY_MAGIC, "bad simple reply magic");
    let error = read_u32(stream)?;
    let handle = read_u64(stream)?;
    Ok((error, handle))
}

fn run(args: Args) -> std::io::Result<()> {
    let mut stream = TcpStream::connect((args.host.as_str(), args.port))?;
    handshake(&mut stream, args.structured_reply)?;

    if args.structured_reply {
        eprintln!("structured-reply round trip not implemented in this smoke client; exercising simple replies");
    }

    let pattern: Vec<u8> = (0..args.length).map(|i| (i % 251) as u8).collect();

    send_request(&mut stream, NBD_CMD_WRITE, 1, args.offset, args.length)?;
    stream.write_all(&pattern)?;
    let (error, handle) = read_simple_reply(&mut stream)?;
    println!("write: handle={handle} error={error}");
    assert_eq!(error, 0, "write failed");

    send_request(&mut stream, NBD_CMD_READ, 2, args.offset, args.length)?;
    let (error, handle) = read_simple_reply(&mut stream)?;
    let mut readback = vec![0u8; args.length as usize];
    stream.read_exact(&mut readback)?;
    println!("read: handle={handle} error={error}");
    assert_eq!(error, 0, "read failed");
    assert_eq!(readback, pattern, "readback did not match what was written");
    println!("round trip verified over {} bytes at offset {}", args.length, args.offset);

    send_request(&mut stream, NBD_CMD_DISC, 3, 0, 0)?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
