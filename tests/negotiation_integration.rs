//! Drives `negotiation::handshake` against a real loopback socket, playing
//! the client side by hand at the byte level.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use nbd_server::export::Export;

const NBD_INIT_PASSWD: u64 = 0x4e42_444d_4147_4943;
const NBD_OPTS_MAGIC: u64 = 0x4948_4156_454f_5054;
const NBD_FLAG_CLIENT_FIXED_NEWSTYLE: u32 = 1 << 0;
const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_ABORT: u32 = 2;
const NBD_REP_MAGIC: u64 = 0x3e88_9045_7ac0_15e2;
const NBD_REP_ACK: u32 = 1;

struct TempFile(std::path::PathBuf);

impl TempFile {
    fn new(tag: &str, size: u64) -> Self {
        let path = std::env::temp_dir().join(format!(
            "nbd-server-test-{tag}-{}-{:?}",
            std::process::id(),
            thread::current().id()
        ));
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(size).unwrap();
        Self(path)
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

#[test]
fn export_name_option_completes_transmission_phase() {
    let backing = TempFile::new("export-name", 1 << 20);
    let export = Export::open(&backing.0, false).unwrap();
    let (mut server, mut client) = loopback_pair();

    let handshake = thread::spawn(move || nbd_server::negotiation::handshake(&mut server, &export));

    let mut passwd = [0u8; 8];
    client.read_exact(&mut passwd).unwrap();
    assert_eq!(u64::from_be_bytes(passwd), NBD_INIT_PASSWD);
    let mut opts_magic = [0u8; 8];
    client.read_exact(&mut opts_magic).unwrap();
    assert_eq!(u64::from_be_bytes(opts_magic), NBD_OPTS_MAGIC);
    let mut server_flags = [0u8; 2];
    client.read_exact(&mut server_flags).unwrap();

    client.write_all(&NBD_FLAG_CLIENT_FIXED_NEWSTYLE.to_be_bytes()).unwrap();

    client.write_all(&NBD_OPTS_MAGIC.to_be_bytes()).unwrap();
    client.write_all(&NBD_OPT_EXPORT_NAME.to_be_bytes()).unwrap();
    client.write_all(&0u32.to_be_bytes()).unwrap();

    let mut size = [0u8; 8];
    client.read_exact(&mut size).unwrap();
    assert_eq!(u64::from_be_bytes(size), 1 << 20);
    let mut flags = [0u8; 2];
    client.read_exact(&mut flags).unwrap();
    let mut zero_pad = [0u8; 124];
    client.read_exact(&mut zero_pad).unwrap();
    assert!(zero_pad.iter().all(|&b| b == 0));

    let result = handshake.join().unwrap().unwrap();
    let negotiated = result.expect("client did not abort");
    assert!(!negotiated.structured_reply);
}

#[test]
fn abort_option_is_reported_without_a_reply_body() {
    let backing = TempFile::new("abort", 4096);
    let export = Export::open(&backing.0, false).unwrap();
    let (mut server, mut client) = loopback_pair();

    let handshake = thread::spawn(move || nbd_server::negotiation::handshake(&mut server, &export));

    let mut passwd = [0u8; 8];
    client.read_exact(&mut passwd).unwrap();
    let mut opts_magic = [0u8; 8];
    client.read_exact(&mut opts_magic).unwrap();
    let mut server_flags = [0u8; 2];
    client.read_exact(&mut server_flags).unwrap();
    client.write_all(&NBD_FLAG_CLIENT_FIXED_NEWSTYLE.to_be_bytes()).unwrap();

    client.write_all(&NBD_OPTS_MAGIC.to_be_bytes()).unwrap();
    client.write_all(&NBD_OPT_ABORT.to_be_bytes()).unwrap();
    client.write_all(&0u32.to_be_bytes()).unwrap();

    let mut reply_magic = [0u8; 8];
    client.read_exact(&mut reply_magic).unwrap();
    assert_eq!(u64::from_be_bytes(reply_magic), NBD_REP_MAGIC);
    let mut option = [0u8; 4];
    client.read_exact(&mut option).unwrap();
    assert_eq!(u32::from_be_bytes(option), NBD_OPT_ABORT);
    let mut reply_type = [0u8; 4];
    client.read_exact(&mut reply_type).unwrap();
    assert_eq!(u32::from_be_bytes(reply_type), NBD_REP_ACK);
    let mut len = [0u8; 4];
    client.read_exact(&mut len).unwrap();
    assert_eq!(u32::from_be_bytes(len), 0);

    let result = handshake.join().unwrap().unwrap();
    assert!(result.is_err(), "expected AbortRequested");
}
