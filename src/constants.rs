//! Wire-protocol constants: magics, command/option codes, error numbers.
//!
//! Values are the fixed-newstyle NBD protocol's. Only what this server
//! actually emits or recognises is defined here.

/// Block size used for IOT buffer slicing. The protocol-advertised minimum
/// block size need not equal this.
pub const BLOCK_SIZE: usize = 4096;

/// Maximum single-request length the server advertises to clients.
pub const MAX_REQUEST_LENGTH: u32 = 1 << 20;

/// Preferred block size advertised during negotiation.
pub const PREFERRED_BLOCK_SIZE: u32 = 4096;

/// Reserved TCP port for NBD.
pub const NBD_PORT: u16 = 10809;

// --- Transmission-phase request header ---

pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;

pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;

// --- Structured reply ---

pub const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

pub const NBD_REPLY_FLAG_DONE: u16 = 1 << 0;

pub const NBD_REPLY_TYPE_NONE: u16 = 0;
pub const NBD_REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub const NBD_REPLY_TYPE_ERROR_OFFSET: u16 = 0x8002;

// --- Simple reply (fallback path, negotiated by an external collaborator) ---

pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;

// --- NBD error numbers carried on the wire ---

pub const NBD_EINVAL: u32 = 22;
pub const NBD_EPERM: u32 = 1;

// --- Handshake / option haggling ---

pub const NBD_INIT_PASSWD: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
pub const NBD_OPTS_MAGIC: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"

pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;
pub const NBD_FLAG_CLIENT_FIXED_NEWSTYLE: u32 = 1 << 0;

pub const NBD_REP_MAGIC: u64 = 0x3e88_9045_7ac0_15e2;

pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;
pub const NBD_OPT_STRUCTURED_REPLY: u32 = 8;

pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = NBD_REP_FLAG_ERROR | 1;
pub const NBD_REP_ERR_UNKNOWN_EXPORT: u32 = NBD_REP_FLAG_ERROR | 6;

pub const NBD_INFO_EXPORT: u16 = 0;

pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
