//! Fatal-error taxonomy (see distilled-spec §7). Protocol and I/O errors are
//! per-request and carried to the client on the wire; everything in this
//! enum terminates the process instead.

use std::io;

/// A fatal error: transport failure, ring/syscall failure, or a
/// negotiation-phase failure that leaves the connection unusable. `main`
/// logs this once and exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("socket transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("io_uring ring/syscall error: {0}")]
    Ring(#[source] io::Error),

    #[error("client protocol framing error: {0}")]
    Protocol(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type FatalResult<T> = Result<T, FatalError>;
