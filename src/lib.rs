//! Library crate for the NBD server core: bounded slot tables, protocol
//! framing, negotiation, and the pure request-slicing logic, kept separate
//! from the binary so it is testable without a live ring.
//!
//! The **binary** (`main.rs`) is the only io_uring entrypoint: it wires
//! `scr`, `receiver`, and `sender` together inside `session`. `scr`'s real
//! `io_uring`-backed types are not exercised outside the binary; the
//! `FakeRing` test double in `scr` stands in for them everywhere else.

pub mod arena;
pub mod config;
pub mod constants;
pub mod error;
pub mod export;
pub mod iot;
pub mod metrics;
pub mod negotiation;
pub mod nrt;
pub mod protocol;
pub mod receiver;
pub mod scr;
pub mod semaphore;
pub mod sender;
pub mod session;
pub mod socket_opts;
