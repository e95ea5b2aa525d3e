//! Server sizing and operational configuration.
//!
//! Hardcoded defaults that are not necessarily shared protocol constants.
//! Protocol constants (magics, command codes, block size) live in `constants`.

use crate::constants::{BLOCK_SIZE, MAX_REQUEST_LENGTH};

/// Default I/O Request Table capacity. Must be a power of two and satisfy
/// `MAX_IO >= ceil(MAX_REQUEST_LENGTH / BLOCK_SIZE)` so a single maximum-size
/// request can always be sliced without deadlocking on IOT capacity.
pub const DEFAULT_MAX_IO: usize = 256;

/// Default NBD Request Table capacity. Must be a power of two.
pub const DEFAULT_MAX_NBD: usize = 32;

/// Default io_uring ring size (number of SQ/CQ entries).
pub const DEFAULT_RING_ENTRIES: u32 = 512;

/// Raw request header size on the wire, in bytes.
pub const REQUEST_HEADER_SIZE: usize = 28;

/// Structured reply chunk header size on the wire, in bytes.
pub const REPLY_HEADER_SIZE: usize = 20;

const fn min_io_slots_for(max_request_length: u32) -> usize {
    (max_request_length as usize).div_ceil(BLOCK_SIZE)
}

// Compile-time sanity checks
const _: () = assert!(
    DEFAULT_MAX_IO >= min_io_slots_for(MAX_REQUEST_LENGTH),
    "MAX_IO too small to slice one maximum-size request"
);
const _: () = assert!(DEFAULT_MAX_IO.is_power_of_two(), "MAX_IO must be a power of two");
const _: () = assert!(DEFAULT_MAX_NBD.is_power_of_two(), "MAX_NBD must be a power of two");

/// Runtime session configuration, built from CLI flags and validated once at
/// startup (see `SessionConfig::validate`).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_io: usize,
    pub max_nbd: usize,
    pub ring_entries: u32,
    pub read_only: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_io: DEFAULT_MAX_IO,
            max_nbd: DEFAULT_MAX_NBD,
            ring_entries: DEFAULT_RING_ENTRIES,
            read_only: false,
        }
    }
}

impl SessionConfig {
    /// Validate sizing invariants required by the IOT/NRT/SCR. A violation is
    /// a configuration error, not a runtime fault: caught once at startup.
    pub fn validate(&self) -> Result<(), String> {
        if !self.max_io.is_power_of_two() {
            return Err(format!("max_io ({}) must be a power of two", self.max_io));
        }
        if !self.max_nbd.is_power_of_two() {
            return Err(format!("max_nbd ({}) must be a power of two", self.max_nbd));
        }
        let min_io = min_io_slots_for(MAX_REQUEST_LENGTH);
        if self.max_io < min_io {
            return Err(format!(
                "max_io ({}) too small to slice a {MAX_REQUEST_LENGTH}-byte request at \
                 {BLOCK_SIZE}-byte blocks (need at least {min_io})",
                self.max_io
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn non_power_of_two_max_io_rejected() {
        let cfg = SessionConfig {
            max_io: 300,
            ..SessionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn too_small_max_io_rejected() {
        let cfg = SessionConfig {
            max_io: 4,
            ..SessionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
