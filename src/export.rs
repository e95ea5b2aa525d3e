//! The single block device this server exposes.

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use crate::constants::PREFERRED_BLOCK_SIZE;
use crate::error::{FatalError, FatalResult};

/// A backing file opened for the session, along with the metadata the
/// negotiation phase advertises to clients.
pub struct Export {
    file: File,
    size: u64,
    read_only: bool,
}

impl Export {
    /// Open `path` and stat its size. `read_only` forces `O_RDONLY` even if
    /// the file is otherwise writable, and is reflected in the `NBD_FLAG_READ_ONLY`
    /// transmission flag during negotiation.
    pub fn open(path: &Path, read_only: bool) -> FatalResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(FatalError::Transport)?;
        let size = file.metadata().map_err(FatalError::Transport)?.len();
        Ok(Self { file, size, read_only })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn preferred_block_size(&self) -> u32 {
        PREFERRED_BLOCK_SIZE
    }
}
