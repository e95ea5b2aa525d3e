//! NBD Request Table: one bounded slot per in-flight client request.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::constants::NBD_CMD_WRITE;
use crate::metrics;
use crate::semaphore::Semaphore;

/// One in-flight NBD request. `occupied` and `io_reqs_pending` together
/// record the invariant from the data model: while `occupied`, exactly
/// `io_reqs_pending` IOT entries have `mother == <this slot's index>`.
#[derive(Debug, Clone, Copy)]
pub struct NrtEntry {
    pub occupied: bool,
    pub error: u32,
    pub cmd_type: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    pub io_reqs_pending: u32,
}

impl NrtEntry {
    const EMPTY: Self = Self {
        occupied: false,
        error: 0,
        cmd_type: 0,
        handle: 0,
        offset: 0,
        length: 0,
        io_reqs_pending: 0,
    };

    fn is_write(&self) -> bool {
        self.cmd_type == NBD_CMD_WRITE
    }

    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length as u64)
    }

    fn intersects(&self, offset: u64, length: u32) -> bool {
        let other_end = offset.saturating_add(length as u64);
        self.offset < other_end && offset < self.end()
    }
}

pub struct Nrt {
    slots: Vec<Mutex<NrtEntry>>,
    sem: Semaphore,
    hint: AtomicUsize,
}

impl Nrt {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "MAX_NBD must be a power of two");
        Self {
            slots: (0..capacity).map(|_| Mutex::new(NrtEntry::EMPTY)).collect(),
            sem: Semaphore::new(capacity),
            hint: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Block until a cell is free, claim it, and initialise it with the
    /// given request header. Returns the slot index.
    pub fn acquire(&self, cmd_type: u16, handle: u64, offset: u64, length: u32, error: u32) -> usize {
        if !self.sem.try_acquire() {
            metrics::inc_nrt_full();
            self.sem.acquire();
        }
        metrics::inc_nrt_occ();
        self.claim_free_slot(cmd_type, handle, offset, length, error)
    }

    fn claim_free_slot(&self, cmd_type: u16, handle: u64, offset: u64, length: u32, error: u32) -> usize {
        let mask = self.slots.len() - 1;
        let start = self.hint.load(Ordering::Relaxed) & mask;
        for step in 0..self.slots.len() {
            let idx = (start + step) & mask;
            let mut entry = self.slots[idx].lock().expect("NRT slot mutex poisoned");
            if !entry.occupied {
                *entry = NrtEntry {
                    occupied: true,
                    error,
                    cmd_type,
                    handle,
                    offset,
                    length,
                    io_reqs_pending: 0,
                };
                self.hint.store(idx + 1, Ordering::Relaxed);
                return idx;
            }
        }
        unreachable!("semaphore admitted a claim but no free NRT slot was found");
    }

    pub fn set_pending(&self, idx: usize, pending: u32) {
        self.slots[idx].lock().expect("NRT slot mutex poisoned").io_reqs_pending = pending;
    }

    /// Decrement the pending I/O count for slot `idx`; returns the new value.
    pub fn dec_pending(&self, idx: usize) -> u32 {
        let mut entry = self.slots[idx].lock().expect("NRT slot mutex poisoned");
        entry.io_reqs_pending = entry.io_reqs_pending.saturating_sub(1);
        entry.io_reqs_pending
    }

    pub fn get(&self, idx: usize) -> NrtEntry {
        *self.slots[idx].lock().expect("NRT slot mutex poisoned")
    }

    /// Record the first error seen for a request; later calls for the same
    /// slot are ignored once an error is already recorded, so the client
    /// sees the earliest failure rather than the last one to complete.
    pub fn set_error_if_absent(&self, idx: usize, error: u32) {
        let mut entry = self.slots[idx].lock().expect("NRT slot mutex poisoned");
        if entry.error == 0 {
            entry.error = error;
        }
    }

    /// Release a fully-drained slot (`io_reqs_pending == 0`) back to the pool.
    pub fn release(&self, idx: usize) {
        {
            let mut entry = self.slots[idx].lock().expect("NRT slot mutex poisoned");
            debug_assert_eq!(entry.io_reqs_pending, 0, "released NRT slot with I/O still pending");
            entry.occupied = false;
        }
        self.sem.release();
        metrics::dec_nrt_occ();
        metrics::inc_requests_completed();
    }

    /// True iff some other occupied entry's range intersects `[offset,
    /// offset+length)` and at least one of the two requests is a WRITE.
    pub fn overlaps(&self, exclude_idx: usize, is_write: bool, offset: u64, length: u32) -> bool {
        for (idx, slot) in self.slots.iter().enumerate() {
            if idx == exclude_idx {
                continue;
            }
            let entry = slot.lock().expect("NRT slot mutex poisoned");
            if !entry.occupied {
                continue;
            }
            if !(is_write || entry.is_write()) {
                continue;
            }
            if entry.intersects(offset, length) {
                return true;
            }
        }
        false
    }

    /// True iff no NRT slot is occupied (used to detect soft-disconnect
    /// completion).
    pub fn idle(&self) -> bool {
        self.sem.is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NBD_CMD_READ;

    #[test]
    fn acquire_release_cycles_through_capacity() {
        let nrt = Nrt::new(4);
        let mut idxs = Vec::new();
        for i in 0..4 {
            idxs.push(nrt.acquire(NBD_CMD_READ, i, 0, 0, 0));
        }
        assert!(!nrt.idle());
        for idx in idxs {
            nrt.release(idx);
        }
        assert!(nrt.idle());
    }

    #[test]
    fn overlap_requires_write_involvement() {
        let nrt = Nrt::new(4);
        let read_idx = nrt.acquire(NBD_CMD_READ, 1, 0, 4096, 0);

        // Another read over the same range: no ordering needed.
        assert!(!nrt.overlaps(usize::MAX, false, 0, 4096));

        nrt.release(read_idx);
        let write_idx = nrt.acquire(NBD_CMD_WRITE, 2, 0, 4096, 0);
        // A read overlapping a live write: ordering required.
        assert!(nrt.overlaps(usize::MAX, false, 0, 4096));
        // A disjoint read: no ordering required.
        assert!(!nrt.overlaps(usize::MAX, false, 8192, 4096));
        nrt.release(write_idx);
    }

    #[test]
    fn overlap_excludes_self() {
        let nrt = Nrt::new(4);
        let idx = nrt.acquire(NBD_CMD_WRITE, 1, 0, 4096, 0);
        assert!(!nrt.overlaps(idx, true, 0, 4096));
        nrt.release(idx);
    }

    #[test]
    fn pending_tracks_and_drains() {
        let nrt = Nrt::new(2);
        let idx = nrt.acquire(NBD_CMD_READ, 1, 0, 8192, 0);
        nrt.set_pending(idx, 2);
        assert_eq!(nrt.dec_pending(idx), 1);
        assert_eq!(nrt.dec_pending(idx), 0);
        nrt.release(idx);
    }
}
