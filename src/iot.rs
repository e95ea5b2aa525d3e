//! I/O Request Table: one bounded slot per in-flight kernel I/O operation,
//! each with a fixed 1:1 correspondence to a pre-registered arena buffer.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::metrics;
use crate::semaphore::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOpcode {
    ReadFixed,
    WriteFixed,
    /// `NBD_CMD_FLUSH`: an `fsync` against the export.
    Fsync,
    /// No-op submission solely to wake the Sender (DISC, `NBD_CMD_TRIM`,
    /// pre-validated errors).
    Nop,
}

/// Sentinel `mother` value for an IOT entry that doesn't belong to any NRT
/// request — a wakeup-only NOP (e.g. `NBD_CMD_DISC`) that exists solely to
/// unblock the Sender's wait on the ring. The Sender releases such an entry
/// without touching the NRT.
pub const NO_MOTHER: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
pub struct IotEntry {
    pub occupied: bool,
    pub mother: usize,
    pub opcode: IoOpcode,
    pub offset: u64,
    pub length: u32,
    pub error: u32,
}

impl IotEntry {
    const EMPTY: Self = Self {
        occupied: false,
        mother: NO_MOTHER,
        opcode: IoOpcode::Nop,
        offset: 0,
        length: 0,
        error: 0,
    };
}

pub struct Iot {
    slots: Vec<Mutex<IotEntry>>,
    sem: Semaphore,
    hint: AtomicUsize,
}

impl Iot {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "MAX_IO must be a power of two");
        Self {
            slots: (0..capacity).map(|_| Mutex::new(IotEntry::EMPTY)).collect(),
            sem: Semaphore::new(capacity),
            hint: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Block until a cell is free, then claim it for `mother`'s I/O.
    pub fn acquire(&self, mother: usize, opcode: IoOpcode, offset: u64, length: u32, error: u32) -> usize {
        if !self.sem.try_acquire() {
            metrics::inc_iot_full();
            self.sem.acquire();
        }
        metrics::inc_iot_occ();
        metrics::inc_io_ops_submitted();
        self.claim_free_slot(mother, opcode, offset, length, error)
    }

    /// Claim a cell without blocking; `None` if the table is full.
    pub fn try_acquire(
        &self,
        mother: usize,
        opcode: IoOpcode,
        offset: u64,
        length: u32,
        error: u32,
    ) -> Option<usize> {
        if !self.sem.try_acquire() {
            metrics::inc_iot_full();
            return None;
        }
        metrics::inc_iot_occ();
        metrics::inc_io_ops_submitted();
        Some(self.claim_free_slot(mother, opcode, offset, length, error))
    }

    fn claim_free_slot(&self, mother: usize, opcode: IoOpcode, offset: u64, length: u32, error: u32) -> usize {
        let mask = self.slots.len() - 1;
        // Rotating hint spreads allocations across buffers rather than
        // reusing the most-recently-freed one immediately.
        let start = self.hint.load(Ordering::Relaxed) & mask;
        for step in 0..self.slots.len() {
            let idx = (start + step) & mask;
            let mut entry = self.slots[idx].lock().expect("IOT slot mutex poisoned");
            if !entry.occupied {
                *entry = IotEntry {
                    occupied: true,
                    mother,
                    opcode,
                    offset,
                    length,
                    error,
                };
                self.hint.store(idx + 1, Ordering::Relaxed);
                return idx;
            }
        }
        unreachable!("semaphore admitted a claim but no free IOT slot was found");
    }

    pub fn get(&self, idx: usize) -> IotEntry {
        *self.slots[idx].lock().expect("IOT slot mutex poisoned")
    }

    pub fn set_error(&self, idx: usize, error: u32) {
        self.slots[idx].lock().expect("IOT slot mutex poisoned").error = error;
    }

    pub fn release(&self, idx: usize) {
        {
            let mut entry = self.slots[idx].lock().expect("IOT slot mutex poisoned");
            entry.occupied = false;
        }
        self.sem.release();
        metrics::dec_iot_occ();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_fails_once_full() {
        let iot = Iot::new(2);
        let a = iot.try_acquire(0, IoOpcode::ReadFixed, 0, 4096, 0);
        let b = iot.try_acquire(0, IoOpcode::ReadFixed, 4096, 4096, 0);
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(iot.try_acquire(0, IoOpcode::ReadFixed, 8192, 4096, 0).is_none());
    }

    #[test]
    fn release_frees_capacity_for_reuse() {
        let iot = Iot::new(1);
        let idx = iot.try_acquire(0, IoOpcode::ReadFixed, 0, 4096, 0).unwrap();
        assert!(iot.try_acquire(0, IoOpcode::ReadFixed, 0, 4096, 0).is_none());
        iot.release(idx);
        assert!(iot.try_acquire(0, IoOpcode::ReadFixed, 0, 4096, 0).is_some());
    }

    #[test]
    fn mother_back_pointer_preserved() {
        let iot = Iot::new(4);
        let idx = iot.try_acquire(7, IoOpcode::WriteFixed, 0, 100, 0).unwrap();
        assert_eq!(iot.get(idx).mother, 7);
    }

    #[test]
    fn set_error_is_visible_via_get() {
        let iot = Iot::new(2);
        let idx = iot.try_acquire(0, IoOpcode::ReadFixed, 0, 4096, 0).unwrap();
        iot.set_error(idx, 22);
        assert_eq!(iot.get(idx).error, 22);
    }
}
