//! Counting semaphore mediating NRT/IOT cell allocation.
//!
//! The design note is explicit that cell accounting uses a semaphore, not a
//! mutex, so that allocation is the only thing that blocks: the `occupied`
//! flag of each slot is written exactly at the moment a cell is claimed or
//! released, under cover of the semaphore's own happens-before edge.

use std::sync::{Condvar, Mutex};

pub struct Semaphore {
    count: Mutex<usize>,
    cvar: Condvar,
    capacity: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            count: Mutex::new(capacity),
            cvar: Condvar::new(),
            capacity,
        }
    }

    /// Block until a cell is available, then claim it.
    pub fn acquire(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        while *count == 0 {
            count = self.cvar.wait(count).expect("semaphore mutex poisoned");
        }
        *count -= 1;
    }

    /// Claim a cell without blocking; `false` if none is free.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Release a previously claimed cell.
    pub fn release(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        debug_assert!(*count < self.capacity, "semaphore released past capacity");
        *count += 1;
        self.cvar.notify_one();
    }

    /// True iff every cell is currently free (no slot occupied).
    pub fn is_idle(&self) -> bool {
        *self.count.lock().expect("semaphore mutex poisoned") == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_release_round_trips() {
        let sem = Semaphore::new(2);
        sem.acquire();
        sem.acquire();
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
    }

    #[test]
    fn is_idle_tracks_capacity() {
        let sem = Semaphore::new(3);
        assert!(sem.is_idle());
        sem.acquire();
        assert!(!sem.is_idle());
        sem.release();
        assert!(sem.is_idle());
    }

    #[test]
    fn try_acquire_fails_when_exhausted() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(1));
        sem.acquire();

        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            sem2.acquire();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        sem.release();
        handle.join().expect("acquirer thread panicked");
    }
}
