//! Submission/Completion Ring: the one place this crate talks to the kernel.
//!
//! Built on the `io-uring` crate rather than hand-rolled `mmap`/`io_uring_enter`
//! calls — the crate already implements the acquire/release-barrier discipline
//! the underlying SQ/CQ shared memory requires, which is the same reasoning
//! that led the teacher to wrap `io_uring::IoUring` in `io_thread` instead of
//! going to raw syscalls.
//!
//! `IoUring::split` hands back three independently ownable pieces
//! (`Submitter`, `SubmissionQueue`, `CompletionQueue`). The Receiver only
//! ever pushes SQEs (no kernel entry call of its own); the Sender owns the
//! `Submitter` and is the only thread that ever calls into the kernel, via
//! `submit_and_wait`, which both flushes whatever the Receiver has queued
//! and blocks for completions in one syscall. That split is what lets the
//! two threads run without a lock serialising them: the shared ring memory
//! tolerates a concurrent producer and a concurrent consumer by
//! construction, and only the IOT/NRT occupancy protocol needs to agree on
//! who touches which slot.
//!
//! `user_data` on every submitted SQE is simply the IOT slot index: the slot
//! already records the opcode, mother NRT index, and target range, so there
//! is nothing else worth packing into it.

use std::io;
use std::os::unix::io::RawFd;

use io_uring::squeue::Flags;
use io_uring::{opcode, types, IoUring};

/// One reaped completion: which IOT slot it belongs to and the raw `res`
/// value from the CQE (negative `-errno` on failure, bytes-transferred or 0
/// on success).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCompletion {
    pub iot_idx: u32,
    pub result: i32,
}

/// The Receiver's view of the ring: push submissions. Never calls into the
/// kernel itself — see module docs.
pub trait SubmitRing {
    fn submit_read_fixed(&mut self, iot_idx: u32, offset: u64, length: u32, buf_ptr: *mut u8, buf_index: u16, drain_barrier: bool);
    fn submit_write_fixed(&mut self, iot_idx: u32, offset: u64, length: u32, buf_ptr: *const u8, buf_index: u16, drain_barrier: bool);
    /// A NOP submission used purely to wake the Sender (e.g. after a
    /// pre-validated per-request error that generates no real I/O).
    fn submit_nop(&mut self, iot_idx: u32, drain_barrier: bool);
    /// `NBD_CMD_FLUSH`: fsync the export. Always submitted as a drain
    /// barrier so every write accepted before the flush request is durable
    /// before it completes.
    fn submit_fsync(&mut self, iot_idx: u32);
}

/// The Sender's view of the ring: flush submissions, wait for and reap
/// completions.
pub trait CompleteRing {
    /// Flush whatever is queued and block until at least `min_complete`
    /// completions are ready.
    fn wait(&mut self, min_complete: usize) -> io::Result<usize>;
    /// Drain all currently available completions.
    fn reap(&mut self) -> Vec<RingCompletion>;
}

/// Submission-side handle to a live `io_uring` instance. Lives on the
/// Receiver thread. Holds no `Submitter`: pushing an SQE never enters the
/// kernel on its own.
pub struct UringSubmitSide {
    sq: io_uring::SubmissionQueue<'static>,
}

// Safety: the SQ tail this handle owns is only ever advanced from the
// Receiver thread; the kernel-shared ring memory tolerates a concurrent
// reader (the Sender's CompletionQueue) by construction.
unsafe impl Send for UringSubmitSide {}

/// Completion-side handle to a live `io_uring` instance, plus the ring's
/// sole `Submitter`. Lives on the Sender thread.
pub struct UringCompleteSide {
    cq: io_uring::CompletionQueue<'static>,
    submitter: io_uring::Submitter<'static>,
}

unsafe impl Send for UringCompleteSide {}

impl UringSubmitSide {
    fn push_entry(&mut self, sqe: &io_uring::squeue::Entry) {
        loop {
            if unsafe { self.sq.push(sqe) }.is_ok() {
                self.sq.sync();
                return;
            }
            // SQ full: the Sender drains it into the kernel on every
            // `wait` call, so spin until it catches up rather than
            // blocking on a lock here.
            std::thread::yield_now();
        }
    }
}

impl SubmitRing for UringSubmitSide {
    fn submit_read_fixed(
        &mut self,
        iot_idx: u32,
        offset: u64,
        length: u32,
        buf_ptr: *mut u8,
        buf_index: u16,
        drain_barrier: bool,
    ) {
        let mut entry = opcode::ReadFixed::new(types::Fixed(0), buf_ptr, length, buf_index)
            .offset(offset)
            .build()
            .user_data(iot_idx as u64);
        if drain_barrier {
            entry = entry.flags(Flags::IO_DRAIN);
        }
        self.push_entry(&entry);
    }

    fn submit_write_fixed(
        &mut self,
        iot_idx: u32,
        offset: u64,
        length: u32,
        buf_ptr: *const u8,
        buf_index: u16,
        drain_barrier: bool,
    ) {
        let mut entry = opcode::WriteFixed::new(types::Fixed(0), buf_ptr, length, buf_index)
            .offset(offset)
            .build()
            .user_data(iot_idx as u64);
        if drain_barrier {
            entry = entry.flags(Flags::IO_DRAIN);
        }
        self.push_entry(&entry);
    }

    fn submit_nop(&mut self, iot_idx: u32, drain_barrier: bool) {
        let mut entry = opcode::Nop::new().build().user_data(iot_idx as u64);
        if drain_barrier {
            entry = entry.flags(Flags::IO_DRAIN);
        }
        self.push_entry(&entry);
    }

    fn submit_fsync(&mut self, iot_idx: u32) {
        let entry = opcode::Fsync::new(types::Fixed(0))
            .build()
            .user_data(iot_idx as u64)
            .flags(Flags::IO_DRAIN);
        self.push_entry(&entry);
    }
}

impl CompleteRing for UringCompleteSide {
    fn wait(&mut self, min_complete: usize) -> io::Result<usize> {
        self.submitter.submit_and_wait(min_complete)
    }

    fn reap(&mut self) -> Vec<RingCompletion> {
        self.cq.sync();
        self.cq
            .by_ref()
            .map(|cqe| RingCompletion {
                iot_idx: cqe.user_data() as u32,
                result: cqe.result(),
            })
            .collect()
    }
}

/// Build a live `io_uring` instance sized for `entries` SQ/CQ slots, register
/// `export_fd` as fixed file index 0 and every arena slot in `buffers` as a
/// fixed buffer, then split it into the Receiver's submit side and the
/// Sender's complete side.
///
/// The `IoUring` itself is leaked to obtain the `'static` lifetime `split`
/// needs to hand back halves with no borrow back to this function's stack
/// frame — the same trick the buffer arena uses to outlive its allocating
/// thread.
pub fn open(
    entries: u32,
    export_fd: RawFd,
    buffers: &[libc::iovec],
) -> io::Result<(UringSubmitSide, UringCompleteSide)> {
    let ring: &'static mut IoUring = Box::leak(Box::new(IoUring::new(entries)?));

    ring.submitter().register_files(&[export_fd])?;
    if !buffers.is_empty() {
        unsafe { ring.submitter().register_buffers(buffers) }?;
    }

    let (submitter, sq, cq) = ring.split();
    Ok((UringSubmitSide { sq }, UringCompleteSide { cq, submitter }))
}

/// In-memory ring substitute for tests: a scripted completion queue with no
/// real kernel behind it. Sanctioned directly by the design note that NOP
/// submissions can stand in for synthetic wakeups — here the whole ring is
/// synthetic.
#[cfg(any(test, feature = "test-util"))]
pub struct FakeRing {
    completed: std::collections::VecDeque<RingCompletion>,
}

#[cfg(any(test, feature = "test-util"))]
impl FakeRing {
    pub fn new() -> Self {
        Self {
            completed: std::collections::VecDeque::new(),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for FakeRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl SubmitRing for FakeRing {
    fn submit_read_fixed(&mut self, iot_idx: u32, _offset: u64, _length: u32, _buf_ptr: *mut u8, _buf_index: u16, _drain_barrier: bool) {
        self.completed.push_back(RingCompletion { iot_idx, result: 0 });
    }

    fn submit_write_fixed(
        &mut self,
        iot_idx: u32,
        _offset: u64,
        _length: u32,
        _buf_ptr: *const u8,
        _buf_index: u16,
        _drain_barrier: bool,
    ) {
        self.completed.push_back(RingCompletion { iot_idx, result: 0 });
    }

    fn submit_nop(&mut self, iot_idx: u32, _drain_barrier: bool) {
        self.completed.push_back(RingCompletion { iot_idx, result: 0 });
    }

    fn submit_fsync(&mut self, iot_idx: u32) {
        self.completed.push_back(RingCompletion { iot_idx, result: 0 });
    }
}

#[cfg(any(test, feature = "test-util"))]
impl CompleteRing for FakeRing {
    fn wait(&mut self, _min_complete: usize) -> io::Result<usize> {
        Ok(self.completed.len())
    }

    fn reap(&mut self) -> Vec<RingCompletion> {
        self.completed.drain(..).collect()
    }
}
