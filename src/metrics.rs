//! Feature-gated occupancy and stall counters, reported periodically via
//! `log`. Mirrors the teacher's zero-cost-when-disabled `imp` module split:
//! compiled out entirely unless the `metrics` feature is on.

#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // Stall / backpressure (cumulative counts)
    static NRT_FULL: AtomicU64 = AtomicU64::new(0);
    static IOT_FULL: AtomicU64 = AtomicU64::new(0);
    static CQ_WAIT_STALLS: AtomicU64 = AtomicU64::new(0);
    static DRAIN_BARRIERS: AtomicU64 = AtomicU64::new(0);
    // Throughput (cumulative)
    static REQUESTS_COMPLETED: AtomicU64 = AtomicU64::new(0);
    static IO_OPS_SUBMITTED: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static NRT_OCC: AtomicUsize = AtomicUsize::new(0);
    static IOT_OCC: AtomicUsize = AtomicUsize::new(0);
    static NRT_MAX_OCC: AtomicUsize = AtomicUsize::new(0);
    static IOT_MAX_OCC: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub nrt_full: u64,
        pub iot_full: u64,
        pub cq_wait_stalls: u64,
        pub drain_barriers: u64,
        pub requests_completed: u64,
        pub io_ops_submitted: u64,
        pub nrt_occ: usize,
        pub iot_occ: usize,
        pub nrt_max_occ: usize,
        pub iot_max_occ: usize,
    }

    fn update_max(target: &AtomicUsize, value: usize) {
        let mut prev = target.load(Ordering::Relaxed);
        while value > prev {
            match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn inc_nrt_full() {
        NRT_FULL.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_iot_full() {
        IOT_FULL.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cq_wait_stall() {
        CQ_WAIT_STALLS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_drain_barrier() {
        DRAIN_BARRIERS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_nrt_occ() {
        let v = NRT_OCC.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&NRT_MAX_OCC, v);
    }

    pub fn dec_nrt_occ() {
        NRT_OCC.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_iot_occ() {
        let v = IOT_OCC.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&IOT_MAX_OCC, v);
    }

    pub fn dec_iot_occ() {
        IOT_OCC.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_requests_completed() {
        REQUESTS_COMPLETED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_io_ops_submitted() {
        IO_OPS_SUBMITTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            nrt_full: NRT_FULL.load(Ordering::Relaxed),
            iot_full: IOT_FULL.load(Ordering::Relaxed),
            cq_wait_stalls: CQ_WAIT_STALLS.load(Ordering::Relaxed),
            drain_barriers: DRAIN_BARRIERS.load(Ordering::Relaxed),
            requests_completed: REQUESTS_COMPLETED.load(Ordering::Relaxed),
            io_ops_submitted: IO_OPS_SUBMITTED.load(Ordering::Relaxed),
            nrt_occ: NRT_OCC.load(Ordering::Relaxed),
            iot_occ: IOT_OCC.load(Ordering::Relaxed),
            nrt_max_occ: NRT_MAX_OCC.load(Ordering::Relaxed),
            iot_max_occ: IOT_MAX_OCC.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                log::info!(
                    "metrics delta {}s: completed={} io_ops={} | stalls: nrt_full={} iot_full={} cq_wait={} drain_barriers={} | gauges: nrt_occ={} iot_occ={} nrt_max={} iot_max={}",
                    INTERVAL_SECS,
                    snap.requests_completed.saturating_sub(last.requests_completed),
                    snap.io_ops_submitted.saturating_sub(last.io_ops_submitted),
                    snap.nrt_full.saturating_sub(last.nrt_full),
                    snap.iot_full.saturating_sub(last.iot_full),
                    snap.cq_wait_stalls.saturating_sub(last.cq_wait_stalls),
                    snap.drain_barriers.saturating_sub(last.drain_barriers),
                    snap.nrt_occ,
                    snap.iot_occ,
                    snap.nrt_max_occ,
                    snap.iot_max_occ,
                );
                last = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub nrt_full: u64,
        pub iot_full: u64,
        pub cq_wait_stalls: u64,
        pub drain_barriers: u64,
        pub requests_completed: u64,
        pub io_ops_submitted: u64,
        pub nrt_occ: usize,
        pub iot_occ: usize,
        pub nrt_max_occ: usize,
        pub iot_max_occ: usize,
    }

    pub fn inc_nrt_full() {}
    pub fn inc_iot_full() {}
    pub fn inc_cq_wait_stall() {}
    pub fn inc_drain_barrier() {}
    pub fn inc_nrt_occ() {}
    pub fn dec_nrt_occ() {}
    pub fn inc_iot_occ() {}
    pub fn dec_iot_occ() {}
    pub fn inc_requests_completed() {}
    pub fn inc_io_ops_submitted() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            nrt_full: 0,
            iot_full: 0,
            cq_wait_stalls: 0,
            drain_barriers: 0,
            requests_completed: 0,
            io_ops_submitted: 0,
            nrt_occ: 0,
            iot_occ: 0,
            nrt_max_occ: 0,
            iot_max_occ: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
