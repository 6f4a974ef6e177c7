//! Pipeline-wide counters and the status/stats surface.
//!
//! Counters are plain relaxed atomics bumped from the worker threads;
//! [`StatsSnapshot`] is the point-in-time copy handed to monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::dictionary::DictionaryStats;
use crate::report::ReportState;

/// Accumulated user/system CPU of one worker thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRusage {
    pub utime: Duration,
    pub stime: Duration,
}

fn duration_from_timeval(t: libc::timeval) -> Duration {
    #[allow(clippy::cast_sign_loss)]
    Duration::new(t.tv_sec.max(0) as u64, (t.tv_usec.max(0) as u32) * 1000)
}

/// Samples the calling thread's accumulated CPU time.
pub(crate) fn thread_rusage() -> ThreadRusage {
    // RUSAGE_THREAD is linux-only; elsewhere fall back to the process
    #[cfg(target_os = "linux")]
    let who = libc::RUSAGE_THREAD;
    #[cfg(not(target_os = "linux"))]
    let who = libc::RUSAGE_SELF;

    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: `ru` is a valid zeroed out-param for getrusage
    let rc = unsafe { libc::getrusage(who, &mut ru) };
    if rc != 0 {
        return ThreadRusage::default();
    }

    ThreadRusage {
        utime: duration_from_timeval(ru.ru_utime),
        stime: duration_from_timeval(ru.ru_stime),
    }
}

#[derive(Debug, Default)]
pub struct UdpCounters {
    pub poll_total: AtomicU64,
    pub recv_total: AtomicU64,
    pub recv_eagain: AtomicU64,
    pub recv_bytes: AtomicU64,
    pub recv_packets: AtomicU64,
    pub packet_decode_err: AtomicU64,
    pub batch_send_total: AtomicU64,
    pub batch_send_err: AtomicU64,
}

#[derive(Debug, Default)]
pub struct RepackerCounters {
    pub poll_total: AtomicU64,
    pub recv_total: AtomicU64,
    pub recv_eagain: AtomicU64,
    pub recv_packets: AtomicU64,
    pub packet_validate_err: AtomicU64,
    pub batch_send_total: AtomicU64,
    pub batch_send_err: AtomicU64,
    pub batch_send_by_timer: AtomicU64,
    pub batch_send_by_size: AtomicU64,
}

#[derive(Debug, Default)]
pub struct CoordinatorCounters {
    pub batches_received: AtomicU64,
    pub batch_send_total: AtomicU64,
    pub batch_send_err: AtomicU64,
    pub batches_send_dropped: AtomicU64,
    pub control_requests: AtomicU64,
}

/// Shared mutable stats, one instance per engine.
#[derive(Debug)]
pub struct Stats {
    started_at: Instant,
    pub udp: UdpCounters,
    pub repacker: RepackerCounters,
    pub coordinator: CoordinatorCounters,

    pub collector_threads: Mutex<Vec<ThreadRusage>>,
    pub repacker_threads: Mutex<Vec<ThreadRusage>>,
    pub coordinator_thread: Mutex<ThreadRusage>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            udp: UdpCounters::default(),
            repacker: RepackerCounters::default(),
            coordinator: CoordinatorCounters::default(),
            collector_threads: Mutex::new(Vec::new()),
            repacker_threads: Mutex::new(Vec::new()),
            coordinator_thread: Mutex::new(ThreadRusage::default()),
        }
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[inline]
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Plain-value mirrors of the counter groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpStats {
    pub poll_total: u64,
    pub recv_total: u64,
    pub recv_eagain: u64,
    pub recv_bytes: u64,
    pub recv_packets: u64,
    pub packet_decode_err: u64,
    pub batch_send_total: u64,
    pub batch_send_err: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RepackerStats {
    pub poll_total: u64,
    pub recv_total: u64,
    pub recv_eagain: u64,
    pub recv_packets: u64,
    pub packet_validate_err: u64,
    pub batch_send_total: u64,
    pub batch_send_err: u64,
    pub batch_send_by_timer: u64,
    pub batch_send_by_size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorStats {
    pub batches_received: u64,
    pub batch_send_total: u64,
    pub batch_send_err: u64,
    pub batches_send_dropped: u64,
    pub control_requests: u64,
}

/// Point-in-time view of the whole engine for the status surface.
#[derive(Debug, Default)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub udp: UdpStats,
    pub repacker: RepackerStats,
    pub coordinator: CoordinatorStats,
    pub dictionary: DictionaryStats,
    pub collector_rusage: Vec<ThreadRusage>,
    pub repacker_rusage: Vec<ThreadRusage>,
    pub coordinator_rusage: ThreadRusage,
    pub active_reports: Vec<ReportState>,
}

impl Stats {
    /// Copies every counter; report states are filled in by the engine.
    #[must_use]
    pub fn snapshot(&self, dictionary: DictionaryStats) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            udp: UdpStats {
                poll_total: load(&self.udp.poll_total),
                recv_total: load(&self.udp.recv_total),
                recv_eagain: load(&self.udp.recv_eagain),
                recv_bytes: load(&self.udp.recv_bytes),
                recv_packets: load(&self.udp.recv_packets),
                packet_decode_err: load(&self.udp.packet_decode_err),
                batch_send_total: load(&self.udp.batch_send_total),
                batch_send_err: load(&self.udp.batch_send_err),
            },
            repacker: RepackerStats {
                poll_total: load(&self.repacker.poll_total),
                recv_total: load(&self.repacker.recv_total),
                recv_eagain: load(&self.repacker.recv_eagain),
                recv_packets: load(&self.repacker.recv_packets),
                packet_validate_err: load(&self.repacker.packet_validate_err),
                batch_send_total: load(&self.repacker.batch_send_total),
                batch_send_err: load(&self.repacker.batch_send_err),
                batch_send_by_timer: load(&self.repacker.batch_send_by_timer),
                batch_send_by_size: load(&self.repacker.batch_send_by_size),
            },
            coordinator: CoordinatorStats {
                batches_received: load(&self.coordinator.batches_received),
                batch_send_total: load(&self.coordinator.batch_send_total),
                batch_send_err: load(&self.coordinator.batch_send_err),
                batches_send_dropped: load(&self.coordinator.batches_send_dropped),
                control_requests: load(&self.coordinator.control_requests),
            },
            dictionary,
            collector_rusage: self.collector_threads.lock().clone(),
            repacker_rusage: self.repacker_threads.lock().clone(),
            coordinator_rusage: *self.coordinator_thread.lock(),
            active_reports: Vec::new(),
        }
    }
}
