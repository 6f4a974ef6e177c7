//! UDP collector pool.
//!
//! N workers each own a socket bound to the same endpoint with
//! `SO_REUSEADDR` + `SO_REUSEPORT`, so the kernel fans incoming datagrams
//! across them. Each worker decodes datagrams straight into its current
//! raw batch and publishes batches downstream without ever blocking: the
//! kernel socket buffer is the only place data is allowed to queue.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use rustix::event::{poll, PollFd, PollFlags, Timespec};
use rustix::net::{sockopt, AddressFamily, SocketType};
use tracing::{debug, error, warn};

use crate::error::PinbaError;
use crate::packet::{RawBatch, MAX_DATAGRAM_SIZE};
use crate::proto::decode_request;
use crate::stats::{add, inc, thread_rusage, Stats};

/// Collector pool configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Endpoint every worker binds to (port-reuse).
    pub address: SocketAddr,
    pub n_threads: u32,
    /// Records per published raw batch.
    pub batch_size: u32,
    /// Max time a non-empty batch stays open.
    pub batch_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 3002)),
            n_threads: 4,
            batch_size: 256,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

/// The collector thread pool. Dropping (or [`Collector::shutdown`]) joins
/// every worker.
pub struct Collector {
    threads: Vec<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
    local_addr: SocketAddr,
}

impl Collector {
    /// Binds one reuse-port socket per worker and spawns the workers.
    ///
    /// # Errors
    /// Returns an error when a socket cannot be created or bound, or a
    /// thread cannot be spawned.
    pub fn start(
        conf: &CollectorConfig,
        output: &Sender<RawBatch>,
        stats: &Arc<Stats>,
    ) -> Result<Self, PinbaError> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        stats
            .collector_threads
            .lock()
            .resize(conf.n_threads as usize, Default::default());

        let mut threads = Vec::with_capacity(conf.n_threads as usize);
        // port 0 resolves on the first bind; every other worker reuses it
        let mut bind_addr = conf.address;
        for i in 0..conf.n_threads {
            // bind in the caller so startup errors are catchable
            let sock = bind_reuseport(bind_addr)?;
            if bind_addr.port() == 0 {
                bind_addr = sock.local_addr()?;
            }

            let conf = conf.clone();
            let output = output.clone();
            let shutdown_rx = shutdown_rx.clone();
            let stats = Arc::clone(stats);

            let handle = std::thread::Builder::new()
                .name(format!("udp_reader/{i}"))
                .spawn(move || {
                    worker(i, &sock, &conf, &output, &shutdown_rx, &stats);
                    debug!("udp_reader/{i}; exiting");
                })?;
            threads.push(handle);
        }

        Ok(Self {
            threads,
            shutdown_tx: Some(shutdown_tx),
            local_addr: bind_addr,
        })
    }

    /// The endpoint the workers are bound to (resolved when the
    /// configured port was 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals every worker and joins them. Partial batches are dropped.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        drop(self.shutdown_tx.take());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("collector worker panicked");
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_reuseport(addr: SocketAddr) -> Result<UdpSocket, PinbaError> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::INET,
        SocketAddr::V6(_) => AddressFamily::INET6,
    };

    let fd = rustix::net::socket(family, SocketType::DGRAM, None)?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    sockopt::set_socket_reuseport(&fd, true)?;
    rustix::net::bind(&fd, &addr)?;

    let sock = UdpSocket::from(fd);
    sock.set_nonblocking(true)?;
    Ok(sock)
}

enum DrainOutcome {
    /// Socket drained to EAGAIN; go back to polling.
    Drained,
    /// Unrecoverable socket error; this worker exits.
    Fatal,
}

fn worker(
    thread_id: u32,
    sock: &UdpSocket,
    conf: &CollectorConfig,
    output: &Sender<RawBatch>,
    shutdown_rx: &Receiver<()>,
    stats: &Arc<Stats>,
) {
    let batch_size = conf.batch_size as usize;

    let mut recv = RecvQueue::new(batch_size);
    let mut batch = RawBatch::with_capacity(batch_size);
    let mut batch_opened = Instant::now();
    let mut next_rusage = Instant::now() + Duration::from_secs(1);

    loop {
        inc(&stats.udp.poll_total);

        let wait = if batch.is_empty() {
            conf.batch_timeout
        } else {
            conf.batch_timeout.saturating_sub(batch_opened.elapsed())
        };
        // 1 ms floor on poll wait
        let wait = wait.clamp(Duration::from_millis(1), Duration::from_secs(1));

        let readable = {
            let mut fds = [PollFd::new(sock, PollFlags::IN)];
            #[allow(clippy::cast_possible_wrap)]
            let timeout = Timespec {
                tv_sec: wait.as_secs() as i64,
                tv_nsec: i64::from(wait.subsec_nanos()),
            };
            match poll(&mut fds, Some(&timeout)) {
                Ok(0) => false,
                Ok(_) => true,
                Err(rustix::io::Errno::INTR) => false,
                Err(e) => {
                    error!("udp_reader/{thread_id}; poll() failed, exiting: {e}");
                    return;
                }
            }
        };

        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                debug!("udp_reader/{thread_id}; received shutdown request");
                return;
            }
            Err(TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if now >= next_rusage {
            stats.collector_threads.lock()[thread_id as usize] = thread_rusage();
            next_rusage = now + Duration::from_secs(1);
        }

        if !batch.is_empty() && batch_opened.elapsed() >= conf.batch_timeout {
            send_batch(&mut batch, batch_size, output, stats);
            batch_opened = Instant::now();
        }

        if !readable {
            continue;
        }

        let outcome = drain_socket(
            sock,
            &mut recv,
            &mut batch,
            &mut batch_opened,
            batch_size,
            output,
            stats,
        );
        match outcome {
            DrainOutcome::Drained => {}
            DrainOutcome::Fatal => {
                error!("udp_reader/{thread_id}; socket failed, exiting");
                return;
            }
        }
    }
}

fn send_batch(batch: &mut RawBatch, batch_size: usize, output: &Sender<RawBatch>, stats: &Stats) {
    let full = std::mem::replace(batch, RawBatch::with_capacity(batch_size));

    inc(&stats.udp.batch_send_total);
    match output.try_send(full) {
        Ok(()) => {}
        Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
            // lossy by design: never block the kernel socket buffer
            inc(&stats.udp.batch_send_err);
        }
    }
}

fn ingest_datagram(
    payload: &[u8],
    batch: &mut RawBatch,
    batch_opened: &mut Instant,
    batch_size: usize,
    output: &Sender<RawBatch>,
    stats: &Stats,
) {
    inc(&stats.udp.recv_packets);
    add(&stats.udp.recv_bytes, payload.len() as u64);

    match decode_request(payload) {
        Ok(request) => {
            if batch.is_empty() {
                *batch_opened = Instant::now();
            }
            batch.requests.push(request);

            if batch.len() >= batch_size {
                send_batch(batch, batch_size, output, stats);
                *batch_opened = Instant::now();
            }
        }
        Err(_) => {
            inc(&stats.udp.packet_decode_err);
        }
    }
}

// after EAGAIN, sleep at least 1ms before polling again, to let more
// packets arrive and save a ton on system calls
fn eagain_pause(
    batch: &mut RawBatch,
    batch_opened: &mut Instant,
    batch_size: usize,
    output: &Sender<RawBatch>,
    stats: &Stats,
) {
    inc(&stats.udp.recv_eagain);

    if !batch.is_empty() {
        send_batch(batch, batch_size, output, stats);
        *batch_opened = Instant::now();
    }

    std::thread::sleep(Duration::from_millis(1));
}

/// Scatter-gather multi-message receive on Linux.
#[cfg(target_os = "linux")]
struct RecvQueue {
    max_msgs: usize,
    buffers: Vec<u8>,
    iovecs: Vec<libc::iovec>,
    hdrs: Vec<libc::mmsghdr>,
}

#[cfg(target_os = "linux")]
impl RecvQueue {
    fn new(max_msgs: usize) -> Self {
        let max_msgs = max_msgs.max(1);
        let mut buffers = vec![0u8; max_msgs * MAX_DATAGRAM_SIZE];

        let mut iovecs = Vec::with_capacity(max_msgs);
        for i in 0..max_msgs {
            iovecs.push(libc::iovec {
                iov_base: buffers[i * MAX_DATAGRAM_SIZE..].as_mut_ptr().cast(),
                iov_len: MAX_DATAGRAM_SIZE,
            });
        }

        let mut hdrs = Vec::with_capacity(max_msgs);
        for iovec in &mut iovecs {
            // SAFETY: zeroed mmsghdr is a valid initial state
            let mut hdr: libc::mmsghdr = unsafe { std::mem::zeroed() };
            hdr.msg_hdr.msg_iov = std::ptr::from_mut(iovec);
            hdr.msg_hdr.msg_iovlen = 1;
            hdrs.push(hdr);
        }

        // buffers and iovecs are never resized after this point, so the
        // pointers captured above stay valid for the queue's lifetime
        Self {
            max_msgs,
            buffers,
            iovecs,
            hdrs,
        }
    }

    fn recv(&mut self, sock: &UdpSocket) -> std::io::Result<usize> {
        use std::os::fd::AsRawFd;

        // SAFETY: hdrs/iovecs/buffers are live for &mut self, sized for
        // max_msgs messages of MAX_DATAGRAM_SIZE each
        let rc = unsafe {
            libc::recvmmsg(
                sock.as_raw_fd(),
                self.hdrs.as_mut_ptr(),
                self.max_msgs as u32,
                libc::MSG_DONTWAIT,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        #[allow(clippy::cast_sign_loss)]
        Ok(rc as usize)
    }

    fn datagram(&self, i: usize) -> &[u8] {
        let len = self.hdrs[i].msg_len as usize;
        &self.buffers[i * MAX_DATAGRAM_SIZE..i * MAX_DATAGRAM_SIZE + len]
    }
}

#[cfg(target_os = "linux")]
#[allow(clippy::too_many_arguments)]
fn drain_socket(
    sock: &UdpSocket,
    recv: &mut RecvQueue,
    batch: &mut RawBatch,
    batch_opened: &mut Instant,
    batch_size: usize,
    output: &Sender<RawBatch>,
    stats: &Stats,
) -> DrainOutcome {
    loop {
        inc(&stats.udp.recv_total);

        match recv.recv(sock) {
            Ok(n) => {
                for i in 0..n {
                    ingest_datagram(
                        recv.datagram(i),
                        batch,
                        batch_opened,
                        batch_size,
                        output,
                        stats,
                    );
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                eagain_pause(batch, batch_opened, batch_size, output, stats);
                return DrainOutcome::Drained;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("recvmmsg() failed: {e}");
                return DrainOutcome::Fatal;
            }
        }
    }
}

/// One-datagram-at-a-time fallback for platforms without `recvmmsg`.
#[cfg(not(target_os = "linux"))]
struct RecvQueue {
    buffer: Vec<u8>,
}

#[cfg(not(target_os = "linux"))]
impl RecvQueue {
    fn new(_max_msgs: usize) -> Self {
        Self {
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }
}

#[cfg(not(target_os = "linux"))]
#[allow(clippy::too_many_arguments)]
fn drain_socket(
    sock: &UdpSocket,
    recv: &mut RecvQueue,
    batch: &mut RawBatch,
    batch_opened: &mut Instant,
    batch_size: usize,
    output: &Sender<RawBatch>,
    stats: &Stats,
) -> DrainOutcome {
    loop {
        inc(&stats.udp.recv_total);

        match sock.recv(&mut recv.buffer) {
            Ok(0) => {
                // socket closed from another thread
                return DrainOutcome::Fatal;
            }
            Ok(n) => {
                ingest_datagram(
                    &recv.buffer[..n],
                    batch,
                    batch_opened,
                    batch_size,
                    output,
                    stats,
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                eagain_pause(batch, batch_opened, batch_size, output, stats);
                return DrainOutcome::Drained;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("recv() failed: {e}");
                return DrainOutcome::Fatal;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_reuseport_allows_two_sockets() {
        let a = bind_reuseport("127.0.0.1:0".parse().unwrap()).expect("bind first");
        let port = a.local_addr().unwrap().port();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let _b = bind_reuseport(addr).expect("bind second on same port");
    }

    #[test]
    fn test_collector_receives_and_batches() {
        use prost::Message;

        let stats = Arc::new(Stats::new());
        let (tx, rx) = bounded(16);

        let conf = CollectorConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            n_threads: 1,
            batch_size: 4,
            batch_timeout: Duration::from_millis(20),
        };

        let mut collector = Collector::start(&conf, &tx, &stats).expect("start");
        let addr = collector.local_addr();

        let record = crate::proto::WireRequest {
            hostname: "h".to_string(),
            server_name: "s".to_string(),
            script_name: "p".to_string(),
            request_count: 1,
            document_size: 1,
            memory_peak: 1,
            request_time: 0.01,
            ru_utime: 0.0,
            ru_stime: 0.0,
            ..Default::default()
        };
        let mut payload = Vec::new();
        record.encode(&mut payload).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..4 {
            client.send_to(&payload, addr).unwrap();
        }
        // garbage datagram is counted and dropped
        client.send_to(&[0xde, 0xad], addr).unwrap();

        let batch = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("one full batch");
        assert_eq!(batch.len(), 4);

        collector.shutdown();
        assert_eq!(
            stats
                .udp
                .packet_decode_err
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
