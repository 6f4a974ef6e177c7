//! Report host: one thread running one report.
//!
//! The host consumes packet batches from its own bounded queue, closes a
//! tick every `time_window / tick_count`, and serves in-thread requests
//! (snapshot, state) from the coordinator over a control channel.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{bounded, tick, Receiver, Sender, TrySendError};
use crossbeam::select;
use tracing::{debug, warn};

use crate::dictionary::Dictionary;
use crate::error::PinbaError;
use crate::packet::PacketBatch;
use crate::report::by_packet::ByPacketReport;
use crate::report::by_request::ByRequestReport;
use crate::report::by_timer::ByTimerReport;
use crate::report::snapshot::ReportSnapshot;
use crate::report::{ReportConfig, ReportEstimates, ReportInfo, ReportState, ReportStats};
use crate::stats::{add, inc, thread_rusage};

// the tagged sum over report kinds; all variants share this calling
// surface and nothing else
enum Report {
    ByPacket(ByPacketReport),
    ByRequest(ByRequestReport),
    ByTimer(ByTimerReport),
}

impl Report {
    fn new(
        config: &ReportConfig,
        dict: Arc<Dictionary>,
        stats: Arc<ReportStats>,
    ) -> Result<Self, PinbaError> {
        config.validate()?;
        let info = config.info();
        let hdr = match config.histogram_conf() {
            Some(hv) => Some(hv.hdr_config()?),
            None => None,
        };

        Ok(match config {
            ReportConfig::ByPacket(c) => {
                Self::ByPacket(ByPacketReport::new(c, info, hdr, dict, stats))
            }
            ReportConfig::ByRequest(c) => {
                Self::ByRequest(ByRequestReport::new(c, info, hdr, dict, stats))
            }
            ReportConfig::ByTimer(c) => {
                Self::ByTimer(ByTimerReport::new(c, info, hdr, dict, stats))
            }
        })
    }

    fn add_batch(&mut self, batch: &Arc<PacketBatch>) {
        match self {
            Self::ByPacket(r) => r.add_batch(batch),
            Self::ByRequest(r) => r.add_batch(batch),
            Self::ByTimer(r) => r.add_batch(batch),
        }
    }

    fn tick_now(&mut self) {
        match self {
            Self::ByPacket(r) => r.tick_now(),
            Self::ByRequest(r) => r.tick_now(),
            Self::ByTimer(r) => r.tick_now(),
        }
    }

    fn get_snapshot(&self) -> Box<dyn ReportSnapshot> {
        match self {
            Self::ByPacket(r) => r.get_snapshot(),
            Self::ByRequest(r) => r.get_snapshot(),
            Self::ByTimer(r) => r.get_snapshot(),
        }
    }

    fn estimates(&self) -> ReportEstimates {
        match self {
            Self::ByPacket(r) => r.estimates(),
            Self::ByRequest(r) => r.estimates(),
            Self::ByTimer(r) => r.estimates(),
        }
    }
}

enum HostRequest {
    GetSnapshot {
        reply: Sender<Box<dyn ReportSnapshot>>,
    },
    GetState {
        reply: Sender<ReportState>,
    },
}

/// Handle to a running report host; owned by the coordinator.
pub(crate) struct ReportHost {
    name: String,
    batch_tx: Sender<Arc<PacketBatch>>,
    control_tx: Sender<HostRequest>,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<ReportStats>,
}

impl ReportHost {
    pub(crate) fn start(
        id: u32,
        config: &ReportConfig,
        dict: Arc<Dictionary>,
        queue_capacity: usize,
    ) -> Result<Self, PinbaError> {
        let stats = Arc::new(ReportStats::default());
        let host_stats = Arc::clone(&stats);
        let report = Report::new(config, dict, Arc::clone(&stats))?;
        let info = config.info();

        let (batch_tx, batch_rx) = bounded::<Arc<PacketBatch>>(queue_capacity);
        let (control_tx, control_rx) = bounded::<HostRequest>(4);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let name = config.name().to_string();
        let thread_name = format!("report/{name}");
        let tick_interval = info.tick_interval();

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                run(
                    id,
                    &info,
                    report,
                    &stats,
                    tick_interval,
                    &batch_rx,
                    &control_rx,
                    &shutdown_rx,
                );
                debug!("{thread_name}; exiting");
            })?;

        Ok(Self {
            name,
            batch_tx,
            control_tx,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
            stats: host_stats,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking batch hand-off; `false` means the batch was dropped
    /// for this (slow) report.
    pub(crate) fn try_send_batch(&self, batch: Arc<PacketBatch>) -> bool {
        let packet_count = batch.len() as u64;
        inc(&self.stats.batches_send_total);
        add(&self.stats.packets_send_total, packet_count);

        match self.batch_tx.try_send(batch) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                inc(&self.stats.batches_send_err);
                add(&self.stats.packets_send_err, packet_count);
                false
            }
        }
    }

    pub(crate) fn get_snapshot(&self) -> Result<Box<dyn ReportSnapshot>, PinbaError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.control_tx
            .send(HostRequest::GetSnapshot { reply: reply_tx })
            .map_err(|_| PinbaError::ShutDown)?;
        reply_rx.recv().map_err(|_| PinbaError::ShutDown)
    }

    pub(crate) fn get_state(&self) -> Result<ReportState, PinbaError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.control_tx
            .send(HostRequest::GetState { reply: reply_tx })
            .map_err(|_| PinbaError::ShutDown)?;
        reply_rx.recv().map_err(|_| PinbaError::ShutDown)
    }

    /// Drains, exits and joins the host thread.
    pub(crate) fn shutdown(&mut self) {
        drop(self.shutdown_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("report host '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for ReportHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    id: u32,
    info: &ReportInfo,
    mut report: Report,
    stats: &Arc<ReportStats>,
    tick_interval: Duration,
    batch_rx: &Receiver<Arc<PacketBatch>>,
    control_rx: &Receiver<HostRequest>,
    shutdown_rx: &Receiver<()>,
) {
    let created = Instant::now();
    let ticker = tick(tick_interval);
    let rusage_ticker = tick(Duration::from_secs(1));

    loop {
        select! {
            recv(batch_rx) -> msg => {
                let Ok(batch) = msg else { break };
                inc(&stats.batches_recv_total);
                add(&stats.packets_recv_total, batch.len() as u64);
                report.add_batch(&batch);
            },
            recv(ticker) -> _ => {
                let started = Instant::now();
                report.tick_now();

                let mut timings = stats.timings.lock();
                timings.last_tick_at = Some(SystemTime::now());
                timings.last_tick_prepare_d = started.elapsed();
            },
            recv(rusage_ticker) -> _ => {
                let ru = thread_rusage();
                let mut timings = stats.timings.lock();
                timings.ru_utime = ru.utime;
                timings.ru_stime = ru.stime;
            },
            recv(control_rx) -> msg => {
                let Ok(request) = msg else { break };
                match request {
                    HostRequest::GetSnapshot { reply } => {
                        let _ = reply.send(report.get_snapshot());
                    }
                    HostRequest::GetState { reply } => {
                        let state = ReportState {
                            id,
                            info: info.clone(),
                            uptime: created.elapsed(),
                            stats: stats.snapshot(),
                            estimates: report.estimates(),
                        };
                        let _ = reply.send(state);
                    }
                }
            },
            recv(shutdown_rx) -> _ => break,
        }
    }
}
