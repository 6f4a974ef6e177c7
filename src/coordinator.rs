//! Coordinator: owns the registry of active reports, fans every packet
//! batch out to all of them, and serves the control plane.
//!
//! Fan-out is a non-blocking `try_send` per report host: a slow report
//! loses batches (counted per engine in `batch_send_err`) while fast
//! reports are unaffected. Control operations are synchronous
//! request/reply pairs over a channel.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, warn};

use crate::dictionary::Dictionary;
use crate::error::PinbaError;
use crate::packet::PacketBatch;
use crate::report::host::ReportHost;
use crate::report::{ReportConfig, ReportSnapshot, ReportState};
use crate::stats::{inc, thread_rusage, Stats};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Capacity of each report host's batch queue, in batches.
    pub report_queue_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            report_queue_capacity: 128,
        }
    }
}

enum ControlRequest {
    AddReport {
        config: Box<ReportConfig>,
        reply: Sender<Result<(), PinbaError>>,
    },
    DeleteReport {
        name: String,
        reply: Sender<Result<(), PinbaError>>,
    },
    GetSnapshot {
        name: String,
        reply: Sender<Result<Box<dyn ReportSnapshot>, PinbaError>>,
    },
    GetState {
        name: String,
        reply: Sender<Result<ReportState, PinbaError>>,
    },
    ListStates {
        reply: Sender<Vec<ReportState>>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Handle to the coordinator thread.
pub struct Coordinator {
    control_tx: Sender<ControlRequest>,
    thread: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Spawns the coordinator thread consuming packet batches from
    /// `input`.
    ///
    /// # Errors
    /// Returns an error when the thread cannot be spawned.
    pub fn start(
        conf: &CoordinatorConfig,
        dictionary: &Arc<Dictionary>,
        input: &Receiver<Arc<PacketBatch>>,
        stats: &Arc<Stats>,
    ) -> Result<Self, PinbaError> {
        let (control_tx, control_rx) = bounded::<ControlRequest>(16);

        let conf = conf.clone();
        let dictionary = Arc::clone(dictionary);
        let input = input.clone();
        let stats = Arc::clone(stats);

        let thread = std::thread::Builder::new()
            .name("coordinator".to_string())
            .spawn(move || {
                run(&conf, &dictionary, &input, &control_rx, &stats);
                debug!("coordinator; exiting");
            })?;

        Ok(Self {
            control_tx,
            thread: Some(thread),
        })
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> ControlRequest) -> Result<T, PinbaError> {
        let (tx, rx) = bounded(1);
        self.control_tx
            .send(make(tx))
            .map_err(|_| PinbaError::ShutDown)?;
        rx.recv().map_err(|_| PinbaError::ShutDown)
    }

    /// Registers a new report and starts its host thread.
    ///
    /// # Errors
    /// [`PinbaError::DuplicateReport`] for a name already registered, or
    /// any configuration error.
    pub fn add_report(&self, config: ReportConfig) -> Result<(), PinbaError> {
        self.request(|reply| ControlRequest::AddReport {
            config: Box::new(config),
            reply,
        })?
    }

    /// Unregisters a report; its host drains, exits and is joined.
    ///
    /// # Errors
    /// [`PinbaError::UnknownReport`] when no such report exists.
    pub fn delete_report(&self, name: &str) -> Result<(), PinbaError> {
        let name = name.to_string();
        self.request(|reply| ControlRequest::DeleteReport { name, reply })?
    }

    /// Asks the report's host thread for a snapshot.
    ///
    /// # Errors
    /// [`PinbaError::UnknownReport`] when no such report exists.
    pub fn get_report_snapshot(&self, name: &str) -> Result<Box<dyn ReportSnapshot>, PinbaError> {
        let name = name.to_string();
        self.request(|reply| ControlRequest::GetSnapshot { name, reply })?
    }

    /// Returns a copy of report info, stats and estimates.
    ///
    /// # Errors
    /// [`PinbaError::UnknownReport`] when no such report exists.
    pub fn get_report_state(&self, name: &str) -> Result<ReportState, PinbaError> {
        let name = name.to_string();
        self.request(|reply| ControlRequest::GetState { name, reply })?
    }

    /// States of every active report, for the stats surface.
    #[must_use]
    pub fn list_report_states(&self) -> Vec<ReportState> {
        self.request(|reply| ControlRequest::ListStates { reply })
            .unwrap_or_default()
    }

    /// Deletes all reports and joins the coordinator thread. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let (tx, rx) = bounded(1);
            if self.control_tx.send(ControlRequest::Shutdown { reply: tx }).is_ok() {
                let _ = rx.recv();
            }
            if thread.join().is_err() {
                warn!("coordinator thread panicked");
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    conf: &CoordinatorConfig,
    dictionary: &Arc<Dictionary>,
    input: &Receiver<Arc<PacketBatch>>,
    control_rx: &Receiver<ControlRequest>,
    stats: &Arc<Stats>,
) {
    // insertion order is fan-out order; registry is small
    let mut hosts: Vec<ReportHost> = Vec::new();
    let mut next_report_id: u32 = 1;

    let rusage_ticker = tick(Duration::from_secs(1));

    loop {
        select! {
            recv(input) -> msg => {
                let Ok(batch) = msg else {
                    // repackers are gone; keep serving control requests
                    // until shutdown is requested
                    handle_control_only(conf, dictionary, control_rx, &mut hosts, &mut next_report_id, stats);
                    break;
                };

                inc(&stats.coordinator.batches_received);
                if hosts.is_empty() {
                    inc(&stats.coordinator.batches_send_dropped);
                }

                for host in &hosts {
                    inc(&stats.coordinator.batch_send_total);
                    if !host.try_send_batch(Arc::clone(&batch)) {
                        inc(&stats.coordinator.batch_send_err);
                    }
                }
            },
            recv(rusage_ticker) -> _ => {
                *stats.coordinator_thread.lock() = thread_rusage();
            },
            recv(control_rx) -> msg => {
                let Ok(request) = msg else { break };
                inc(&stats.coordinator.control_requests);
                if handle_control(conf, dictionary, request, &mut hosts, &mut next_report_id) {
                    break;
                }
            },
        }
    }

    for host in &mut hosts {
        host.shutdown();
    }
}

// continue serving the control plane after the data path disconnected
fn handle_control_only(
    conf: &CoordinatorConfig,
    dictionary: &Arc<Dictionary>,
    control_rx: &Receiver<ControlRequest>,
    hosts: &mut Vec<ReportHost>,
    next_report_id: &mut u32,
    stats: &Arc<Stats>,
) {
    while let Ok(request) = control_rx.recv() {
        inc(&stats.coordinator.control_requests);
        if handle_control(conf, dictionary, request, hosts, next_report_id) {
            return;
        }
    }
}

// returns true on shutdown
fn handle_control(
    conf: &CoordinatorConfig,
    dictionary: &Arc<Dictionary>,
    request: ControlRequest,
    hosts: &mut Vec<ReportHost>,
    next_report_id: &mut u32,
) -> bool {
    match request {
        ControlRequest::AddReport { config, reply } => {
            let result = add_report(conf, dictionary, &config, hosts, next_report_id);
            let _ = reply.send(result);
        }
        ControlRequest::DeleteReport { name, reply } => {
            let result = match hosts.iter().position(|h| h.name() == name) {
                Some(i) => {
                    let mut host = hosts.remove(i);
                    host.shutdown();
                    Ok(())
                }
                None => Err(PinbaError::UnknownReport(name)),
            };
            let _ = reply.send(result);
        }
        ControlRequest::GetSnapshot { name, reply } => {
            let result = match hosts.iter().find(|h| h.name() == name) {
                Some(host) => host.get_snapshot(),
                None => Err(PinbaError::UnknownReport(name)),
            };
            let _ = reply.send(result);
        }
        ControlRequest::GetState { name, reply } => {
            let result = match hosts.iter().find(|h| h.name() == name) {
                Some(host) => host.get_state(),
                None => Err(PinbaError::UnknownReport(name)),
            };
            let _ = reply.send(result);
        }
        ControlRequest::ListStates { reply } => {
            let states = hosts.iter().filter_map(|h| h.get_state().ok()).collect();
            let _ = reply.send(states);
        }
        ControlRequest::Shutdown { reply } => {
            for host in hosts.iter_mut() {
                host.shutdown();
            }
            hosts.clear();
            let _ = reply.send(());
            return true;
        }
    }
    false
}

fn add_report(
    conf: &CoordinatorConfig,
    dictionary: &Arc<Dictionary>,
    config: &ReportConfig,
    hosts: &mut Vec<ReportHost>,
    next_report_id: &mut u32,
) -> Result<(), PinbaError> {
    if hosts.iter().any(|h| h.name() == config.name()) {
        return Err(PinbaError::DuplicateReport(config.name().to_string()));
    }

    debug!("creating report {}", config.name());
    let host = ReportHost::start(
        *next_report_id,
        config,
        Arc::clone(dictionary),
        conf.report_queue_capacity,
    )?;
    *next_report_id += 1;
    hosts.push(host);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{ByPacketConfig, ReportKind};

    fn by_packet_config(name: &str) -> ReportConfig {
        ReportConfig::ByPacket(ByPacketConfig {
            name: name.to_string(),
            time_window: Duration::from_secs(10),
            tick_count: 10,
            histogram: None,
            filters: Vec::new(),
        })
    }

    fn start_coordinator() -> (Coordinator, Sender<Arc<PacketBatch>>) {
        let (batch_tx, batch_rx) = bounded(16);
        let coordinator = Coordinator::start(
            &CoordinatorConfig::default(),
            &Arc::new(Dictionary::new()),
            &batch_rx,
            &Arc::new(Stats::new()),
        )
        .expect("start coordinator");
        (coordinator, batch_tx)
    }

    #[test]
    fn test_add_and_delete_report() {
        let (coordinator, _batch_tx) = start_coordinator();

        coordinator
            .add_report(by_packet_config("pkts"))
            .expect("add");
        assert!(matches!(
            coordinator.add_report(by_packet_config("pkts")),
            Err(PinbaError::DuplicateReport(_))
        ));

        let state = coordinator.get_report_state("pkts").expect("state");
        assert_eq!(state.info.kind, ReportKind::ByPacket);
        assert_eq!(state.id, 1);

        coordinator.delete_report("pkts").expect("delete");
        assert!(matches!(
            coordinator.delete_report("pkts"),
            Err(PinbaError::UnknownReport(_))
        ));
        assert!(matches!(
            coordinator.get_report_state("pkts"),
            Err(PinbaError::UnknownReport(_))
        ));
    }

    #[test]
    fn test_snapshot_of_unknown_report_is_an_error() {
        let (coordinator, _batch_tx) = start_coordinator();
        assert!(matches!(
            coordinator.get_report_snapshot("nope"),
            Err(PinbaError::UnknownReport(_))
        ));
    }

    #[test]
    fn test_fanout_reaches_reports() {
        let (coordinator, batch_tx) = start_coordinator();
        coordinator
            .add_report(by_packet_config("pkts"))
            .expect("add");

        let mut batch = PacketBatch::with_capacity(2);
        crate::packet::test_support::push_packet(&mut batch, crate::packet::Packet::default());
        crate::packet::test_support::push_packet(&mut batch, crate::packet::Packet::default());
        batch_tx.send(Arc::new(batch)).unwrap();

        // the host aggregates asynchronously; poll its stats
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let state = coordinator.get_report_state("pkts").expect("state");
            if state.stats.packets_recv_total == 2 {
                assert_eq!(state.stats.packets_aggregated, 2);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
