//! The engine facade: wires dictionary → collectors → repackers →
//! coordinator and exposes the control plane and the stats surface.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam::channel::bounded;
use parking_lot::Mutex;

use crate::collector::{Collector, CollectorConfig};
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::dictionary::Dictionary;
use crate::error::PinbaError;
use crate::repacker::{Repacker, RepackerConfig};
use crate::report::{ReportConfig, ReportSnapshot, ReportState};
use crate::stats::{Stats, StatsSnapshot};

/// Everything needed to start an engine. Queue capacities are message
/// counts, not bytes.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub collector: CollectorConfig,
    pub repacker: RepackerConfig,
    pub coordinator: CoordinatorConfig,
    /// Collector → repacker queue, in raw batches.
    pub raw_batch_queue_capacity: usize,
    /// Repacker → coordinator queue, in packet batches.
    pub packet_batch_queue_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            collector: CollectorConfig::default(),
            repacker: RepackerConfig::default(),
            coordinator: CoordinatorConfig::default(),
            raw_batch_queue_capacity: 512,
            packet_batch_queue_capacity: 512,
        }
    }
}

/// A share of one report handed to the SQL adapter; tracked in the
/// engine's open-share table so concurrent opens agree on one instance.
#[derive(Debug)]
pub struct OpenShare {
    pub report_name: String,
}

/// A running engine. Dropping it (or calling [`Engine::shutdown`]) joins
/// the whole pipeline.
pub struct Engine {
    dictionary: Arc<Dictionary>,
    stats: Arc<Stats>,

    collector: Collector,
    repacker: Repacker,
    coordinator: Coordinator,

    open_shares: Mutex<hashbrown::HashMap<String, Arc<OpenShare>, ahash::RandomState>>,
}

impl Engine {
    /// Starts the full pipeline.
    ///
    /// # Errors
    /// Surfaces socket setup and thread spawn failures; on error every
    /// already-started stage is shut down by drop.
    pub fn start(options: &EngineOptions) -> Result<Self, PinbaError> {
        let dictionary = Arc::new(Dictionary::new());
        let stats = Arc::new(Stats::new());

        let (raw_tx, raw_rx) = bounded(options.raw_batch_queue_capacity);
        let (packet_tx, packet_rx) = bounded(options.packet_batch_queue_capacity);

        // downstream first, so every stage's consumer exists before data flows
        let coordinator =
            Coordinator::start(&options.coordinator, &dictionary, &packet_rx, &stats)?;
        let repacker =
            Repacker::start(&options.repacker, &dictionary, &raw_rx, &packet_tx, &stats)?;
        let collector = Collector::start(&options.collector, &raw_tx, &stats)?;

        // the pipeline threads own all channel endpoints now; the locals
        // drop here, so stage shutdown disconnects cascade downstream

        Ok(Self {
            dictionary,
            stats,
            collector,
            repacker,
            coordinator,
            open_shares: Mutex::new(hashbrown::HashMap::default()),
        })
    }

    /// The UDP endpoint the collectors listen on.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        self.collector.local_addr()
    }

    #[must_use]
    pub fn dictionary(&self) -> &Arc<Dictionary> {
        &self.dictionary
    }

    /// Registers a report and starts aggregating into it.
    ///
    /// # Errors
    /// Configuration errors, [`PinbaError::DuplicateReport`], or
    /// [`PinbaError::ShutDown`].
    pub fn add_report(&self, config: ReportConfig) -> Result<(), PinbaError> {
        self.coordinator.add_report(config)
    }

    /// Unregisters a report; its host thread exits and is joined.
    ///
    /// # Errors
    /// [`PinbaError::UnknownReport`] or [`PinbaError::ShutDown`].
    pub fn delete_report(&self, name: &str) -> Result<(), PinbaError> {
        self.coordinator.delete_report(name)
    }

    /// Produces an unprepared snapshot of the named report. The caller
    /// owns it; call `prepare` before iterating.
    ///
    /// # Errors
    /// [`PinbaError::UnknownReport`] or [`PinbaError::ShutDown`].
    pub fn get_report_snapshot(&self, name: &str) -> Result<Box<dyn ReportSnapshot>, PinbaError> {
        self.coordinator.get_report_snapshot(name)
    }

    /// Copies the named report's info, stats and estimates.
    ///
    /// # Errors
    /// [`PinbaError::UnknownReport`] or [`PinbaError::ShutDown`].
    pub fn get_report_state(&self, name: &str) -> Result<ReportState, PinbaError> {
        self.coordinator.get_report_state(name)
    }

    /// Point-in-time stats of the whole pipeline, including per-report
    /// states.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot(self.dictionary.stats());
        snapshot.active_reports = self.coordinator.list_report_states();
        snapshot
    }

    /// Looks up or creates the open-share entry for `name`.
    #[must_use]
    pub fn open_share(&self, name: &str) -> Arc<OpenShare> {
        let mut shares = self.open_shares.lock();
        if let Some(share) = shares.get(name) {
            return Arc::clone(share);
        }
        let share = Arc::new(OpenShare {
            report_name: name.to_string(),
        });
        shares.insert(name.to_string(), Arc::clone(&share));
        share
    }

    /// Removes the open-share entry once the last holder is done with it.
    pub fn close_share(&self, share: &Arc<OpenShare>) {
        let mut shares = self.open_shares.lock();
        if let Some(existing) = shares.get(&share.report_name) {
            // two strong refs mean only the table and the caller remain
            if Arc::ptr_eq(existing, share) && Arc::strong_count(share) <= 2 {
                shares.remove(&share.report_name);
            }
        }
    }

    /// Stops the pipeline stage by stage (collectors first) and joins
    /// every thread. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.collector.shutdown();
        self.repacker.shutdown();
        self.coordinator.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_share_table() {
        let mut options = EngineOptions::default();
        options.collector.address = "127.0.0.1:0".parse().unwrap();
        options.collector.n_threads = 1;
        options.repacker.n_threads = 1;

        let engine = Engine::start(&options).expect("start");

        let a = engine.open_share("report");
        let b = engine.open_share("report");
        assert!(Arc::ptr_eq(&a, &b));

        drop(b);
        engine.close_share(&a);
        let c = engine.open_share("report");
        assert!(!Arc::ptr_eq(&a, &c), "entry was removed and recreated");
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut options = EngineOptions::default();
        options.collector.address = "127.0.0.1:0".parse().unwrap();
        options.collector.n_threads = 1;
        options.repacker.n_threads = 1;

        let mut engine = Engine::start(&options).expect("start");
        assert_ne!(engine.listen_addr().port(), 0);
        engine.shutdown();
        engine.shutdown();
    }
}
