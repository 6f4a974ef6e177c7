//! # pinba-engine
//!
//! A high-throughput UDP telemetry aggregation engine with rolling-window
//! reports.
//!
//! ## Features
//!
//! - **Lossy, Non-Blocking Pipeline**: bounded queues between thread
//!   pools; overload drops batches (and counts them) instead of growing
//!   latency
//! - **Shared Dictionary**: every wire string interned once, reports and
//!   snapshots work on `u32` ids; reference-counted reclamation keeps
//!   memory bounded under adversarial input
//! - **Rolling-Window Reports**: `by_packet`, `by_request` and `by_timer`
//!   aggregation with per-row HDR histograms and percentiles
//! - **Batch Syscalls**: `SO_REUSEPORT` socket fan-out and `recvmmsg`
//!   draining on Linux
//!
//! ## Quick Start
//!
//! ```no_run
//! use pinba_engine::{Engine, EngineOptions, MergeFlags};
//! use pinba_engine::report::{ByRequestConfig, KeyPart, ReportConfig, RequestField};
//! use std::time::Duration;
//!
//! let mut options = EngineOptions::default();
//! options.collector.address = "0.0.0.0:3002".parse().unwrap();
//!
//! let engine = Engine::start(&options).unwrap();
//!
//! engine
//!     .add_report(ReportConfig::ByRequest(ByRequestConfig {
//!         name: "by_script".to_string(),
//!         time_window: Duration::from_secs(60),
//!         tick_count: 60,
//!         histogram: None,
//!         filters: Vec::new(),
//!         keys: vec![KeyPart::RequestField(RequestField::Script)],
//!     }))
//!     .unwrap();
//!
//! std::thread::sleep(Duration::from_secs(5));
//!
//! let mut snapshot = engine.get_report_snapshot("by_script").unwrap();
//! snapshot.prepare(MergeFlags::NONE);
//! for row in snapshot.rows() {
//!     println!("{:?} -> {:?}", snapshot.key_str(&row.key), row.data);
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bloom;
pub mod collector;
pub mod coordinator;
pub mod dictionary;
mod engine;
mod error;
pub mod histogram;
pub mod packet;
pub mod proto;
pub mod repacker;
pub mod report;
pub mod stats;

pub use collector::CollectorConfig;
pub use coordinator::CoordinatorConfig;
pub use dictionary::Dictionary;
pub use engine::{Engine, EngineOptions, OpenShare};
pub use error::PinbaError;
pub use histogram::{FlatHistogram, HdrConfig, HdrHistogram, HistogramConf};
pub use repacker::RepackerConfig;
pub use report::{
    MergeFlags, ReportConfig, ReportKey, ReportSnapshot, ReportState, SnapshotData, SnapshotRow,
};
pub use stats::StatsSnapshot;

/// Result type for engine operations.
pub type PinbaResult<T> = Result<T, PinbaError>;
