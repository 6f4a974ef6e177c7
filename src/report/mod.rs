//! Report machinery: configurations, aggregators, tick history, snapshots.
//!
//! A report is one of three kinds sharing the external interface but with
//! unrelated internal state, modeled as a tagged sum: `by_packet` keeps a
//! single row, `by_request` groups packets by a key of request-level
//! extractors, `by_timer` groups individual timers. Each report runs on
//! its own host thread (see [`host`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::PinbaError;
use crate::histogram::HistogramConf;
use crate::packet::{Packet, PacketBatch};

pub mod by_packet;
pub mod by_request;
pub mod by_timer;
pub mod history;
pub mod host;
pub mod key;
pub mod snapshot;

pub use key::{key_to_string, ReportKey, REPORT_MAX_KEY_PARTS};
pub use snapshot::{MergeFlags, ReportSnapshot, SnapshotData, SnapshotRow};

/// The three report kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    ByPacket,
    ByRequest,
    ByTimer,
}

impl ReportKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ByPacket => "by_packet",
            Self::ByRequest => "by_request",
            Self::ByTimer => "by_timer",
        }
    }
}

/// Fixed packet fields usable in filters and keys. Every one of them is a
/// dictionary word id in the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestField {
    Host,
    Server,
    Script,
    Schema,
    Status,
}

impl RequestField {
    #[must_use]
    pub(crate) fn fetch(self, p: &Packet) -> u32 {
        match self {
            Self::Host => p.host_id,
            Self::Server => p.server_id,
            Self::Script => p.script_id,
            Self::Schema => p.schema_id,
            Self::Status => p.status_id,
        }
    }
}

/// Packet-level filter, applied before key extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFilter {
    /// Keep packets with `request_time >= min_time`.
    ByMinTime(Duration),
    /// Keep packets with `request_time < max_time`.
    ByMaxTime(Duration),
    /// Keep packets whose field equals the given word id.
    ByRequestField { field: RequestField, value_id: u32 },
    /// Keep packets carrying the request tag `name_id` with `value_id`.
    ByRequestTag { name_id: u32, value_id: u32 },
}

impl PacketFilter {
    pub(crate) fn matches(&self, batch: &PacketBatch, p: &Packet) -> bool {
        match *self {
            Self::ByMinTime(min) => p.request_time >= min,
            Self::ByMaxTime(max) => p.request_time < max,
            Self::ByRequestField { field, value_id } => field.fetch(p) == value_id,
            Self::ByRequestTag { name_id, value_id } => {
                let (names, values) = batch.request_tags(p);
                names
                    .iter()
                    .position(|&n| n == name_id)
                    .is_some_and(|i| values[i] == value_id)
            }
        }
    }
}

/// Per-timer filter for `by_timer` reports: the timer must carry the tag
/// `name_id` with `value_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTagFilter {
    pub name_id: u32,
    pub value_id: u32,
}

/// One part of a report key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart {
    RequestField(RequestField),
    /// Request tag value, selected by tag-name word id.
    RequestTag(u32),
    /// Timer tag value, selected by tag-name word id (`by_timer` only).
    TimerTag(u32),
}

/// `by_packet` report configuration: a single unkeyed row.
#[derive(Debug, Clone)]
pub struct ByPacketConfig {
    pub name: String,
    pub time_window: Duration,
    pub tick_count: u32,
    /// `None` (or `bucket_count == 0`) disables histograms.
    pub histogram: Option<HistogramConf>,
    pub filters: Vec<PacketFilter>,
}

/// `by_request` report configuration.
#[derive(Debug, Clone)]
pub struct ByRequestConfig {
    pub name: String,
    pub time_window: Duration,
    pub tick_count: u32,
    pub histogram: Option<HistogramConf>,
    pub filters: Vec<PacketFilter>,
    /// Ordered key parts; `TimerTag` is not allowed here.
    pub keys: Vec<KeyPart>,
}

/// `by_timer` report configuration.
#[derive(Debug, Clone)]
pub struct ByTimerConfig {
    pub name: String,
    pub time_window: Duration,
    pub tick_count: u32,
    pub histogram: Option<HistogramConf>,
    pub filters: Vec<PacketFilter>,
    pub timer_filters: Vec<TimerTagFilter>,
    /// Ordered key parts; must contain at least one `TimerTag`.
    pub keys: Vec<KeyPart>,
}

/// A report configuration of any kind.
#[derive(Debug, Clone)]
pub enum ReportConfig {
    ByPacket(ByPacketConfig),
    ByRequest(ByRequestConfig),
    ByTimer(ByTimerConfig),
}

impl ReportConfig {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ByPacket(c) => &c.name,
            Self::ByRequest(c) => &c.name,
            Self::ByTimer(c) => &c.name,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ReportKind {
        match self {
            Self::ByPacket(_) => ReportKind::ByPacket,
            Self::ByRequest(_) => ReportKind::ByRequest,
            Self::ByTimer(_) => ReportKind::ByTimer,
        }
    }

    #[must_use]
    pub fn time_window(&self) -> Duration {
        match self {
            Self::ByPacket(c) => c.time_window,
            Self::ByRequest(c) => c.time_window,
            Self::ByTimer(c) => c.time_window,
        }
    }

    #[must_use]
    pub fn tick_count(&self) -> u32 {
        match self {
            Self::ByPacket(c) => c.tick_count,
            Self::ByRequest(c) => c.tick_count,
            Self::ByTimer(c) => c.tick_count,
        }
    }

    /// Structural validation shared by all kinds.
    ///
    /// # Errors
    /// Returns [`PinbaError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<(), PinbaError> {
        if self.name().is_empty() {
            return Err(PinbaError::Config("report name must not be empty".into()));
        }
        if self.tick_count() == 0 {
            return Err(PinbaError::Config("tick_count must be > 0".into()));
        }
        if self.time_window().is_zero() {
            return Err(PinbaError::Config("time_window must be > 0".into()));
        }

        let keys: &[KeyPart] = match self {
            Self::ByPacket(_) => &[],
            Self::ByRequest(c) => &c.keys,
            Self::ByTimer(c) => &c.keys,
        };
        if keys.len() > REPORT_MAX_KEY_PARTS {
            return Err(PinbaError::Config(format!(
                "required keys ({}) > supported keys ({REPORT_MAX_KEY_PARTS})",
                keys.len()
            )));
        }

        match self {
            Self::ByPacket(_) => {}
            Self::ByRequest(c) => {
                if c.keys.is_empty() {
                    return Err(PinbaError::Config(
                        "by_request report needs at least one key part".into(),
                    ));
                }
                if c.keys.iter().any(|k| matches!(k, KeyPart::TimerTag(_))) {
                    return Err(PinbaError::Config(
                        "by_request report cannot key on timer tags".into(),
                    ));
                }
            }
            Self::ByTimer(c) => {
                if !c.keys.iter().any(|k| matches!(k, KeyPart::TimerTag(_))) {
                    return Err(PinbaError::Config(
                        "by_timer report needs at least one timer_tag key part".into(),
                    ));
                }
            }
        }

        if let Some(hv) = self.histogram_conf() {
            // surfaces bad bucket geometry early
            hv.hdr_config()?;
        }

        Ok(())
    }

    #[must_use]
    pub fn histogram_conf(&self) -> Option<HistogramConf> {
        let hv = match self {
            Self::ByPacket(c) => c.histogram,
            Self::ByRequest(c) => c.histogram,
            Self::ByTimer(c) => c.histogram,
        };
        hv.filter(|c| c.bucket_count > 0)
    }

    #[must_use]
    pub fn info(&self) -> ReportInfo {
        let hv = self.histogram_conf();
        let n_key_parts = match self {
            Self::ByPacket(_) => 0,
            Self::ByRequest(c) => c.keys.len() as u32,
            Self::ByTimer(c) => c.keys.len() as u32,
        };

        ReportInfo {
            name: self.name().to_string(),
            kind: self.kind(),
            time_window: self.time_window(),
            tick_count: self.tick_count(),
            n_key_parts,
            hv_enabled: hv.is_some(),
            hv_bucket_count: hv.map_or(0, |c| c.bucket_count),
            hv_bucket_d: hv.map_or(Duration::ZERO, |c| c.bucket_d),
            hv_min_value: hv.map_or(Duration::ZERO, |c| c.min_value),
        }
    }
}

/// Immutable description of a report, copied into snapshots and states.
#[derive(Debug, Clone)]
pub struct ReportInfo {
    pub name: String,
    pub kind: ReportKind,
    pub time_window: Duration,
    pub tick_count: u32,
    pub n_key_parts: u32,
    pub hv_enabled: bool,
    pub hv_bucket_count: u32,
    pub hv_bucket_d: Duration,
    pub hv_min_value: Duration,
}

impl ReportInfo {
    /// Width of one aggregation slot.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.time_window / self.tick_count.max(1)
    }
}

/// Per-report counters, shared between the host thread, the coordinator
/// (send side) and state readers.
#[derive(Debug, Default)]
pub struct ReportStats {
    pub batches_send_total: AtomicU64,
    pub batches_send_err: AtomicU64,
    pub packets_send_total: AtomicU64,
    pub packets_send_err: AtomicU64,

    pub batches_recv_total: AtomicU64,
    pub packets_recv_total: AtomicU64,

    pub packets_aggregated: AtomicU64,
    pub packets_dropped_by_bloom: AtomicU64,
    pub packets_dropped_by_filters: AtomicU64,
    pub packets_dropped_by_rfield: AtomicU64,
    pub packets_dropped_by_rtag: AtomicU64,
    pub packets_dropped_by_timertag: AtomicU64,

    pub timers_scanned: AtomicU64,
    pub timers_aggregated: AtomicU64,
    pub timers_skipped_by_bloom: AtomicU64,
    pub timers_skipped_by_filters: AtomicU64,
    pub timers_skipped_by_tags: AtomicU64,

    pub last_snapshot_src_rows: AtomicU64,
    pub last_snapshot_uniq_rows: AtomicU64,

    /// Short struct copies only.
    pub timings: Mutex<ReportTimings>,
}

/// Timing facts sampled on the host thread (and the snapshot reader).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportTimings {
    pub last_tick_at: Option<std::time::SystemTime>,
    pub last_tick_prepare_d: Duration,
    pub last_snapshot_merge_d: Duration,
    pub ru_utime: Duration,
    pub ru_stime: Duration,
}

/// Plain-value copy of [`ReportStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportStatsSnapshot {
    pub batches_send_total: u64,
    pub batches_send_err: u64,
    pub packets_send_total: u64,
    pub packets_send_err: u64,
    pub batches_recv_total: u64,
    pub packets_recv_total: u64,
    pub packets_aggregated: u64,
    pub packets_dropped_by_bloom: u64,
    pub packets_dropped_by_filters: u64,
    pub packets_dropped_by_rfield: u64,
    pub packets_dropped_by_rtag: u64,
    pub packets_dropped_by_timertag: u64,
    pub timers_scanned: u64,
    pub timers_aggregated: u64,
    pub timers_skipped_by_bloom: u64,
    pub timers_skipped_by_filters: u64,
    pub timers_skipped_by_tags: u64,
    pub last_snapshot_src_rows: u64,
    pub last_snapshot_uniq_rows: u64,
    pub timings: ReportTimings,
}

impl ReportStats {
    #[must_use]
    pub fn snapshot(&self) -> ReportStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ReportStatsSnapshot {
            batches_send_total: load(&self.batches_send_total),
            batches_send_err: load(&self.batches_send_err),
            packets_send_total: load(&self.packets_send_total),
            packets_send_err: load(&self.packets_send_err),
            batches_recv_total: load(&self.batches_recv_total),
            packets_recv_total: load(&self.packets_recv_total),
            packets_aggregated: load(&self.packets_aggregated),
            packets_dropped_by_bloom: load(&self.packets_dropped_by_bloom),
            packets_dropped_by_filters: load(&self.packets_dropped_by_filters),
            packets_dropped_by_rfield: load(&self.packets_dropped_by_rfield),
            packets_dropped_by_rtag: load(&self.packets_dropped_by_rtag),
            packets_dropped_by_timertag: load(&self.packets_dropped_by_timertag),
            timers_scanned: load(&self.timers_scanned),
            timers_aggregated: load(&self.timers_aggregated),
            timers_skipped_by_bloom: load(&self.timers_skipped_by_bloom),
            timers_skipped_by_filters: load(&self.timers_skipped_by_filters),
            timers_skipped_by_tags: load(&self.timers_skipped_by_tags),
            last_snapshot_src_rows: load(&self.last_snapshot_src_rows),
            last_snapshot_uniq_rows: load(&self.last_snapshot_uniq_rows),
            timings: *self.timings.lock(),
        }
    }
}

/// Row count and memory estimate of one report.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportEstimates {
    pub row_count: u32,
    pub mem_used: u64,
}

/// Everything `get_report_state` returns.
#[derive(Debug, Clone)]
pub struct ReportState {
    pub id: u32,
    pub info: ReportInfo,
    pub uptime: Duration,
    pub stats: ReportStatsSnapshot,
    pub estimates: ReportEstimates,
}

/// Row counter sets per report kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByPacketData {
    pub req_count: u32,
    pub timer_count: u32,
    pub time_total: Duration,
    pub ru_utime: Duration,
    pub ru_stime: Duration,
    pub traffic: u64,
    pub mem_used: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByRequestData {
    pub req_count: u32,
    pub time_total: Duration,
    pub ru_utime: Duration,
    pub ru_stime: Duration,
    pub traffic: u64,
    pub mem_used: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByTimerData {
    /// Requests a matching timer was present in, at most one per packet.
    pub req_count: u32,
    pub hit_count: u32,
    pub time_total: Duration,
    pub ru_utime: Duration,
    pub ru_stime: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_request_config() -> ReportConfig {
        ReportConfig::ByRequest(ByRequestConfig {
            name: "req".to_string(),
            time_window: Duration::from_secs(10),
            tick_count: 10,
            histogram: None,
            filters: Vec::new(),
            keys: vec![KeyPart::RequestField(RequestField::Script)],
        })
    }

    #[test]
    fn test_validate_accepts_sane_config() {
        assert!(by_request_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let ReportConfig::ByRequest(base) = by_request_config() else {
            unreachable!()
        };

        let mut c = base.clone();
        c.keys.clear();
        assert!(ReportConfig::ByRequest(c).validate().is_err());

        let mut c = base.clone();
        c.keys = vec![KeyPart::TimerTag(1)];
        assert!(ReportConfig::ByRequest(c).validate().is_err());

        let mut c = base.clone();
        c.keys = vec![KeyPart::RequestField(RequestField::Script); 8];
        assert!(ReportConfig::ByRequest(c).validate().is_err());

        let mut c = base.clone();
        c.tick_count = 0;
        assert!(ReportConfig::ByRequest(c).validate().is_err());

        let timer = ReportConfig::ByTimer(ByTimerConfig {
            name: "t".to_string(),
            time_window: Duration::from_secs(10),
            tick_count: 10,
            histogram: None,
            filters: Vec::new(),
            timer_filters: Vec::new(),
            keys: vec![KeyPart::RequestField(RequestField::Script)],
        });
        assert!(timer.validate().is_err(), "by_timer needs a timer_tag key");
    }

    #[test]
    fn test_info_reflects_histograms() {
        let mut c = match by_request_config() {
            ReportConfig::ByRequest(c) => c,
            _ => unreachable!(),
        };
        c.histogram = Some(HistogramConf {
            bucket_count: 100,
            bucket_d: Duration::from_millis(10),
            min_value: Duration::ZERO,
        });
        let info = ReportConfig::ByRequest(c).info();
        assert!(info.hv_enabled);
        assert_eq!(info.hv_bucket_count, 100);
        assert_eq!(info.tick_interval(), Duration::from_secs(1));
    }
}
