//! Snapshot interface: the immutable, reader-owned view of a report.
//!
//! A snapshot is produced on the report's host thread (capturing tick
//! references and a report-info copy) but *prepared* — merged into its
//! final hashtable — on the reader's thread, so heavy merges never stall
//! aggregation. The word cache lives with the snapshot too: key-part ids
//! resolve to strings without taking the dictionary lock more than once
//! per distinct id.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dictionary::Dictionary;
use crate::histogram::{HdrConfig, HdrHistogram};
use crate::report::key::ReportKey;
use crate::report::{ByPacketData, ByRequestData, ByTimerData, ReportInfo};

/// What [`ReportSnapshot::prepare`] should merge. Histogram and totals
/// merging is skipped unless requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeFlags {
    pub with_histograms: bool,
    pub with_totals: bool,
}

impl MergeFlags {
    pub const NONE: Self = Self {
        with_histograms: false,
        with_totals: false,
    };

    pub const ALL: Self = Self {
        with_histograms: true,
        with_totals: true,
    };
}

/// Row counters of one snapshot row, by report kind.
#[derive(Debug, Clone, Copy)]
pub enum SnapshotData<'a> {
    ByPacket(&'a ByPacketData),
    ByRequest(&'a ByRequestData),
    ByTimer(&'a ByTimerData),
}

/// One row yielded by snapshot iteration.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRow<'a> {
    pub key: ReportKey,
    pub data: SnapshotData<'a>,
    /// Present only after a `with_histograms` prepare on a
    /// histogram-enabled report.
    pub histogram: Option<&'a HdrHistogram>,
}

/// The consumer-of-snapshots contract (what the SQL adapter iterates).
pub trait ReportSnapshot: Send {
    fn info(&self) -> &ReportInfo;

    /// Histogram layout, when the report has histograms enabled.
    fn hdr_config(&self) -> Option<&HdrConfig>;

    /// Performs the merge. Idempotent: a second call is a no-op, whatever
    /// its flags.
    fn prepare(&mut self, flags: MergeFlags);

    fn is_prepared(&self) -> bool;

    /// Number of merged rows; 0 before `prepare`.
    fn row_count(&self) -> usize;

    /// Iterates merged rows; empty before `prepare`.
    fn rows(&self) -> Box<dyn Iterator<Item = SnapshotRow<'_>> + '_>;

    /// The summed-over-all-rows row, after a `with_totals` prepare.
    fn totals(&self) -> Option<SnapshotRow<'_>>;

    /// Cached `word_id -> string` lookup; empty string for id 0 and ids
    /// that are no longer live.
    fn get_word(&self, id: u32) -> Arc<str>;

    /// Key parts resolved to strings.
    fn key_str(&self, key: &ReportKey) -> Vec<Arc<str>> {
        key.parts().iter().map(|&id| self.get_word(id)).collect()
    }
}

/// Single-threaded-use `word_id -> string` cache backing
/// [`ReportSnapshot::get_word`]. Saves global dictionary locking on wide
/// reports with many repeating key parts; correctness of the returned
/// strings relies on the snapshot's tick references keeping the words
/// alive.
pub struct SnapshotDictionary {
    dict: Arc<Dictionary>,
    words: Mutex<hashbrown::HashMap<u32, Arc<str>, ahash::RandomState>>,
    empty: Arc<str>,
}

impl SnapshotDictionary {
    #[must_use]
    pub fn new(dict: Arc<Dictionary>) -> Self {
        Self {
            dict,
            words: Mutex::new(hashbrown::HashMap::default()),
            empty: Arc::from(""),
        }
    }

    #[must_use]
    pub fn get_word(&self, id: u32) -> Arc<str> {
        if id == 0 {
            return Arc::clone(&self.empty);
        }

        let mut cache = self.words.lock();
        if let Some(word) = cache.get(&id) {
            return Arc::clone(word);
        }

        let word = self
            .dict
            .get_word(id)
            .unwrap_or_else(|| Arc::clone(&self.empty));
        cache.insert(id, Arc::clone(&word));
        word
    }
}
