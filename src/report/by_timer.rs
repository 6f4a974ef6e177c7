//! `by_timer` report: one row per key tuple that may include timer-tag
//! values; every matching timer of a packet contributes to its row.
//!
//! Tag-name blooms prune the scans: a packet whose packet-level bloom is
//! missing a required name is rejected outright, and each timer's bloom is
//! tested before its tags are walked. `req_count` of a row grows at most
//! once per packet, tracked with a per-aggregator packet sequence number
//! stored in the row.
//!
//! Closed ticks are flattened — keys, row counters and flat histograms in
//! parallel arrays — and the snapshot merge re-expands them into HDR rows.

use std::sync::Arc;
use std::time::Instant;

use crate::bloom::{PacketBloom, TimerBloom};
use crate::dictionary::Dictionary;
use crate::histogram::{duration_to_hdr_value, FlatHistogram, HdrConfig, HdrHistogram};
use crate::packet::{Packet, PacketBatch, PackedTimer};
use crate::report::history::{SliceAccumulator, Tick, TickRing};
use crate::report::key::ReportKey;
use crate::report::snapshot::{
    MergeFlags, ReportSnapshot, SnapshotData, SnapshotDictionary, SnapshotRow,
};
use crate::report::{
    ByTimerConfig, ByTimerData, KeyPart, PacketFilter, ReportEstimates, ReportInfo, ReportStats,
    RequestField, TimerTagFilter,
};
use crate::stats::inc;

#[derive(Debug, Default)]
struct TimerItem {
    // sequence number of the last packet that bumped req_count
    last_unique: u64,
    data: ByTimerData,
    hv: Option<HdrHistogram>,
}

impl TimerItem {
    fn data_increment(&mut self, t: &PackedTimer) {
        let d = &mut self.data;
        d.hit_count += t.hit_count;
        d.time_total += t.value;
        d.ru_utime += t.ru_utime;
        d.ru_stime += t.ru_stime;
    }

    fn packet_increment(&mut self, unique: u64) {
        if self.last_unique != unique {
            self.data.req_count += 1;
            self.last_unique = unique;
        }
    }
}

fn merge_data(dst: &mut ByTimerData, src: &ByTimerData) {
    dst.req_count += src.req_count;
    dst.hit_count += src.hit_count;
    dst.time_total += src.time_total;
    dst.ru_utime += src.ru_utime;
    dst.ru_stime += src.ru_stime;
}

type RowMap = hashbrown::HashMap<ReportKey, TimerItem, ahash::RandomState>;

/// One closed tick, flattened: `keys[i]` / `datas[i]` / `hvs[i]` describe
/// row `i`; `hvs` is empty when histograms are disabled.
#[derive(Debug, Default)]
pub(crate) struct TickData {
    keys: Vec<ReportKey>,
    datas: Vec<ByTimerData>,
    hvs: Vec<FlatHistogram>,
}

// key extractors split by source, each remembering its position in the
// user-ordered key tuple
struct KeyInfo {
    n_parts: usize,
    rtag: Vec<(u32, usize)>,
    rfield: Vec<(RequestField, usize)>,
    ttag: Vec<(u32, usize)>,
}

impl KeyInfo {
    fn from_keys(keys: &[KeyPart]) -> Self {
        let mut ki = Self {
            n_parts: keys.len(),
            rtag: Vec::new(),
            rfield: Vec::new(),
            ttag: Vec::new(),
        };
        for (pos, part) in keys.iter().enumerate() {
            match *part {
                KeyPart::RequestTag(name_id) => ki.rtag.push((name_id, pos)),
                KeyPart::RequestField(field) => ki.rfield.push((field, pos)),
                KeyPart::TimerTag(name_id) => ki.ttag.push((name_id, pos)),
            }
        }
        ki
    }
}

pub(crate) struct ByTimerReport {
    info: ReportInfo,
    hdr: Option<HdrConfig>,
    filters: Vec<PacketFilter>,
    timer_filters: Vec<TimerTagFilter>,
    ki: KeyInfo,
    // every timer-tag name the aggregation needs present on a timer
    required_packet_bloom: PacketBloom,
    required_timer_bloom: TimerBloom,
    stats: Arc<ReportStats>,
    dict: Arc<Dictionary>,

    current: RowMap,
    packet_unique: u64,
    slices: SliceAccumulator,
    ring: TickRing<TickData>,
}

impl ByTimerReport {
    pub(crate) fn new(
        conf: &ByTimerConfig,
        info: ReportInfo,
        hdr: Option<HdrConfig>,
        dict: Arc<Dictionary>,
        stats: Arc<ReportStats>,
    ) -> Self {
        let ki = KeyInfo::from_keys(&conf.keys);

        let mut required_packet_bloom = PacketBloom::default();
        let mut required_timer_bloom = TimerBloom::default();
        for &(name_id, _) in &ki.ttag {
            required_packet_bloom.add(name_id);
            required_timer_bloom.add(name_id);
        }
        for f in &conf.timer_filters {
            required_packet_bloom.add(f.name_id);
            required_timer_bloom.add(f.name_id);
        }

        Self {
            info,
            hdr,
            filters: conf.filters.clone(),
            timer_filters: conf.timer_filters.clone(),
            ki,
            required_packet_bloom,
            required_timer_bloom,
            stats,
            dict,
            current: RowMap::default(),
            // starts at 1 so a default-constructed row (last_unique == 0)
            // never aliases a real packet
            packet_unique: 1,
            slices: SliceAccumulator::default(),
            ring: TickRing::new(conf.tick_count),
        }
    }

    pub(crate) fn add_batch(&mut self, batch: &Arc<PacketBatch>) {
        if let Some(slice) = &batch.wordslice {
            self.slices.add(slice);
        }
        for p in batch.packets() {
            self.add(batch, p);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn add(&mut self, batch: &PacketBatch, p: &Packet) {
        if !self.filters.iter().all(|f| f.matches(batch, p)) {
            inc(&self.stats.packets_dropped_by_filters);
            return;
        }

        if !p.timer_bloom.contains(&self.required_packet_bloom) {
            inc(&self.stats.packets_dropped_by_bloom);
            return;
        }

        let mut key = ReportKey::zeroed(self.ki.n_parts);

        for &(name_id, pos) in &self.ki.rtag {
            let (names, values) = batch.request_tags(p);
            let Some(i) = names.iter().position(|&n| n == name_id) else {
                inc(&self.stats.packets_dropped_by_rtag);
                return;
            };
            key.set(pos, values[i]);
        }

        for &(field, pos) in &self.ki.rfield {
            let value = field.fetch(p);
            if value == 0 {
                inc(&self.stats.packets_dropped_by_rfield);
                return;
            }
            key.set(pos, value);
        }

        self.packet_unique += 1;
        let mut matched_any = false;

        'timers: for t in batch.timers(p) {
            inc(&self.stats.timers_scanned);

            if !t.bloom.contains(&self.required_timer_bloom) {
                inc(&self.stats.timers_skipped_by_bloom);
                continue;
            }

            let (names, values) = batch.timer_tags(t);

            for f in &self.timer_filters {
                let passes = names
                    .iter()
                    .position(|&n| n == f.name_id)
                    .is_some_and(|i| values[i] == f.value_id);
                if !passes {
                    inc(&self.stats.timers_skipped_by_filters);
                    continue 'timers;
                }
            }

            for &(name_id, pos) in &self.ki.ttag {
                let Some(i) = names.iter().position(|&n| n == name_id) else {
                    inc(&self.stats.timers_skipped_by_tags);
                    continue 'timers;
                };
                key.set(pos, values[i]);
            }

            let item = self.current.entry(key).or_insert_with(|| TimerItem {
                last_unique: 0,
                data: ByTimerData::default(),
                hv: self.hdr.as_ref().map(HdrHistogram::new),
            });
            item.data_increment(t);
            item.packet_increment(self.packet_unique);
            if let Some(conf) = &self.hdr {
                if let Some(hv) = &mut item.hv {
                    hv.increment(
                        conf,
                        duration_to_hdr_value(t.value / t.hit_count.max(1)),
                        1,
                    );
                }
            }

            inc(&self.stats.timers_aggregated);
            matched_any = true;
        }

        if matched_any {
            inc(&self.stats.packets_aggregated);
        } else {
            inc(&self.stats.packets_dropped_by_timertag);
        }
    }

    pub(crate) fn tick_now(&mut self) {
        let closed = std::mem::take(&mut self.current);

        let mut td = TickData {
            keys: Vec::with_capacity(closed.len()),
            datas: Vec::with_capacity(closed.len()),
            hvs: Vec::with_capacity(if self.hdr.is_some() { closed.len() } else { 0 }),
        };

        for (key, item) in &closed {
            td.keys.push(*key);
            td.datas.push(item.data);
            if let (Some(conf), Some(hv)) = (self.hdr.as_ref(), item.hv.as_ref()) {
                td.hvs.push(hv.to_flat(conf));
            }
        }

        let tick = Arc::new(Tick {
            data: td,
            wordslices: self.slices.take(),
        });
        self.ring.push(tick);
    }

    pub(crate) fn get_snapshot(&self) -> Box<dyn ReportSnapshot> {
        Box::new(ByTimerSnapshot {
            info: self.info.clone(),
            hdr: self.hdr,
            ticks: self.ring.ticks(),
            data: SnapMap::default(),
            totals: None,
            sdict: SnapshotDictionary::new(Arc::clone(&self.dict)),
            stats: Arc::clone(&self.stats),
            prepared: false,
        })
    }

    pub(crate) fn estimates(&self) -> ReportEstimates {
        let row_count = self
            .ring
            .last()
            .map_or_else(|| self.current.len(), |t| t.data.keys.len());

        let mut mem_used =
            (self.current.capacity() * size_of::<(ReportKey, TimerItem)>()) as u64;
        for item in self.current.values() {
            if let Some(hv) = &item.hv {
                mem_used += hv.allocated_size() as u64;
            }
        }
        for tick in self.ring.iter() {
            mem_used += (tick.data.keys.capacity() * size_of::<ReportKey>()) as u64;
            mem_used += (tick.data.datas.capacity() * size_of::<ByTimerData>()) as u64;
            for hv in &tick.data.hvs {
                mem_used += (hv.values.capacity() * size_of::<crate::histogram::FlatValue>()) as u64;
            }
        }

        ReportEstimates {
            row_count: row_count as u32,
            mem_used,
        }
    }
}

#[derive(Debug, Default)]
struct SnapItem {
    data: ByTimerData,
    hv: Option<HdrHistogram>,
}

type SnapMap = hashbrown::HashMap<ReportKey, SnapItem, ahash::RandomState>;

struct ByTimerSnapshot {
    info: ReportInfo,
    hdr: Option<HdrConfig>,
    ticks: Vec<Arc<Tick<TickData>>>,
    data: SnapMap,
    totals: Option<ByTimerData>,
    sdict: SnapshotDictionary,
    stats: Arc<ReportStats>,
    prepared: bool,
}

impl ReportSnapshot for ByTimerSnapshot {
    fn info(&self) -> &ReportInfo {
        &self.info
    }

    fn hdr_config(&self) -> Option<&HdrConfig> {
        self.hdr.as_ref()
    }

    fn prepare(&mut self, flags: MergeFlags) {
        if self.prepared {
            return;
        }
        let started = Instant::now();

        let with_hv = flags.with_histograms && self.info.hv_enabled;
        let mut src_rows = 0u64;

        for tick in &self.ticks {
            let td = &tick.data;
            if td.keys.is_empty() {
                continue;
            }
            src_rows += td.keys.len() as u64;

            for (i, key) in td.keys.iter().enumerate() {
                let dst = self.data.entry(*key).or_insert_with(|| SnapItem {
                    data: ByTimerData::default(),
                    hv: if with_hv {
                        self.hdr.as_ref().map(HdrHistogram::new)
                    } else {
                        None
                    },
                });

                merge_data(&mut dst.data, &td.datas[i]);
                if with_hv {
                    if let (Some(conf), Some(dst_hv), Some(src_hv)) =
                        (self.hdr.as_ref(), dst.hv.as_mut(), td.hvs.get(i))
                    {
                        dst_hv.merge_flat(conf, src_hv);
                    }
                }
            }
        }

        if flags.with_totals {
            let mut totals = ByTimerData::default();
            for item in self.data.values() {
                merge_data(&mut totals, &item.data);
            }
            self.totals = Some(totals);
        }

        self.stats
            .last_snapshot_src_rows
            .store(src_rows, std::sync::atomic::Ordering::Relaxed);
        self.stats
            .last_snapshot_uniq_rows
            .store(self.data.len() as u64, std::sync::atomic::Ordering::Relaxed);
        self.stats.timings.lock().last_snapshot_merge_d = started.elapsed();

        self.prepared = true;
    }

    fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn row_count(&self) -> usize {
        self.data.len()
    }

    fn rows(&self) -> Box<dyn Iterator<Item = SnapshotRow<'_>> + '_> {
        Box::new(self.data.iter().map(|(key, item)| SnapshotRow {
            key: *key,
            data: SnapshotData::ByTimer(&item.data),
            histogram: item.hv.as_ref(),
        }))
    }

    fn totals(&self) -> Option<SnapshotRow<'_>> {
        self.totals.as_ref().map(|data| SnapshotRow {
            key: ReportKey::new(),
            data: SnapshotData::ByTimer(data),
            histogram: None,
        })
    }

    fn get_word(&self, id: u32) -> Arc<str> {
        self.sdict.get_word(id)
    }
}
