//! `by_request` report: one row per key tuple of request-level extractors.
//!
//! A packet contributes to exactly one row; it is dropped whenever a
//! required request tag is absent. Closed ticks keep their row hashtable
//! as-is and the snapshot merges all non-empty ticks on demand.

use std::sync::Arc;
use std::time::Instant;

use crate::dictionary::Dictionary;
use crate::histogram::{duration_to_hdr_value, HdrConfig, HdrHistogram};
use crate::packet::{Packet, PacketBatch};
use crate::report::history::{SliceAccumulator, Tick, TickRing};
use crate::report::key::ReportKey;
use crate::report::snapshot::{
    MergeFlags, ReportSnapshot, SnapshotData, SnapshotDictionary, SnapshotRow,
};
use crate::report::{
    ByRequestConfig, ByRequestData, KeyPart, PacketFilter, ReportEstimates, ReportInfo,
    ReportStats, RequestField,
};
use crate::stats::inc;

#[derive(Debug, Default, Clone)]
pub(crate) struct Item {
    pub data: ByRequestData,
    pub hv: Option<HdrHistogram>,
}

impl Item {
    fn data_increment(&mut self, p: &Packet) {
        let d = &mut self.data;
        d.req_count += 1;
        d.time_total += p.request_time;
        d.ru_utime += p.ru_utime;
        d.ru_stime += p.ru_stime;
        d.traffic += u64::from(p.traffic);
        d.mem_used += u64::from(p.mem_used);
    }

    fn merge_data(&mut self, other: &ByRequestData) {
        let d = &mut self.data;
        d.req_count += other.req_count;
        d.time_total += other.time_total;
        d.ru_utime += other.ru_utime;
        d.ru_stime += other.ru_stime;
        d.traffic += other.traffic;
        d.mem_used += other.mem_used;
    }
}

pub(crate) type RowMap = hashbrown::HashMap<ReportKey, Item, ahash::RandomState>;

// request-level key extractors, precompiled from config
enum Extractor {
    Field(RequestField),
    Tag(u32),
}

pub(crate) struct ByRequestReport {
    info: ReportInfo,
    hdr: Option<HdrConfig>,
    filters: Vec<PacketFilter>,
    extractors: Vec<Extractor>,
    stats: Arc<ReportStats>,
    dict: Arc<Dictionary>,

    current: RowMap,
    slices: SliceAccumulator,
    ring: TickRing<RowMap>,
}

impl ByRequestReport {
    pub(crate) fn new(
        conf: &ByRequestConfig,
        info: ReportInfo,
        hdr: Option<HdrConfig>,
        dict: Arc<Dictionary>,
        stats: Arc<ReportStats>,
    ) -> Self {
        let extractors = conf
            .keys
            .iter()
            .map(|k| match *k {
                KeyPart::RequestField(f) => Extractor::Field(f),
                KeyPart::RequestTag(name_id) => Extractor::Tag(name_id),
                KeyPart::TimerTag(_) => unreachable!("rejected by config validation"),
            })
            .collect();

        Self {
            info,
            hdr,
            filters: conf.filters.clone(),
            extractors,
            stats,
            dict,
            current: RowMap::default(),
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

    fn add(&mut self, batch: &PacketBatch, p: &Packet) {
        if !self.filters.iter().all(|f| f.matches(batch, p)) {
            inc(&self.stats.packets_dropped_by_filters);
            return;
        }

        let mut key = ReportKey::new();
        for extractor in &self.extractors {
            match *extractor {
                Extractor::Field(field) => key.push(field.fetch(p)),
                Extractor::Tag(name_id) => {
                    let (names, values) = batch.request_tags(p);
                    let Some(i) = names.iter().position(|&n| n == name_id) else {
                        inc(&self.stats.packets_dropped_by_rtag);
                        return;
                    };
                    key.push(values[i]);
                }
            }
        }

        let item = self.current.entry(key).or_insert_with(|| Item {
            data: ByRequestData::default(),
            hv: self.hdr.as_ref().map(HdrHistogram::new),
        });
        item.data_increment(p);
        if let Some(conf) = &self.hdr {
            if let Some(hv) = &mut item.hv {
                hv.increment(conf, duration_to_hdr_value(p.request_time), 1);
            }
        }
        inc(&self.stats.packets_aggregated);
    }

    pub(crate) fn tick_now(&mut self) {
        let closed = std::mem::take(&mut self.current);
        let tick = Arc::new(Tick {
            data: closed,
            wordslices: self.slices.take(),
        });
        self.ring.push(tick);
    }

    pub(crate) fn get_snapshot(&self) -> Box<dyn ReportSnapshot> {
        Box::new(ByRequestSnapshot {
            info: self.info.clone(),
            hdr: self.hdr,
            ticks: self.ring.ticks(),
            data: RowMap::default(),
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
            .map_or_else(|| self.current.len(), |t| t.data.len());

        let entry_size = size_of::<(ReportKey, Item)>();
        let mut mem_used = (self.current.capacity() * entry_size) as u64;
        for tick in self.ring.iter() {
            mem_used += (tick.data.capacity() * entry_size) as u64;
            for item in tick.data.values() {
                if let Some(hv) = &item.hv {
                    mem_used += hv.allocated_size() as u64;
                }
            }
        }

        ReportEstimates {
            row_count: row_count as u32,
            mem_used,
        }
    }
}

struct ByRequestSnapshot {
    info: ReportInfo,
    hdr: Option<HdrConfig>,
    ticks: Vec<Arc<Tick<RowMap>>>,
    data: RowMap,
    totals: Option<Item>,
    sdict: SnapshotDictionary,
    stats: Arc<ReportStats>,
    prepared: bool,
}

impl ReportSnapshot for ByRequestSnapshot {
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
            if tick.data.is_empty() {
                continue;
            }
            src_rows += tick.data.len() as u64;

            for (key, src) in &tick.data {
                let dst = self.data.entry(*key).or_insert_with(|| Item {
                    data: ByRequestData::default(),
                    hv: if with_hv {
                        self.hdr.as_ref().map(HdrHistogram::new)
                    } else {
                        None
                    },
                });

                dst.merge_data(&src.data);
                if with_hv {
                    if let (Some(conf), Some(dst_hv), Some(src_hv)) =
                        (self.hdr.as_ref(), dst.hv.as_mut(), src.hv.as_ref())
                    {
                        dst_hv.merge_same_conf(conf, src_hv);
                    }
                }
            }
        }

        if flags.with_totals {
            let mut totals = Item {
                data: ByRequestData::default(),
                hv: None,
            };
            for item in self.data.values() {
                totals.merge_data(&item.data);
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
            data: SnapshotData::ByRequest(&item.data),
            histogram: item.hv.as_ref(),
        }))
    }

    fn totals(&self) -> Option<SnapshotRow<'_>> {
        self.totals.as_ref().map(|item| SnapshotRow {
            key: ReportKey::new(),
            data: SnapshotData::ByRequest(&item.data),
            histogram: None,
        })
    }

    fn get_word(&self, id: u32) -> Arc<str> {
        self.sdict.get_word(id)
    }
}
