//! `by_packet` report: exactly one row aggregating every accepted packet.
//!
//! Uses the windowed history strategy: a running merge of all ticks in the
//! window, updated incrementally by adding the incoming tick and
//! subtracting the evicted one — so producing a snapshot is O(1) except
//! for the histogram, which is merged (never subtracted) from the live
//! ring ticks on demand.

use std::sync::Arc;

use crate::dictionary::Dictionary;
use crate::histogram::{duration_to_hdr_value, HdrConfig, HdrHistogram};
use crate::packet::{Packet, PacketBatch};
use crate::report::history::{SliceAccumulator, Tick, TickRing};
use crate::report::snapshot::{
    MergeFlags, ReportSnapshot, SnapshotData, SnapshotDictionary, SnapshotRow,
};
use crate::report::{
    ByPacketConfig, ByPacketData, PacketFilter, ReportEstimates, ReportInfo, ReportKey,
    ReportStats,
};
use crate::stats::inc;

#[derive(Debug, Default, Clone)]
pub(crate) struct Item {
    pub data: ByPacketData,
    pub hv: Option<HdrHistogram>,
}

impl Item {
    fn data_increment(&mut self, p: &Packet) {
        let d = &mut self.data;
        d.req_count += 1;
        d.timer_count += u32::from(p.timer_count);
        d.time_total += p.request_time;
        d.ru_utime += p.ru_utime;
        d.ru_stime += p.ru_stime;
        d.traffic += u64::from(p.traffic);
        d.mem_used += u64::from(p.mem_used);
    }

    fn hv_increment(&mut self, conf: &HdrConfig, p: &Packet) {
        if let Some(hv) = &mut self.hv {
            hv.increment(conf, duration_to_hdr_value(p.request_time), 1);
        }
    }
}

fn window_sub(total: &mut ByPacketData, evicted: &ByPacketData) {
    total.req_count -= evicted.req_count;
    total.timer_count -= evicted.timer_count;
    total.time_total = total.time_total.saturating_sub(evicted.time_total);
    total.ru_utime = total.ru_utime.saturating_sub(evicted.ru_utime);
    total.ru_stime = total.ru_stime.saturating_sub(evicted.ru_stime);
    total.traffic -= evicted.traffic;
    total.mem_used -= evicted.mem_used;
}

fn window_add(total: &mut ByPacketData, tick: &ByPacketData) {
    total.req_count += tick.req_count;
    total.timer_count += tick.timer_count;
    total.time_total += tick.time_total;
    total.ru_utime += tick.ru_utime;
    total.ru_stime += tick.ru_stime;
    total.traffic += tick.traffic;
    total.mem_used += tick.mem_used;
}

pub(crate) struct ByPacketReport {
    info: ReportInfo,
    hdr: Option<HdrConfig>,
    filters: Vec<PacketFilter>,
    stats: Arc<ReportStats>,
    dict: Arc<Dictionary>,

    current: Item,
    slices: SliceAccumulator,
    ring: TickRing<Item>,
    window_total: ByPacketData,
}

impl ByPacketReport {
    pub(crate) fn new(
        conf: &ByPacketConfig,
        info: ReportInfo,
        hdr: Option<HdrConfig>,
        dict: Arc<Dictionary>,
        stats: Arc<ReportStats>,
    ) -> Self {
        let current = Item {
            data: ByPacketData::default(),
            hv: hdr.as_ref().map(HdrHistogram::new),
        };

        Self {
            info,
            hdr,
            filters: conf.filters.clone(),
            stats,
            dict,
            current,
            slices: SliceAccumulator::default(),
            ring: TickRing::new(conf.tick_count),
            window_total: ByPacketData::default(),
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

        self.current.data_increment(p);
        if let Some(conf) = &self.hdr {
            self.current.hv_increment(conf, p);
        }
        inc(&self.stats.packets_aggregated);
    }

    pub(crate) fn tick_now(&mut self) {
        let fresh = Item {
            data: ByPacketData::default(),
            hv: self.hdr.as_ref().map(HdrHistogram::new),
        };
        let closed = std::mem::replace(&mut self.current, fresh);

        window_add(&mut self.window_total, &closed.data);

        let tick = Arc::new(Tick {
            data: closed,
            wordslices: self.slices.take(),
        });
        if let Some(evicted) = self.ring.push(tick) {
            window_sub(&mut self.window_total, &evicted.data.data);
        }
    }

    pub(crate) fn get_snapshot(&self) -> Box<dyn ReportSnapshot> {
        Box::new(ByPacketSnapshot {
            info: self.info.clone(),
            hdr: self.hdr,
            data: self.window_total,
            hv: None,
            ticks: self.ring.ticks(),
            sdict: SnapshotDictionary::new(Arc::clone(&self.dict)),
            prepared: false,
        })
    }

    pub(crate) fn estimates(&self) -> ReportEstimates {
        let mut mem_used = (self.ring.len() + 1) as u64 * size_of::<Item>() as u64;
        if let Some(hv) = &self.current.hv {
            mem_used += hv.allocated_size() as u64;
        }
        for tick in self.ring.iter() {
            if let Some(hv) = &tick.data.hv {
                mem_used += hv.allocated_size() as u64;
            }
        }

        ReportEstimates {
            row_count: 1,
            mem_used,
        }
    }

    /// Sum over ring contents, used to cross-check the incremental total.
    #[cfg(test)]
    fn ring_total(&self) -> ByPacketData {
        let mut total = ByPacketData::default();
        for tick in self.ring.iter() {
            window_add(&mut total, &tick.data.data);
        }
        total
    }
}

struct ByPacketSnapshot {
    info: ReportInfo,
    hdr: Option<HdrConfig>,
    data: ByPacketData,
    hv: Option<HdrHistogram>,
    // held for word lifetime and the on-demand histogram merge
    ticks: Vec<Arc<Tick<Item>>>,
    sdict: SnapshotDictionary,
    prepared: bool,
}

impl ReportSnapshot for ByPacketSnapshot {
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

        if flags.with_histograms {
            if let Some(conf) = &self.hdr {
                let mut merged = HdrHistogram::new(conf);
                for tick in &self.ticks {
                    if let Some(hv) = &tick.data.hv {
                        merged.merge_same_conf(conf, hv);
                    }
                }
                self.hv = Some(merged);
            }
        }

        self.prepared = true;
    }

    fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn row_count(&self) -> usize {
        usize::from(self.prepared)
    }

    fn rows(&self) -> Box<dyn Iterator<Item = SnapshotRow<'_>> + '_> {
        if !self.prepared {
            return Box::new(std::iter::empty());
        }
        Box::new(std::iter::once(SnapshotRow {
            key: ReportKey::new(),
            data: SnapshotData::ByPacket(&self.data),
            histogram: self.hv.as_ref(),
        }))
    }

    fn totals(&self) -> Option<SnapshotRow<'_>> {
        // single-row report: the row is its own total
        self.rows().next()
    }

    fn get_word(&self, id: u32) -> Arc<str> {
        self.sdict.get_word(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportConfig;
    use std::time::Duration;

    fn make_report(tick_count: u32) -> ByPacketReport {
        let conf = ByPacketConfig {
            name: "pkts".to_string(),
            time_window: Duration::from_secs(10),
            tick_count,
            histogram: None,
            filters: Vec::new(),
        };
        let info = ReportConfig::ByPacket(conf.clone()).info();
        ByPacketReport::new(
            &conf,
            info,
            None,
            Arc::new(Dictionary::new()),
            Arc::new(ReportStats::default()),
        )
    }

    fn batch_of(n: usize) -> Arc<PacketBatch> {
        let mut batch = PacketBatch::with_capacity(n);
        for _ in 0..n {
            crate::packet::test_support::push_packet(
                &mut batch,
                Packet {
                    request_time: Duration::from_millis(15),
                    ru_utime: Duration::from_millis(3),
                    ru_stime: Duration::from_millis(1),
                    traffic: 9999,
                    mem_used: 1,
                    ..Packet::default()
                },
            );
        }
        Arc::new(batch)
    }

    #[test]
    fn test_windowed_single_window() {
        let mut r = make_report(10);

        r.add_batch(&batch_of(4));
        r.tick_now();
        r.add_batch(&batch_of(3));
        r.tick_now();
        r.add_batch(&batch_of(2));
        r.tick_now();

        let mut snap = r.get_snapshot();
        snap.prepare(MergeFlags::NONE);
        assert!(snap.is_prepared());

        let rows: Vec<_> = snap.rows().collect();
        assert_eq!(rows.len(), 1);
        let SnapshotData::ByPacket(d) = rows[0].data else {
            unreachable!()
        };
        assert_eq!(d.req_count, 9);
        assert_eq!(d.timer_count, 0);
        assert_eq!(d.time_total, Duration::from_millis(135));
        assert_eq!(d.ru_utime, Duration::from_millis(27));
        assert_eq!(d.ru_stime, Duration::from_millis(9));
        assert_eq!(d.traffic, 89991);
        assert_eq!(d.mem_used, 9);
    }

    #[test]
    fn test_window_eviction_subtracts_counters() {
        let mut r = make_report(2);

        r.add_batch(&batch_of(4));
        r.tick_now();
        assert_eq!(r.window_total, r.ring_total());

        r.add_batch(&batch_of(3));
        r.tick_now();
        assert_eq!(r.window_total, r.ring_total());
        assert_eq!(r.window_total.req_count, 7);

        // third tick evicts the first (4 packets)
        r.add_batch(&batch_of(2));
        r.tick_now();
        assert_eq!(r.window_total, r.ring_total());
        assert_eq!(r.window_total.req_count, 5);
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let mut r = make_report(4);
        r.add_batch(&batch_of(1));
        r.tick_now();

        let mut snap = r.get_snapshot();
        snap.prepare(MergeFlags::NONE);
        let first: Vec<_> = snap.rows().map(|row| row.key).collect();
        snap.prepare(MergeFlags::ALL);
        assert_eq!(snap.rows().count(), first.len());
        assert!(snap.rows().next().unwrap().histogram.is_none());
    }
}
