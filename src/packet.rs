//! Internal packet representation and the raw → packet transform.
//!
//! A [`RawBatch`] owns the decoded wire records of up to one collector
//! batch and frees them en bloc. A [`PacketBatch`] owns flat pools —
//! packets, timers and four contiguous id arrays — that individual
//! [`Packet`]s and [`PackedTimer`]s address by offset, so aggregation scans
//! run over contiguous memory. The batch also embeds the repacker
//! word-slice that keeps every referenced dictionary word alive for the
//! batch's (and its consumers') lifetime.

use std::sync::Arc;
use std::time::Duration;

use crate::bloom::{bloom_hash, PacketBloom, TimerBloom};
use crate::dictionary::{WordInterner, WordSlice};
use crate::proto::WireRequest;

/// Max UDP datagram size; one datagram is one complete record.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Decoded wire records of one collector batch, released en bloc.
#[derive(Debug, Default)]
pub struct RawBatch {
    pub requests: Vec<WireRequest>,
}

impl RawBatch {
    #[must_use]
    pub fn with_capacity(batch_size: usize) -> Self {
        Self {
            requests: Vec::with_capacity(batch_size),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// One repacked record: all strings replaced by dictionary ids, tags and
/// timers addressed as ranges into the owning batch's pools.
#[derive(Debug, Clone, Copy, Default)]
pub struct Packet {
    pub host_id: u32,
    pub server_id: u32,
    pub script_id: u32,
    pub schema_id: u32,
    pub status_id: u32,
    pub traffic: u32,
    pub mem_used: u32,
    pub tag_count: u16,
    pub timer_count: u16,
    pub(crate) tag_off: u32,
    pub(crate) timer_off: u32,
    pub request_time: Duration,
    pub ru_utime: Duration,
    pub ru_stime: Duration,
    /// Superset of every timer bloom of this packet.
    pub timer_bloom: PacketBloom,
}

/// One timer of a packet; tag ids live in the batch's timer-tag pools.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedTimer {
    pub hit_count: u32,
    pub tag_count: u16,
    pub(crate) tag_off: u32,
    pub value: Duration,
    pub ru_utime: Duration,
    pub ru_stime: Duration,
    pub bloom: TimerBloom,
}

/// Flat-pool batch of packets, ref-counted across report hosts via `Arc`.
#[derive(Debug, Default)]
pub struct PacketBatch {
    packets: Vec<Packet>,
    timers: Vec<PackedTimer>,
    tag_name_ids: Vec<u32>,
    tag_value_ids: Vec<u32>,
    timer_tag_name_ids: Vec<u32>,
    timer_tag_value_ids: Vec<u32>,

    /// The repacker word-slice current when this batch was sealed.
    pub wordslice: Option<Arc<WordSlice>>,
}

impl PacketBatch {
    #[must_use]
    pub fn with_capacity(batch_size: usize) -> Self {
        Self {
            packets: Vec::with_capacity(batch_size),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Request tag (name_id, value_id) arrays of `p`.
    #[must_use]
    pub fn request_tags(&self, p: &Packet) -> (&[u32], &[u32]) {
        let range = p.tag_off as usize..p.tag_off as usize + p.tag_count as usize;
        (
            &self.tag_name_ids[range.clone()],
            &self.tag_value_ids[range],
        )
    }

    /// Timers of `p`.
    #[must_use]
    pub fn timers(&self, p: &Packet) -> &[PackedTimer] {
        &self.timers[p.timer_off as usize..p.timer_off as usize + p.timer_count as usize]
    }

    /// Timer tag (name_id, value_id) arrays of `t`.
    #[must_use]
    pub fn timer_tags(&self, t: &PackedTimer) -> (&[u32], &[u32]) {
        let range = t.tag_off as usize..t.tag_off as usize + t.tag_count as usize;
        (
            &self.timer_tag_name_ids[range.clone()],
            &self.timer_tag_value_ids[range],
        )
    }

    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.packets.capacity() * size_of::<Packet>()
            + self.timers.capacity() * size_of::<PackedTimer>()
            + (self.tag_name_ids.capacity()
                + self.tag_value_ids.capacity()
                + self.timer_tag_name_ids.capacity()
                + self.timer_tag_value_ids.capacity())
                * size_of::<u32>()
    }
}

/// Why a record was rejected by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateError {
    StatusIsTooLarge,
    BadHitCount,
    BadTagCount,
    NotEnoughTagNames,
    NotEnoughTagValues,
    BadTimerHitCount,
    BadFloatRequestTime,
    BadFloatRuUtime,
    BadFloatRuStime,
    BadFloatTimerValue,
    NegativeFloatTimerValue,
    BadFloatTimerRuUtime,
    BadFloatTimerRuStime,
}

impl ValidateError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StatusIsTooLarge => "status_is_too_large",
            Self::BadHitCount => "bad_hit_count",
            Self::BadTagCount => "bad_tag_count",
            Self::NotEnoughTagNames => "not_enough_tag_names",
            Self::NotEnoughTagValues => "not_enough_tag_values",
            Self::BadTimerHitCount => "bad_timer_hit_count",
            Self::BadFloatRequestTime => "bad_float_request_time",
            Self::BadFloatRuUtime => "bad_float_ru_utime",
            Self::BadFloatRuStime => "bad_float_ru_stime",
            Self::BadFloatTimerValue => "bad_float_timer_value",
            Self::NegativeFloatTimerValue => "negative_float_timer_value",
            Self::BadFloatTimerRuUtime => "bad_float_timer_ru_utime",
            Self::BadFloatTimerRuStime => "bad_float_timer_ru_stime",
        }
    }
}

// zero and normal are fine, NaN/Inf/subnormal are not
fn float_ok(v: f32) -> bool {
    v == 0.0 || v.is_normal()
}

/// Validates a record the rest of the pipeline depends on; may clamp
/// negative request-time / rusage values to zero (common in the wild)
/// rather than rejecting the record.
///
/// # Errors
/// Returns the rejection reason; the caller counts and drops the record.
pub fn validate_request(r: &mut WireRequest) -> Result<(), ValidateError> {
    if r.status == Some(u32::MAX) {
        return Err(ValidateError::StatusIsTooLarge);
    }

    // all timers have hit counts and tag counts
    if r.timer_value.len() != r.timer_hit_count.len() {
        return Err(ValidateError::BadHitCount);
    }
    if r.timer_value.len() != r.timer_tag_count.len() {
        return Err(ValidateError::BadTagCount);
    }

    // some clients don't send timer rusage at all, let them

    if r.timer_hit_count.iter().any(|&h| h == 0) {
        return Err(ValidateError::BadTimerHitCount);
    }

    let total_tag_count: usize = r.timer_tag_count.iter().map(|&c| c as usize).sum();
    if total_tag_count != r.timer_tag_name.len() {
        return Err(ValidateError::NotEnoughTagNames);
    }
    if total_tag_count != r.timer_tag_value.len() {
        return Err(ValidateError::NotEnoughTagValues);
    }

    if !float_ok(r.request_time) {
        return Err(ValidateError::BadFloatRequestTime);
    }
    if r.request_time.is_sign_negative() {
        r.request_time = 0.0;
    }

    // negative rusage should not happen, but happens A LOT; reset to zero
    if !float_ok(r.ru_utime) {
        return Err(ValidateError::BadFloatRuUtime);
    }
    if r.ru_utime.is_sign_negative() {
        r.ru_utime = 0.0;
    }

    if !float_ok(r.ru_stime) {
        return Err(ValidateError::BadFloatRuStime);
    }
    if r.ru_stime.is_sign_negative() {
        r.ru_stime = 0.0;
    }

    for &v in &r.timer_value {
        if !float_ok(v) {
            return Err(ValidateError::BadFloatTimerValue);
        }
        if v.is_sign_negative() {
            return Err(ValidateError::NegativeFloatTimerValue);
        }
    }

    for v in &mut r.timer_ru_utime {
        if !float_ok(*v) {
            return Err(ValidateError::BadFloatTimerRuUtime);
        }
        if v.is_sign_negative() {
            *v = 0.0;
        }
    }

    for v in &mut r.timer_ru_stime {
        if !float_ok(*v) {
            return Err(ValidateError::BadFloatTimerRuStime);
        }
        if v.is_sign_negative() {
            *v = 0.0;
        }
    }

    Ok(())
}

fn duration_from_float(v: f32) -> Duration {
    if v <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(f64::from(v))
    }
}

/// Reusable per-thread scratch for [`request_to_packet`]; avoids
/// per-record allocations of the translation tables.
#[derive(Default)]
pub struct RepackScratch {
    // record-local word offset -> global dictionary word id
    translate: Vec<u32>,
    // global word id, hashed for bloom probing
    translate_hashed: Vec<u64>,
    // word offsets already added to the packet-level bloom
    bloom_added: Vec<bool>,
    status_buf: itoa::Buffer,
}

impl std::fmt::Debug for RepackScratch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepackScratch")
            .field("translate", &self.translate)
            .field("translate_hashed", &self.translate_hashed)
            .field("bloom_added", &self.bloom_added)
            .finish()
    }
}

/// Translates a validated record into a packet appended to `batch`,
/// interning every observed string through `interner`.
pub fn request_to_packet<I: WordInterner>(
    r: &WireRequest,
    interner: &mut I,
    scratch: &mut RepackScratch,
    batch: &mut PacketBatch,
) {
    let n_words = r.dictionary.len();

    scratch.translate.clear();
    scratch.translate_hashed.clear();
    scratch.bloom_added.clear();
    for word in &r.dictionary {
        let id = interner.intern(word);
        scratch.translate.push(id);
        scratch.translate_hashed.push(bloom_hash(id));
        scratch.bloom_added.push(false);
    }
    let translate_offset = |off: u32| -> u32 {
        scratch
            .translate
            .get(off as usize)
            .copied()
            .unwrap_or_default()
    };

    let mut p = Packet {
        host_id: interner.intern(&r.hostname),
        server_id: interner.intern(&r.server_name),
        script_id: interner.intern(&r.script_name),
        schema_id: interner.intern(r.schema.as_deref().unwrap_or_default()),
        status_id: interner.intern(scratch.status_buf.format(r.status.unwrap_or_default())),
        traffic: r.document_size,
        mem_used: r.memory_footprint.unwrap_or_default(),
        request_time: duration_from_float(r.request_time),
        ru_utime: duration_from_float(r.ru_utime),
        ru_stime: duration_from_float(r.ru_stime),
        ..Packet::default()
    };

    // timers, with all tag ids contiguous in the batch pools
    p.timer_count = r.timer_value.len().min(u16::MAX as usize) as u16;
    p.timer_off = batch.timers.len() as u32;

    let mut tag_offset = 0usize;
    for i in 0..p.timer_count as usize {
        let tag_count = r.timer_tag_count[i] as usize;

        let mut t = PackedTimer {
            hit_count: r.timer_hit_count[i],
            tag_count: tag_count.min(u16::MAX as usize) as u16,
            tag_off: batch.timer_tag_name_ids.len() as u32,
            value: duration_from_float(r.timer_value[i]),
            ru_utime: duration_from_float(r.timer_ru_utime.get(i).copied().unwrap_or_default()),
            ru_stime: duration_from_float(r.timer_ru_stime.get(i).copied().unwrap_or_default()),
            bloom: TimerBloom::default(),
        };

        for j in 0..tag_count {
            // offsets into the record's mini-dictionary
            let name_off = r.timer_tag_name[tag_offset + j];
            let value_off = r.timer_tag_value[tag_offset + j];

            batch.timer_tag_name_ids.push(translate_offset(name_off));
            batch.timer_tag_value_ids.push(translate_offset(value_off));

            if let Some(&hashed) = scratch.translate_hashed.get(name_off as usize) {
                // always add the tag name to this timer's bloom
                t.bloom.add_hashed(hashed);

                // and to the packet-level bloom, once per distinct name
                if (name_off as usize) < n_words && !scratch.bloom_added[name_off as usize] {
                    scratch.bloom_added[name_off as usize] = true;
                    p.timer_bloom.add_hashed(hashed);
                }
            }
        }

        tag_offset += tag_count;
        batch.timers.push(t);
    }

    // request tags
    p.tag_count = r.tag_name.len().min(u16::MAX as usize) as u16;
    p.tag_off = batch.tag_name_ids.len() as u32;
    for i in 0..p.tag_count as usize {
        batch.tag_name_ids.push(translate_offset(r.tag_name[i]));
        batch.tag_value_ids.push(translate_offset(r.tag_value.get(i).copied().unwrap_or(0)));
    }

    batch.packets.push(p);
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Direct batch construction for aggregator unit tests, bypassing the
    //! wire format but building the same bloom/pool layout as the repacker.

    use super::{Packet, PackedTimer, PacketBatch};
    use crate::bloom::bloom_hash;
    use std::time::Duration;

    pub(crate) struct TimerSpec {
        pub hit_count: u32,
        pub value: Duration,
        pub ru_utime: Duration,
        pub ru_stime: Duration,
        /// (name_id, value_id) pairs
        pub tags: Vec<(u32, u32)>,
    }

    impl Default for TimerSpec {
        fn default() -> Self {
            Self {
                hit_count: 1,
                value: Duration::from_millis(1),
                ru_utime: Duration::ZERO,
                ru_stime: Duration::ZERO,
                tags: Vec::new(),
            }
        }
    }

    pub(crate) fn push_packet(batch: &mut PacketBatch, p: Packet) {
        push_packet_full(batch, p, &[], &[]);
    }

    pub(crate) fn push_packet_full(
        batch: &mut PacketBatch,
        mut p: Packet,
        request_tags: &[(u32, u32)],
        timers: &[TimerSpec],
    ) {
        p.tag_count = request_tags.len() as u16;
        p.tag_off = batch.tag_name_ids.len() as u32;
        for &(name_id, value_id) in request_tags {
            batch.tag_name_ids.push(name_id);
            batch.tag_value_ids.push(value_id);
        }

        p.timer_count = timers.len() as u16;
        p.timer_off = batch.timers.len() as u32;
        for spec in timers {
            let mut t = PackedTimer {
                hit_count: spec.hit_count,
                tag_count: spec.tags.len() as u16,
                tag_off: batch.timer_tag_name_ids.len() as u32,
                value: spec.value,
                ru_utime: spec.ru_utime,
                ru_stime: spec.ru_stime,
                ..PackedTimer::default()
            };
            for &(name_id, value_id) in &spec.tags {
                batch.timer_tag_name_ids.push(name_id);
                batch.timer_tag_value_ids.push(value_id);
                let hashed = bloom_hash(name_id);
                t.bloom.add_hashed(hashed);
                p.timer_bloom.add_hashed(hashed);
            }
            batch.timers.push(t);
        }

        batch.packets.push(p);
    }
}
