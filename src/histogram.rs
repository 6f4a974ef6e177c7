//! HDR-style histogram codec.
//!
//! Two representations coexist. The live [`HdrHistogram`] sits inside
//! aggregator rows: a linear-within-exponential-bucket counter array with
//! u32 counters, plus out-of-range mass accumulated in `negative_inf` /
//! `positive_inf`. The [`FlatHistogram`] is the immutable snapshot form: a
//! sorted vector of `(value, count)` pairs plus the same three scalars,
//! cheap to merge and to walk for percentiles.
//!
//! All layout parameters live in [`HdrConfig`], shared by every histogram
//! of a report; the histogram itself carries only counters. Percentile
//! results over the flat form are bit-exact with the live form.

use std::time::Duration;

use crate::error::PinbaError;

/// Sanity cap on the physical counts array length.
pub const HISTOGRAM_MAX_BUCKETS: u32 = 100_000_000;

/// Report-facing histogram configuration. `bucket_count == 0` means
/// histograms are disabled for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramConf {
    /// Number of buckets, each `bucket_d` wide.
    pub bucket_count: u32,
    /// Width of one bucket.
    pub bucket_d: Duration,
    /// Lower bound; upper bound is `min_value + bucket_d * bucket_count`.
    pub min_value: Duration,
}

impl HistogramConf {
    /// Derives the HDR layout covering this configuration's value range,
    /// with two significant decimal figures of relative precision.
    ///
    /// # Errors
    /// Returns [`PinbaError::Config`] when the range is empty or the
    /// resulting layout exceeds [`HISTOGRAM_MAX_BUCKETS`].
    pub fn hdr_config(&self) -> Result<HdrConfig, PinbaError> {
        if self.bucket_count == 0 {
            return Err(PinbaError::Config(
                "histogram bucket_count must be > 0".to_string(),
            ));
        }

        let lowest = duration_to_hdr_value(self.min_value).max(1);
        let span = self
            .bucket_d
            .checked_mul(self.bucket_count)
            .unwrap_or(Duration::MAX);
        let highest = duration_to_hdr_value(self.min_value.saturating_add(span)).max(lowest * 2);

        HdrConfig::with_significant_figures(lowest, highest, 2)
    }
}

/// Converts a duration to the integer value space histograms operate on
/// (microseconds).
#[inline]
#[must_use]
pub fn duration_to_hdr_value(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Immutable HDR layout: bucket geometry derived from the trackable value
/// range and the precision, shared by all histograms of one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdrConfig {
    sub_bucket_count: u32,
    sub_bucket_half_count: u32,
    sub_bucket_mask: u64,
    unit_magnitude: u8,
    sub_bucket_half_count_magnitude: u8,

    lowest_trackable_value: u64,
    highest_trackable_value: u64,
    significant_bits: u8,
    bucket_count: u32,
    counts_len: u32,
}

// smallest power of two >= v, as an exponent
fn ceil_log2(v: u64) -> u32 {
    debug_assert!(v >= 2);
    64 - (v - 1).leading_zeros()
}

impl HdrConfig {
    /// Builds the layout for the `[lowest_trackable_value,
    /// highest_trackable_value]` range at `significant_bits` of linear
    /// resolution per exponential bucket.
    ///
    /// # Errors
    /// Returns [`PinbaError::Config`] on an invalid range, `significant_bits`
    /// outside `1..=14`, or a layout above [`HISTOGRAM_MAX_BUCKETS`].
    pub fn new(
        lowest_trackable_value: u64,
        highest_trackable_value: u64,
        significant_bits: u8,
    ) -> Result<Self, PinbaError> {
        if lowest_trackable_value == 0 {
            return Err(PinbaError::Config(format!(
                "lowest_trackable_value must be > 0, {lowest_trackable_value} given"
            )));
        }
        if lowest_trackable_value > highest_trackable_value / 2 {
            return Err(PinbaError::Config(format!(
                "lowest_trackable_value * 2 must be <= highest_trackable_value, {lowest_trackable_value}*2 > {highest_trackable_value}"
            )));
        }
        if !(1..=14).contains(&significant_bits) {
            return Err(PinbaError::Config(format!(
                "significant_bits must be in range [1, 14], {significant_bits} given"
            )));
        }

        let largest_value_with_single_unit_resolution = 2u64 << significant_bits;

        let sub_bucket_count_magnitude = ceil_log2(largest_value_with_single_unit_resolution);
        let sub_bucket_half_count_magnitude = (sub_bucket_count_magnitude.max(1) - 1) as u8;

        #[allow(clippy::cast_possible_truncation)]
        let unit_magnitude = (63 - lowest_trackable_value.leading_zeros()) as u8;

        let sub_bucket_count = 1u32 << (sub_bucket_half_count_magnitude + 1);
        let sub_bucket_half_count = sub_bucket_count / 2;
        let sub_bucket_mask = (u64::from(sub_bucket_count) - 1) << unit_magnitude;

        let bucket_count = Self::buckets_needed_to_cover(
            highest_trackable_value,
            sub_bucket_count,
            unit_magnitude,
        );
        let counts_len = (bucket_count + 1) * sub_bucket_half_count;

        if counts_len > HISTOGRAM_MAX_BUCKETS {
            return Err(PinbaError::Config(format!(
                "histogram counts_len {counts_len} exceeds maximum {HISTOGRAM_MAX_BUCKETS}"
            )));
        }

        Ok(Self {
            sub_bucket_count,
            sub_bucket_half_count,
            sub_bucket_mask,
            unit_magnitude,
            sub_bucket_half_count_magnitude,
            lowest_trackable_value,
            highest_trackable_value,
            significant_bits,
            bucket_count,
            counts_len,
        })
    }

    /// Like [`HdrConfig::new`], with precision given in significant decimal
    /// figures: the significant-bits count is the smallest power of two
    /// covering `10^figures`.
    ///
    /// # Errors
    /// See [`HdrConfig::new`].
    pub fn with_significant_figures(
        lowest_trackable_value: u64,
        highest_trackable_value: u64,
        figures: u32,
    ) -> Result<Self, PinbaError> {
        let resolution = 10u64
            .checked_pow(figures)
            .ok_or_else(|| PinbaError::Config(format!("bad significant figures: {figures}")))?;
        #[allow(clippy::cast_possible_truncation)]
        let sig_bits = (64 - resolution.leading_zeros()) as u8;
        Self::new(lowest_trackable_value, highest_trackable_value, sig_bits)
    }

    fn buckets_needed_to_cover(value: u64, sub_bucket_count: u32, unit_magnitude: u8) -> u32 {
        let mut smallest_untrackable = u64::from(sub_bucket_count) << unit_magnitude;
        let mut buckets_needed = 1u32;
        while smallest_untrackable <= value {
            if smallest_untrackable > u64::MAX / 2 {
                return buckets_needed + 1;
            }
            smallest_untrackable <<= 1;
            buckets_needed += 1;
        }
        buckets_needed
    }

    #[must_use]
    pub const fn lowest_trackable_value(&self) -> u64 {
        self.lowest_trackable_value
    }

    #[must_use]
    pub const fn highest_trackable_value(&self) -> u64 {
        self.highest_trackable_value
    }

    #[must_use]
    pub const fn significant_bits(&self) -> u8 {
        self.significant_bits
    }

    /// Number of exponential buckets needed to cover the trackable range.
    #[must_use]
    pub const fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    #[must_use]
    pub const fn counts_len(&self) -> u32 {
        self.counts_len
    }

    #[must_use]
    pub const fn initial_counts_len(&self) -> u32 {
        self.sub_bucket_half_count
    }

    // index <-> value math, the standard HDR layout

    fn bucket_index(&self, value: u64) -> u32 {
        let pow2ceiling = 64 - (value | self.sub_bucket_mask).leading_zeros();
        pow2ceiling - u32::from(self.unit_magnitude) - (u32::from(self.sub_bucket_half_count_magnitude) + 1)
    }

    fn sub_bucket_index(&self, value: u64, bucket_index: u32) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            (value >> (bucket_index + u32::from(self.unit_magnitude))) as u32
        }
    }

    fn counts_index(&self, bucket_index: u32, sub_bucket_index: u32) -> u32 {
        let bucket_base_index = (bucket_index + 1) << self.sub_bucket_half_count_magnitude;
        bucket_base_index + sub_bucket_index - self.sub_bucket_half_count
    }

    pub(crate) fn counts_index_for(&self, value: u64) -> u32 {
        let bucket_index = self.bucket_index(value);
        let sub_bucket_index = self.sub_bucket_index(value, bucket_index);
        self.counts_index(bucket_index, sub_bucket_index)
    }

    #[must_use]
    pub fn value_at_index(&self, index: u32) -> u64 {
        let mut bucket_index = (index >> self.sub_bucket_half_count_magnitude) as i32 - 1;
        let mut sub_bucket_index =
            (index & (self.sub_bucket_half_count - 1)) + self.sub_bucket_half_count;

        if bucket_index < 0 {
            sub_bucket_index -= self.sub_bucket_half_count;
            bucket_index = 0;
        }

        #[allow(clippy::cast_sign_loss)]
        {
            u64::from(sub_bucket_index) << (bucket_index as u32 + u32::from(self.unit_magnitude))
        }
    }

    #[must_use]
    pub fn size_of_equivalent_value_range(&self, value: u64) -> u64 {
        let bucket_index = self.bucket_index(value);
        let sub_bucket_index = self.sub_bucket_index(value, bucket_index);
        let adjusted_bucket = if sub_bucket_index >= self.sub_bucket_count {
            bucket_index + 1
        } else {
            bucket_index
        };
        1u64 << (u32::from(self.unit_magnitude) + adjusted_bucket)
    }

    #[must_use]
    pub fn lowest_equivalent_value(&self, value: u64) -> u64 {
        let bucket_index = self.bucket_index(value);
        let sub_bucket_index = self.sub_bucket_index(value, bucket_index);
        u64::from(sub_bucket_index) << (bucket_index + u32::from(self.unit_magnitude))
    }

    #[must_use]
    pub fn highest_equivalent_value(&self, value: u64) -> u64 {
        self.lowest_equivalent_value(value) + self.size_of_equivalent_value_range(value) - 1
    }
}

/// Live histogram: grows its counts array lazily, starting at half of one
/// exponential bucket and jumping to the full layout on the first
/// out-of-range index.
#[derive(Debug, Clone)]
pub struct HdrHistogram {
    counts: Vec<u32>,
    counts_nonzero: u32,
    negative_inf: u32,
    positive_inf: u32,
    total_count: u64,
}

impl HdrHistogram {
    #[must_use]
    pub fn new(conf: &HdrConfig) -> Self {
        Self {
            counts: vec![0; conf.initial_counts_len() as usize],
            counts_nonzero: 0,
            negative_inf: 0,
            positive_inf: 0,
            total_count: 0,
        }
    }

    #[must_use]
    pub const fn total_count(&self) -> u64 {
        self.total_count
    }

    #[must_use]
    pub const fn negative_inf(&self) -> u32 {
        self.negative_inf
    }

    #[must_use]
    pub const fn positive_inf(&self) -> u32 {
        self.positive_inf
    }

    #[must_use]
    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    #[must_use]
    pub fn allocated_size(&self) -> usize {
        self.counts.capacity() * size_of::<u32>()
    }

    /// Folds `value` into the histogram.
    ///
    /// Buckets are open on the left and closed on the right: values below
    /// the trackable range land in `negative_inf`, values above it in
    /// `positive_inf`.
    pub fn increment(&mut self, conf: &HdrConfig, value: u64, increment_by: u32) {
        if value < conf.lowest_trackable_value {
            self.negative_inf = self.negative_inf.saturating_add(increment_by);
        } else if value > conf.highest_trackable_value {
            self.positive_inf = self.positive_inf.saturating_add(increment_by);
        } else {
            let index = conf.counts_index_for(value) as usize;
            self.increment_index(conf, index, increment_by);
        }

        self.total_count += u64::from(increment_by);
    }

    fn increment_index(&mut self, conf: &HdrConfig, index: usize, increment_by: u32) {
        if index >= self.counts.len() {
            self.counts.resize(conf.counts_len() as usize, 0);
        }

        let counter = &mut self.counts[index];
        self.counts_nonzero += u32::from(*counter == 0);
        *counter = counter.saturating_add(increment_by);
    }

    /// Element-wise addition of counts and the three scalars. Only valid
    /// between histograms built from the same [`HdrConfig`].
    pub fn merge_same_conf(&mut self, conf: &HdrConfig, other: &Self) {
        if self.counts.len() < other.counts.len() {
            self.counts.resize(conf.counts_len() as usize, 0);
        }

        for (dst, src) in self.counts.iter_mut().zip(other.counts.iter()) {
            if *dst == 0 && *src != 0 {
                self.counts_nonzero += 1;
            }
            *dst = dst.saturating_add(*src);
        }

        self.negative_inf = self.negative_inf.saturating_add(other.negative_inf);
        self.positive_inf = self.positive_inf.saturating_add(other.positive_inf);
        self.total_count += other.total_count;
    }

    /// Folds a flattened histogram back in; counts land in the exact
    /// buckets they were flattened from.
    pub fn merge_flat(&mut self, conf: &HdrConfig, other: &FlatHistogram) {
        for fv in &other.values {
            let index = conf.counts_index_for(fv.value) as usize;
            self.increment_index(conf, index, fv.count);
        }

        self.negative_inf = self.negative_inf.saturating_add(other.negative_inf);
        self.positive_inf = self.positive_inf.saturating_add(other.positive_inf);
        self.total_count += other.total_count;
    }

    /// Computes the value at percentile `p` (0..=100), interpolating
    /// linearly inside the reached bucket. Always within the trackable
    /// range and non-decreasing in `p`.
    #[must_use]
    pub fn get_percentile(&self, conf: &HdrConfig, percentile: f64) -> u64 {
        percentile_walk(
            conf,
            percentile,
            self.total_count,
            self.negative_inf,
            self.positive_inf,
            self.counts
                .iter()
                .enumerate()
                .map(|(i, &c)| (conf.value_at_index(i as u32), c)),
        )
    }

    /// Flattens into the snapshot form: non-zero buckets in index order,
    /// which makes the output sorted by value.
    #[must_use]
    pub fn to_flat(&self, conf: &HdrConfig) -> FlatHistogram {
        let mut values = Vec::with_capacity(self.counts_nonzero as usize);
        for (i, &c) in self.counts.iter().enumerate() {
            if c != 0 {
                values.push(FlatValue {
                    value: conf.value_at_index(i as u32),
                    count: c,
                });
            }
        }

        FlatHistogram {
            values,
            negative_inf: self.negative_inf,
            positive_inf: self.positive_inf,
            total_count: self.total_count,
        }
    }
}

/// One non-empty bucket of a flattened histogram: the bucket's
/// representative value and its count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatValue {
    pub value: u64,
    pub count: u32,
}

/// Immutable snapshot form of a histogram: sorted `(value, count)` pairs
/// plus the out-of-range scalars.
#[derive(Debug, Clone, Default)]
pub struct FlatHistogram {
    pub values: Vec<FlatValue>,
    pub negative_inf: u32,
    pub positive_inf: u32,
    pub total_count: u64,
}

impl FlatHistogram {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }

    /// Percentile over the flat form; bit-exact with
    /// [`HdrHistogram::get_percentile`] for the histogram it was flattened
    /// from.
    #[must_use]
    pub fn get_percentile(&self, conf: &HdrConfig, percentile: f64) -> u64 {
        percentile_walk(
            conf,
            percentile,
            self.total_count,
            self.negative_inf,
            self.positive_inf,
            self.values.iter().map(|fv| (fv.value, fv.count)),
        )
    }
}

// Shared percentile machinery over (bucket_value, count) pairs in value
// order. Zero-count pairs are harmless.
fn percentile_walk(
    conf: &HdrConfig,
    percentile: f64,
    total_count: u64,
    negative_inf: u32,
    positive_inf: u32,
    buckets: impl Iterator<Item = (u64, u32)>,
) -> u64 {
    if percentile <= 0.0 || total_count == 0 {
        return conf.lowest_trackable_value();
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut required = ((total_count as f64) * percentile / 100.0).ceil() as u64;
    if required > total_count {
        required = total_count;
    }

    if required == 0 || required <= u64::from(negative_inf) {
        return conf.lowest_trackable_value();
    }
    if required > total_count - u64::from(positive_inf) {
        return conf.highest_trackable_value();
    }

    required -= u64::from(negative_inf);

    let mut current_sum = 0u64;
    for (value, count) in buckets {
        let has_values = u64::from(count);
        let need_values = required - current_sum;

        if has_values < need_values {
            current_sum += has_values;
            continue;
        }

        let result = if has_values == need_values {
            // complete bucket, upper bound of its value range
            conf.highest_equivalent_value(value)
        } else {
            // incomplete bucket, assume flat distribution within
            let d = conf.size_of_equivalent_value_range(value) * need_values / has_values;
            conf.lowest_equivalent_value(value) + d
        };

        return result.clamp(conf.lowest_trackable_value(), conf.highest_trackable_value());
    }

    // counts exhausted without reaching required; everything left is above
    conf.highest_trackable_value()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(lowest: u64, highest: u64, bits: u8) -> HdrConfig {
        HdrConfig::new(lowest, highest, bits).expect("valid config")
    }

    #[test]
    fn test_config_geometry() {
        let c = conf(1, 600_000_000, 7);
        assert_eq!(c.sub_bucket_count, 256);
        assert_eq!(c.sub_bucket_half_count, 128);
        assert_eq!(c.unit_magnitude, 0);
        // every valid value maps to a valid index
        assert!(c.counts_index_for(600_000_000) < c.counts_len());
    }

    #[test]
    fn test_config_rejects_bad_params() {
        assert!(HdrConfig::new(0, 100, 3).is_err());
        assert!(HdrConfig::new(100, 150, 3).is_err());
        assert!(HdrConfig::new(1, 100, 0).is_err());
        assert!(HdrConfig::new(1, 100, 15).is_err());
    }

    #[test]
    fn test_value_index_roundtrip() {
        let c = conf(1, 1_000_000, 7);
        for value in [1u64, 2, 100, 255, 256, 1000, 65536, 999_999] {
            let idx = c.counts_index_for(value);
            let low = c.lowest_equivalent_value(value);
            let high = c.highest_equivalent_value(value);
            assert!(low <= value && value <= high);
            assert_eq!(c.value_at_index(idx), low);
            assert_eq!(c.counts_index_for(low), idx);
        }
    }

    #[test]
    fn test_increment_grows_lazily() {
        let c = conf(1, 1_000_000, 7);
        let mut h = HdrHistogram::new(&c);
        assert_eq!(h.counts().len() as u32, c.initial_counts_len());

        h.increment(&c, 1, 1);
        assert_eq!(h.counts().len() as u32, c.initial_counts_len());

        h.increment(&c, 500_000, 1);
        assert_eq!(h.counts().len() as u32, c.counts_len());
        assert_eq!(h.total_count(), 2);
    }

    #[test]
    fn test_out_of_range_mass() {
        let c = conf(100, 10_000, 3);
        let mut h = HdrHistogram::new(&c);
        h.increment(&c, 1, 5);
        h.increment(&c, 1_000_000, 7);
        assert_eq!(h.negative_inf(), 5);
        assert_eq!(h.positive_inf(), 7);
        assert_eq!(h.total_count(), 12);
    }

    #[test]
    fn test_percentile_boundaries() {
        let c = conf(100, 10_000, 3);

        let empty = HdrHistogram::new(&c);
        assert_eq!(empty.get_percentile(&c, 50.0), 100);

        let mut neg = HdrHistogram::new(&c);
        neg.increment(&c, 1, 10);
        for p in [1.0, 50.0, 99.0, 100.0] {
            assert_eq!(neg.get_percentile(&c, p), 100);
        }

        let mut pos = HdrHistogram::new(&c);
        pos.increment(&c, 1_000_000, 10);
        for p in [1.0, 50.0, 99.0, 100.0] {
            assert_eq!(pos.get_percentile(&c, p), 10_000);
        }
    }

    #[test]
    fn test_percentile_is_monotonic_and_bounded() {
        let c = conf(1, 600_000_000, 7);
        let mut h = HdrHistogram::new(&c);
        for v in [1u64, 10, 100, 5_000, 100_000, 20_000_000, 599_000_000] {
            h.increment(&c, v, 3);
        }
        h.increment(&c, 0, 1); // negative_inf
        h.increment(&c, u64::MAX, 1); // positive_inf

        let mut prev = 0u64;
        let mut p = 0.0f64;
        while p <= 100.0 {
            let v = h.get_percentile(&c, p);
            assert!(v >= c.lowest_trackable_value());
            assert!(v <= c.highest_trackable_value());
            assert!(v >= prev, "percentile must be non-decreasing");
            prev = v;
            p += 0.5;
        }
    }

    #[test]
    fn test_percentile_interpolation_dense_uniform() {
        // 7 significant bits over [1, 600e6]; each of 1..=1_000_000 once.
        let c = conf(1, 600_000_000, 7);
        let mut h = HdrHistogram::new(&c);
        for v in 1..=1_000_000u64 {
            h.increment(&c, v, 1);
        }

        let p50 = h.get_percentile(&c, 50.0);
        assert!((499_000..=501_000).contains(&p50), "p50 = {p50}");
    }

    #[test]
    fn test_merge_identity_and_commutativity() {
        let c = conf(1, 1_000_000, 7);

        let mut a = HdrHistogram::new(&c);
        let mut b = HdrHistogram::new(&c);
        for v in [5u64, 500, 50_000, 2_000_000] {
            a.increment(&c, v, 2);
        }
        for v in [7u64, 700, 70_000] {
            b.increment(&c, v, 3);
        }

        // merge(empty, h) == h
        let mut empty = HdrHistogram::new(&c);
        empty.merge_same_conf(&c, &a);
        assert_eq!(empty.counts(), a.counts());
        assert_eq!(empty.total_count(), a.total_count());

        // commutative
        let mut ab = a.clone();
        ab.merge_same_conf(&c, &b);
        let mut ba = b.clone();
        ba.merge_same_conf(&c, &a);
        assert_eq!(ab.counts(), ba.counts());
        assert_eq!(ab.total_count(), ba.total_count());
        assert_eq!(ab.positive_inf(), ba.positive_inf());
    }

    #[test]
    fn test_flat_percentile_is_bit_exact() {
        let c = conf(1, 600_000_000, 7);
        let mut h = HdrHistogram::new(&c);
        for v in [1u64, 3, 900, 12_345, 777_777, 599_999_999] {
            h.increment(&c, v, 4);
        }
        h.increment(&c, 0, 2);
        h.increment(&c, u64::MAX, 2);

        let flat = h.to_flat(&c);
        assert_eq!(flat.total_count, h.total_count());

        let mut p = 0.0f64;
        while p <= 100.0 {
            assert_eq!(flat.get_percentile(&c, p), h.get_percentile(&c, p));
            p += 0.25;
        }
    }

    #[test]
    fn test_flat_values_are_sorted() {
        let c = conf(1, 1_000_000, 7);
        let mut h = HdrHistogram::new(&c);
        for v in [999_999u64, 1, 500, 123_456] {
            h.increment(&c, v, 1);
        }
        let flat = h.to_flat(&c);
        assert!(flat.values.windows(2).all(|w| w[0].value < w[1].value));
    }

    #[test]
    fn test_merge_flat_reproduces_source() {
        let c = conf(1, 1_000_000, 7);
        let mut src = HdrHistogram::new(&c);
        for v in [2u64, 20, 200, 2_000, 2_000_000] {
            src.increment(&c, v, 5);
        }
        src.increment(&c, 0, 1);

        let flat = src.to_flat(&c);
        let mut dst = HdrHistogram::new(&c);
        dst.merge_flat(&c, &flat);

        assert_eq!(dst.total_count(), src.total_count());
        assert_eq!(dst.negative_inf(), src.negative_inf());
        assert_eq!(dst.positive_inf(), src.positive_inf());
        let mut p = 0.0f64;
        while p <= 100.0 {
            assert_eq!(dst.get_percentile(&c, p), src.get_percentile(&c, p));
            p += 1.0;
        }
    }

    #[test]
    fn test_histogram_conf_mapping() {
        let hc = HistogramConf {
            bucket_count: 1000,
            bucket_d: Duration::from_millis(1),
            min_value: Duration::ZERO,
        };
        let c = hc.hdr_config().expect("valid");
        assert_eq!(c.lowest_trackable_value(), 1);
        assert_eq!(c.highest_trackable_value(), 1_000_000);

        let disabled = HistogramConf {
            bucket_count: 0,
            bucket_d: Duration::from_millis(1),
            min_value: Duration::ZERO,
        };
        assert!(disabled.hdr_config().is_err());
    }
}
