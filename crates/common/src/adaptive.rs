//! Shared adaptive parallelism primitives over partition-unit statistics.
//!
//! Partition units are the finest addressable slices of a producer's output,
//! indexed contiguously from `0`. Consumers read contiguous unit ranges, so
//! every function here preserves unit order.

use serde::{Deserialize, Serialize};

use crate::search::find_min_legal_value;

/// Half-open range of partition units `[start, end)` read by one consumer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubpartitionRange {
    /// First unit index, inclusive.
    pub start: u32,
    /// Last unit index, exclusive.
    pub end: u32,
}

impl SubpartitionRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One partition-bytes histogram bucket for decision diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBytesHistogramBucket {
    /// Inclusive upper bound in bytes for the bucket.
    pub upper_bound_bytes: u64,
    /// Number of partition units in this bucket.
    pub unit_count: u32,
}

/// Sum per-instance byte vectors element-wise into one vector per unit.
///
/// Instances reporting fewer units are treated as zero for the missing tail.
pub fn aggregate_unit_bytes<'a, I>(per_instance: I) -> Vec<u64>
where
    I: IntoIterator<Item = &'a [u64]>,
{
    let mut out: Vec<u64> = Vec::new();
    for sizes in per_instance {
        if sizes.len() > out.len() {
            out.resize(sizes.len(), 0);
        }
        for (acc, b) in out.iter_mut().zip(sizes) {
            *acc = acc.saturating_add(*b);
        }
    }
    out
}

/// Number of contiguous groups a greedy left-to-right split needs so that no
/// group exceeds `limit` bytes. Units larger than `limit` get a group each.
pub fn groups_needed(units: &[u64], limit: u64) -> u64 {
    let mut groups = 0_u64;
    let mut current = 0_u64;
    let mut open = false;
    for &bytes in units {
        if open && current.saturating_add(bytes) > limit {
            groups += 1;
            current = 0;
        }
        current = current.saturating_add(bytes);
        open = true;
    }
    if open {
        groups += 1;
    }
    groups
}

/// Smallest achievable maximum group sum when `units` is split into at most
/// `k` contiguous ranges.
///
/// Non-increasing in `k`. Returns `0` for no units and the total for `k == 0`.
pub fn max_range_size(units: &[u64], k: u32) -> u64 {
    let total = units.iter().fold(0_u64, |acc, b| acc.saturating_add(*b));
    let largest = units.iter().copied().max().unwrap_or(0);
    if units.is_empty() || k <= 1 {
        return total;
    }
    if k as usize >= units.len() {
        return largest;
    }
    find_min_legal_value(|limit: u64| groups_needed(units, limit) <= k as u64, largest, total)
        .unwrap_or(total)
}

/// Split `units` into exactly `k` contiguous ranges whose sums are at most
/// [`max_range_size`]`(units, k)`.
///
/// When `k` exceeds the number of units, trailing ranges are empty.
pub fn balanced_ranges(units: &[u64], k: u32) -> Vec<SubpartitionRange> {
    if k == 0 {
        return Vec::new();
    }
    let n = units.len() as u32;
    let limit = max_range_size(units, k);

    let mut ranges = Vec::with_capacity(k as usize);
    let mut start = 0_u32;
    let mut current = 0_u64;
    for (idx, &bytes) in units.iter().enumerate() {
        let idx = idx as u32;
        if idx > start && current.saturating_add(bytes) > limit {
            ranges.push(SubpartitionRange::new(start, idx));
            start = idx;
            current = 0;
        }
        current = current.saturating_add(bytes);
    }
    if n > start {
        ranges.push(SubpartitionRange::new(start, n));
    }

    // Greedy packing may leave instances idle; split the widest ranges by unit count.
    while (ranges.len() as u32) < k {
        let Some((idx, widest)) = ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| r.len() > 1)
            .max_by_key(|(i, r)| (r.len(), std::cmp::Reverse(*i)))
            .map(|(i, r)| (i, *r))
        else {
            break;
        };
        let mid = widest.start + widest.len() / 2;
        ranges[idx] = SubpartitionRange::new(widest.start, mid);
        ranges.insert(idx + 1, SubpartitionRange::new(mid, widest.end));
    }
    while (ranges.len() as u32) < k {
        ranges.push(SubpartitionRange::new(n, n));
    }
    ranges
}

/// Build a stable bytes histogram over partition units.
pub fn build_unit_bytes_histogram(units: &[u64]) -> Vec<PartitionBytesHistogramBucket> {
    const BOUNDS: &[u64] = &[
        64 * 1024,
        256 * 1024,
        1024 * 1024,
        4 * 1024 * 1024,
        16 * 1024 * 1024,
        64 * 1024 * 1024,
        u64::MAX,
    ];
    let mut counts = vec![0_u32; BOUNDS.len()];
    for bytes in units {
        let idx = BOUNDS
            .iter()
            .position(|b| bytes <= b)
            .unwrap_or(BOUNDS.len() - 1);
        counts[idx] = counts[idx].saturating_add(1);
    }
    BOUNDS
        .iter()
        .zip(counts)
        .filter(|(_, c)| *c > 0)
        .map(|(upper, unit_count)| PartitionBytesHistogramBucket {
            upper_bound_bytes: *upper,
            unit_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_sum(units: &[u64], r: SubpartitionRange) -> u64 {
        units[r.start as usize..r.end as usize].iter().sum()
    }

    #[test]
    fn max_range_size_of_even_units() {
        let units = [40, 40, 40, 40];
        assert_eq!(max_range_size(&units, 1), 160);
        assert_eq!(max_range_size(&units, 2), 80);
        assert_eq!(max_range_size(&units, 3), 80);
        assert_eq!(max_range_size(&units, 4), 40);
        assert_eq!(max_range_size(&units, 9), 40);
    }

    #[test]
    fn max_range_size_minimizes_the_largest_group() {
        // Best split into two ranges is [7, 2, 5] | [10, 8] -> 18.
        assert_eq!(max_range_size(&[7, 2, 5, 10, 8], 2), 18);
        assert_eq!(max_range_size(&[7, 2, 5, 10, 8], 3), 14);
    }

    #[test]
    fn max_range_size_is_non_increasing() {
        let units = [3, 9, 1, 1, 12, 4, 4, 7, 0, 2];
        let sizes = (1..=12).map(|k| max_range_size(&units, k)).collect::<Vec<_>>();
        assert!(sizes.windows(2).all(|w| w[0] >= w[1]), "{sizes:?}");
    }

    #[test]
    fn empty_units_have_zero_range_size() {
        assert_eq!(max_range_size(&[], 3), 0);
        assert!(balanced_ranges(&[], 0).is_empty());
    }

    #[test]
    fn balanced_ranges_cover_units_contiguously() {
        let units = [7, 2, 5, 10, 8];
        let ranges = balanced_ranges(&units, 3);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[2].end, 5);
        assert!(ranges.windows(2).all(|w| w[0].end == w[1].start));
        let limit = max_range_size(&units, 3);
        assert!(ranges.iter().all(|r| range_sum(&units, *r) <= limit));
    }

    #[test]
    fn balanced_ranges_split_idle_instances_by_count() {
        // Zero-byte units all pack into one range, but four instances are requested.
        let units = [0, 0, 0, 0];
        let ranges = balanced_ranges(&units, 4);
        assert_eq!(
            ranges,
            vec![
                SubpartitionRange::new(0, 1),
                SubpartitionRange::new(1, 2),
                SubpartitionRange::new(2, 3),
                SubpartitionRange::new(3, 4),
            ]
        );
    }

    #[test]
    fn balanced_ranges_pad_with_empty_ranges() {
        let ranges = balanced_ranges(&[5, 5], 4);
        assert_eq!(ranges.len(), 4);
        assert!(ranges[2].is_empty() && ranges[3].is_empty());
        assert_eq!(ranges[3], SubpartitionRange::new(2, 2));
    }

    #[test]
    fn aggregates_ragged_instances() {
        let a = vec![1_u64, 2, 3];
        let b = vec![10_u64];
        let out = aggregate_unit_bytes([a.as_slice(), b.as_slice()]);
        assert_eq!(out, vec![11, 2, 3]);
    }

    #[test]
    fn histogram_is_stable() {
        let h = build_unit_bytes_histogram(&[1, 2, 70 * 1024, 1 << 40]);
        assert_eq!(h.len(), 3);
        assert_eq!(h[0].unit_count, 2);
        assert_eq!(h[2].upper_bound_bytes, u64::MAX);
    }
}
