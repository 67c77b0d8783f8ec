// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! An ordered set of disjoint, non-adjacent `[low, low + count)` ranges
//!
//! Backs both the per-stream SACK bookkeeping and the received packet number
//! tracking, where only the bounds of runs of consecutive values are worth
//! storing.

use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub low: u64,
    pub count: u64,
}

impl Range {
    /// The first value past the range
    #[inline]
    pub fn high(&self) -> u64 {
        self.low + self.count
    }

    #[inline]
    pub fn contains(&self, value: u64) -> bool {
        (self.low..self.high()).contains(&value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitExceeded;

#[derive(Clone, Debug, Default)]
pub struct RangeSet {
    ranges: VecDeque<Range>,
    limit: Option<usize>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set that rejects insertions which would create more than
    /// `limit` disjoint ranges
    pub fn with_limit(limit: usize) -> Self {
        Self {
            ranges: VecDeque::new(),
            limit: Some(limit),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<Range> {
        self.ranges.get(index).copied()
    }

    #[inline]
    pub fn first(&self) -> Option<Range> {
        self.ranges.front().copied()
    }

    #[inline]
    pub fn last(&self) -> Option<Range> {
        self.ranges.back().copied()
    }

    #[inline]
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range> + '_ {
        self.ranges.iter().copied()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.ranges.clear()
    }

    /// Inserts `[low, low + count)`, merging overlapping and adjacent ranges.
    ///
    /// Returns the resulting containing range and whether the set's coverage
    /// changed (false means every value was already present).
    pub fn add(&mut self, low: u64, count: u64) -> Result<(Range, bool), LimitExceeded> {
        debug_assert!(count > 0);
        let high = low + count;

        // The first existing range that ends at or after `low`; anything
        // before it is unaffected. Adjacency counts, hence `>=`.
        let start = self.ranges.partition_point(|r| r.high() < low);

        // The first existing range that starts strictly after `high`;
        // everything in `start..end` merges into the new range.
        let end = self.ranges.partition_point(|r| r.low <= high);

        if start == end {
            // No overlap and no adjacency: a brand new range
            if let Some(limit) = self.limit {
                ensure!(self.ranges.len() < limit, Err(LimitExceeded));
            }
            let range = Range { low, count };
            self.ranges.insert(start, range);
            return Ok((range, true));
        }

        let merged_low = low.min(self.ranges[start].low);
        let merged_high = high.max(self.ranges[end - 1].high());
        let mut covered = 0u64;
        for index in start..end {
            covered += self.ranges[index].count;
        }

        let merged = Range {
            low: merged_low,
            count: merged_high - merged_low,
        };

        // `updated` is false only when a single existing range already
        // covered the whole insertion
        let updated = merged.count != covered;

        self.ranges.drain(start + 1..end);
        self.ranges[start] = merged;

        Ok((merged, updated))
    }

    /// Removes every value below `min`, trimming a range that straddles it
    pub fn set_min(&mut self, min: u64) {
        while let Some(front) = self.ranges.front_mut() {
            if front.high() <= min {
                self.ranges.pop_front();
            } else if front.low < min {
                front.count = front.high() - min;
                front.low = min;
                break;
            } else {
                break;
            }
        }
    }

    /// Removes the range at `index`
    pub fn remove(&mut self, index: usize) -> Option<Range> {
        self.ranges.remove(index)
    }

    /// The lowest value not covered starting from `from` (i.e. `from` itself
    /// unless a range contains it)
    pub fn next_uncovered(&self, from: u64) -> u64 {
        for range in &self.ranges {
            if range.contains(from) {
                return range.high();
            }
            if range.low > from {
                break;
            }
        }
        from
    }
}
