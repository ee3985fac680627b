//! Flat wire record and the merge operator the reduction runs.

use crate::record::StatRecord;

/// Number of reals in a [`StatTuple`].
pub const WIDTH: usize = 7;

/// One record as it travels through the reduction: seven reals in a fixed
/// order. Counts and ranks are carried as reals (exact below 2^53).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StatTuple {
    pub count: f64,
    pub sum_values: f64,
    pub sum_squares: f64,
    pub min: f64,
    pub max: f64,
    pub min_rank: f64,
    pub max_rank: f64,
}

impl StatTuple {
    /// Flatten a local record contributed by `rank`.
    pub fn from_record(record: &StatRecord, rank: usize) -> Self {
        Self {
            count: record.count as f64,
            sum_values: record.sum_values,
            sum_squares: record.sum_squares,
            min: record.min,
            max: record.max,
            min_rank: rank as f64,
            max_rank: rank as f64,
        }
    }

    /// Combine two partial results.
    ///
    /// Sums add. The smaller minimum and the larger maximum win; on an exact
    /// tie the lower rank is kept, value included, so `-0.0` against `0.0`
    /// does not depend on operand order. Associative and commutative, so any
    /// reduction tree gives the same answer.
    pub fn merge(self, other: Self) -> Self {
        let (min, min_rank) = if other.min < self.min {
            (other.min, other.min_rank)
        } else if other.min == self.min && other.min_rank < self.min_rank {
            (other.min, other.min_rank)
        } else {
            (self.min, self.min_rank)
        };
        let (max, max_rank) = if other.max > self.max {
            (other.max, other.max_rank)
        } else if other.max == self.max && other.max_rank < self.max_rank {
            (other.max, other.max_rank)
        } else {
            (self.max, self.max_rank)
        };
        Self {
            count: self.count + other.count,
            sum_values: self.sum_values + other.sum_values,
            sum_squares: self.sum_squares + other.sum_squares,
            min,
            max,
            min_rank,
            max_rank,
        }
    }

    /// Merge a buffer of tuples into another, element by element.
    ///
    /// This is the custom reduction operator registered with the group; both
    /// slices hold a whole number of tuples.
    pub fn merge_slices(input: &[f64], inout: &mut [f64]) {
        let input: &[StatTuple] = bytemuck::cast_slice(input);
        let inout: &mut [StatTuple] = bytemuck::cast_slice_mut(inout);
        for (acc, x) in inout.iter_mut().zip(input) {
            *acc = acc.merge(*x);
        }
    }

    /// Write the reduced accumulators back into `record` and derive.
    pub fn apply_to(&self, record: &mut StatRecord) {
        record.count = self.count as u64;
        record.sum_values = self.sum_values;
        record.sum_squares = self.sum_squares;
        record.min = self.min;
        record.max = self.max;
        record.min_at_rank = self.min_rank as usize;
        record.max_at_rank = self.max_rank as usize;
        record.derive();
    }
}
