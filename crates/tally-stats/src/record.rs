//! Per-variable statistics record.

/// Where a record is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Status {
    /// Seeded locally, not reduced yet. Derived fields are not valid.
    #[default]
    Local,
    /// Reduced across the group; derived fields are valid.
    Reduced,
    /// Reduced, but the group contributed no samples. Derived fields are NaN.
    Empty,
}

/// Accumulated samples of one tracked variable, plus the statistics derived
/// from them after a global reduction.
///
/// Seed the accumulators on every participant, then call
/// [`compute`](crate::compute). Afterwards the accumulators hold the global
/// totals and the derived fields are filled in identically everywhere.
#[derive(Clone, Debug, PartialEq)]
pub struct StatRecord {
    /// Number of samples.
    pub count: u64,
    pub sum_values: f64,
    pub sum_squares: f64,
    /// Smallest sample; `+inf` when there are none.
    pub min: f64,
    /// Largest sample; `-inf` when there are none.
    pub max: f64,
    /// Rank that reported `min` (lowest such rank on ties).
    pub min_at_rank: usize,
    /// Rank that reported `max` (lowest such rank on ties).
    pub max_at_rank: usize,
    pub average: f64,
    pub variance: f64,
    pub standard_deviation: f64,
    pub variance_of_mean: f64,
    pub standard_deviation_of_mean: f64,
    /// Display name for reports. Never transmitted.
    pub label: Option<String>,
    pub status: Status,
}

impl StatRecord {
    /// An empty record: no samples.
    pub fn new() -> Self {
        Self {
            count: 0,
            sum_values: 0.0,
            sum_squares: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            min_at_rank: 0,
            max_at_rank: 0,
            average: f64::NAN,
            variance: f64::NAN,
            standard_deviation: f64::NAN,
            variance_of_mean: f64::NAN,
            standard_deviation_of_mean: f64::NAN,
            label: None,
            status: Status::Local,
        }
    }

    /// A record holding the single sample `value`.
    pub fn from_value(value: f64) -> Self {
        let mut record = Self::new();
        record.set1(value);
        record
    }

    /// A record from accumulators gathered elsewhere.
    pub fn from_accumulated(count: u64, sum_values: f64, sum_squares: f64, min: f64, max: f64) -> Self {
        Self {
            count,
            sum_values,
            sum_squares,
            min,
            max,
            ..Self::new()
        }
    }

    /// Attach a display name.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Reset the accumulators to the single sample `value`. The label is kept.
    pub fn set1(&mut self, value: f64) {
        self.count = 1;
        self.sum_values = value;
        self.sum_squares = value * value;
        self.min = value;
        self.max = value;
        self.status = Status::Local;
    }

    /// Add one local sample.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum_values += value;
        self.sum_squares += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.status = Status::Local;
    }

    /// Whether the record holds at least one sample.
    pub fn has_data(&self) -> bool {
        self.count > 0
    }

    /// Recompute the derived fields from the accumulators.
    ///
    /// A pure function of the accumulators, so calling it twice changes
    /// nothing. With no samples every derived field becomes NaN and the
    /// status becomes [`Status::Empty`].
    pub fn derive(&mut self) {
        if self.count == 0 {
            self.average = f64::NAN;
            self.variance = f64::NAN;
            self.standard_deviation = f64::NAN;
            self.variance_of_mean = f64::NAN;
            self.standard_deviation_of_mean = f64::NAN;
            self.status = Status::Empty;
            return;
        }

        let n = self.count as f64;
        let (average, variance) = if self.min == self.max {
            // Every sample is the same value; the rounded sums would drift.
            (self.min, 0.0)
        } else {
            let average = self.sum_values / n;
            // Cancellation can push this slightly below zero.
            (average, (self.sum_squares / n - average * average).max(0.0))
        };
        self.average = average;
        self.variance = variance;
        self.standard_deviation = variance.sqrt();
        self.variance_of_mean = variance / n;
        self.standard_deviation_of_mean = self.variance_of_mean.sqrt();
        self.status = Status::Reduced;
    }

    /// Standard deviation as a percentage of `|average|`, when defined.
    pub fn relative_deviation(&self) -> Option<f64> {
        if self.status != Status::Reduced || self.average == 0.0 {
            return None;
        }
        Some(100.0 * self.standard_deviation / self.average.abs())
    }
}

impl Default for StatRecord {
    fn default() -> Self {
        Self::new()
    }
}
