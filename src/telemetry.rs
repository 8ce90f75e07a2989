/// Running min/max/average of the device temperature since boot.
///
/// Mutated only by the periodic data task. The first sample seeds both
/// `min` and `max`, so `min <= current <= max` holds from the first record
/// onwards. `average` uses integer division (truncation toward zero).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TelemetryAggregator {
    current: i32,
    min: i32,
    max: i32,
    running_total: i64,
    sample_count: u32,
    average: i32,
    max_changed: bool,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample into the aggregate.
    ///
    /// `max_changed` reflects whether this sample raised the maximum; it is
    /// also cleared by [`clear_max_changed`](Self::clear_max_changed) once the
    /// new maximum has been reported.
    pub fn record(&mut self, sample: i32) {
        self.current = sample;

        let raised = self.sample_count == 0 || sample > self.max;
        if raised {
            self.max = sample;
        }
        if self.sample_count == 0 || sample < self.min {
            self.min = sample;
        }

        self.sample_count = self.sample_count.saturating_add(1);
        self.running_total += i64::from(sample);
        self.average = (self.running_total / i64::from(self.sample_count)) as i32;

        self.max_changed = raised;
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn average(&self) -> i32 {
        self.average
    }

    pub fn running_total(&self) -> i64 {
        self.running_total
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn max_changed(&self) -> bool {
        self.max_changed
    }

    /// Acknowledge that the current maximum has been reported to the twin.
    pub fn clear_max_changed(&mut self) {
        self.max_changed = false;
    }
}
