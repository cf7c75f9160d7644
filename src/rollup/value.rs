/// Aggregated statistics for the samples inside one time slot.
///
/// Values merge associatively, so a coarser slot's rollup is the merge of
/// its child slots' rollups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rollup {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Rollup {
    pub fn new() -> Rollup {
        Rollup {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Folds one raw sample into the rollup.
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Merges another rollup covering a disjoint set of samples.
    pub fn merge(&mut self, other: &Rollup) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for Rollup {
    fn default() -> Rollup {
        Rollup::new()
    }
}
