/// Bounded-window sequence of f64 samples.
///
/// Tracks the plain average/variance over the last `length` samples and an
/// exponentially decaying average/variance (`davg`/`dvariance`) over the whole
/// history, weighted by `alpha`. The decaying statistics are what the trigger
/// heuristics consume: they are much more stable than the raw windowed values
/// when the sample stream is bursty.
pub struct TruncatedSeq {
    num: usize,
    sum: f64,
    sum_of_squares: f64,

    davg: f64,
    dvariance: f64,
    alpha: f64,

    sequence: Box<[f64]>,
    next: usize,
}

impl TruncatedSeq {
    pub fn new(length: usize, alpha: f64) -> Self {
        Self {
            num: 0,
            sum: 0.0,
            sum_of_squares: 0.0,
            davg: 0.0,
            dvariance: 0.0,
            alpha,
            sequence: vec![0.0; length].into_boxed_slice(),
            next: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.num
    }

    pub fn add(&mut self, val: f64) {
        if self.num == 0 {
            self.davg = val;
            self.dvariance = 0.0;
        } else {
            let diff = val - self.davg;
            let incr = self.alpha * diff;
            self.davg += incr;
            self.dvariance = (1.0 - self.alpha) * (self.dvariance + diff * incr);
        }

        let old_val = self.sequence[self.next];

        self.sum -= old_val;
        self.sum_of_squares -= old_val * old_val;

        self.sum += val;
        self.sum_of_squares += val * val;

        self.sequence[self.next] = val;
        self.next = (self.next + 1) % self.sequence.len();

        if self.num < self.sequence.len() {
            self.num += 1;
        }
    }

    pub fn last(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            let last_index = (self.next + self.sequence.len() - 1) % self.sequence.len();
            self.sequence[last_index]
        }
    }

    pub fn maximum(&self) -> f64 {
        self.sequence[..self.num]
            .iter()
            .copied()
            .fold(0.0, f64::max)
    }

    pub fn avg(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            self.sum / self.num as f64
        }
    }

    pub fn variance(&self) -> f64 {
        if self.num == 0 {
            return 0.0;
        }

        let result = self.sum_of_squares / self.num as f64 - self.avg() * self.avg();

        // Rounding can push a near-zero variance negative.
        if result < 0.0 {
            0.0
        } else {
            result
        }
    }

    pub fn sd(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn davg(&self) -> f64 {
        self.davg
    }

    pub fn dvariance(&self) -> f64 {
        if self.num <= 1 || self.dvariance < 0.0 {
            return 0.0;
        }

        self.dvariance
    }

    pub fn dsd(&self) -> f64 {
        self.dvariance().sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windowed_average_and_sd() {
        let mut seq = TruncatedSeq::new(10, 0.3);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            seq.add(v);
        }

        // Mean 5, population stddev 2 for this classic sequence.
        assert!((seq.avg() - 5.0).abs() < 1e-9);
        assert!((seq.sd() - 2.0).abs() < 1e-9);
        assert_eq!(seq.total(), 8);
        assert_eq!(seq.last(), 9.0);
    }

    #[test]
    fn window_truncates_old_samples() {
        let mut seq = TruncatedSeq::new(3, 0.3);
        for v in [100.0, 1.0, 2.0, 3.0] {
            seq.add(v);
        }

        // The 100.0 sample fell out of the window.
        assert!((seq.avg() - 2.0).abs() < 1e-9);
        assert_eq!(seq.total(), 3);
        assert_eq!(seq.maximum(), 3.0);
    }

    #[test]
    fn decaying_average_tracks_recent_values() {
        let mut seq = TruncatedSeq::new(4, 0.5);
        seq.add(10.0);
        assert_eq!(seq.davg(), 10.0);
        assert_eq!(seq.dvariance(), 0.0);

        seq.add(20.0);
        // davg = 10 + 0.5 * (20 - 10)
        assert!((seq.davg() - 15.0).abs() < 1e-9);
        assert!(seq.dsd() > 0.0);
    }
}
