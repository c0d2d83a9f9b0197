use crate::constants::NANOS_PER_SEC;
use ringbuffer::{AllocRingBuffer, RingBuffer};

///
/// Smoothed event rate over the last `window_size` inter-event intervals.
///
/// Until the window has been filled once (warmup), the average interval is the plain
/// mean of every sample seen so far. After that (steady state) the average is updated
/// incrementally: the sample being overwritten is subtracted out and the new one is
/// added in, each scaled by `1/window_size`. The incremental form drifts slightly from
/// an exact rescan in floating point, and the logged window rates must keep that drift.
///
/// A zero average interval gives `f64::INFINITY`.
///
pub struct WindowedRateEstimator {
    samples: AllocRingBuffer<i64>,
    window_size: usize,
    pushes: u64,
    steady_state: bool,
    last_average: f64,
}

impl WindowedRateEstimator {
    pub fn new(window_size: usize) -> WindowedRateEstimator {
        assert!(window_size > 0, "window size must be positive");
        WindowedRateEstimator {
            samples: AllocRingBuffer::new(window_size),
            window_size,
            pushes: 0,
            steady_state: false,
            last_average: 0.,
        }
    }

    /// Add one interval (in ns) and return the smoothed rate in events/second.
    pub fn update(&mut self, delta_ns: i64) -> f64 {
        let average = if !self.steady_state {
            self.samples.push(delta_ns);
            let sum = self.samples.iter().map(|&x| x as f64).sum::<f64>();
            let average = sum / (self.samples.len() as f64);
            if self.samples.len() == self.window_size {
                self.steady_state = true;
            }
            average
        } else {
            let evicted = *self
                .samples
                .front()
                .expect("window is full in steady state");
            let n = self.window_size as f64;
            let mut average = self.last_average - (evicted as f64) / n;
            average += (delta_ns as f64) / n;
            self.samples.push(delta_ns);
            average
        };
        self.pushes += 1;
        self.last_average = average;
        NANOS_PER_SEC / average
    }

    pub fn is_steady(&self) -> bool {
        self.steady_state
    }

    /// Slot that the next sample will occupy.
    pub fn current_index(&self) -> usize {
        (self.pushes % self.window_size as u64) as usize
    }

    pub fn average_interval(&self) -> f64 {
        self.last_average
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }
}

impl core::fmt::Debug for WindowedRateEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedRateEstimator")
            .field("window_size", &self.window_size)
            .field("steady_state", &self.steady_state)
            .field("last_average", &self.last_average)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_is_exact_mean() {
        let mut w = WindowedRateEstimator::new(4);
        let deltas = [100, 300, 200];
        for (k, &d) in deltas.iter().enumerate() {
            w.update(d);
            let mean = deltas[..=k].iter().sum::<i64>() as f64 / (k + 1) as f64;
            assert_eq!(w.average_interval(), mean);
            assert!(!w.is_steady());
        }
        assert_eq!(w.current_index(), 3);
    }

    #[test]
    fn becomes_steady_after_window_fills() {
        let mut w = WindowedRateEstimator::new(3);
        w.update(10);
        w.update(10);
        assert!(!w.is_steady());
        w.update(10);
        assert!(w.is_steady());
        assert_eq!(w.current_index(), 0);
        for _ in 0..10 {
            w.update(50);
            assert!(w.is_steady());
        }
    }

    #[test]
    fn steady_state_uses_incremental_update() {
        let mut w = WindowedRateEstimator::new(3);
        w.update(1000);
        w.update(2000);
        w.update(3000);
        assert_eq!(w.average_interval(), 2000.);

        // evicts the 1000 sample
        w.update(4000);
        let expected = 2000. - 1000. / 3. + 4000. / 3.;
        assert_eq!(w.average_interval(), expected);
        assert_eq!(w.current_index(), 1);
    }

    #[test]
    fn constant_delta_converges() {
        let mut w = WindowedRateEstimator::new(5);
        for d in [7, 900, 13, 4000, 1] {
            w.update(d);
        }
        let mut rate = 0.;
        for _ in 0..50 {
            rate = w.update(2500);
        }
        assert!((w.average_interval() - 2500.).abs() < 1e-6);
        assert!((rate - 400_000.).abs() < 1e-3);
    }

    #[test]
    fn first_interval_rate() {
        let mut w = WindowedRateEstimator::new(3);
        assert_eq!(w.update(1000), 1_000_000.);
    }

    #[test]
    fn rates_keep_double_precision() {
        let mut w = WindowedRateEstimator::new(2);
        let rate = w.update(3000);
        assert_eq!(rate, 1e9 / 3000.);
        assert_eq!(format!("{:.6}", rate), "333333.333333");
    }

    #[test]
    fn zero_interval_is_infinite() {
        let mut w = WindowedRateEstimator::new(2);
        assert_eq!(w.update(0), f64::INFINITY);
        assert_eq!(w.update(10), 1e9 / 5.);
    }
}
