use std::time::Duration;

/// Per-doctor consultation length, as an exponential moving average of
/// completed consultations. Falls back to a fixed default until the first
/// consultation completes.
#[derive(Debug, Clone)]
pub struct WaitEstimator {
    average_secs: Option<f64>,
    smoothing: f64,
    default: Duration,
    samples: u64,
}

impl WaitEstimator {
    pub fn new(default: Duration, smoothing: f64) -> Self {
        Self {
            average_secs: None,
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            default,
            samples: 0,
        }
    }

    pub fn record(&mut self, duration: Duration) {
        let sample = duration.as_secs_f64();
        self.average_secs = Some(match self.average_secs {
            None => sample,
            Some(previous) => self.smoothing * sample + (1.0 - self.smoothing) * previous,
        });
        self.samples += 1;
    }

    pub fn average(&self) -> Duration {
        match self.average_secs {
            Some(secs) => Duration::from_secs_f64(secs.max(0.0)),
            None => self.default,
        }
    }

    pub fn estimate(&self, position: u32) -> Duration {
        self.average() * position
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}
