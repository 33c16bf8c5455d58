use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Detects wall-clock steps by comparing wall-clock deltas against the
/// monotonic clock between ticks. Fire decisions use the monotonic-derived
/// tick loop; absolute fire instants are translated once at schedule time, so
/// a step only matters insofar as it skews jitter accounting and imminent
/// wake-ups. On detection the kernel pauses arming briefly to let NTP
/// reconverge.
pub struct TimeJumpDetector {
    threshold_ms: i64,
    last_wall: DateTime<Utc>,
    last_mono: Instant,
}

impl TimeJumpDetector {
    pub fn new(threshold_ms: i64) -> Self {
        Self {
            threshold_ms: threshold_ms.max(1),
            last_wall: Utc::now(),
            last_mono: Instant::now(),
        }
    }

    /// Returns the anomaly in milliseconds when the wall clock moved more
    /// than `threshold_ms` away from what the monotonic clock observed.
    pub fn observe(&mut self) -> Option<i64> {
        let wall = Utc::now();
        let mono = Instant::now();
        let wall_delta = (wall - self.last_wall).num_milliseconds();
        let mono_delta = mono.duration_since(self.last_mono).as_millis() as i64;
        self.last_wall = wall;
        self.last_mono = mono;

        let anomaly = wall_delta - mono_delta;
        if anomaly.abs() > self.threshold_ms {
            Some(anomaly)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn steady_clock_reports_no_anomaly() {
        let mut detector = TimeJumpDetector::new(1_000);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(detector.observe(), None);
    }

    #[test]
    fn forged_step_is_detected() {
        let mut detector = TimeJumpDetector::new(500);
        // Simulate a 2s backwards wall step since the last observation.
        detector.last_wall = Utc::now() + chrono::Duration::seconds(2);
        let anomaly = detector.observe().expect("anomaly");
        assert!(anomaly < -500);
    }
}
