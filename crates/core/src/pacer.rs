//! Wall-clock pacing to PTS, with late-frame drop classification and
//! resync on regression (spec.md §4.10).
//!
//! The `tokio::time::sleep`-to-a-deadline shape follows the bitrate control
//! loop's `tokio::time::sleep(Duration::from_secs(1))` idiom, generalized
//! from a fixed interval to a PTS-computed deadline.

use std::time::{Duration, Instant};

pub struct Pacer {
    base: Option<(Instant, i64)>,
    max_wait: Duration,
}

impl Pacer {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            base: None,
            max_wait,
        }
    }

    /// Resync the pacer so `pts_ms` is now anchored to the current wall
    /// clock. Called on first frame, on PTS regression, and after any
    /// queue eviction (spec.md §4.11: "any eviction MUST trigger a pacer
    /// resync").
    pub fn resync(&mut self, pts_ms: i64) {
        self.base = Some((Instant::now(), pts_ms));
    }

    fn expected_instant(&mut self, pts_ms: i64) -> Instant {
        match self.base {
            None => {
                self.resync(pts_ms);
                Instant::now()
            }
            Some((base_wall, base_pts)) => {
                if pts_ms < base_pts {
                    self.resync(pts_ms);
                    return Instant::now();
                }
                let delta = Duration::from_millis((pts_ms - base_pts).max(0) as u64);
                base_wall + delta
            }
        }
    }

    /// Sleep until `pts_ms`'s wall-clock deadline, clamped by `max_wait`.
    pub async fn wait(&mut self, pts_ms: i64) {
        let expected = self.expected_instant(pts_ms);
        let now = Instant::now();
        if expected <= now {
            return;
        }
        let delay = (expected - now).min(self.max_wait);
        tokio::time::sleep(delay).await;
    }

    /// Decide whether a frame arriving "now" for `pts_ms` should be
    /// dropped. `threshold == 0` disables dropping. Lateness beyond
    /// `max_wait` escalates to a resync and the frame is admitted rather
    /// than dropped (spec.md §4.10).
    pub fn should_drop(&mut self, pts_ms: i64, threshold: Duration) -> bool {
        if threshold.is_zero() {
            return false;
        }
        let expected = self.expected_instant(pts_ms);
        let now = Instant::now();
        if now <= expected {
            return false;
        }
        let lateness = now - expected;
        if lateness > self.max_wait {
            self.resync(pts_ms);
            return false;
        }
        lateness > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_establishes_base_without_drop() {
        let mut p = Pacer::new(Duration::from_secs(1));
        assert!(!p.should_drop(0, Duration::from_millis(50)));
    }

    #[test]
    fn pts_regression_triggers_resync_not_drop() {
        let mut p = Pacer::new(Duration::from_secs(1));
        p.resync(1000);
        assert!(!p.should_drop(500, Duration::from_millis(10)));
        // After resync to 500, base_pts is 500 so a frame at 500 is exactly on time.
        assert!(!p.should_drop(500, Duration::from_millis(10)));
    }

    #[test]
    fn threshold_zero_never_drops() {
        let mut p = Pacer::new(Duration::from_millis(10));
        p.resync(0);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!p.should_drop(0, Duration::ZERO));
    }

    #[test]
    fn severe_lateness_escalates_to_resync_and_admits() {
        let mut p = Pacer::new(Duration::from_millis(20));
        p.resync(0);
        std::thread::sleep(Duration::from_millis(60));
        // lateness (~60ms) > max_wait (20ms) -> resync, frame admitted.
        assert!(!p.should_drop(0, Duration::from_millis(5)));
        assert!(!p.should_drop(0, Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_not_ahead_of_schedule() {
        let mut p = Pacer::new(Duration::from_secs(1));
        p.resync(0);
        let start = Instant::now();
        p.wait(0).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
