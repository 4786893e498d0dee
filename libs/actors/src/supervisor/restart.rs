//! Restart intensity tracking
//!
//! A sliding window rather than a fixed one: a burst that straddles a
//! window boundary still counts as a burst.

use super::types::RestartIntensity;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct RestartWindow {
    intensity: RestartIntensity,
    restarts: VecDeque<Instant>,
}

impl RestartWindow {
    pub(crate) fn new(intensity: RestartIntensity) -> Self {
        Self {
            intensity,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart at `now`; false once the budget is exceeded
    pub(crate) fn should_restart(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.restarts.push_back(now);
        self.restarts.len() as u32 <= self.intensity.max_restarts
    }

    pub(crate) fn recent(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.restarts.len() as u32
    }

    pub(crate) fn within(&self) -> Duration {
        self.intensity.within
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) >= self.intensity.within {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(max_restarts: u32, within_ms: u64) -> RestartWindow {
        RestartWindow::new(RestartIntensity {
            max_restarts,
            within: Duration::from_millis(within_ms),
        })
    }

    #[test]
    fn test_budget_is_exhausted_by_a_burst() {
        let mut w = window(3, 1000);
        let t0 = Instant::now();
        assert!(w.should_restart(t0));
        assert!(w.should_restart(t0 + Duration::from_millis(10)));
        assert!(w.should_restart(t0 + Duration::from_millis(20)));
        assert!(!w.should_restart(t0 + Duration::from_millis(30)));
    }

    #[test]
    fn test_old_restarts_slide_out() {
        let mut w = window(2, 100);
        let t0 = Instant::now();
        assert!(w.should_restart(t0));
        assert!(w.should_restart(t0 + Duration::from_millis(50)));
        assert!(w.should_restart(t0 + Duration::from_millis(120)));
        assert_eq!(w.recent(t0 + Duration::from_millis(120)), 2);
        assert_eq!(w.recent(t0 + Duration::from_millis(500)), 0);
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let mut w = window(0, 1000);
        assert!(!w.should_restart(Instant::now()));
    }
}
