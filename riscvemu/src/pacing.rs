//! Optional per-step sleep to throttle execution to a target
//! instructions-per-second rate. Purely a presentation nicety for a live
//! renderer; it must never be used to drive the real-time timer, whose
//! own wall-clock sampling lives in [`crate::devices::rt_timer`].

use std::thread;
use std::time::{Duration, Instant};

/// Sleeps at the end of each step so the step rate does not exceed
/// `target_hz`. Disabled (a no-op) when constructed with `None`.
#[derive(Debug)]
pub struct Pacing {
    period: Option<Duration>,
    last_step: Option<Instant>,
}

impl Pacing {
    pub fn new(target_hz: Option<u32>) -> Self {
        Self {
            period: target_hz
                .filter(|hz| *hz > 0)
                .map(|hz| Duration::from_secs_f64(1.0 / hz as f64)),
            last_step: None,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Block until `period` has elapsed since the previous call. The
    /// first call never sleeps.
    pub fn throttle(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        let now = Instant::now();
        if let Some(last) = self.last_step {
            let elapsed = now.duration_since(last);
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
        }
        self.last_step = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_pacing_never_sleeps() {
        let mut pacing = Pacing::disabled();
        let start = Instant::now();
        for _ in 0..1000 {
            pacing.throttle();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn zero_hz_is_treated_as_disabled() {
        let pacing = Pacing::new(Some(0));
        assert!(pacing.period.is_none());
    }
}
