pub use std::time::Instant;

use std::time::Duration;

/// Measures the delta between consecutive frames.
///
/// Large stalls (window drag, debugger breaks) are clamped so that time driven
/// effects such as exposure adaptation do not jump.
#[derive(Debug, Clone)]
pub struct FrameClock {
    last: Option<Instant>,
    elapsed: f64,
    max_delta: Duration,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            last: None,
            elapsed: 0.0,
            max_delta: Duration::from_millis(250),
        }
    }

    /// Advance the clock to `now` and return the delta in seconds.
    /// The first tick returns zero.
    pub fn tick_at(&mut self, now: Instant) -> f32 {
        let delta = match self.last {
            Some(last) => now.saturating_duration_since(last).min(self.max_delta),
            None => Duration::ZERO,
        };
        self.last = Some(now);
        self.elapsed += delta.as_secs_f64();
        delta.as_secs_f32()
    }

    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_is_zero() {
        let mut clock = FrameClock::new();
        assert_eq!(clock.tick_at(Instant::now()), 0.0);
    }

    #[test]
    fn delta_is_clamped() {
        let mut clock = FrameClock::new();
        let start = Instant::now();
        clock.tick_at(start);
        let dt = clock.tick_at(start + Duration::from_secs(5));
        assert!((dt - 0.25).abs() < 1e-6);
        assert!((clock.elapsed() - 0.25).abs() < 1e-6);
    }
}
