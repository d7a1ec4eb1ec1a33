use rand::Rng;
use std::time::Duration;

/// Reconnect backoff policy.
///
/// The base delay for attempt `n` is `first × factor^n`, clamped to
/// [`ReconnectBackoff::cap`]. A symmetric jitter of `± jitter × base` is
/// then applied so that many clients reconnecting at once do not hammer
/// the broker in lockstep. The base is derived purely from the attempt
/// number, so jitter output never feeds back into later delays.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    /// Delay before the first reconnect attempt.
    pub first: Duration,
    /// Maximum delay cap.
    pub cap: Duration,
    /// Multiplicative growth factor (`>= 1.0`).
    pub factor: f64,
    /// Jitter fraction in `[0.0, 1.0]`; `0.2` means ±20%.
    pub jitter: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectBackoff {
    /// Base delay for the given attempt (0-indexed), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let cap_secs = self.cap.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > cap_secs {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay for the given attempt (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter.clamp(0.0, 1.0);
        if spread <= 0.0 {
            return base;
        }
        let mut rng = rand::rng();
        let offset = rng.random_range(-spread..=spread);
        let jittered = (base.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(jittered).min(self.cap)
    }
}
