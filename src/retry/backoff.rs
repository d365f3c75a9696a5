use std::time::Duration;

/// Wait-time strategy between retry attempts.
///
/// All variants are pure functions of the 1-based attempt index, so a given
/// configuration always produces the same schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitStrategy {
    /// Always wait the same duration.
    Constant(Duration),
    /// `min + (attempt - 1) * step`, clamped to `[min, max]`.
    Linear {
        min: Duration,
        step: Duration,
        max: Duration,
    },
    /// `min * factor^(attempt - 1)`, capped at `max`.
    Exponential {
        min: Duration,
        factor: f64,
        max: Duration,
    },
}

impl WaitStrategy {
    /// Wait before the retry following the given attempt (1-based).
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        match *self {
            WaitStrategy::Constant(wait) => wait,
            WaitStrategy::Linear { min, step, max } => {
                let wait = min + step.saturating_mul(n - 1);
                wait.clamp(min, max)
            }
            WaitStrategy::Exponential { min, factor, max } => {
                let millis = min.as_secs_f64() * 1000.0 * factor.powi(n as i32 - 1);
                let wait = Duration::from_millis(millis as u64);
                wait.min(max)
            }
        }
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Constant(Duration::ZERO)
    }
}

// A literal duration resolves to a constant schedule.
impl From<Duration> for WaitStrategy {
    fn from(wait: Duration) -> Self {
        WaitStrategy::Constant(wait)
    }
}
