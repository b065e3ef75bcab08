//! Exponential retry delays.

use rand::Rng;
use std::time::Duration;

/// `delay(n) = min(cap, base * 2^(n-1) + jitter)`, with jitter drawn from
/// `[0, base * 2^(n-1) / 2)`. The jitter window never reaches the next step,
/// so delays never decrease as attempts grow.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
  base: Duration,
  cap: Duration,
  jitter: bool,
}

impl Backoff {
  pub fn new(base: Duration, cap: Duration) -> Self {
    Self {
      base,
      cap,
      jitter: true,
    }
  }

  /// Deterministic delays, for tests and tooling.
  pub fn without_jitter(base: Duration, cap: Duration) -> Self {
    Self {
      base,
      cap,
      jitter: false,
    }
  }

  pub fn cap(&self) -> Duration {
    self.cap
  }

  /// Delay before retry number `attempt` (1 for the first retry).
  pub fn delay(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let raw = self
      .base
      .checked_mul(1u32 << exponent)
      .unwrap_or(Duration::MAX);
    if raw >= self.cap {
      return self.cap;
    }

    let jitter = if self.jitter {
      let window = raw.as_millis() as u64 / 2;
      if window > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..window))
      } else {
        Duration::ZERO
      }
    } else {
      Duration::ZERO
    };

    (raw + jitter).min(self.cap)
  }
}
