/// Reconnect backoff: exponential growth with jitter.
///
/// The base delay doubles per failed attempt up to a cap. The actual
/// sleep is the base plus up to 25% random jitter so a fleet of bots
/// kicked off by the same server outage does not reconnect in lockstep.
/// `reset()` is called once a connection has proven stable.
use std::time::Duration;

use rand::Rng;

pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    /// Consecutive failed attempts since the last reset.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    /// The base delay for this attempt, before jitter. Advances the state:
    /// the next call returns double, capped at the maximum.
    pub fn next_base(&mut self) -> Duration {
        let delay = self.current;
        self.attempt += 1;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// The delay to actually sleep: base plus up to 25% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_base();
        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Back to the initial delay, attempt count cleared.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}
