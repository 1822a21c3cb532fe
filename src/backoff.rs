//! Reconnect pacing shared by the serial link, the payment client and the
//! MQTT loop.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The standard pacing for an external peer: 5 s doubling to a 60 s cap.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }

    /// Delay to sleep before the next attempt; doubles for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Call after a successful attempt so the next failure starts small.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
