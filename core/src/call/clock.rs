// Time source for the negotiation watchdog

use web_time::Instant;

#[cfg_attr(test, mockall::automock)]
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock; `web_time` maps to `performance.now()` in the browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
