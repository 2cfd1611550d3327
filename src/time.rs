use core::fmt::Debug;
use core::time::Duration;

/// Generic abstraction for a countdown timer.
///
/// The handlers never read the wall clock. Instead, the current time is passed into every
/// [state machine call][crate::source::SourceHandler::state_machine] by the user as a monotonic
/// [Duration] timestamp, for example the elapsed time since application start. The same `now`
/// value is forwarded to the timer queries, which allows driving the timers with a virtual
/// clock in test environments.
pub trait Countdown: Debug {
    fn has_expired(&self, now: Duration) -> bool;
    fn reset(&mut self, now: Duration);
}

/// Default [Countdown] implementation which expires once the provided `now` timestamp has
/// progressed more than the expiry period past the arming time.
#[derive(Debug)]
pub struct MonotonicCountdown {
    expiry_period: Duration,
    armed_at: Duration,
}

impl MonotonicCountdown {
    pub fn new(expiry_period: Duration, now: Duration) -> Self {
        Self {
            expiry_period,
            armed_at: now,
        }
    }

    pub fn expiry_period(&self) -> Duration {
        self.expiry_period
    }
}

impl Countdown for MonotonicCountdown {
    fn has_expired(&self, now: Duration) -> bool {
        now.saturating_sub(self.armed_at) > self.expiry_period
    }

    fn reset(&mut self, now: Duration) {
        self.armed_at = now;
    }
}
