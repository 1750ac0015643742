//! The proactive-refresh state machine
//!
//! One scheduler exists per tab and holds at most one armed deadline at any
//! time; re-arming replaces the previous deadline rather than adding a
//! second timer. The machine owns the arithmetic and the armed/idle
//! invariant, while the session owns the task that actually sleeps until
//! the deadline, so the machine can be driven entirely by a test clock.

use tessera_clock::{Clock, DurationMillis, System, UnixMillis};

/// The lifecycle of the per-tab refresh timer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// No deadline armed
    Idle,
    /// A deadline is armed
    Armed,
    /// The deadline elapsed and a refresh attempt is in flight
    Firing,
    /// Explicitly cancelled; equivalent to idle but distinguishable in logs
    Cancelled,
}

/// Schedules proactive renewal of the access token
#[derive(Debug)]
pub struct RefreshScheduler<C = System> {
    state: SchedulerState,
    deadline: Option<UnixMillis>,
    lead_time: DurationMillis,
    clock: C,
}

impl RefreshScheduler<System> {
    /// Constructs a scheduler with the given safety margin before expiry
    pub fn new(lead_time: DurationMillis) -> Self {
        Self::with_clock(lead_time, System)
    }
}

impl<C: Clock> RefreshScheduler<C> {
    /// Constructs a scheduler using the provided clock
    pub fn with_clock(lead_time: DurationMillis, clock: C) -> Self {
        Self {
            state: SchedulerState::Idle,
            deadline: None,
            lead_time,
            clock,
        }
    }

    /// The delay before a token expiring at `expires_at` should be renewed
    ///
    /// `max(remaining − lead_time, remaining / 2)`: the margin halves for
    /// tokens shorter than twice the lead time instead of firing
    /// immediately, and an already-expired token yields zero rather than a
    /// deadline in the past.
    pub fn renewal_delay(&self, expires_at: UnixMillis) -> DurationMillis {
        let remaining = expires_at.saturating_since(self.clock.now());
        remaining.saturating_sub(self.lead_time).max(remaining / 2)
    }

    /// Arms the deadline for a token expiring at `expires_at`
    ///
    /// Replaces any previously armed deadline. Returns the computed delay.
    pub fn arm(&mut self, expires_at: UnixMillis) -> DurationMillis {
        let delay = self.renewal_delay(expires_at);
        self.deadline = Some(self.clock.now() + delay);
        self.state = SchedulerState::Armed;
        tracing::debug!(delay_ms = delay.0, "armed refresh deadline");
        delay
    }

    /// Disarms the timer; safe to call in any state, any number of times
    pub fn cancel(&mut self) {
        if self.state != SchedulerState::Cancelled {
            tracing::debug!(state = ?self.state, "cancelling refresh deadline");
        }
        self.deadline = None;
        self.state = SchedulerState::Cancelled;
    }

    /// Begins a firing attempt if an armed deadline has elapsed
    ///
    /// Returns `false` when there is nothing to fire: not armed, or the
    /// deadline was replaced with a later one while the caller slept.
    pub fn begin_fire(&mut self) -> bool {
        match (self.state, self.deadline) {
            (SchedulerState::Armed, Some(deadline)) if self.clock.now() >= deadline => {
                self.state = SchedulerState::Firing;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Completes a firing attempt by arming for the renewed token's expiry
    ///
    /// No-op unless currently firing: a cancel or a fresh arm that raced
    /// the in-flight attempt wins.
    pub fn finish_rearm(&mut self, expires_at: UnixMillis) {
        if self.state == SchedulerState::Firing {
            self.arm(expires_at);
        }
    }

    /// Completes a firing attempt by arming a retry after `delay`
    pub fn finish_retry(&mut self, delay: DurationMillis) {
        if self.state == SchedulerState::Firing {
            self.deadline = Some(self.clock.now() + delay);
            self.state = SchedulerState::Armed;
            tracing::debug!(delay_ms = delay.0, "armed refresh retry");
        }
    }

    /// Completes a firing attempt with nothing further scheduled
    pub fn finish_idle(&mut self) {
        if self.state == SchedulerState::Firing {
            self.state = SchedulerState::Idle;
        }
    }

    /// The armed deadline, if any
    pub fn next_deadline(&self) -> Option<UnixMillis> {
        match self.state {
            SchedulerState::Armed => self.deadline,
            _ => None,
        }
    }

    /// Whether a deadline is currently armed
    pub fn is_armed(&self) -> bool {
        self.state == SchedulerState::Armed
    }

    /// The current state of the machine
    pub fn state(&self) -> SchedulerState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_clock::TestClock;

    const LEAD: DurationMillis = DurationMillis(120_000);

    fn scheduler(now: UnixMillis) -> (RefreshScheduler<TestClock>, TestClock) {
        let clock = TestClock::new(now);
        (RefreshScheduler::with_clock(LEAD, clock.clone()), clock)
    }

    #[test]
    fn long_lived_tokens_renew_lead_time_early() {
        let (scheduler, _) = scheduler(UnixMillis(1_000_000));
        // expires in ten minutes
        let delay = scheduler.renewal_delay(UnixMillis(1_600_000));
        assert_eq!(delay, DurationMillis(480_000));
    }

    #[test]
    fn short_lived_tokens_halve_the_margin() {
        // expires in 90s with a 120s lead: half of remaining, not negative
        let (scheduler, _) = scheduler(UnixMillis(1_000_000));
        let delay = scheduler.renewal_delay(UnixMillis(1_090_000));
        assert_eq!(delay, DurationMillis(45_000));
    }

    #[test]
    fn expired_tokens_yield_a_zero_delay() {
        let (scheduler, _) = scheduler(UnixMillis(1_000_000));
        assert_eq!(
            scheduler.renewal_delay(UnixMillis(900_000)),
            DurationMillis::ZERO
        );
    }

    #[test]
    fn rearming_replaces_the_deadline() {
        let (mut scheduler, _) = scheduler(UnixMillis(0));

        scheduler.arm(UnixMillis(1_000_000));
        let first = scheduler.next_deadline().unwrap();
        scheduler.arm(UnixMillis(2_000_000));
        let second = scheduler.next_deadline().unwrap();

        assert_ne!(first, second);
        assert!(scheduler.is_armed());
        // still exactly one deadline
        assert_eq!(scheduler.next_deadline(), Some(second));
    }

    #[test]
    fn cancel_is_idempotent_and_total() {
        let (mut scheduler, _) = scheduler(UnixMillis(0));
        scheduler.arm(UnixMillis(500_000));

        scheduler.cancel();
        scheduler.cancel();

        assert_eq!(scheduler.state(), SchedulerState::Cancelled);
        assert_eq!(scheduler.next_deadline(), None);
        assert!(!scheduler.begin_fire());
    }

    #[test]
    fn firing_follows_the_armed_deadline() {
        let (mut scheduler, clock) = scheduler(UnixMillis(0));
        scheduler.arm(UnixMillis(600_000));

        // too early
        assert!(!scheduler.begin_fire());

        clock.set(UnixMillis(600_000));
        assert!(scheduler.begin_fire());
        assert_eq!(scheduler.state(), SchedulerState::Firing);

        // a successful renewal re-arms for the new expiry
        clock.advance(DurationMillis(10));
        scheduler.finish_rearm(UnixMillis(1_200_000));
        assert!(scheduler.is_armed());
    }

    #[test]
    fn a_cancel_during_flight_wins_over_the_result() {
        let (mut scheduler, clock) = scheduler(UnixMillis(0));
        scheduler.arm(UnixMillis(100_000));
        clock.set(UnixMillis(100_000));
        assert!(scheduler.begin_fire());

        scheduler.cancel();
        scheduler.finish_rearm(UnixMillis(900_000));

        assert_eq!(scheduler.state(), SchedulerState::Cancelled);
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn retry_arms_a_backoff_deadline() {
        let (mut scheduler, clock) = scheduler(UnixMillis(0));
        scheduler.arm(UnixMillis(50_000));
        clock.set(UnixMillis(50_000));
        assert!(scheduler.begin_fire());

        scheduler.finish_retry(DurationMillis(2_500));

        assert_eq!(scheduler.next_deadline(), Some(UnixMillis(52_500)));
    }
}
