//! A jittered trigger fires roughly once every `period` events.  The
//! authority uses it to schedule housekeeping, i.e., sweeping
//! abandoned staged files.
//!
//! The countdown is resampled uniformly in `[1, period]` after each
//! firing, so the gap between two firings never exceeds `period`
//! events, and averages about half that.
use rand::Rng;

#[derive(Clone, Copy, Debug)]
pub(crate) struct PeriodicTrigger {
    period: u64,
    // Events left before the next firing; never 0 once initialised.
    countdown: u64,
}

impl PeriodicTrigger {
    /// Returns a trigger that fires at least once every `period`
    /// events.  A period of 0 means every event.
    pub fn new(period: u64) -> PeriodicTrigger {
        let mut ret = PeriodicTrigger {
            period: period.max(1),
            countdown: 0,
        };

        ret.regenerate();
        ret
    }

    fn regenerate(&mut self) {
        self.countdown = rand::thread_rng().gen_range(1..=self.period);
    }

    /// Observes one event.  Returns whether the periodic behaviour
    /// should run now.
    pub fn event(&mut self) -> bool {
        self.countdown -= 1;
        if self.countdown > 0 {
            return false;
        }

        self.regenerate();
        true
    }
}

#[test]
fn smoke_test() {
    let mut trigger = PeriodicTrigger::new(10);

    // We should never go 10 events without firing.
    for _ in 0..100 {
        assert!((0..10).any(|_| trigger.event()))
    }
}

#[test]
fn test_delay_until_trigger() {
    let mut trigger = PeriodicTrigger::new(10);

    let mut max_delay = 0;
    for _ in 0..200 {
        let mut delay = 1;
        while !trigger.event() {
            delay += 1;
        }

        assert!(delay <= 10);
        max_delay = max_delay.max(delay);
    }

    // Each gap is 9 or 10 with probability 20%; after 200 gaps, we
    // should have seen one with overwhelming probability.
    assert!(max_delay >= 9);
}

#[test]
fn test_zero_period() {
    let mut trigger = PeriodicTrigger::new(0);

    for _ in 0..10 {
        assert!(trigger.event());
    }
}

#[test]
fn test_large_period() {
    let mut trigger = PeriodicTrigger::new(u64::MAX);

    // It should virtually never fire.
    for _ in 0..1000 {
        assert!(!trigger.event());
    }
}
