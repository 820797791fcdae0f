use std::sync::Mutex;

use crate::util::{acquire, unix_now};

/// A per-second token bucket of fixed capacity.
///
/// The epoch counter resets lazily on the next `take` after the wall clock
/// rolls over to a new second; there is no timer. The rollover check and the
/// consume decision happen inside one critical section, so concurrent takers
/// never double-spend.
#[derive(Debug)]
pub struct Reservoir {
    capacity: u64,
    state: Mutex<ReservoirState>,
}

#[derive(Debug)]
struct ReservoirState {
    used: u64,
    current_epoch: u64,
}

impl Reservoir {
    /// Creates a reservoir allowing `capacity` takes per second.
    pub fn new(capacity: u64) -> Self {
        Reservoir {
            capacity,
            state: Mutex::new(ReservoirState {
                used: 0,
                current_epoch: 0,
            }),
        }
    }

    /// Consumes one unit if the current second still has spare capacity.
    pub fn take(&self) -> bool {
        self.take_at(unix_now())
    }

    pub(crate) fn take_at(&self, now: u64) -> bool {
        let mut state = acquire(&self.state);
        if state.current_epoch != now {
            state.current_epoch = now;
            state.used = 0;
        }
        if state.used < self.capacity {
            state.used += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced_within_one_epoch() {
        let reservoir = Reservoir::new(5);
        let epoch = 1_600_000_000;
        for _ in 0..5 {
            assert!(reservoir.take_at(epoch));
        }
        assert!(!reservoir.take_at(epoch));
    }

    #[test]
    fn epoch_rollover_resets_usage() {
        let reservoir = Reservoir::new(5);
        let epoch = 1_600_000_000;
        for _ in 0..6 {
            reservoir.take_at(epoch);
        }
        for _ in 0..5 {
            assert!(reservoir.take_at(epoch + 1));
        }
        assert!(!reservoir.take_at(epoch + 1));
    }

    #[test]
    fn zero_capacity_never_grants() {
        let reservoir = Reservoir::new(0);
        assert!(!reservoir.take_at(42));
        assert!(!reservoir.take_at(43));
    }
}
