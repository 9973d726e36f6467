use std::cell::Cell;
use std::rc::Rc;

/// Manual platform timebase in nanoseconds. The machine advances it as the
/// CPU retires cycles; every timed device reads the same handle, so device
/// time never drifts from guest time and snapshots stay deterministic.
#[derive(Clone, Default)]
pub struct Clock {
    now_ns: Rc<Cell<u64>>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ns.get()
    }

    pub fn advance_ns(&self, delta: u64) {
        self.now_ns.set(self.now_ns.get() + delta);
    }

    pub fn set_ns(&self, now: u64) {
        self.now_ns.set(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_share_the_timebase() {
        let clock = Clock::new();
        let other = clock.clone();
        clock.advance_ns(123);
        assert_eq!(other.now_ns(), 123);
    }
}
