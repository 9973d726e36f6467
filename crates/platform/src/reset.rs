use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEvent {
    /// Full power-on-style reset: 0xCF9, the 8042 pulse command, or a CPU
    /// triple fault.
    System,
}

/// Shared queue of reset requests. Devices hold a clone and push; the
/// machine drains it between run slices and performs the actual broadcast.
#[derive(Clone, Default)]
pub struct ResetEvents {
    queue: Rc<RefCell<Vec<ResetEvent>>>,
}

impl ResetEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, event: ResetEvent) {
        self.queue.borrow_mut().push(event);
    }

    pub fn take(&self) -> Vec<ResetEvent> {
        std::mem::take(&mut *self.queue.borrow_mut())
    }

    pub fn is_pending(&self) -> bool {
        !self.queue.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_drain_in_order() {
        let events = ResetEvents::new();
        let handle = events.clone();
        handle.request(ResetEvent::System);
        assert!(events.is_pending());
        assert_eq!(events.take(), vec![ResetEvent::System]);
        assert!(!events.is_pending());
    }
}
