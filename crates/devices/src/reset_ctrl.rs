use corten_platform::{PortIoDevice, ResetEvent, ResetEvents};

pub const RESET_CTRL_PORT: u16 = 0xCF9;
/// Value guests write for a full reset (RCPU | SRST).
pub const RESET_CTRL_RESET_VALUE: u8 = 0x06;

/// PIIX reset-control register at 0xCF9. Bit 2 set together with bit 1
/// requests a hard reset; everything else is latched and readable.
pub struct ResetCtrl {
    events: ResetEvents,
    latch: u8,
}

impl ResetCtrl {
    pub fn new(events: ResetEvents) -> Self {
        Self { events, latch: 0 }
    }
}

impl PortIoDevice for ResetCtrl {
    fn port_read(&mut self, _port: u16, _size: u8) -> u32 {
        self.latch as u32
    }

    fn port_write(&mut self, _port: u16, value: u32, _size: u8) {
        let value = value as u8;
        if value & 0x04 != 0 && value & 0x02 != 0 {
            self.events.request(ResetEvent::System);
        }
        self.latch = value & !0x04; // the reset pulse itself does not latch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_value_queues_a_system_reset() {
        let events = ResetEvents::new();
        let mut dev = ResetCtrl::new(events.clone());
        dev.port_write(RESET_CTRL_PORT, RESET_CTRL_RESET_VALUE as u32, 1);
        assert_eq!(events.take(), vec![ResetEvent::System]);
    }

    #[test]
    fn plain_writes_only_latch() {
        let events = ResetEvents::new();
        let mut dev = ResetCtrl::new(events.clone());
        dev.port_write(RESET_CTRL_PORT, 0x02, 1);
        assert!(events.take().is_empty());
        assert_eq!(dev.port_read(RESET_CTRL_PORT, 1), 0x02);
    }
}
