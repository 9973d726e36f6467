use std::cell::RefCell;
use std::rc::Rc;

/// A device's view of one of its MMIO windows. Only the byte accessors are
/// required; wider accesses fall back to byte-at-a-time decomposition, which
/// is what devices with byte-grained register files (VGA planar memory,
/// option ROMs) rely on. Devices with dword registers (APICs) override the
/// wide paths.
pub trait MmioHandler {
    fn mmio_read8(&mut self, addr: u32) -> u8;
    fn mmio_write8(&mut self, addr: u32, value: u8);

    fn mmio_read16(&mut self, addr: u32) -> u16 {
        let lo = self.mmio_read8(addr) as u16;
        let hi = self.mmio_read8(addr.wrapping_add(1)) as u16;
        lo | hi << 8
    }

    fn mmio_write16(&mut self, addr: u32, value: u16) {
        self.mmio_write8(addr, value as u8);
        self.mmio_write8(addr.wrapping_add(1), (value >> 8) as u8);
    }

    fn mmio_read32(&mut self, addr: u32) -> u32 {
        let lo = self.mmio_read16(addr) as u32;
        let hi = self.mmio_read16(addr.wrapping_add(2)) as u32;
        lo | hi << 16
    }

    fn mmio_write32(&mut self, addr: u32, value: u32) {
        self.mmio_write16(addr, value as u16);
        self.mmio_write16(addr.wrapping_add(2), (value >> 16) as u16);
    }
}

struct Window {
    begin: u32,
    end: u32, // exclusive
    handler: Rc<RefCell<dyn MmioHandler>>,
}

/// Ordered list of MMIO windows; dispatch scans linearly and the first
/// match wins. Windows are few (APIC pages, VGA hole, LFB, option ROMs),
/// so a scan beats any cleverer structure.
#[derive(Default)]
pub struct MmioRouter {
    windows: Vec<Window>,
}

impl MmioRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, begin: u32, len: u32, handler: Rc<RefCell<dyn MmioHandler>>) {
        self.windows.push(Window {
            begin,
            end: begin.wrapping_add(len),
            handler,
        });
    }

    /// Moves an existing window without re-registering it. Used by PCI
    /// option-ROM BAR writes.
    pub fn remap(&mut self, old_begin: u32, new_begin: u32) {
        for w in &mut self.windows {
            if w.begin == old_begin {
                let len = w.end.wrapping_sub(w.begin);
                w.begin = new_begin;
                w.end = new_begin.wrapping_add(len);
                return;
            }
        }
        tracing::warn!(
            target: "mmio",
            old = format_args!("{old_begin:#010x}"),
            new = format_args!("{new_begin:#010x}"),
            "remap of unknown MMIO window"
        );
    }

    pub fn covers_read(&self, addr: u32) -> bool {
        self.windows.iter().any(|w| addr >= w.begin && addr < w.end)
    }

    pub fn read(&self, addr: u32, size: u8) -> u32 {
        for w in &self.windows {
            if addr >= w.begin && addr < w.end {
                let mut h = w.handler.borrow_mut();
                return match size {
                    1 => h.mmio_read8(addr) as u32,
                    2 => h.mmio_read16(addr) as u32,
                    _ => h.mmio_read32(addr),
                };
            }
        }
        tracing::debug!(target: "mmio", addr = format_args!("{addr:#010x}"), size, "unhandled MMIO read");
        u32::MAX
    }

    pub fn write(&self, addr: u32, value: u32, size: u8) {
        for w in &self.windows {
            if addr >= w.begin && addr < w.end {
                let mut h = w.handler.borrow_mut();
                match size {
                    1 => h.mmio_write8(addr, value as u8),
                    2 => h.mmio_write16(addr, value as u16),
                    _ => h.mmio_write32(addr, value),
                }
                return;
            }
        }
        tracing::debug!(
            target: "mmio",
            addr = format_args!("{addr:#010x}"),
            value = format_args!("{value:#x}"),
            size,
            "unhandled MMIO write dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bank {
        regs: [u8; 16],
    }

    impl MmioHandler for Bank {
        fn mmio_read8(&mut self, addr: u32) -> u8 {
            self.regs[(addr & 15) as usize]
        }
        fn mmio_write8(&mut self, addr: u32, value: u8) {
            self.regs[(addr & 15) as usize] = value;
        }
    }

    #[test]
    fn first_match_wins_and_remap_moves_windows() {
        let bank = Rc::new(RefCell::new(Bank { regs: [0; 16] }));
        let mut router = MmioRouter::new();
        router.register(0x1000, 16, bank.clone());

        router.write(0x1002, 0xAB, 1);
        assert_eq!(router.read(0x1002, 1), 0xAB);
        // Word synthesis from the byte handler.
        router.write(0x1004, 0x1234, 2);
        assert_eq!(router.read(0x1004, 2), 0x1234);

        router.remap(0x1000, 0x2000);
        assert_eq!(router.read(0x1002, 1), u32::MAX);
        assert_eq!(router.read(0x2002, 1), 0xAB);
    }

    #[test]
    fn unhandled_reads_float_high() {
        let router = MmioRouter::new();
        assert_eq!(router.read(0xDEAD_0000, 4), 0xFFFF_FFFF);
    }
}
