//! The CPU's view of the machine: linear accesses through the TLB and
//! page walker, physical routing between RAM and the MMIO windows, port
//! I/O, and SMC bookkeeping.

use std::cell::RefCell;
use std::rc::Rc;

use corten_cpu_core::exception::Exception;
use corten_cpu_core::exec::InterruptController;
use corten_cpu_core::mem::CpuBus;
use corten_cpu_core::state::CpuState;
use corten_mmu::walk::{PageTableOps, PagingControl};
use corten_mmu::{translate, AccessMode, Tlb};
use corten_platform::PlatformInterrupts;

use crate::platform::PcPlatform;

const VGA_HOLE_BEGIN: u32 = 0xA_0000;
const VGA_HOLE_END: u32 = 0xC_0000;
const LOW_MEM_TOP: u32 = 0x10_0000;

/// Physical read routing. Reads in C0000..FFFFF hit RAM directly (shadow
/// reads always pass through); only the VGA hole and everything above
/// top-of-RAM are MMIO.
fn phys_read8(p: &mut PcPlatform, addr: u32) -> u8 {
    let in_hole = (VGA_HOLE_BEGIN..VGA_HOLE_END).contains(&addr);
    if !in_hole && p.ram.borrow().contains(addr) {
        return p.ram.borrow().read(addr);
    }
    p.mmio.read(addr, 1) as u8
}

/// Physical write routing. Writes in A0000..FFFFF all route as MMIO so
/// the VGA planar logic and the PAM shadow filter see them.
fn phys_write8(p: &mut PcPlatform, addr: u32, value: u8) {
    let routed = (VGA_HOLE_BEGIN..LOW_MEM_TOP).contains(&addr);
    if !routed && p.ram.borrow().contains(addr) {
        p.ram.borrow_mut().write(addr, value);
        return;
    }
    p.mmio.write(addr, value as u32, 1);
}

fn phys_read32(p: &mut PcPlatform, addr: u32) -> u32 {
    let in_hole = (VGA_HOLE_BEGIN..VGA_HOLE_END).contains(&addr);
    let in_ram = addr
        .checked_add(3)
        .is_some_and(|end| p.ram.borrow().contains(end));
    if !in_hole && addr & 3 == 0 && in_ram {
        let ram = p.ram.borrow();
        return u32::from_le_bytes([
            ram.read(addr),
            ram.read(addr + 1),
            ram.read(addr + 2),
            ram.read(addr + 3),
        ]);
    }
    if in_hole || !p.ram.borrow().contains(addr) {
        return p.mmio.read(addr, 4);
    }
    let mut v = 0;
    for i in 0..4 {
        v |= (phys_read8(p, addr.wrapping_add(i)) as u32) << (i * 8);
    }
    v
}

fn phys_write32(p: &mut PcPlatform, addr: u32, value: u32) {
    let routed = (VGA_HOLE_BEGIN..LOW_MEM_TOP).contains(&addr);
    let in_ram = addr
        .checked_add(3)
        .is_some_and(|end| p.ram.borrow().contains(end));
    if !routed && addr & 3 == 0 && in_ram {
        let mut ram = p.ram.borrow_mut();
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            ram.write(addr + i as u32, *b);
        }
        return;
    }
    if routed && !(VGA_HOLE_BEGIN..VGA_HOLE_END).contains(&addr) {
        // Shadow region: byte path applies PAM per byte.
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            phys_write8(p, addr.wrapping_add(i as u32), *b);
        }
        return;
    }
    if routed || !p.ram.borrow().contains(addr) {
        p.mmio.write(addr, value, 4);
        return;
    }
    for (i, b) in value.to_le_bytes().iter().enumerate() {
        phys_write8(p, addr.wrapping_add(i as u32), *b);
    }
}

struct PtOps<'a> {
    platform: &'a mut PcPlatform,
    a20_mask: u32,
}

impl PageTableOps for PtOps<'_> {
    fn pt_read_u32(&mut self, paddr: u32) -> u32 {
        phys_read32(self.platform, paddr & self.a20_mask)
    }
    fn pt_write_u32(&mut self, paddr: u32, value: u32) {
        phys_write32(self.platform, paddr & self.a20_mask, value);
    }
    fn pt_read_u64(&mut self, paddr: u32) -> u64 {
        self.pt_read_u32(paddr) as u64 | (self.pt_read_u32(paddr.wrapping_add(4)) as u64) << 32
    }
    fn pt_write_u64(&mut self, paddr: u32, value: u64) {
        self.pt_write_u32(paddr, value as u32);
        self.pt_write_u32(paddr.wrapping_add(4), (value >> 32) as u32);
    }
}

pub struct PcCpuBus {
    pub platform: PcPlatform,
    tlb: Tlb,
    paging: PagingControl,
}

impl PcCpuBus {
    pub fn new(platform: PcPlatform) -> Self {
        Self {
            platform,
            tlb: Tlb::new(),
            paging: PagingControl::default(),
        }
    }

    fn a20_mask(&self) -> u32 {
        self.platform.a20.mask()
    }

    fn mode(user: bool, write: bool) -> AccessMode {
        match (user, write) {
            (false, false) => AccessMode::SysRead,
            (false, true) => AccessMode::SysWrite,
            (true, false) => AccessMode::UserRead,
            (true, true) => AccessMode::UserWrite,
        }
    }

    /// Linear-to-physical through the TLB, walking on a miss.
    fn lin_to_phys(
        &mut self,
        lin: u32,
        mode: AccessMode,
        fetch: bool,
    ) -> Result<u32, Exception> {
        if let Some(phys) = self.tlb.lookup(lin, mode) {
            return Ok(phys & self.a20_mask());
        }
        let a20_mask = self.a20_mask();
        let mut ops = PtOps {
            platform: &mut self.platform,
            a20_mask,
        };
        let t = translate(&mut ops, self.paging, lin, mode, fetch).map_err(|pf| {
            Exception::PageFault {
                addr: pf.addr,
                error_code: pf.error_code,
            }
        })?;
        self.tlb.insert(lin >> 12, t.phys_page, t.perms, t.global);
        Ok(t.phys & a20_mask)
    }

    /// Per-byte translation plan for an access; faults before any byte
    /// commits, so split accesses never half-complete.
    fn plan(
        &mut self,
        lin: u32,
        len: u32,
        mode: AccessMode,
    ) -> Result<[u32; 8], Exception> {
        debug_assert!(len <= 8);
        let mut plan = [0u32; 8];
        if (lin ^ lin.wrapping_add(len - 1)) & !0xFFF == 0 {
            let base = self.lin_to_phys(lin, mode, false)?;
            for (i, slot) in plan.iter_mut().enumerate().take(len as usize) {
                *slot = base.wrapping_add(i as u32);
            }
        } else {
            for (i, slot) in plan.iter_mut().enumerate().take(len as usize) {
                *slot = self.lin_to_phys(lin.wrapping_add(i as u32), mode, false)?;
            }
        }
        Ok(plan)
    }

    fn read_sized(&mut self, lin: u32, len: u32, user: bool) -> Result<u64, Exception> {
        let plan = self.plan(lin, len, Self::mode(user, false))?;
        let mut out = 0u64;
        for (i, phys) in plan.iter().enumerate().take(len as usize) {
            out |= (phys_read8(&mut self.platform, *phys) as u64) << (i * 8);
        }
        Ok(out)
    }

    fn write_sized(&mut self, lin: u32, len: u32, value: u64, user: bool) -> Result<(), Exception> {
        let plan = self.plan(lin, len, Self::mode(user, true))?;
        for (i, phys) in plan.iter().enumerate().take(len as usize) {
            phys_write8(&mut self.platform, *phys, (value >> (i * 8)) as u8);
        }
        Ok(())
    }

    /// Diagnostic/physical accessors used by the machine front-end; these
    /// bypass the TLB and the A20 gate entirely.
    pub fn read_physical_u8(&mut self, paddr: u32) -> u8 {
        phys_read8(&mut self.platform, paddr)
    }

    pub fn write_physical_u8(&mut self, paddr: u32, value: u8) {
        phys_write8(&mut self.platform, paddr, value);
    }

    pub fn read_physical_u32(&mut self, paddr: u32) -> u32 {
        phys_read32(&mut self.platform, paddr)
    }

    pub fn write_physical_u32(&mut self, paddr: u32, value: u32) {
        phys_write32(&mut self.platform, paddr, value);
        self.platform.service();
    }

    pub fn tlb_probe(&self, lin: u32) -> Option<u32> {
        self.tlb.probe(lin)
    }

    /// Full TLB drop, used by snapshot restore and machine reset.
    pub fn flush_tlb(&mut self) {
        self.tlb.flush_all();
    }
}

impl CpuBus for PcCpuBus {
    fn read_u8(&mut self, lin: u32, user: bool) -> Result<u8, Exception> {
        Ok(self.read_sized(lin, 1, user)? as u8)
    }
    fn read_u16(&mut self, lin: u32, user: bool) -> Result<u16, Exception> {
        Ok(self.read_sized(lin, 2, user)? as u16)
    }
    fn read_u32(&mut self, lin: u32, user: bool) -> Result<u32, Exception> {
        Ok(self.read_sized(lin, 4, user)? as u32)
    }
    fn read_u64(&mut self, lin: u32, user: bool) -> Result<u64, Exception> {
        self.read_sized(lin, 8, user)
    }
    fn write_u8(&mut self, lin: u32, value: u8, user: bool) -> Result<(), Exception> {
        self.write_sized(lin, 1, value as u64, user)
    }
    fn write_u16(&mut self, lin: u32, value: u16, user: bool) -> Result<(), Exception> {
        self.write_sized(lin, 2, value as u64, user)
    }
    fn write_u32(&mut self, lin: u32, value: u32, user: bool) -> Result<(), Exception> {
        self.write_sized(lin, 4, value as u64, user)
    }
    fn write_u64(&mut self, lin: u32, value: u64, user: bool) -> Result<(), Exception> {
        self.write_sized(lin, 8, value, user)
    }

    fn read_bytes(&mut self, lin: u32, out: &mut [u8], user: bool) -> Result<(), Exception> {
        let mode = Self::mode(user, false);
        // Validate every page up front for fault atomicity.
        let mut page = lin & !0xFFF;
        let end = lin.wrapping_add(out.len() as u32 - 1);
        loop {
            self.lin_to_phys(page.max(lin), mode, false)?;
            if page == end & !0xFFF {
                break;
            }
            page = page.wrapping_add(0x1000);
        }
        for (i, b) in out.iter_mut().enumerate() {
            let phys = self.lin_to_phys(lin.wrapping_add(i as u32), mode, false)?;
            *b = phys_read8(&mut self.platform, phys);
        }
        Ok(())
    }

    fn write_bytes(&mut self, lin: u32, data: &[u8], user: bool) -> Result<(), Exception> {
        let mode = Self::mode(user, true);
        let mut page = lin & !0xFFF;
        let end = lin.wrapping_add(data.len() as u32 - 1);
        loop {
            self.lin_to_phys(page.max(lin), mode, false)?;
            if page == end & !0xFFF {
                break;
            }
            page = page.wrapping_add(0x1000);
        }
        for (i, b) in data.iter().enumerate() {
            let phys = self.lin_to_phys(lin.wrapping_add(i as u32), mode, false)?;
            phys_write8(&mut self.platform, phys, *b);
        }
        Ok(())
    }

    fn translate_fetch(&mut self, lin: u32, user: bool) -> Result<u32, Exception> {
        self.lin_to_phys(lin, Self::mode(user, false), true)
    }

    fn read_phys_code(&mut self, phys: u32, out: &mut [u8]) {
        for (i, b) in out.iter_mut().enumerate() {
            *b = phys_read8(&mut self.platform, phys.wrapping_add(i as u32));
        }
    }

    fn code_page_version(&mut self, phys_page: u32) -> u32 {
        self.platform
            .ram
            .borrow()
            .page_version((phys_page >> 12) as usize)
    }

    fn mark_code_page(&mut self, phys_page: u32) {
        self.platform
            .ram
            .borrow_mut()
            .mark_code_page((phys_page >> 12) as usize);
    }

    fn unmark_code_page(&mut self, phys_page: u32) {
        self.platform
            .ram
            .borrow_mut()
            .clear_code_page((phys_page >> 12) as usize);
    }

    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        let value = self.platform.io.read(port, size);
        self.platform.service();
        value
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.platform.io.write(port, size, value);
        self.platform.service();
    }

    fn sync(&mut self, state: &CpuState) {
        let new = PagingControl {
            cr0: state.control.cr0,
            cr3: state.control.cr3,
            cr4: state.control.cr4,
        };
        let old = self.paging;
        self.paging = new;
        const CR0_FLUSH_BITS: u32 = 1 << 31 | 1 << 16 | 1 << 0;
        const CR4_FLUSH_BITS: u32 = 1 << 4 | 1 << 5 | 1 << 7;
        if (old.cr0 ^ new.cr0) & CR0_FLUSH_BITS != 0 || (old.cr4 ^ new.cr4) & CR4_FLUSH_BITS != 0
        {
            self.tlb.flush_all();
        } else if old.cr3 != new.cr3 {
            if new.global_pages() {
                self.tlb.flush_nonglobal();
            } else {
                self.tlb.flush_all();
            }
        }
    }

    fn invlpg(&mut self, lin: u32) {
        self.tlb.invlpg(lin);
    }

    fn take_trace_invalidations(&mut self) -> Vec<(u32, u32)> {
        self.platform.take_trace_invalidations()
    }
}

/// The interrupt complex through the executor's controller interface.
pub struct PlatformIntrCtrl {
    pub interrupts: Rc<RefCell<PlatformInterrupts>>,
}

impl InterruptController for PlatformIntrCtrl {
    fn intr_asserted(&self) -> bool {
        self.interrupts.borrow().intr_asserted()
    }

    fn acknowledge(&mut self) -> u8 {
        self.interrupts.borrow_mut().acknowledge()
    }

    fn take_fast_return(&mut self) -> bool {
        self.interrupts.borrow_mut().take_fast_return()
    }

    fn take_nmi(&mut self) -> bool {
        self.interrupts.borrow_mut().take_nmi()
    }

    fn nmi_pending(&self) -> bool {
        self.interrupts.borrow().nmi_line()
    }
}
