//! The CPU's window onto the platform: linear memory (through the TLB),
//! physical code fetch for the decoder, and port I/O.

use crate::exception::Exception;
use crate::state::CpuState;

/// Implemented by the platform bus (`PcCpuBus`). All linear accessors take
/// `user` = effective-CPL-3, honor A20 masking, route MMIO, and return
/// architectural faults as values. A multi-byte access that faults must
/// not have committed any partial store.
pub trait CpuBus {
    fn read_u8(&mut self, lin: u32, user: bool) -> Result<u8, Exception>;
    fn read_u16(&mut self, lin: u32, user: bool) -> Result<u16, Exception>;
    fn read_u32(&mut self, lin: u32, user: bool) -> Result<u32, Exception>;
    fn read_u64(&mut self, lin: u32, user: bool) -> Result<u64, Exception>;
    fn write_u8(&mut self, lin: u32, value: u8, user: bool) -> Result<(), Exception>;
    fn write_u16(&mut self, lin: u32, value: u16, user: bool) -> Result<(), Exception>;
    fn write_u32(&mut self, lin: u32, value: u32, user: bool) -> Result<(), Exception>;
    fn write_u64(&mut self, lin: u32, value: u64, user: bool) -> Result<(), Exception>;
    fn read_bytes(&mut self, lin: u32, out: &mut [u8], user: bool) -> Result<(), Exception>;
    fn write_bytes(&mut self, lin: u32, data: &[u8], user: bool) -> Result<(), Exception>;

    /// Translates a code fetch address, returning the physical address.
    fn translate_fetch(&mut self, lin: u32, user: bool) -> Result<u32, Exception>;

    /// Raw physical read used by the decoder once `translate_fetch`
    /// resolved the page. Never faults; unmapped space reads as 0xFF
    /// (which decodes to IDIV and will surface as an error in the guest,
    /// matching open-bus fetch on hardware).
    fn read_phys_code(&mut self, phys: u32, out: &mut [u8]);

    /// SMC bookkeeping: current write-version of a physical code page, and
    /// registration of a page as holding decoded code.
    fn code_page_version(&mut self, phys_page: u32) -> u32;
    fn mark_code_page(&mut self, phys_page: u32);
    fn unmark_code_page(&mut self, phys_page: u32);

    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, value: u32);

    /// Pushes the paging-relevant control state into the TLB layer; called
    /// after CR0/CR3/CR4 writes and mode changes.
    fn sync(&mut self, state: &CpuState);
    fn invlpg(&mut self, lin: u32);

    /// Physical ranges whose cached traces must be dropped (PAM shadow
    /// permission changes). Drained once per executed batch.
    fn take_trace_invalidations(&mut self) -> Vec<(u32, u32)>;
}
