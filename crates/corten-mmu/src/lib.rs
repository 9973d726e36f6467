//! TLB and page-table walker for IA-32 paging: legacy 2-level 32-bit
//! tables, 4 MiB pages under CR4.PSE (with the PSE-36 extension), and
//! 3-level PAE with 64-bit entries.
//!
//! The TLB is direct-mapped over the 2^20 linear page numbers. An entry
//! carries the physical frame plus a four-bit permission tag, one bit per
//! access mode in {user, supervisor} x {read, write}; a lookup that misses
//! its permission bit falls back to a fresh walk, which is also what makes
//! dirty-bit setting work: entries installed by reads never carry write
//! permission, so the first write through a mapping always walks and sets
//! D before write permission is cached.

pub mod tlb;
pub mod walk;

pub use tlb::{Tlb, TLB_ENTRIES};
pub use walk::{translate, PageFault, PageTableOps, PagingControl, Translation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    SysRead,
    SysWrite,
    UserRead,
    UserWrite,
}

impl AccessMode {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, AccessMode::SysWrite | AccessMode::UserWrite)
    }

    #[inline]
    pub fn is_user(self) -> bool {
        matches!(self, AccessMode::UserRead | AccessMode::UserWrite)
    }

    /// Bit position inside a TLB permission tag.
    #[inline]
    pub(crate) fn perm_bit(self) -> u8 {
        match self {
            AccessMode::SysRead => 1,
            AccessMode::SysWrite => 2,
            AccessMode::UserRead => 4,
            AccessMode::UserWrite => 8,
        }
    }
}
