//! # Page Directory (top level)
//!
//! - [`DirectoryIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 entries, each either
//!   absent or pointing at a second-level [`PageTable`](super::pt::PageTable).
//!
//! The last slot ([`SELF_MAP_SLOT`](crate::self_map::SELF_MAP_SLOT)) always
//! points back at the directory itself.

use crate::page_table::{ENTRIES_PER_TABLE, PageTableEntry};
use kernel_memory_addresses::VirtualAddress;

/// Index into the page directory (virtual-address bits `[31:22]`).
///
/// Each slot covers 4 MiB of the virtual address space.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

impl DirectoryIndex {
    /// Extract bits `[31:22]` of `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new((va.as_u32() >> 22) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Every slot, in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..1024).map(Self::new)
    }

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }
}

/// The page directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageDirectory {
    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation.
    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }
}
