//! # Page Table (second level)
//!
//! - [`TableIndex`]: index type for virtual-address bits `[21:12]`.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 entries. Every present
//!   entry maps one 4 KiB page.

use crate::page_table::{ENTRIES_PER_TABLE, PageTableEntry};
use kernel_memory_addresses::VirtualAddress;

/// Index into a page table (virtual-address bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Extract bits `[21:12]` of `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u32() >> 12) & 0x3FF) as u16)
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
}

/// A second-level page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Mark every entry absent.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }
}
