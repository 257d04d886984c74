//! # Two-Level Paging Structures
//!
//! - [`pd`]: the page directory (top level) and [`DirectoryIndex`].
//! - [`pt`]: second-level page tables and [`TableIndex`].
//! - [`PageTableEntry`]: the entry type shared by both levels.

pub mod pd;
pub mod pt;

use crate::PageEntryBits;
use crate::page_table::pd::DirectoryIndex;
use crate::page_table::pt::TableIndex;
use kernel_memory_addresses::{FrameNumber, VirtualAddress};

/// Entries per directory and per table (4 KiB / 4 bytes).
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Split a virtual address into its directory and table indices.
///
/// ```rust
/// # use kernel_memory_addresses::VirtualAddress;
/// # use kernel_vmem::page_table::split_indices;
/// let (d, t) = split_indices(VirtualAddress::new(0x4000_3123));
/// assert_eq!(d.as_usize(), 0x100);
/// assert_eq!(t.as_usize(), 0x003);
/// ```
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirectoryIndex, TableIndex) {
    (DirectoryIndex::from(va), TableIndex::from(va))
}

/// A single directory or table entry.
///
/// All permission/present bits live inside the inner [`PageEntryBits`]; the
/// wrapper only adds the typed constructors the paging code needs.
#[doc(alias = "PTE")]
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageTableEntry(PageEntryBits);

impl PageTableEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    /// A present entry pointing at `frame` with the permission bits of `flags`.
    #[inline]
    #[must_use]
    pub const fn new(frame: FrameNumber, flags: PageEntryBits) -> Self {
        Self(flags.with_present(true).with_large_page(false).with_frame(frame))
    }

    /// A non-present entry that keeps `flags` (minus `present`) for later use.
    #[inline]
    #[must_use]
    pub const fn absent(flags: PageEntryBits) -> Self {
        Self(flags.with_present(false).with_frame(FrameNumber::new(0)))
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    /// The frame behind a present entry.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> Option<FrameNumber> {
        if self.is_present() {
            Some(self.0.frame())
        } else {
            None
        }
    }

    /// Expose the underlying bitfield for inspection.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    /// No validation is performed.
    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_cover_the_address() {
        let (d, t) = split_indices(VirtualAddress::new(0xFFFF_F000));
        assert_eq!(d.as_usize(), 1023);
        assert_eq!(t.as_usize(), 1023);

        let (d, t) = split_indices(VirtualAddress::new(0x0040_0FFF));
        assert_eq!(d.as_usize(), 1);
        assert_eq!(t.as_usize(), 0);
    }

    #[test]
    fn entry_encoding_is_bit_exact() {
        let frame = FrameNumber::new(0x12345);
        assert_eq!(PageTableEntry::new(frame, PageEntryBits::new_kernel_rw()).raw(), 0x1234_5003);
        assert_eq!(PageTableEntry::new(frame, PageEntryBits::new_user_rw()).raw(), 0x1234_5007);
        assert_eq!(PageTableEntry::absent(PageEntryBits::new_absent_table()).raw(), 0x0000_0006);
    }

    #[test]
    fn absent_entries_have_no_frame() {
        let e = PageTableEntry::absent(PageEntryBits::new_user_rw().with_frame(FrameNumber::new(9)));
        assert!(!e.is_present());
        assert_eq!(e.frame(), None);
        assert_eq!(PageTableEntry::zero().frame(), None);

        let e = PageTableEntry::from_raw(0x0000_9001);
        assert_eq!(e.frame(), Some(FrameNumber::new(9)));
        assert!(!e.flags().writable());
    }
}
