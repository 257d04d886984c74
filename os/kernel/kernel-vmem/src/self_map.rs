//! # Self-Mapped Table Aliases
//!
//! With directory slot [`SELF_MAP_SLOT`] pointing at the directory itself,
//! the top 4 MiB of every address space is a window onto its own tables.

use crate::page_table::pd::DirectoryIndex;
use kernel_memory_addresses::VirtualAddress;

/// Directory slot that maps the directory onto itself.
pub const SELF_MAP_SLOT: DirectoryIndex = DirectoryIndex::new(1023);

/// First virtual address of the table window (`0xFFC0_0000`).
pub const TABLE_WINDOW_BASE: VirtualAddress = SELF_MAP_SLOT.base();

/// Virtual address of the directory while it is active (`0xFFFF_F000`).
pub const DIRECTORY_ALIAS: VirtualAddress = table_alias(SELF_MAP_SLOT);

/// Virtual address of the page table behind directory slot `index`.
///
/// ```rust
/// # use kernel_vmem::DirectoryIndex;
/// # use kernel_vmem::self_map::table_alias;
/// assert_eq!(table_alias(DirectoryIndex::new(0)).as_u32(), 0xFFC0_0000);
/// assert_eq!(table_alias(DirectoryIndex::new(3)).as_u32(), 0xFFC0_3000);
/// ```
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn table_alias(index: DirectoryIndex) -> VirtualAddress {
    VirtualAddress::new(TABLE_WINDOW_BASE.as_u32() + ((index.as_usize() as u32) << 12))
}

/// Whether `va` falls into the table window.
#[inline]
#[must_use]
pub const fn is_self_mapped(va: VirtualAddress) -> bool {
    va.as_u32() >= TABLE_WINDOW_BASE.as_u32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases() {
        assert_eq!(TABLE_WINDOW_BASE.as_u32(), 0xFFC0_0000);
        assert_eq!(DIRECTORY_ALIAS.as_u32(), 0xFFFF_F000);
        assert_eq!(table_alias(DirectoryIndex::new(0x100)).as_u32(), 0xFFD0_0000);
    }

    #[test]
    fn window_bounds() {
        assert!(!is_self_mapped(VirtualAddress::new(0xFFBF_FFFF)));
        assert!(is_self_mapped(VirtualAddress::new(0xFFC0_0000)));
        assert!(is_self_mapped(VirtualAddress::new(0xFFFF_FFFF)));
    }
}
