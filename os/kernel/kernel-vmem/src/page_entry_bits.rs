use kernel_memory_addresses::FrameNumber;
use bitfield_struct::bitfield;

/// A single 32-bit x86 paging-structure entry in its raw bitfield form.
///
/// Page-directory entries (PDE) and page-table entries (PTE) share this
/// layout in 32-bit paging without PSE, so one type serves both levels.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P`             | Present |
/// | 1     | `RW`            | Writable if set |
/// | 2     | `US`            | User-mode accessible if set |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Disable caching |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (PTE only) |
/// | 7     | `PS` / `PAT`    | Large page in a PDE (never set here) |
/// | 8     | `G`             | Global (PTE only) |
/// | 9–11  | OS avail        | Ignored by hardware |
/// | 12–31 | `frame`         | Physical frame number |
///
/// Effective permissions are the intersection over the walk: a supervisor
/// PDE makes every page behind it supervisor-only, whatever the PTE says.
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::FrameNumber;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::new_user_rw().with_frame(FrameNumber::new(0x400));
/// assert_eq!(e.into_bits(), 0x0040_0007);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Clear means any access through this entry raises a not-present page
    /// fault; the remaining bits are then free for software use.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set to allow ring-3 access; clear restricts to supervisor only.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a PTE.
    pub dirty: bool,

    /// Page Size (PS, bit 7). Huge pages are not used; always clear.
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame_bits: u32,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.frame_bits())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: FrameNumber) -> Self {
        self.with_frame_bits(frame.as_u32())
    }

    /// Present, writable, supervisor-only.
    ///
    /// Used for the identity map of low memory, the self-map slot and every
    /// directory entry that points at a second-level table.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, writable, user-accessible. Demand-paged leaf pages.
    #[inline]
    #[must_use]
    pub const fn new_user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
    }

    /// Not present, but writable and user-accessible.
    ///
    /// Directory slots without a second-level table carry these bits so a
    /// fault through them decodes as "not present" rather than a permission
    /// violation.
    #[inline]
    #[must_use]
    pub const fn new_absent_table() -> Self {
        Self::new().with_writable(true).with_user_access(true)
    }
}
