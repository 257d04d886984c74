//! # Simulated Machine
//!
//! A host-side stand-in for physical memory and the paging hardware, used to
//! exercise [`AddressSpace`] without a CPU in 32-bit protected mode.
//!
//! - Physical memory is sparse: a 4 KiB frame springs into existence
//!   (zeroed) the first time it is touched.
//! - CR0.PG, CR2, CR3 and the page-fault error code are plain cells.
//! - [`SimMachine::access`] performs the two-level walk the CPU would do,
//!   including the self map, and caches successful translations in a tiny
//!   TLB that only `set_translation_base`, paging toggles and
//!   `invalidate_page` clear.
//!
//! The TLB matters: kernel accesses through [`Mmu::virt_to_mut`] consult it
//! first, so a missing invalidation shows up as a stale table in tests.

use crate::page_table::{PageTableEntry, split_indices};
use crate::{AddressSpace, FrameAlloc, Mmu, PageFaultError, PagingError, PhysMapper};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Faults a single simulated access may raise before it is considered stuck.
const MAX_FAULTS_PER_ACCESS: usize = 2;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// A cached translation: frame plus the effective permissions of the walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    pub frame: FrameNumber,
    pub user: bool,
    pub writable: bool,
}

/// Simulated physical memory and MMU.
pub struct SimMachine {
    frames: RefCell<BTreeMap<u32, NonNull<Frame>>>,
    translation_base: Cell<PhysicalAddress>,
    paging: Cell<bool>,
    fault_address: Cell<VirtualAddress>,
    fault_error: Cell<PageFaultError>,
    tlb: RefCell<BTreeMap<u32, Translation>>,
    base_loads: Cell<usize>,
    invalidations: Cell<usize>,
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMachine {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: RefCell::new(BTreeMap::new()),
            translation_base: Cell::new(PhysicalAddress::zero()),
            paging: Cell::new(false),
            fault_address: Cell::new(VirtualAddress::zero()),
            fault_error: Cell::new(PageFaultError::new()),
            tlb: RefCell::new(BTreeMap::new()),
            base_loads: Cell::new(0),
            invalidations: Cell::new(0),
        }
    }

    fn frame_ptr(&self, frame: FrameNumber) -> NonNull<Frame> {
        *self
            .frames
            .borrow_mut()
            .entry(frame.as_u32())
            .or_insert_with(|| NonNull::from(Box::leak(Box::new(Frame([0; PAGE_SIZE as usize])))))
    }

    /// Number of distinct frames touched so far.
    #[must_use]
    pub fn touched_frames(&self) -> usize {
        self.frames.borrow().len()
    }

    #[must_use]
    pub fn read_phys_u32(&self, pa: PhysicalAddress) -> u32 {
        // SAFETY: simulated frames are plain bytes; any u32 pattern is valid.
        unsafe { *self.phys_to_mut::<u32>(pa) }
    }

    pub fn write_phys_u32(&self, pa: PhysicalAddress, value: u32) {
        // SAFETY: see `read_phys_u32`.
        unsafe { *self.phys_to_mut::<u32>(pa) = value };
    }

    /// The raw entry `index` of the table or directory stored in `frame`.
    #[must_use]
    pub fn entry(&self, frame: FrameNumber, index: usize) -> PageTableEntry {
        debug_assert!(index < crate::ENTRIES_PER_TABLE);
        #[allow(clippy::cast_possible_truncation)]
        let offset = (index * size_of::<u32>()) as u32;
        PageTableEntry::from_raw(self.read_phys_u32(frame.address() + offset))
    }

    /// Walk the loaded tables for `va` the way the CPU does.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Option<Translation> {
        let (di, ti) = split_indices(va);
        let pde = self.entry(self.translation_base.get().frame(), di.as_usize());
        let pte = self.entry(pde.frame()?, ti.as_usize());
        Some(Translation {
            frame: pte.frame()?,
            user: pde.flags().user_access() && pte.flags().user_access(),
            writable: pde.flags().writable() && pte.flags().writable(),
        })
    }

    /// Whether the translation cache holds an entry for the page of `va`.
    #[must_use]
    pub fn is_cached(&self, va: VirtualAddress) -> bool {
        self.tlb.borrow().contains_key(&va.page().as_u32())
    }

    /// Perform one memory access.
    ///
    /// Without paging the address is used as is. With paging the translation
    /// cache is consulted first, then the tables are walked. On failure CR2
    /// and the error code are recorded exactly as the CPU would before
    /// raising `#PF`.
    ///
    /// # Errors
    /// The page-fault error code the access would raise.
    pub fn access(
        &self,
        va: VirtualAddress,
        write: bool,
        user: bool,
    ) -> Result<PhysicalAddress, PageFaultError> {
        if !self.paging.get() {
            return Ok(PhysicalAddress::new(va.as_u32()));
        }

        let page = va.page().as_u32();
        let cached = self.tlb.borrow().get(&page).copied();
        let translation = match cached {
            Some(t) => t,
            None => {
                let Some(t) = self.walk(va) else {
                    return Err(self.raise(va, false, write, user));
                };
                self.tlb.borrow_mut().insert(page, t);
                t
            }
        };

        if (user && !translation.user) || (write && !translation.writable) {
            return Err(self.raise(va, true, write, user));
        }

        Ok(translation.frame.address() + va.offset())
    }

    fn raise(&self, va: VirtualAddress, present: bool, write: bool, user: bool) -> PageFaultError {
        let error = PageFaultError::new()
            .with_protection_violation(present)
            .with_write(write)
            .with_user_mode(user);
        self.raise_fault(va, error);
        error
    }

    /// Record a fault as if the CPU had raised it.
    pub fn raise_fault(&self, va: VirtualAddress, error: PageFaultError) {
        self.fault_address.set(va);
        self.fault_error.set(error);
    }

    /// An access by a kernel thread that services page faults through
    /// `aspace` until it succeeds, like a thread resuming after the fault
    /// handler returns.
    ///
    /// Threads run in ring 0: directory entries are supervisor-only, so a
    /// ring-3 access to a demand-paged page would always be refused.
    ///
    /// # Errors
    /// Whatever the fault handler could not resolve.
    ///
    /// # Panics
    /// If the access still faults after the handler reported success.
    pub fn touch<A: FrameAlloc>(
        &self,
        aspace: &AddressSpace<'_, Self, A>,
        va: VirtualAddress,
        write: bool,
    ) -> Result<PhysicalAddress, PagingError> {
        for _ in 0..MAX_FAULTS_PER_ACCESS {
            match self.access(va, write, false) {
                Ok(pa) => return Ok(pa),
                Err(_) => aspace.service_fault()?,
            }
        }
        panic!("access to {va} keeps faulting after the handler succeeded");
    }

    /// How often CR3 was written.
    #[must_use]
    pub const fn translation_loads(&self) -> usize {
        self.base_loads.get()
    }

    /// How often a single page was invalidated.
    #[must_use]
    pub const fn invalidations(&self) -> usize {
        self.invalidations.get()
    }

    fn flush(&self) {
        self.tlb.borrow_mut().clear();
    }
}

impl Drop for SimMachine {
    fn drop(&mut self) {
        for (_, frame) in core::mem::take(self.frames.get_mut()) {
            // SAFETY: every pointer came from `Box::leak` in `frame_ptr`.
            drop(unsafe { Box::from_raw(frame.as_ptr()) });
        }
    }
}

impl PhysMapper for SimMachine {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.offset() as usize + size_of::<T>() <= PAGE_SIZE as usize);
        let base = self.frame_ptr(pa.frame()).cast::<u8>();
        // SAFETY: the offset stays inside the 4 KiB frame, which lives until
        // the machine is dropped.
        unsafe { &mut *base.as_ptr().add(pa.offset() as usize).cast::<T>() }
    }
}

impl Mmu for SimMachine {
    fn fault_address(&self) -> VirtualAddress {
        self.fault_address.get()
    }

    fn fault_error(&self) -> PageFaultError {
        self.fault_error.get()
    }

    fn translation_base(&self) -> PhysicalAddress {
        self.translation_base.get()
    }

    unsafe fn set_translation_base(&self, pa: PhysicalAddress) {
        self.translation_base.set(pa);
        self.base_loads.set(self.base_loads.get() + 1);
        self.flush();
    }

    fn paging_enabled(&self) -> bool {
        self.paging.get()
    }

    unsafe fn set_paging_enabled(&self, enabled: bool) {
        self.paging.set(enabled);
        self.flush();
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidations.set(self.invalidations.get() + 1);
        self.tlb.borrow_mut().remove(&va.page().as_u32());
    }

    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        let pa = match self.access(va, true, false) {
            Ok(pa) => pa,
            Err(error) => panic!("kernel access to {va} faulted: {}", error.explain()),
        };
        // SAFETY: forwarded to the caller.
        unsafe { self.phys_to_mut(pa) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_memory_is_sparse_and_zeroed() {
        let sim = SimMachine::new();
        assert_eq!(sim.touched_frames(), 0);
        assert_eq!(sim.read_phys_u32(PhysicalAddress::new(0x0123_4568)), 0);
        sim.write_phys_u32(PhysicalAddress::new(0x0123_4568), 0xDEAD_BEEF);
        assert_eq!(sim.read_phys_u32(PhysicalAddress::new(0x0123_4568)), 0xDEAD_BEEF);
        assert_eq!(sim.touched_frames(), 1);
    }

    #[test]
    fn accesses_are_physical_without_paging() {
        let sim = SimMachine::new();
        assert_eq!(
            sim.access(VirtualAddress::new(0x4000_0000), true, true),
            Ok(PhysicalAddress::new(0x4000_0000))
        );
    }

    #[test]
    fn missing_directory_entry_raises_not_present() {
        let sim = SimMachine::new();
        unsafe {
            sim.set_translation_base(PhysicalAddress::new(0x0040_0000));
            sim.set_paging_enabled(true);
        }
        let err = sim
            .access(VirtualAddress::new(0x0080_0010), true, true)
            .unwrap_err();
        assert!(!err.protection_violation());
        assert!(err.write());
        assert!(err.user_mode());
        assert_eq!(sim.fault_address(), VirtualAddress::new(0x0080_0010));
        assert_eq!(sim.fault_error(), err);
    }

    #[test]
    fn walk_intersects_permissions_and_caches() {
        let sim = SimMachine::new();
        let dir = FrameNumber::new(0x400);
        let table = FrameNumber::new(0x401);
        let page = FrameNumber::new(0x402);
        sim.write_phys_u32(dir.address() + 2 * 4, table.address().as_u32() | 0b011);
        sim.write_phys_u32(table.address() + 5 * 4, page.address().as_u32() | 0b111);
        unsafe {
            sim.set_translation_base(dir.address());
            sim.set_paging_enabled(true);
        }

        let va = VirtualAddress::new(0x0080_5044);
        assert_eq!(sim.access(va, true, false), Ok(page.address() + 0x44));
        assert!(sim.is_cached(va));
        assert!(sim.access(va, false, true).unwrap_err().protection_violation());

        sim.invalidate_page(va);
        assert!(!sim.is_cached(va));
        assert_eq!(sim.invalidations(), 1);
        assert_eq!(sim.translation_loads(), 1);
    }
}
