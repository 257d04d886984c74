//! # Address Space (two-level, directory-rooted)
//!
//! [`AddressSpace`] owns one page directory and is the system's page-fault
//! handler while it is the active space.
//!
//! ## Highlights
//!
//! - [`AddressSpace::new`] builds a directory whose slot 0 identity-maps the
//!   low 4 MiB for the kernel and whose last slot maps the directory itself.
//! - [`AddressSpace::handle_fault`] binds a frame to a not-present page on
//!   first touch, creating the second-level table when needed.
//! - [`AddressSpace::free_page`] unbinds a page and returns its frame. Pages
//!   of the identity-mapped prefix are never unbound.
//! - [`AddressSpace::register_region_pool`] lets region allocators veto
//!   stray accesses before a frame is bound to them.
//!
//! ## Table access
//!
//! Tables live in physical frames. While paging is off they are reached
//! through [`PhysMapper::phys_to_mut`]; once this space is active they are
//! reached through the [`self_map`](crate::self_map) window. Every table
//! access goes through one accessor that picks the form from the hardware
//! state, so an inactive space with paging on is refused rather than
//! silently edited through the wrong tables.
//!
//! ## Frame sources
//!
//! Table frames and page frames are drawn from two (possibly identical)
//! allocators. Both sit behind a [`SpinLock`]; a lock is never held across a
//! call into the other allocator, so passing the same lock twice is fine.

use crate::page_fault::FaultCause;
use crate::page_table::pd::{DirectoryIndex, PageDirectory};
use crate::page_table::pt::{PageTable, TableIndex};
use crate::page_table::{PageTableEntry, split_indices};
use crate::self_map::{DIRECTORY_ALIAS, SELF_MAP_SLOT, is_self_mapped, table_alias};
use crate::{FrameAlloc, Mmu, PageEntryBits, PageFaultError, RegionPool};
use kernel_info::memory::{FRAME_SIZE, SHARED_SIZE};
use kernel_memory_addresses::{FrameNumber, PageNumber, PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;
use log::{debug, error, info, trace, warn};

/// How many region pools fit into the registry (pointers per frame).
pub const MAX_REGISTERED_POOLS: usize = FRAME_SIZE as usize / size_of::<&dyn RegionPool>();

/// Where an address space stands relative to the paging hardware.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    /// Built, but another directory (or none) is loaded.
    Bootstrapped,
    /// Loaded into the translation base while paging is still off.
    Loaded,
    /// Loaded and paging is on.
    Active,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum PagingError {
    #[error("no physical frame available")]
    OutOfFrames,
    #[error("protection violation at {address}")]
    ProtectionFault { address: VirtualAddress },
    #[error("access to {address} outside every in-use region")]
    StrayAccess { address: VirtualAddress },
    #[error("access to {address} inside the page-table window")]
    SelfMapAccess { address: VirtualAddress },
    #[error("region pool registry is full")]
    RegistrationOverflow,
    #[error("frame {frame} was refused by its allocator")]
    InvalidRelease { frame: FrameNumber },
    #[error("address space is not loaded")]
    NotLoaded,
    #[error("page tables are not reachable while another address space is active")]
    NotAccessible,
}

/// How the tables of an address space are reached right now.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TableView {
    Physical,
    SelfMapped,
}

struct PoolRegistry<'p> {
    pools: [Option<&'p dyn RegionPool>; MAX_REGISTERED_POOLS],
    len: usize,
}

impl<'p> PoolRegistry<'p> {
    const fn new() -> Self {
        Self {
            pools: [None; MAX_REGISTERED_POOLS],
            len: 0,
        }
    }

    fn push(&mut self, pool: &'p dyn RegionPool) -> Result<(), PagingError> {
        let slot = self
            .pools
            .get_mut(self.len)
            .ok_or(PagingError::RegistrationOverflow)?;
        *slot = Some(pool);
        self.len += 1;
        Ok(())
    }

    fn iter(&self) -> impl Iterator<Item = &'p dyn RegionPool> + '_ {
        self.pools[..self.len].iter().flatten().copied()
    }
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'p, M: Mmu, A: FrameAlloc> {
    mmu: &'p M,
    table_frames: &'p SpinLock<A>,
    page_frames: &'p SpinLock<A>,
    directory: FrameNumber,
    pools: SpinLock<PoolRegistry<'p>>,
}

impl<'p, M: Mmu, A: FrameAlloc> AddressSpace<'p, M, A> {
    /// Build a fresh directory plus the identity table for the low 4 MiB.
    ///
    /// Both frames come from `table_frames`. Directory slots other than the
    /// identity slot and the self map are absent but writable and user
    /// accessible, so the first fault through them reads as "not present".
    ///
    /// # Errors
    /// - [`PagingError::NotAccessible`] if paging is already on (the new
    ///   frames cannot be reached physically).
    /// - [`PagingError::OutOfFrames`] if either frame is unavailable; nothing
    ///   is leaked.
    pub fn new(
        mmu: &'p M,
        table_frames: &'p SpinLock<A>,
        page_frames: &'p SpinLock<A>,
    ) -> Result<Self, PagingError> {
        if mmu.paging_enabled() {
            return Err(PagingError::NotAccessible);
        }

        let directory = table_frames.lock().acquire();
        let Some(directory) = directory else {
            error!("no frame for a new page directory");
            return Err(PagingError::OutOfFrames);
        };
        let identity = table_frames.lock().acquire();
        let Some(identity) = identity else {
            error!("no frame for the identity page table");
            give_back(table_frames, directory);
            return Err(PagingError::OutOfFrames);
        };

        // SAFETY: paging is off, both frames were just handed to us.
        let table = unsafe { mmu.phys_to_mut::<PageTable>(identity.address()) };
        for ti in TableIndex::all() {
            #[allow(clippy::cast_possible_truncation)]
            let frame = FrameNumber::new(ti.as_usize() as u32);
            table.set(ti, PageTableEntry::new(frame, PageEntryBits::new_kernel_rw()));
        }

        // SAFETY: as above.
        let dir = unsafe { mmu.phys_to_mut::<PageDirectory>(directory.address()) };
        for di in DirectoryIndex::all() {
            dir.set(di, PageTableEntry::absent(PageEntryBits::new_absent_table()));
        }
        dir.set(
            DirectoryIndex::new(0),
            PageTableEntry::new(identity, PageEntryBits::new_kernel_rw()),
        );
        dir.set(
            SELF_MAP_SLOT,
            PageTableEntry::new(directory, PageEntryBits::new_kernel_rw()),
        );

        info!("page directory at {directory}, identity table at {identity}");
        Ok(Self {
            mmu,
            table_frames,
            page_frames,
            directory,
            pools: SpinLock::new(PoolRegistry::new()),
        })
    }

    #[inline]
    #[must_use]
    pub const fn directory_frame(&self) -> FrameNumber {
        self.directory
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        if self.mmu.translation_base() != self.directory.address() {
            Lifecycle::Bootstrapped
        } else if self.mmu.paging_enabled() {
            Lifecycle::Active
        } else {
            Lifecycle::Loaded
        }
    }

    /// Point the hardware at this directory. Drops every cached translation,
    /// so it doubles as a full flush for the active space.
    pub fn load(&self) {
        // SAFETY: every directory built by `new` identity-maps the kernel.
        unsafe { self.mmu.set_translation_base(self.directory.address()) };
        debug!("loaded page directory {}", self.directory);
    }

    /// Switch the CPU to translated addressing.
    ///
    /// # Errors
    /// [`PagingError::NotLoaded`] unless [`load`](Self::load) ran first.
    pub fn enable_paging(&self) -> Result<(), PagingError> {
        if self.mmu.translation_base() != self.directory.address() {
            error!("enabling paging before the directory is loaded");
            return Err(PagingError::NotLoaded);
        }
        // SAFETY: the loaded directory identity-maps the running kernel.
        unsafe { self.mmu.set_paging_enabled(true) };
        info!("paging enabled");
        Ok(())
    }

    fn view(&self) -> Result<TableView, PagingError> {
        if !self.mmu.paging_enabled() {
            Ok(TableView::Physical)
        } else if self.mmu.translation_base() == self.directory.address() {
            Ok(TableView::SelfMapped)
        } else {
            Err(PagingError::NotAccessible)
        }
    }

    /// # Safety
    /// No other reference to the directory may be live.
    unsafe fn directory_mut<'a>(&self, view: TableView) -> &'a mut PageDirectory {
        match view {
            TableView::Physical => unsafe { self.mmu.phys_to_mut(self.directory.address()) },
            TableView::SelfMapped => unsafe { self.mmu.virt_to_mut(DIRECTORY_ALIAS) },
        }
    }

    /// # Safety
    /// `frame` must be the table installed at `index`, and no other
    /// reference to it may be live.
    unsafe fn table_mut<'a>(
        &self,
        view: TableView,
        index: DirectoryIndex,
        frame: FrameNumber,
    ) -> &'a mut PageTable {
        match view {
            TableView::Physical => unsafe { self.mmu.phys_to_mut(frame.address()) },
            TableView::SelfMapped => unsafe { self.mmu.virt_to_mut(table_alias(index)) },
        }
    }

    fn directory_entry(&self, view: TableView, index: DirectoryIndex) -> PageTableEntry {
        // SAFETY: the reference does not outlive this expression.
        unsafe { self.directory_mut(view) }.get(index)
    }

    /// Whether some registered pool hands out `address`. Without any
    /// registered pool every address is accepted.
    #[must_use]
    pub fn is_legitimate(&self, address: VirtualAddress) -> bool {
        let registry = self.pools.lock();
        registry.len == 0 || registry.iter().any(|pool| pool.is_legitimate(address))
    }

    /// Resolve a page fault at `address`.
    ///
    /// A not-present fault binds one frame from the page pool with
    /// {present, writable, user}. When the directory slot is absent too, a
    /// table frame is taken first and linked with {present, writable,
    /// supervisor}. A fault on a page that is already present only drops
    /// the stale translation.
    ///
    /// # Errors
    /// - [`PagingError::ProtectionFault`] for access-rule violations.
    /// - [`PagingError::SelfMapAccess`] inside the table window.
    /// - [`PagingError::StrayAccess`] if registered pools reject `address`.
    /// - [`PagingError::OutOfFrames`]; no half-installed table is left.
    /// - [`PagingError::NotAccessible`] if another space is active.
    pub fn handle_fault(
        &self,
        address: VirtualAddress,
        fault: PageFaultError,
    ) -> Result<(), PagingError> {
        if fault.cause() == FaultCause::ProtectionViolation {
            error!("{} at {address}", fault.explain());
            return Err(PagingError::ProtectionFault { address });
        }
        if is_self_mapped(address) {
            error!("fault at {address} inside the page-table window");
            return Err(PagingError::SelfMapAccess { address });
        }
        if !self.is_legitimate(address) {
            error!("stray access to {address}");
            return Err(PagingError::StrayAccess { address });
        }

        let view = self.view()?;
        let (di, ti) = split_indices(address);

        if let Some(table_frame) = self.directory_entry(view, di).frame() {
            // SAFETY: the directory reference above is gone.
            let table = unsafe { self.table_mut(view, di, table_frame) };
            if table.get(ti).is_present() {
                trace!("{address} already mapped, dropping stale translation");
                self.mmu.invalidate_page(address);
                return Ok(());
            }

            let frame = self.page_frames.lock().acquire();
            let Some(frame) = frame else {
                error!("out of frames while paging in {address}");
                return Err(PagingError::OutOfFrames);
            };
            table.set(ti, PageTableEntry::new(frame, PageEntryBits::new_user_rw()));
            trace!("mapped {address} to {frame}");
            return Ok(());
        }

        let table_frame = self.table_frames.lock().acquire();
        let Some(table_frame) = table_frame else {
            error!("out of frames for a page table covering {address}");
            return Err(PagingError::OutOfFrames);
        };
        let frame = self.page_frames.lock().acquire();
        let Some(frame) = frame else {
            error!("out of frames while paging in {address}");
            give_back(self.table_frames, table_frame);
            return Err(PagingError::OutOfFrames);
        };

        // SAFETY: no table reference is live.
        unsafe { self.directory_mut(view) }.set(
            di,
            PageTableEntry::new(table_frame, PageEntryBits::new_kernel_rw()),
        );
        if view == TableView::SelfMapped {
            self.mmu.invalidate_page(table_alias(di));
        }

        // SAFETY: the table was linked above; the directory reference is gone.
        let table = unsafe { self.table_mut(view, di, table_frame) };
        table.zero();
        table.set(ti, PageTableEntry::new(frame, PageEntryBits::new_user_rw()));
        debug!("page table {table_frame} installed for slot {}", di.as_usize());
        trace!("mapped {address} to {frame}");
        Ok(())
    }

    /// Entry point for the `#PF` trap: reads the fault state from the MMU
    /// and runs [`handle_fault`](Self::handle_fault).
    ///
    /// # Errors
    /// As [`handle_fault`](Self::handle_fault). The caller must not resume
    /// the faulting context on `Err`.
    pub fn service_fault(&self) -> Result<(), PagingError> {
        let address = self.mmu.fault_address();
        let fault = self.mmu.fault_error();
        self.handle_fault(address, fault)
            .inspect_err(|e| error!("unrecoverable page fault at {address}: {e}"))
    }

    /// Unbind `page` and give its frame back to the page pool.
    ///
    /// Freeing a page that is not mapped is reported and otherwise ignored,
    /// and so is freeing a page below [`SHARED_SIZE`]: the identity map is
    /// shared by every space and never demand-paged.
    ///
    /// # Errors
    /// - [`PagingError::SelfMapAccess`] for pages of the table window.
    /// - [`PagingError::InvalidRelease`] if the pool refuses the frame; the
    ///   mapping stays intact.
    /// - [`PagingError::NotAccessible`] if another space is active.
    pub fn free_page(&self, page: PageNumber) -> Result<(), PagingError> {
        let address = page.address();
        if is_self_mapped(address) {
            return Err(PagingError::SelfMapAccess { address });
        }

        let view = self.view()?;
        if is_shared(address) {
            warn!("{page} is identity mapped, left bound");
            return Ok(());
        }

        let (di, ti) = split_indices(address);
        let Some(table_frame) = self.directory_entry(view, di).frame() else {
            warn!("{page} already free");
            return Ok(());
        };

        // SAFETY: the directory reference above is gone.
        let table = unsafe { self.table_mut(view, di, table_frame) };
        let Some(frame) = table.get(ti).frame() else {
            warn!("{page} already free");
            return Ok(());
        };

        if let Err(e) = self.page_frames.with_lock(|pool| pool.release(frame)) {
            error!("cannot release {frame} behind {page}: {e}");
            return Err(PagingError::InvalidRelease { frame });
        }

        table.set(ti, PageTableEntry::zero());
        if view == TableView::SelfMapped {
            self.mmu.invalidate_page(address);
        }
        Ok(())
    }

    /// Check that [`free_page`](Self::free_page) would succeed for each of
    /// the `count` pages from `first`. Nothing is unbound or released.
    ///
    /// # Errors
    /// The first error `free_page` would report for one of the pages.
    pub fn check_free(&self, first: PageNumber, count: u32) -> Result<(), PagingError> {
        let view = self.view()?;
        for n in 0..count {
            let address = (first + n).address();
            if is_self_mapped(address) {
                return Err(PagingError::SelfMapAccess { address });
            }
            if is_shared(address) {
                continue;
            }
            let Some(frame) = self.bound_frame(view, address) else {
                continue;
            };
            if let Err(e) = self.page_frames.with_lock(|pool| pool.check_release(frame)) {
                error!("{frame} behind {address} cannot be released: {e}");
                return Err(PagingError::InvalidRelease { frame });
            }
        }
        Ok(())
    }

    /// Let the fault handler consult `pool` before binding frames.
    ///
    /// # Errors
    /// [`PagingError::RegistrationOverflow`] once [`MAX_REGISTERED_POOLS`]
    /// pools are registered.
    pub fn register_region_pool(&self, pool: &'p dyn RegionPool) -> Result<(), PagingError> {
        self.pools.lock().push(pool).inspect_err(|_| {
            error!("cannot register more than {MAX_REGISTERED_POOLS} region pools");
        })
    }

    #[must_use]
    pub fn registered_pools(&self) -> usize {
        self.pools.lock().len
    }

    /// The physical address `va` maps to, if any.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let view = self.view().ok()?;
        let frame = self.bound_frame(view, va)?;
        Some(frame.address() + va.offset())
    }

    fn bound_frame(&self, view: TableView, va: VirtualAddress) -> Option<FrameNumber> {
        let (di, ti) = split_indices(va);
        let table_frame = self.directory_entry(view, di).frame()?;
        // SAFETY: the directory reference above is gone.
        let table = unsafe { self.table_mut(view, di, table_frame) };
        table.get(ti).frame()
    }
}

/// Inside the identity-mapped prefix every space shares.
const fn is_shared(va: VirtualAddress) -> bool {
    va.as_u32() < SHARED_SIZE
}

fn give_back<A: FrameAlloc>(pool: &SpinLock<A>, frame: FrameNumber) {
    if let Err(e) = pool.with_lock(|pool| pool.release(frame)) {
        error!("leaking {frame}: {e}");
    }
}
