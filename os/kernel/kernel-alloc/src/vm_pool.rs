//! # Virtual-Region Allocator
//!
//! A [`VmPool`] carves a fixed virtual range of one [`AddressSpace`] into
//! page-granular regions. Handing out a region only does bookkeeping; frames
//! are bound later by the fault handler, the first time each page is touched.
//!
//! The region table is kept sorted by start address and always tiles the
//! pool exactly:
//!
//! ```text
//!  base                                                        base + size
//!   ┌──────────────┬────────┬──────────────────┬────────────────────┐
//!   │   in use     │  free  │      in use      │        free        │
//!   └──────────────┴────────┴──────────────────┴────────────────────┘
//! ```
//!
//! - `allocate` takes the first free region that is large enough and splits
//!   off the remainder as a new free region.
//! - `release` only accepts the exact start of an in-use region, unbinds
//!   its pages, and merges it with free neighbours.

use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::self_map::is_self_mapped;
use kernel_vmem::{AddressSpace, FrameAlloc, Lifecycle, Mmu, PagingError, RegionPool};
use log::{debug, error, info};

/// Region slots of a pool unless chosen otherwise: as many as fit a frame.
pub const DEFAULT_REGION_SLOTS: usize = FRAME_SIZE as usize / size_of::<Region>();

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("cannot allocate an empty region")]
    ZeroSize,
    #[error("{address} is not page aligned")]
    Misaligned { address: VirtualAddress },
    #[error("pool range collides with the page-table window or wraps")]
    InvalidRange,
    #[error("no free region of {length} bytes")]
    NoFit { length: u32 },
    #[error("region table is full")]
    OutOfRegionSlots,
    #[error("no in-use region starts at {address}")]
    InvalidRelease { address: VirtualAddress },
    #[error(transparent)]
    Paging(#[from] PagingError),
}

/// One contiguous run of pages.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Region {
    pub start: VirtualAddress,
    pub length: u32,
    pub in_use: bool,
}

impl Region {
    /// One past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.start.as_u32() + self.length
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        address.as_u32() >= self.start.as_u32() && address.as_u32() < self.end()
    }
}

/// A sorted, gap-free table of regions.
#[derive(Copy, Clone, Debug)]
pub struct RegionTable<const N: usize> {
    slots: [Region; N],
    len: usize,
}

impl<const N: usize> RegionTable<N> {
    const fn new(start: VirtualAddress, length: u32) -> Self {
        let mut slots = [Region {
            start: VirtualAddress::zero(),
            length: 0,
            in_use: false,
        }; N];
        slots[0] = Region {
            start,
            length,
            in_use: false,
        };
        Self { slots, len: 1 }
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[Region] {
        &self.slots[..self.len]
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.as_slice().iter()
    }

    fn insert(&mut self, index: usize, region: Region) {
        debug_assert!(self.len < N);
        self.slots.copy_within(index..self.len, index + 1);
        self.slots[index] = region;
        self.len += 1;
    }

    fn remove(&mut self, index: usize) {
        self.slots.copy_within(index + 1..self.len, index);
        self.len -= 1;
    }

    /// Merge the free region at `index` with free neighbours.
    fn coalesce(&mut self, mut index: usize) {
        if index + 1 < self.len && !self.slots[index + 1].in_use {
            self.slots[index].length += self.slots[index + 1].length;
            self.remove(index + 1);
        }
        if index > 0 && !self.slots[index - 1].in_use {
            index -= 1;
            self.slots[index].length += self.slots[index + 1].length;
            self.remove(index + 1);
        }
    }
}

/// Virtual-region allocator for one address space.
///
/// `N` bounds the number of regions (free and in use) the pool can track.
pub struct VmPool<'p, M: Mmu, A: FrameAlloc, const N: usize = DEFAULT_REGION_SLOTS> {
    base: VirtualAddress,
    size: u32,
    aspace: &'p AddressSpace<'p, M, A>,
    regions: SpinLock<RegionTable<N>>,
}

impl<'p, M: Mmu, A: FrameAlloc, const N: usize> VmPool<'p, M, A, N> {
    /// A pool over `[base, base + size)` that starts as one free region.
    ///
    /// Call [`register`](Self::register) once the pool has its final place
    /// so the fault handler consults it. Until some pool of the address
    /// space is registered, the fault handler backs every not-present
    /// address, including ones this pool never handed out.
    ///
    /// # Errors
    /// - [`RegionError::ZeroSize`] for an empty range.
    /// - [`RegionError::Misaligned`] unless `base` and `size` are page multiples.
    /// - [`RegionError::InvalidRange`] if the range wraps or reaches the
    ///   page-table window.
    pub fn new(
        base: VirtualAddress,
        size: u32,
        aspace: &'p AddressSpace<'p, M, A>,
    ) -> Result<Self, RegionError> {
        const { assert!(N > 0, "a pool needs at least one region slot") };

        if size == 0 {
            return Err(RegionError::ZeroSize);
        }
        if !base.is_page_aligned() {
            return Err(RegionError::Misaligned { address: base });
        }
        let Some(end) = base.checked_add(size) else {
            return Err(RegionError::InvalidRange);
        };
        if !end.is_page_aligned() {
            return Err(RegionError::Misaligned { address: end });
        }
        if is_self_mapped(VirtualAddress::new(end.as_u32() - 1)) {
            return Err(RegionError::InvalidRange);
        }

        info!("virtual pool {base}..{end}");
        Ok(Self {
            base,
            size,
            aspace,
            regions: SpinLock::new(RegionTable::new(base, size)),
        })
    }

    /// Register with the address space so stray faults can be refused.
    ///
    /// # Errors
    /// [`PagingError::RegistrationOverflow`] as [`RegionError::Paging`].
    pub fn register(&'p self) -> Result<(), RegionError> {
        self.aspace.register_region_pool(self)?;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// A copy of the current region table.
    #[must_use]
    pub fn regions(&self) -> RegionTable<N> {
        *self.regions.lock()
    }

    /// Hand out a region of at least `size` bytes, rounded up to pages.
    ///
    /// # Errors
    /// - [`RegionError::ZeroSize`] for `size == 0`.
    /// - [`RegionError::NoFit`] if no free region is large enough.
    /// - [`RegionError::OutOfRegionSlots`] if the fitting region would need
    ///   a split but the table is full.
    pub fn allocate(&self, size: u32) -> Result<VirtualAddress, RegionError> {
        if size == 0 {
            return Err(RegionError::ZeroSize);
        }
        let length = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(RegionError::NoFit { length: size })?;

        let mut table = self.regions.lock();
        let Some(index) = table
            .iter()
            .position(|region| !region.in_use && region.length >= length)
        else {
            error!("no free region of {length} bytes in pool {}", self.base);
            return Err(RegionError::NoFit { length });
        };

        let region = table.slots[index];
        if region.length > length {
            if table.len == N {
                error!("region table of pool {} is full", self.base);
                return Err(RegionError::OutOfRegionSlots);
            }
            table.insert(
                index + 1,
                Region {
                    start: region.start + length,
                    length: region.length - length,
                    in_use: false,
                },
            );
        }
        table.slots[index] = Region {
            start: region.start,
            length,
            in_use: true,
        };

        debug!("allocated {length} bytes at {}", region.start);
        Ok(region.start)
    }

    /// Return the region starting at `start`.
    ///
    /// Every page of the region is unbound and its frame returned, the
    /// region becomes free and merges with free neighbours, and cached
    /// translations are flushed. Pages in the identity-mapped prefix stay
    /// bound.
    ///
    /// # Errors
    /// - [`RegionError::InvalidRelease`] unless `start` is the exact start of
    ///   an in-use region.
    /// - [`RegionError::Paging`] if some page could not be freed; every page
    ///   is checked first, so the region stays in use with all its pages
    ///   still bound.
    pub fn release(&self, start: VirtualAddress) -> Result<(), RegionError> {
        let mut table = self.regions.lock();
        let Some(index) = table
            .iter()
            .position(|region| region.in_use && region.start == start)
        else {
            error!("release of {start}, which starts no in-use region");
            return Err(RegionError::InvalidRelease { address: start });
        };

        let region = table.slots[index];
        let first = region.start.page();
        let pages = region.length / PAGE_SIZE;
        self.aspace.check_free(first, pages)?;
        for n in 0..pages {
            self.aspace.free_page(first + n)?;
        }

        table.slots[index].in_use = false;
        table.coalesce(index);
        drop(table);

        if self.aspace.lifecycle() == Lifecycle::Active {
            self.aspace.load();
        }
        debug!("released {} bytes at {start}", region.length);
        Ok(())
    }
}

impl<M: Mmu, A: FrameAlloc, const N: usize> RegionPool for VmPool<'_, M, A, N> {
    fn is_legitimate(&self, address: VirtualAddress) -> bool {
        self.regions
            .lock()
            .iter()
            .any(|region| region.in_use && region.contains(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::BitmapFrameAlloc;
    use kernel_memory_addresses::{FrameNumber, PhysicalAddress};
    use kernel_vmem::sim::SimMachine;

    const PAGE: u32 = PAGE_SIZE;

    fn frames(sim: &SimMachine) -> SpinLock<BitmapFrameAlloc<'_>> {
        let pool = unsafe { BitmapFrameAlloc::new(sim, FrameNumber::new(1024), 64, None) };
        SpinLock::new(pool.unwrap())
    }

    fn total_length<const N: usize>(table: &RegionTable<N>) -> u32 {
        table.iter().map(|region| region.length).sum()
    }

    fn is_tiled<const N: usize>(table: &RegionTable<N>, base: u32, size: u32) -> bool {
        let mut next = base;
        for region in table.iter() {
            if region.start.as_u32() != next {
                return false;
            }
            next = region.end();
        }
        next == base + size
    }

    #[test]
    fn allocate_rounds_up_and_splits() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        let pool = VmPool::<_, _, 8>::new(VirtualAddress::new(0x1000), 16 * PAGE, &aspace).unwrap();

        let start = pool.allocate(3 * PAGE + 1).unwrap();
        assert_eq!(start, VirtualAddress::new(0x1000));

        let regions = pool.regions();
        assert_eq!(
            regions.as_slice(),
            &[
                Region { start: VirtualAddress::new(0x1000), length: 4 * PAGE, in_use: true },
                Region { start: VirtualAddress::new(0x5000), length: 12 * PAGE, in_use: false },
            ]
        );
    }

    #[test]
    fn release_restores_a_single_free_region() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        let pool = VmPool::<_, _, 8>::new(VirtualAddress::new(0x1000), 16 * PAGE, &aspace).unwrap();

        let start = pool.allocate(3 * PAGE + 1).unwrap();
        pool.release(start).unwrap();

        assert_eq!(
            pool.regions().as_slice(),
            &[Region { start: VirtualAddress::new(0x1000), length: 16 * PAGE, in_use: false }]
        );
        // The identity map below 4 MiB is untouched.
        assert_eq!(aspace.translate(start), Some(PhysicalAddress::new(0x1000)));
    }

    #[test]
    fn release_across_the_identity_boundary_frees_the_upper_pages() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        aspace.load();
        aspace.enable_paging().unwrap();
        let base = 0x0040_0000 - 2 * PAGE;
        let pool = VmPool::<_, _, 8>::new(VirtualAddress::new(base), 8 * PAGE, &aspace).unwrap();

        let start = pool.allocate(4 * PAGE).unwrap();
        let upper = start + 2 * PAGE;
        sim.touch(&aspace, upper, true).unwrap();
        sim.touch(&aspace, upper + PAGE, true).unwrap();
        let free = frames.lock().free_frames();

        pool.release(start).unwrap();
        assert_eq!(frames.lock().free_frames(), free + 2);
        assert_eq!(aspace.translate(upper), None);
        assert!(aspace.translate(start).is_some());
        assert_eq!(pool.regions().len(), 1);
    }

    #[test]
    fn refused_release_keeps_every_page_bound() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        aspace.load();
        aspace.enable_paging().unwrap();
        let pool = VmPool::<_, _, 8>::new(VirtualAddress::new(0x1000_0000), 8 * PAGE, &aspace).unwrap();

        let start = pool.allocate(3 * PAGE).unwrap();
        let bound: Vec<_> = (0..3)
            .map(|n| sim.touch(&aspace, start + n * PAGE, true).unwrap())
            .collect();
        // Hand the last frame back behind the pool's back.
        frames.lock().release(bound[2].frame()).unwrap();

        assert_eq!(
            pool.release(start),
            Err(RegionError::Paging(PagingError::InvalidRelease { frame: bound[2].frame() }))
        );
        for (n, pa) in (0..3).zip(&bound) {
            assert_eq!(aspace.translate(start + n * PAGE), Some(*pa));
        }
        assert!(pool.is_legitimate(start));
        assert!(pool.regions().as_slice()[0].in_use);
    }

    #[test]
    fn first_fit_reuses_released_regions() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        let pool = VmPool::<_, _, 8>::new(VirtualAddress::new(0x1000_0000), 16 * PAGE, &aspace).unwrap();

        let a = pool.allocate(2 * PAGE).unwrap();
        let b = pool.allocate(PAGE).unwrap();
        let c = pool.allocate(4 * PAGE).unwrap();
        assert_eq!(b, a + 2 * PAGE);
        assert_eq!(c, b + PAGE);

        pool.release(a).unwrap();
        // Fits into the hole left by `a`; the first match wins.
        assert_eq!(pool.allocate(PAGE).unwrap(), a);
        // Too large for what is left of the hole.
        assert_eq!(pool.allocate(2 * PAGE).unwrap(), c + 4 * PAGE);
    }

    #[test]
    fn release_merges_with_both_neighbours() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        let pool = VmPool::<_, _, 8>::new(VirtualAddress::new(0x1000_0000), 8 * PAGE, &aspace).unwrap();

        let a = pool.allocate(PAGE).unwrap();
        let b = pool.allocate(PAGE).unwrap();
        let c = pool.allocate(PAGE).unwrap();
        pool.release(a).unwrap();
        pool.release(c).unwrap();
        assert_eq!(pool.regions().len(), 3);

        pool.release(b).unwrap();
        assert_eq!(pool.regions().len(), 1);
        assert!(!pool.regions().as_slice()[0].in_use);
    }

    #[test]
    fn split_and_merge_preserve_the_pool_size() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        let base = 0x2000_0000;
        let size = 32 * PAGE;
        let pool = VmPool::<_, _, 16>::new(VirtualAddress::new(base), size, &aspace).unwrap();

        let mut live = Vec::new();
        for (step, bytes) in [PAGE, 3 * PAGE + 7, 1, 5 * PAGE, 2 * PAGE, 9].into_iter().enumerate() {
            live.push(pool.allocate(bytes).unwrap());
            if step % 2 == 1 {
                pool.release(live.remove(0)).unwrap();
            }
            let table = pool.regions();
            assert_eq!(total_length(&table), size);
            assert!(is_tiled(&table, base, size));
        }
        for start in live {
            pool.release(start).unwrap();
            let table = pool.regions();
            assert_eq!(total_length(&table), size);
            assert!(is_tiled(&table, base, size));
        }
        assert_eq!(pool.regions().len(), 1);
    }

    #[test]
    fn legitimacy_covers_in_use_regions_only() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        let pool = VmPool::<_, _, 8>::new(VirtualAddress::new(0x1000_0000), 8 * PAGE, &aspace).unwrap();

        let a = pool.allocate(2 * PAGE).unwrap();
        assert!(pool.is_legitimate(a));
        assert!(pool.is_legitimate(a + (2 * PAGE - 1)));
        assert!(!pool.is_legitimate(a + 2 * PAGE));
        assert!(!pool.is_legitimate(VirtualAddress::new(0x0FFF_FFFF)));

        pool.release(a).unwrap();
        assert!(!pool.is_legitimate(a));
    }

    #[test]
    fn exhausted_pool_reports_no_fit() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        let pool = VmPool::<_, _, 8>::new(VirtualAddress::new(0x1000_0000), 4 * PAGE, &aspace).unwrap();

        assert_eq!(pool.allocate(0), Err(RegionError::ZeroSize));
        assert_eq!(pool.allocate(5 * PAGE), Err(RegionError::NoFit { length: 5 * PAGE }));
        pool.allocate(4 * PAGE).unwrap();
        assert_eq!(pool.allocate(1), Err(RegionError::NoFit { length: PAGE }));
        assert_eq!(pool.allocate(u32::MAX), Err(RegionError::NoFit { length: u32::MAX }));
    }

    #[test]
    fn full_table_allows_exact_fits_only() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        let pool = VmPool::<_, _, 2>::new(VirtualAddress::new(0x1000_0000), 4 * PAGE, &aspace).unwrap();

        pool.allocate(PAGE).unwrap();
        assert_eq!(pool.regions().len(), 2);
        assert_eq!(pool.allocate(PAGE), Err(RegionError::OutOfRegionSlots));
        assert_eq!(pool.allocate(3 * PAGE).unwrap(), VirtualAddress::new(0x1000_1000));
    }

    #[test]
    fn release_needs_the_exact_start_of_an_in_use_region() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();
        let pool = VmPool::<_, _, 8>::new(VirtualAddress::new(0x1000_0000), 8 * PAGE, &aspace).unwrap();

        let a = pool.allocate(2 * PAGE).unwrap();
        let interior = a + PAGE;
        assert_eq!(pool.release(interior), Err(RegionError::InvalidRelease { address: interior }));
        let free = a + 2 * PAGE;
        assert_eq!(pool.release(free), Err(RegionError::InvalidRelease { address: free }));
        assert!(pool.is_legitimate(a));

        pool.release(a).unwrap();
        assert_eq!(pool.release(a), Err(RegionError::InvalidRelease { address: a }));
    }

    #[test]
    fn pool_range_is_validated() {
        let sim = SimMachine::new();
        let frames = frames(&sim);
        let aspace = AddressSpace::new(&sim, &frames, &frames).unwrap();

        let new = |base: u32, size: u32| VmPool::<_, _, 4>::new(VirtualAddress::new(base), size, &aspace).err();
        assert_eq!(new(0x1000, 0), Some(RegionError::ZeroSize));
        assert_eq!(new(0x1001, PAGE), Some(RegionError::Misaligned { address: VirtualAddress::new(0x1001) }));
        assert_eq!(new(0x1000, 10), Some(RegionError::Misaligned { address: VirtualAddress::new(0x100A) }));
        assert_eq!(new(0xFFBF_F000, 2 * PAGE), Some(RegionError::InvalidRange));
        assert_eq!(new(0xFFFF_F000, 2 * PAGE), Some(RegionError::InvalidRange));
        assert_eq!(new(0xFFBF_F000, PAGE), None);
    }

    #[test]
    fn default_slot_count_fills_a_frame() {
        assert_eq!(DEFAULT_REGION_SLOTS, 4096 / 12);
    }
}
