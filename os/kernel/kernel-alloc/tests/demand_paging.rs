use kernel_alloc::boot::{FramePools, boot_address_space};
use kernel_alloc::vm_pool::{RegionError, VmPool};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::sim::SimMachine;
use kernel_vmem::{Lifecycle, PagingError, RegionPool};

const HEAP_BASE: u32 = 0x4000_0000;
const HEAP_SIZE: u32 = 64 * PAGE_SIZE;

#[test]
fn regions_are_backed_lazily_and_released_completely() {
    let sim = SimMachine::new();
    let pools = unsafe { FramePools::init(&sim) }.unwrap();
    let aspace = boot_address_space(&sim, &pools).unwrap();
    let heap = VmPool::<_, _, 16>::new(VirtualAddress::new(HEAP_BASE), HEAP_SIZE, &aspace).unwrap();
    heap.register().unwrap();
    assert_eq!(aspace.registered_pools(), 1);

    let free_after_boot = pools.process.lock().free_frames();
    let buffer = heap.allocate(3 * PAGE_SIZE + 1).unwrap();
    assert_eq!(buffer, VirtualAddress::new(HEAP_BASE));
    // Allocation alone binds nothing.
    assert_eq!(pools.process.lock().free_frames(), free_after_boot);

    for page in 0..4 {
        sim.touch(&aspace, buffer + page * PAGE_SIZE, true).unwrap();
    }
    // One second-level table plus four pages.
    assert_eq!(pools.process.lock().free_frames(), free_after_boot - 5);

    // Touching again is free.
    sim.touch(&aspace, buffer + 17, false).unwrap();
    assert_eq!(pools.process.lock().free_frames(), free_after_boot - 5);

    let loads = sim.translation_loads();
    heap.release(buffer).unwrap();
    assert_eq!(sim.translation_loads(), loads + 1);
    assert!(!sim.is_cached(buffer));
    assert!(!heap.is_legitimate(buffer));
    assert_eq!(aspace.translate(buffer), None);

    // The table stays; every page frame is back.
    assert_eq!(pools.process.lock().free_frames(), free_after_boot - 1);
    assert_eq!(aspace.lifecycle(), Lifecycle::Active);
}

#[test]
fn faults_outside_live_regions_are_refused() {
    let sim = SimMachine::new();
    let pools = unsafe { FramePools::init(&sim) }.unwrap();
    let aspace = boot_address_space(&sim, &pools).unwrap();
    let heap = VmPool::<_, _, 16>::new(VirtualAddress::new(HEAP_BASE), HEAP_SIZE, &aspace).unwrap();
    heap.register().unwrap();

    let free = pools.process.lock().free_frames();

    // Inside the pool, but not handed out.
    let unallocated = VirtualAddress::new(HEAP_BASE + 8 * PAGE_SIZE);
    assert_eq!(
        sim.touch(&aspace, unallocated, true),
        Err(PagingError::StrayAccess { address: unallocated })
    );

    // Outside every pool.
    let wild = VirtualAddress::new(0x7000_0000);
    assert_eq!(
        sim.touch(&aspace, wild, false),
        Err(PagingError::StrayAccess { address: wild })
    );

    // Released regions turn stray again.
    let region = heap.allocate(PAGE_SIZE).unwrap();
    sim.touch(&aspace, region, true).unwrap();
    heap.release(region).unwrap();
    assert_eq!(
        sim.touch(&aspace, region, true),
        Err(PagingError::StrayAccess { address: region })
    );

    // Only the table frame for the heap's directory slot remains bound.
    assert_eq!(pools.process.lock().free_frames(), free - 1);
}

#[test]
fn two_pools_share_one_address_space() {
    let sim = SimMachine::new();
    let pools = unsafe { FramePools::init(&sim) }.unwrap();
    let aspace = boot_address_space(&sim, &pools).unwrap();
    let code = VmPool::<_, _, 8>::new(VirtualAddress::new(0x0800_0000), 16 * PAGE_SIZE, &aspace).unwrap();
    let heap = VmPool::<_, _, 8>::new(VirtualAddress::new(HEAP_BASE), HEAP_SIZE, &aspace).unwrap();
    code.register().unwrap();
    heap.register().unwrap();

    let text = code.allocate(2 * PAGE_SIZE).unwrap();
    let data = heap.allocate(PAGE_SIZE).unwrap();
    let text_pa = sim.touch(&aspace, text, false).unwrap();
    let data_pa = sim.touch(&aspace, data, true).unwrap();
    assert_ne!(text_pa.frame(), data_pa.frame());

    assert!(code.is_legitimate(text));
    assert!(!code.is_legitimate(data));
    assert!(heap.is_legitimate(data));

    heap.release(data).unwrap();
    assert!(sim.touch(&aspace, text + PAGE_SIZE, true).is_ok());
}

#[test]
fn running_out_of_frames_is_reported_and_recoverable() {
    let sim = SimMachine::new();
    let pools = unsafe { FramePools::init(&sim) }.unwrap();
    let aspace = boot_address_space(&sim, &pools).unwrap();
    let heap = VmPool::<_, _, 8>::new(VirtualAddress::new(HEAP_BASE), HEAP_SIZE, &aspace).unwrap();
    heap.register().unwrap();

    let region = heap.allocate(2 * PAGE_SIZE).unwrap();
    sim.touch(&aspace, region, true).unwrap();

    // Drain the pool.
    let mut hoard = Vec::new();
    while let Some(frame) = pools.process.lock().acquire() {
        hoard.push(frame);
    }

    let second = region + PAGE_SIZE;
    assert_eq!(sim.touch(&aspace, second, true), Err(PagingError::OutOfFrames));
    assert_eq!(aspace.translate(second), None);

    pools.release_frame(hoard.pop().unwrap()).unwrap();
    assert!(sim.touch(&aspace, second, true).is_ok());
}

#[test]
fn release_errors_surface_through_the_region_allocator() {
    let sim = SimMachine::new();
    let pools = unsafe { FramePools::init(&sim) }.unwrap();
    let aspace = boot_address_space(&sim, &pools).unwrap();
    let heap = VmPool::<_, _, 8>::new(VirtualAddress::new(HEAP_BASE), HEAP_SIZE, &aspace).unwrap();

    let region = heap.allocate(PAGE_SIZE).unwrap();
    assert_eq!(
        heap.release(region + 1),
        Err(RegionError::InvalidRelease { address: region + 1 })
    );

    // Without registration every not-present fault is served.
    assert_eq!(aspace.registered_pools(), 0);
    assert!(sim.touch(&aspace, VirtualAddress::new(0x7000_0000), true).is_ok());
}

#[test]
fn regions_over_the_identity_map_release_cleanly() {
    let sim = SimMachine::new();
    let pools = unsafe { FramePools::init(&sim) }.unwrap();
    let aspace = boot_address_space(&sim, &pools).unwrap();
    let low = VmPool::<_, _, 8>::new(VirtualAddress::new(0x1000), 16 * PAGE_SIZE, &aspace).unwrap();
    low.register().unwrap();

    let start = low.allocate(3 * PAGE_SIZE + 1).unwrap();
    assert_eq!(start, VirtualAddress::new(0x1000));
    let free = pools.process.lock().free_frames();

    low.release(start).unwrap();
    assert_eq!(low.regions().len(), 1);
    assert!(!low.regions().as_slice()[0].in_use);
    assert!(!low.is_legitimate(start));
    assert_eq!(pools.process.lock().free_frames(), free);
    assert_eq!(aspace.translate(start), Some(PhysicalAddress::new(0x1000)));
}

#[test]
fn regions_straddling_the_identity_boundary_release_their_upper_pages() {
    let sim = SimMachine::new();
    let pools = unsafe { FramePools::init(&sim) }.unwrap();
    let aspace = boot_address_space(&sim, &pools).unwrap();
    let base = VirtualAddress::new(0x0040_0000 - 2 * PAGE_SIZE);
    let pool = VmPool::<_, _, 8>::new(base, 8 * PAGE_SIZE, &aspace).unwrap();
    pool.register().unwrap();

    let start = pool.allocate(4 * PAGE_SIZE).unwrap();
    for page in 0..4 {
        sim.touch(&aspace, start + page * PAGE_SIZE, true).unwrap();
    }
    let free = pools.process.lock().free_frames();

    pool.release(start).unwrap();
    // Two demand-paged frames come back; the new table stays.
    assert_eq!(pools.process.lock().free_frames(), free + 2);
    assert_eq!(aspace.translate(VirtualAddress::new(0x0040_0000)), None);
    assert!(aspace.translate(start).is_some());
    assert_eq!(pool.regions().len(), 1);
}

#[test]
fn refused_release_leaves_every_page_bound() {
    let sim = SimMachine::new();
    let pools = unsafe { FramePools::init(&sim) }.unwrap();
    let aspace = boot_address_space(&sim, &pools).unwrap();
    let heap = VmPool::<_, _, 8>::new(VirtualAddress::new(HEAP_BASE), HEAP_SIZE, &aspace).unwrap();
    heap.register().unwrap();

    let region = heap.allocate(4 * PAGE_SIZE).unwrap();
    let bound: Vec<_> = (0..4)
        .map(|page| sim.touch(&aspace, region + page * PAGE_SIZE, true).unwrap())
        .collect();

    // The third frame goes back to the pool without unbinding it.
    pools.release_frame(bound[2].frame()).unwrap();
    let free = pools.process.lock().free_frames();

    assert_eq!(
        heap.release(region),
        Err(RegionError::Paging(PagingError::InvalidRelease { frame: bound[2].frame() }))
    );
    for (page, pa) in (0..4).zip(&bound) {
        assert_eq!(aspace.translate(region + page * PAGE_SIZE), Some(*pa));
    }
    assert_eq!(pools.process.lock().free_frames(), free);
    assert!(heap.is_legitimate(region));
}
