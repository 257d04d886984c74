//! # Boot Wiring
//!
//! Builds the two system frame pools from the fixed layout in
//! [`kernel_info::memory`] and brings up the first address space.
//!
//! ```text
//!  2 MiB            4 MiB                 15 MiB     16 MiB            32 MiB
//!    ┌───────────────┬──────────────────────┬──────────┬─────────────────┐
//!    │  kernel pool  │         process pool │   hole   │                 │
//!    └───────────────┴──────────────────────┴──────────┴─────────────────┘
//!     bitmap: own      bitmap: a kernel-pool frame, hole reserved
//! ```

use crate::frame_alloc::{BitmapFrameAlloc, FrameError};
use kernel_info::memory::{
    KERNEL_POOL_FRAMES, KERNEL_POOL_START_FRAME, MEMORY_HOLE_FRAMES, MEMORY_HOLE_START_FRAME,
    PROCESS_POOL_FRAMES, PROCESS_POOL_START_FRAME,
};
use kernel_memory_addresses::FrameNumber;
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, Mmu, PagingError, PhysMapper};
use log::{error, info};

/// The kernel and process frame pools.
pub struct FramePools<'m> {
    pub kernel: SpinLock<BitmapFrameAlloc<'m>>,
    pub process: SpinLock<BitmapFrameAlloc<'m>>,
}

impl FramePools<'_> {
    /// Create both pools and wall off the memory hole.
    ///
    /// # Safety
    /// Physical memory of both pools must be reachable through `mapper` and
    /// unused by anything else.
    ///
    /// # Errors
    /// Only on an inconsistent layout; see [`FrameError`].
    pub unsafe fn init<M: PhysMapper>(mapper: &M) -> Result<Self, FrameError> {
        // SAFETY: forwarded to the caller.
        let mut kernel =
            unsafe { BitmapFrameAlloc::new(mapper, KERNEL_POOL_START_FRAME, KERNEL_POOL_FRAMES, None)? };
        let bitmap = kernel.acquire().ok_or(FrameError::Exhausted)?;
        // SAFETY: forwarded to the caller; `bitmap` is ours now.
        let mut process = unsafe {
            BitmapFrameAlloc::new(
                mapper,
                PROCESS_POOL_START_FRAME,
                PROCESS_POOL_FRAMES,
                Some(bitmap),
            )?
        };
        process.reserve_range(MEMORY_HOLE_START_FRAME, MEMORY_HOLE_FRAMES)?;

        info!(
            "frame pools ready: kernel {} free, process {} free",
            kernel.free_frames(),
            process.free_frames()
        );
        Ok(Self {
            kernel: SpinLock::new(kernel),
            process: SpinLock::new(process),
        })
    }

    /// Return `frame` to whichever pool owns it.
    ///
    /// The process pool's bitmap lives in a kernel-pool frame and is refused.
    ///
    /// # Errors
    /// [`FrameError::OutsidePool`] if neither pool owns it, or the owning
    /// pool's refusal.
    pub fn release_frame(&self, frame: FrameNumber) -> Result<(), FrameError> {
        if frame == self.process.lock().bitmap_frame() {
            error!("release of {frame}, which holds the process pool bitmap");
            return Err(FrameError::BitmapFrame { frame });
        }
        for pool in [&self.kernel, &self.process] {
            let mut pool = pool.lock();
            if pool.contains(frame) {
                return pool.release(frame);
            }
        }
        error!("release of {frame}, which no pool owns");
        Err(FrameError::OutsidePool { frame })
    }
}

/// Create the first address space from the process pool, load it and turn
/// paging on.
///
/// # Errors
/// See [`AddressSpace::new`] and [`AddressSpace::enable_paging`].
pub fn boot_address_space<'p, 'm, M: Mmu>(
    mmu: &'p M,
    pools: &'p FramePools<'m>,
) -> Result<AddressSpace<'p, M, BitmapFrameAlloc<'m>>, PagingError> {
    let aspace = AddressSpace::new(mmu, &pools.process, &pools.process)?;
    aspace.load();
    aspace.enable_paging()?;
    Ok(aspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualAddress;
    use kernel_vmem::Lifecycle;
    use kernel_vmem::sim::SimMachine;

    #[test]
    fn pools_follow_the_memory_layout() {
        let sim = SimMachine::new();
        let pools = unsafe { FramePools::init(&sim) }.unwrap();

        let kernel = pools.kernel.lock();
        assert_eq!(kernel.bitmap_frame(), FrameNumber::new(512));
        assert_eq!(kernel.free_frames(), 510);
        assert!(!kernel.is_free(FrameNumber::new(513)));
        drop(kernel);

        let process = pools.process.lock();
        assert_eq!(process.base_frame(), FrameNumber::new(1024));
        assert_eq!(process.frame_count(), 7168);
        assert_eq!(process.bitmap_frame(), FrameNumber::new(513));
        assert_eq!(process.free_frames(), 7168 - 256);
        assert!(!process.is_free(FrameNumber::new(3840)));
        assert!(!process.is_free(FrameNumber::new(4095)));
        assert!(process.is_free(FrameNumber::new(4096)));
    }

    #[test]
    fn process_pool_skips_the_hole() {
        let sim = SimMachine::new();
        let pools = unsafe { FramePools::init(&sim) }.unwrap();
        let mut process = pools.process.lock();

        for _ in 1024..3840 {
            process.acquire().unwrap();
        }
        assert_eq!(process.acquire(), Some(FrameNumber::new(4096)));
    }

    #[test]
    fn release_frame_routes_to_the_owner() {
        let sim = SimMachine::new();
        let pools = unsafe { FramePools::init(&sim) }.unwrap();
        let k = pools.kernel.lock().acquire().unwrap();
        let p = pools.process.lock().acquire().unwrap();

        pools.release_frame(k).unwrap();
        pools.release_frame(p).unwrap();
        assert!(pools.kernel.lock().is_free(k));
        assert!(pools.process.lock().is_free(p));

        assert_eq!(
            pools.release_frame(FrameNumber::new(100)),
            Err(FrameError::OutsidePool { frame: FrameNumber::new(100) })
        );
        assert_eq!(
            pools.release_frame(FrameNumber::new(3900)),
            Err(FrameError::Reserved { frame: FrameNumber::new(3900) })
        );
        assert_eq!(
            pools.release_frame(FrameNumber::new(513)),
            Err(FrameError::BitmapFrame { frame: FrameNumber::new(513) })
        );
        assert!(!pools.kernel.lock().is_free(FrameNumber::new(513)));
    }

    #[test]
    fn boot_enables_paging_on_the_process_pool() {
        let sim = SimMachine::new();
        let pools = unsafe { FramePools::init(&sim) }.unwrap();
        let aspace = boot_address_space(&sim, &pools).unwrap();

        assert_eq!(aspace.lifecycle(), Lifecycle::Active);
        assert_eq!(aspace.directory_frame(), FrameNumber::new(1024));
        assert_eq!(pools.process.lock().free_frames(), 7168 - 256 - 2);

        let pa = sim.touch(&aspace, VirtualAddress::new(0x0040_0000), true).unwrap();
        assert_eq!(pa, FrameNumber::new(1027).address());
    }
}
