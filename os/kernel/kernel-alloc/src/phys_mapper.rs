//! # Identity PhysMapper
//!
//! Until paging is on, and for the low 4 MiB afterwards, every physical
//! address is also a usable virtual address. That is all the frame pools and
//! the directory bootstrap need.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::IdentityPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//! let mapper = IdentityPhysMapper;
//! unsafe {
//!     let table: &mut PageTable = mapper.phys_to_mut(PhysicalAddress::new(0x0020_0000));
//!     table.zero();
//! }
//! ```

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for identity-mapped physical memory.
///
/// # Safety
/// - Paging must be off, or `pa` must lie in the identity-mapped low 4 MiB.
/// - The returned reference must only be used for valid, writable memory.
#[derive(Copy, Clone, Debug, Default)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = pa.as_usize() as *mut T;
        // SAFETY: Caller must ensure the physical address is identity mapped.
        unsafe { &mut *ptr }
    }
}
