//! # x86 Paging Hardware
//!
//! [`X86Mmu`] drives the real control registers: CR0.PG, CR2, CR3 and
//! `invlpg`. The page-fault error code is pushed on the stack by the CPU, so
//! the trap stub hands it over through [`X86Mmu::record_fault`] before
//! calling [`AddressSpace::service_fault`](kernel_vmem::AddressSpace::service_fault).

use crate::phys_mapper::IdentityPhysMapper;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr2::Cr2;
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_vmem::{Mmu, PageFaultError, PhysMapper};

pub struct X86Mmu {
    last_error: AtomicU32,
}

impl Default for X86Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl X86Mmu {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_error: AtomicU32::new(0),
        }
    }

    /// Store the error code the CPU pushed for the current `#PF`.
    pub fn record_fault(&self, error_code: u32) {
        self.last_error.store(error_code, Ordering::Relaxed);
    }
}

impl PhysMapper for X86Mmu {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { IdentityPhysMapper.phys_to_mut(pa) }
    }
}

impl Mmu for X86Mmu {
    fn fault_address(&self) -> VirtualAddress {
        // SAFETY: reading CR2 is side-effect free in ring 0.
        unsafe { Cr2::load_unsafe() }.fault_address()
    }

    fn fault_error(&self) -> PageFaultError {
        PageFaultError::from_bits(self.last_error.load(Ordering::Relaxed))
    }

    fn translation_base(&self) -> PhysicalAddress {
        // SAFETY: reading CR3 is side-effect free in ring 0.
        unsafe { Cr3::load_unsafe() }.directory_phys()
    }

    unsafe fn set_translation_base(&self, pa: PhysicalAddress) {
        unsafe { Cr3::from_directory_phys(pa, false, false).store_unsafe() };
    }

    fn paging_enabled(&self) -> bool {
        // SAFETY: reading CR0 is side-effect free in ring 0.
        unsafe { Cr0::load_unsafe() }.pg_paging()
    }

    unsafe fn set_paging_enabled(&self, enabled: bool) {
        unsafe {
            let cr0 = Cr0::load_unsafe().with_pg_paging(enabled);
            cr0.store_unsafe();
        }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        // SAFETY: `invlpg` only drops a cached translation.
        unsafe { kernel_registers::invalidate_page(va) };
    }

    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        let ptr = va.as_usize() as *mut T;
        // SAFETY: forwarded to the caller.
        unsafe { &mut *ptr }
    }
}
