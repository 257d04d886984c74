//! # Typed x86 (32-bit) Control Registers
//!
//! Bitfield models of the control registers the paging code touches:
//!
//! - [`Cr0`](cr0::Cr0): the paging enable bit (`PG`).
//! - [`Cr2`](cr2::Cr2): the linear address of the last page fault.
//! - [`Cr3`](cr3::Cr3): the physical base of the active page directory.
//!
//! Reading and writing the real registers is only compiled with the `asm`
//! feature on a 32-bit x86 target. Everywhere else the types are plain
//! values, which keeps them usable from host-side tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

/// Invalidate the TLB entry covering one linear address (`invlpg`).
///
/// # Safety
/// Privileged instruction; must run in ring 0.
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[inline]
pub unsafe fn invalidate_page(address: kernel_memory_addresses::VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) address.as_u32(), options(nostack, preserves_flags));
    }
}
