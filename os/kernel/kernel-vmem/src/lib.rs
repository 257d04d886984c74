//! # Virtual Memory Support
//!
//! Two-level x86 (32-bit) paging for a small teaching kernel.
//!
//! ## What you get
//! - An [`AddressSpace`] that owns one page directory, resolves page faults by
//!   binding frames on demand and releases pages again.
//! - A bit-exact [`PageEntryBits`] / [`PageTableEntry`] for directory and
//!   table entries, and 4 KiB-aligned [`PageTable`] / [`PageDirectory`] types.
//! - The [`self_map`] aliases through which the active directory edits itself.
//! - The [`PageFaultError`] error code and its decoded [`FaultCause`].
//! - Small collaborator interfaces: [`FrameAlloc`], [`PhysMapper`], [`Mmu`]
//!   and [`RegionPool`].
//!
//! ## Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 ──► PD ──► PT ──► Physical Page
//!          │       │
//!          │       └───► PTE (Page Table Entry)     → maps one 4 KiB page
//!          └───────────► PDE (Page Directory Entry) → points at a PT
//! ```
//!
//! | Level | Table | Entry | Covers per entry |
//! |:------|:------|:------|:-----------------|
//! | 1 | **PD** (Page Directory) | **PDE** | 4 MiB |
//! | 2 | **PT** (Page Table) | **PTE** | 4 KiB |
//!
//! ## The self map
//!
//! The last directory slot (1023) points at the directory itself. The CPU
//! then treats the directory as a page table for the top 4 MiB of the
//! address space, which makes every table reachable at a fixed address:
//!
//! ```text
//! 0xFFC0_0000 + i * 0x1000   page table behind directory slot i
//! 0xFFFF_F000                the directory itself (slot 1023 twice)
//! ```
//!
//! Before paging is on the tables are reached through their physical
//! addresses instead. [`AddressSpace`] picks the right form from the current
//! hardware state, see [`Lifecycle`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

pub mod address_space;
mod page_entry_bits;
pub mod page_fault;
pub mod page_table;
pub mod self_map;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, Lifecycle, MAX_REGISTERED_POOLS, PagingError};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_fault::{FaultCause, PageFaultError};
pub use crate::page_table::pd::{DirectoryIndex, PageDirectory};
pub use crate::page_table::pt::{PageTable, TableIndex};
pub use crate::page_table::{ENTRIES_PER_TABLE, PageTableEntry};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{FrameNumber, PhysicalAddress, VirtualAddress};

/// Source of **physical** 4 KiB frames.
///
/// The implementation decides where frames come from (bitmap pool, bump
/// region, etc.). `acquire` returns `None` when the pool is exhausted; that
/// is an expected condition and callers must check for it.
pub trait FrameAlloc {
    /// Reason a release was refused.
    type Error: core::fmt::Display;

    /// Take one free frame.
    fn acquire(&mut self) -> Option<FrameNumber>;

    /// Give a frame back.
    ///
    /// # Errors
    /// The frame is not owned by this allocator or may not be released.
    fn release(&mut self, frame: FrameNumber) -> Result<(), Self::Error>;

    /// Whether `release(frame)` would succeed, without releasing anything.
    ///
    /// # Errors
    /// The refusal `release` would report.
    fn check_release(&self, frame: FrameNumber) -> Result<(), Self::Error>;
}

/// Converts physical addresses to *temporarily* usable references.
///
/// Before paging is enabled the kernel runs on physical addresses, so the
/// identity mapping is the usual implementation. Host tests back it with
/// simulated memory.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be reachable and writable in the current execution mode.
    /// - `T` must match the bytes at `pa`, and no other live reference may
    ///   alias them for `'a`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// The paging hardware as seen by [`AddressSpace`].
///
/// On x86 this is CR0.PG, CR2, CR3, the page-fault error code and `invlpg`.
pub trait Mmu: PhysMapper {
    /// The linear address of the most recent page fault (CR2).
    fn fault_address(&self) -> VirtualAddress;

    /// The error code pushed with the most recent page fault.
    fn fault_error(&self) -> PageFaultError;

    /// Physical base of the directory currently loaded (CR3).
    fn translation_base(&self) -> PhysicalAddress;

    /// Load a new directory. Flushes all cached translations.
    ///
    /// # Safety
    /// `pa` must hold a valid directory that maps the running code.
    unsafe fn set_translation_base(&self, pa: PhysicalAddress);

    /// Whether linear addresses are currently translated (CR0.PG).
    fn paging_enabled(&self) -> bool;

    /// # Safety
    /// The loaded directory must map the running code and stack.
    unsafe fn set_paging_enabled(&self, enabled: bool);

    /// Drop the cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Convert a *virtual* address of the active space to a reference.
    ///
    /// # Safety
    /// Same requirements as [`PhysMapper::phys_to_mut`]; additionally `va`
    /// must be mapped.
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;
}

/// A virtual-region allocator the fault handler can consult.
pub trait RegionPool {
    /// Whether `address` lies inside a region that is currently handed out.
    fn is_legitimate(&self, address: VirtualAddress) -> bool;
}
