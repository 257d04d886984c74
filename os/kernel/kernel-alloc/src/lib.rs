//! # Kernel Memory Allocation
//!
//! Physical frame pools, per-address-space virtual regions and the boot
//! sequence that ties them to the paging code in `kernel-vmem`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Virtual-Region Allocator               │
//! │    • page-granular regions, first fit               │
//! │    • exact-start release, neighbour merging         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ registers with, frees pages through
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Address Space (kernel-vmem)                  │
//! │    • demand paging in the fault handler             │
//! │    • self-mapped page directory                     │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ acquires / releases frames
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • one bit per 4 KiB frame                        │
//! │    • lowest free frame first                        │
//! │    • reserved ranges for memory holes               │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! - [`frame_alloc`]: [`BitmapFrameAlloc`](frame_alloc::BitmapFrameAlloc),
//!   a no-heap bitmap allocator over a fixed frame range.
//! - [`vm_pool`]: [`VmPool`](vm_pool::VmPool), the region allocator that
//!   sits on top of an [`AddressSpace`](kernel_vmem::AddressSpace).
//! - [`boot`]: [`FramePools`](boot::FramePools) and
//!   [`boot_address_space`](boot::boot_address_space).
//! - [`phys_mapper`]: identity [`PhysMapper`](kernel_vmem::PhysMapper).
//! - `x86_mmu`: the real paging hardware (32-bit x86 targets only).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kernel_alloc::boot::{FramePools, boot_address_space};
//! use kernel_alloc::vm_pool::VmPool;
//! use kernel_alloc::x86_mmu::X86Mmu;
//! use kernel_memory_addresses::VirtualAddress;
//!
//! let mmu = X86Mmu::new();
//! let pools = unsafe { FramePools::init(&mmu)? };
//! let aspace = boot_address_space(&mmu, &pools)?;
//!
//! let heap = VmPool::<_, _>::new(VirtualAddress::new(0x4000_0000), 0x10_0000, &aspace)?;
//! heap.register()?;
//! let buffer = heap.allocate(3 * 4096)?;
//! // ...first touch of `buffer` faults and binds a frame...
//! heap.release(buffer)?;
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot;
pub mod frame_alloc;
pub mod phys_mapper;
pub mod vm_pool;

#[cfg(target_arch = "x86")]
pub mod x86_mmu;
