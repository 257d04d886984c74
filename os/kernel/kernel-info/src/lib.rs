//! # Kernel Memory Configuration
//!
//! Compile-time description of the physical memory layout the memory
//! management core works with. All values are `const` and checked by
//! compile-time assertions, so an inconsistent layout fails the build rather
//! than the boot.
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Kernel image, low memory       │ identity mapped
//! 0x0020_0000 ├─────────────────────────────────┤ KERNEL_POOL_START_FRAME (2 MiB)
//!             │  Kernel frame pool (2 MiB)      │ identity mapped
//! 0x0040_0000 ├─────────────────────────────────┤ PROCESS_POOL_START_FRAME (4 MiB)
//!             │  Process frame pool             │
//! 0x00F0_0000 │  ┌───────────────────────────┐  │ MEMORY_HOLE_START_FRAME (15 MiB)
//!             │  │  Memory hole (1 MiB)      │  │ never handed out
//! 0x0100_0000 │  └───────────────────────────┘  │
//!             │                                 │
//! 0x0200_0000 └─────────────────────────────────┘ end of process pool (32 MiB)
//! ```
//!
//! Everything below [`SHARED_SIZE`](memory::SHARED_SIZE) is identity mapped
//! by every address space, which keeps the kernel reachable across the
//! switch to paged addressing.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
