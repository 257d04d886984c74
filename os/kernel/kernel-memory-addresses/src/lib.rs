//! # Physical and Virtual Address Types (32-bit)
//!
//! Strongly typed wrappers for the raw addresses and frame/page numbers used
//! by the paging and frame allocation code.
//!
//! ## Overview
//!
//! The two-level x86 paging scheme works on 32-bit addresses and a single
//! 4 KiB page size. Mixing up a physical address with a virtual one, or a byte
//! address with a frame number, is the classic bug in this kind of code, so
//! every kind gets its own zero-cost type:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory. |
//! | [`VirtualAddress`] | A byte address as seen through the page tables. |
//! | [`FrameNumber`] | Index of a 4 KiB physical frame (`address >> 12`). |
//! | [`PageNumber`] | Index of a 4 KiB virtual page (`address >> 12`). |
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! assert_eq!(va.page(), PageNumber::new(0x401));
//! assert_eq!(va.offset(), 0x234);
//!
//! let frame = FrameNumber::new(600);
//! assert_eq!(frame.address(), PhysicalAddress::new(600 * PAGE_SIZE));
//! assert_eq!(PhysicalAddress::new(0x0025_8FFF).frame(), frame);
//! ```
//!
//! ## Design Notes
//!
//! - All types are `#[repr(transparent)]` over `u32` and implement `Copy`,
//!   `Eq`, `Ord` and `Hash`.
//! - Conversions are `const fn` so they can be used in layout constants.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod frame_number;
mod page_number;
mod physical_address;
mod virtual_address;

pub use crate::frame_number::FrameNumber;
pub use crate::page_number::PageNumber;
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// log2 of [`PAGE_SIZE`]; the number of offset bits in an address.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a page (virtual) and of a frame (physical) in bytes.
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;

/// Mask selecting the in-page offset bits of an address.
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;

/// Number of whole pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::{pages_for, PAGE_SIZE};
/// assert_eq!(pages_for(PAGE_SIZE), 1);
/// assert_eq!(pages_for(PAGE_SIZE + 1), 2);
/// ```
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE)
}
