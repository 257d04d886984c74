//! # Kernel synchronization primitives
//!
//! A test-and-test-and-set [`SpinLock`] guarding the frame pools, the region
//! tables and the region-pool registry.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
