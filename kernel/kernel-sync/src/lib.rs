//! # Kernel synchronization primitives
//!
//! The one primitive the memory-management layer needs: a small spin lock
//! whose storage occupies a full cache line, so a process-wide singleton
//! (e.g. a freelist head) does not false-share with its neighbors.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
