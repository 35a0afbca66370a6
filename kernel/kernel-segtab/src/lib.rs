//! # Segment-Table Engine
//!
//! The per-address-space data structure that turns a virtual address into a
//! pointer to its leaf page-table-entry (PTE) slot, and that manages the
//! lifecycle of the intermediate tables. It sits below a physical-map layer
//! (which owns PTE semantics and decides *when* to reserve or tear down) and
//! above the physical page allocator.
//!
//! ## Tree shape
//!
//! The segment table is a sparsely populated radix tree. Each node holds
//! [`SEGTAB_FANOUT`] child pointers; the leaves are page-sized arrays of
//! opaque PTE words.
//!
//! On 64-bit targets the tree has three levels:
//!
//! ```text
//!  root segtab ──► interior segtab ──► leaf PTE page ──► PTE word
//!       │                │                  │
//!       │                │                  └─ covers one hardware page
//!       │                └─ one slot covers a segment  (2 MiB)
//!       └─ one slot covers an xsegment                 (1 GiB)
//! ```
//!
//! On 32-bit targets the interior level does not exist and the root indexes
//! segments directly:
//!
//! ```text
//!  root segtab ──► leaf PTE page ──► PTE word
//! ```
//!
//! A virtual address decomposes accordingly (64-bit shown):
//!
//! ```text
//! | … | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |   | xseg  |  seg  | leaf  | offset |
//! ```
//!
//! | Level | Index | Selects |
//! |:------|:------|:--------|
//! | root | `XsegIndex` | an interior segtab node |
//! | interior | [`SegIndex`] | a leaf PTE page |
//! | leaf | [`LeafIndex`] | one PTE word |
//!
//! ## Concurrency
//!
//! [`AddressSpace::lookup`] takes no locks: child pointers are published with
//! a release compare-and-swap and observed with acquire loads, so a reader
//! sees either null or a fully zero-initialized child. Two CPUs may race to
//! install the first interior node or leaf page for an address; the loser of
//! the CAS returns its allocation to the matching freelist and adopts the
//! winner's. [`AddressSpace::process`] and [`AddressSpace::destroy`] are
//! *not* safe against concurrent reserves; the owning layer quiesces the
//! space first.
//!
//! ## Caching
//!
//! Node descriptors and (optionally) zero-filled leaf pages are recycled
//! through the process-wide [`SegtabCache`] so that a page fault rarely pays
//! for a full physical-page allocation. Everything on those freelists is
//! observably zero, enforced by a debug-build audit at every insertion and
//! removal.
//!
//! ## Collaborators
//!
//! The physical world is reached through two small traits implemented by the
//! embedding kernel: [`PageAlloc`] (zero-page allocation, free, and the
//! out-of-memory wait channel) and [`PoolMapper`] (physical-to-virtual
//! mapping of table pages, identity on direct-map architectures). Hardware
//! translation registers are loaded through [`MdActivation`] when a space is
//! bound to a CPU.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod audit;
mod cache;
mod cpu;
mod node;
mod pte;
mod space;

#[cfg(test)]
mod test_pool;

pub use cache::SegtabCache;
pub use cpu::{CpuSegtabState, MdActivation, SEGTAB_INVALID};
pub use node::{NODES_PER_PAGE, ROOT_SPAN, SEGTAB_FANOUT, SegIndex, Segtab};
pub use pte::{LeafIndex, PTE_PER_PAGE, Pte, PtePage};
pub use space::{AddressSpace, ReserveError, ReserveFlags, SpaceKind};

#[cfg(target_pointer_width = "64")]
pub use node::XsegIndex;

/// Re-export the address newtypes this crate's API is phrased in.
pub use kernel_addresses as addresses;

use core::ptr::NonNull;
use kernel_addresses::{PhysicalAddress, PhysicalPage};

/// Physical page allocator seam.
///
/// Implementations carry their own synchronization: reserves run concurrently
/// on multiple CPUs, so every method takes `&self`.
pub trait PageAlloc {
    /// Allocate one zero-filled, page-aligned physical page.
    ///
    /// Returns `None` when the system is out of memory; the engine decides
    /// per call site whether that is a reportable condition or fatal.
    fn alloc_zero_page(&self) -> Option<PhysicalPage>;

    /// Return a page previously obtained from
    /// [`alloc_zero_page`](Self::alloc_zero_page).
    fn free_page(&self, page: PhysicalPage);

    /// Block until memory is plausibly available again.
    ///
    /// `wchan` names the waiting subsystem for the scheduler's accounting.
    /// Node-descriptor allocation loops through this instead of failing.
    fn wait_for_memory(&self, wchan: &'static str);
}

/// Pool-page mapping seam: make a physical page dereferenceable.
///
/// On architectures with a direct map this is an offset (or identity)
/// translation; others may install a temporary mapping.
pub trait PoolMapper {
    /// Map the page at `pa` and return it typed as a `T`.
    ///
    /// # Safety
    /// - `pa` must be a page the caller owns, page-aligned, and its contents
    ///   must be valid for `T` (the engine only maps zero-filled pages to
    ///   types for which all-zero bytes are valid).
    /// - The mapping must stay writable until
    ///   [`unmap_pool_page`](Self::unmap_pool_page) is called for it.
    unsafe fn map_pool_page<T>(&self, pa: PhysicalAddress) -> NonNull<T>;

    /// Tear down the mapping for `ptr` and return the backing physical
    /// address.
    ///
    /// # Safety
    /// - `ptr` must have come from [`map_pool_page`](Self::map_pool_page) and
    ///   must not be used afterwards.
    unsafe fn unmap_pool_page<T>(&self, ptr: NonNull<T>) -> PhysicalAddress;
}
