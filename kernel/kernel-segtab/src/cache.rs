//! # Node and leaf-page caches
//!
//! Page-granularity allocation amortized over the segment-table workload.
//!
//! Two freelists share one cache-line-aligned spin lock:
//!
//! - **Node descriptors.** Backing pages are carved into
//!   [`NODES_PER_PAGE`] descriptors; reusable descriptors are chained
//!   intrusively through slot 0. Descriptor allocation never fails: when both
//!   the freelist and the physical allocator come up empty, the caller sleeps
//!   on the `"segtab"` wait channel and retries.
//! - **Leaf PTE pages** (feature `pte-page-cache`). Whole zero-filled pages
//!   chained through their first word. Leaf allocation *can* fail; the
//!   caller owns the out-of-memory policy.
//!
//! Critical sections manipulate only the list heads and counters. Allocator
//! calls, pool mapping, and audits all happen outside the lock, on storage
//! that is private at that point.
//!
//! Everything entering either list is audited zero first and the link word is
//! cleared (and re-audited) on the way out, so consumers can publish the
//! storage without touching it again.

use crate::audit::{audit_leaf, audit_node};
use crate::node::{NODES_PER_PAGE, Segtab};
use crate::pte::PtePage;
use crate::{PageAlloc, PoolMapper};
use core::ptr::{NonNull, null_mut};
use core::sync::atomic::Ordering;
use kernel_addresses::PhysicalPage;
use log::trace;

/// Heads of the two freelists. Kept deliberately tiny: this is the entire
/// state the spin lock ever covers.
struct FreeLists {
    /// Reusable node descriptors, linked through slot 0.
    nodes: *mut Segtab,
    node_count: usize,
    /// Zero-filled leaf pages, linked through their first word.
    pte_pages: *mut PtePage,
    pte_page_count: usize,
}

// SAFETY: the raw heads are only ever dereferenced by the lock holder.
unsafe impl Send for FreeLists {}

/// Process-wide cache of segment-table storage.
///
/// A kernel embeds exactly one of these as a `static` (construction is
/// `const`); its lifetime is the lifetime of the system. Address spaces hold
/// a reference to it.
pub struct SegtabCache {
    lists: kernel_sync::SpinLock<FreeLists>,
}

impl SegtabCache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lists: kernel_sync::SpinLock::new(FreeLists {
                nodes: null_mut(),
                node_count: 0,
                pte_pages: null_mut(),
                pte_page_count: 0,
            }),
        }
    }

    /// Idle node descriptors currently on the freelist.
    pub fn free_node_count(&self) -> usize {
        self.lists.with_lock(|l| l.node_count)
    }

    /// Zero-filled leaf pages currently cached.
    pub fn cached_pte_pages(&self) -> usize {
        self.lists.with_lock(|l| l.pte_page_count)
    }

    /// Allocate a zeroed node descriptor. Never fails; may sleep through
    /// [`PageAlloc::wait_for_memory`] when the system is out of pages.
    pub(crate) fn alloc_node<A: PageAlloc, M: PoolMapper>(
        &self,
        alloc: &A,
        mapper: &M,
    ) -> NonNull<Segtab> {
        loop {
            if let Some(node) = self.pop_node() {
                return node;
            }
            match alloc.alloc_zero_page() {
                Some(page) => return self.carve_page(mapper, page),
                None => alloc.wait_for_memory("segtab"),
            }
        }
    }

    /// Return a drained node descriptor to the freelist.
    pub(crate) fn free_node(&self, node: NonNull<Segtab>) {
        // SAFETY: the caller passes a node it exclusively owns.
        audit_node(unsafe { node.as_ref() }, "node free");
        self.lists.with_lock(|l| {
            // SAFETY: private until the head is updated below, under the lock.
            unsafe { node.as_ref() }
                .link()
                .store(l.nodes.cast(), Ordering::Relaxed);
            l.nodes = node.as_ptr();
            l.node_count += 1;
        });
    }

    fn pop_node(&self) -> Option<NonNull<Segtab>> {
        let node = self.lists.with_lock(|l| {
            let head = NonNull::new(l.nodes)?;
            // SAFETY: list members stay valid until unlinked; we hold the lock.
            l.nodes = unsafe { head.as_ref() }
                .link()
                .load(Ordering::Relaxed)
                .cast::<Segtab>();
            l.node_count -= 1;
            Some(head)
        })?;
        // The descriptor is private now: disconnect it and check it clean.
        // SAFETY: unlinked above, so no other CPU can reach it.
        unsafe { node.as_ref() }.link().store(null_mut(), Ordering::Relaxed);
        audit_node(unsafe { node.as_ref() }, "node alloc");
        Some(node)
    }

    /// Cut a fresh zero page into node descriptors: the first one is the
    /// caller's, the rest are spliced in front of the freelist.
    fn carve_page<M: PoolMapper>(&self, mapper: &M, page: PhysicalPage) -> NonNull<Segtab> {
        // SAFETY: the allocator just handed out this page zero-filled and
        // unaliased; all-zero bytes are a valid `Segtab`.
        let first: NonNull<Segtab> = unsafe { mapper.map_pool_page(page.base()) };
        if NODES_PER_PAGE > 1 {
            let base = first.as_ptr();
            // Chain descriptors 1.. through slot 0 into a private list, then
            // splice the whole chain in with a single head update.
            for k in 1..NODES_PER_PAGE - 1 {
                // SAFETY: `k + 1 < NODES_PER_PAGE`, so both stay in the page.
                unsafe {
                    (*base.add(k))
                        .link()
                        .store(base.add(k + 1).cast(), Ordering::Relaxed);
                }
            }
            self.lists.with_lock(|l| {
                // SAFETY: the tail descriptor is within the page.
                unsafe {
                    (*base.add(NODES_PER_PAGE - 1))
                        .link()
                        .store(l.nodes.cast(), Ordering::Relaxed);
                }
                // SAFETY: descriptor 1 exists because NODES_PER_PAGE > 1.
                l.nodes = unsafe { base.add(1) };
                l.node_count += NODES_PER_PAGE - 1;
            });
        }
        // SAFETY: freshly mapped above and not yet shared.
        audit_node(unsafe { first.as_ref() }, "node carve");
        trace!("carved {NODES_PER_PAGE} segtab descriptor(s) from a fresh page");
        first
    }

    /// Allocate a zeroed leaf PTE page: cached if possible, fresh otherwise.
    ///
    /// `None` means the allocator is exhausted; the caller decides whether
    /// that is an error or fatal.
    pub(crate) fn alloc_pte_page<A: PageAlloc, M: PoolMapper>(
        &self,
        alloc: &A,
        mapper: &M,
    ) -> Option<NonNull<PtePage>> {
        #[cfg(feature = "pte-page-cache")]
        if let Some(page) = self.pop_pte_page() {
            return Some(page);
        }
        let page = alloc.alloc_zero_page()?;
        // SAFETY: fresh zero page, page-aligned per the allocator contract.
        let leaf: NonNull<PtePage> = unsafe { mapper.map_pool_page(page.base()) };
        // SAFETY: not yet shared.
        unsafe { audit_leaf(leaf, "leaf alloc") };
        Some(leaf)
    }

    /// Recycle an all-zero leaf PTE page: onto the cache when it is enabled,
    /// back to the physical allocator otherwise. Race losers and teardown
    /// both route through here, so a page always rejoins the pool it would
    /// have been served from.
    pub(crate) fn free_pte_page<A: PageAlloc, M: PoolMapper>(
        &self,
        alloc: &A,
        mapper: &M,
        page: NonNull<PtePage>,
    ) {
        // SAFETY: the caller passes a page it exclusively owns.
        unsafe { audit_leaf(page, "leaf free") };
        #[cfg(feature = "pte-page-cache")]
        {
            let _ = (alloc, mapper);
            self.lists.with_lock(|l| {
                // SAFETY: private until the head is updated below, under the lock.
                unsafe { page.as_ptr().cast::<*mut PtePage>().write(l.pte_pages) };
                l.pte_pages = page.as_ptr();
                l.pte_page_count += 1;
            });
        }
        #[cfg(not(feature = "pte-page-cache"))]
        {
            // SAFETY: mapped by `alloc_pte_page` and now unused.
            let pa = unsafe { mapper.unmap_pool_page(page) };
            alloc.free_page(PhysicalPage::from_addr(pa));
        }
    }

    #[cfg(feature = "pte-page-cache")]
    fn pop_pte_page(&self) -> Option<NonNull<PtePage>> {
        let page = self.lists.with_lock(|l| {
            let head = NonNull::new(l.pte_pages)?;
            // SAFETY: list members stay valid until unlinked; we hold the lock.
            l.pte_pages = unsafe { head.as_ptr().cast::<*mut PtePage>().read() };
            l.pte_page_count -= 1;
            Some(head)
        })?;
        // Clear the link so the page is observably all-zero again.
        // SAFETY: unlinked above, so the page is private.
        unsafe { page.as_ptr().cast::<*mut PtePage>().write(null_mut()) };
        unsafe { audit_leaf(page, "leaf alloc") };
        Some(page)
    }

    /// Release every cached leaf page back to the physical allocator.
    ///
    /// A memory-pressure hook for the embedding kernel. Node descriptors are
    /// carved out of shared pages and cannot be regathered, so the descriptor
    /// freelist is left untouched.
    pub fn drain<A: PageAlloc, M: PoolMapper>(&self, alloc: &A, mapper: &M) {
        // Detach the whole list in one critical section; give the pages back
        // outside the lock.
        let mut head = self.lists.with_lock(|l| {
            let head = l.pte_pages;
            l.pte_pages = null_mut();
            l.pte_page_count = 0;
            head
        });
        let mut released = 0_usize;
        while let Some(page) = NonNull::new(head) {
            // SAFETY: the detached chain is private to this call.
            unsafe {
                head = page.as_ptr().cast::<*mut PtePage>().read();
                page.as_ptr().cast::<*mut PtePage>().write(null_mut());
                audit_leaf(page, "leaf drain");
                let pa = mapper.unmap_pool_page(page);
                alloc.free_page(PhysicalPage::from_addr(pa));
            }
            released += 1;
        }
        if released > 0 {
            trace!("drained {released} cached leaf page(s)");
        }
    }
}

impl Default for SegtabCache {
    fn default() -> Self {
        Self::new()
    }
}
