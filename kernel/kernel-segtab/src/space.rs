//! # Address Space
//!
//! One segment table rooted per address space, with the four operations the
//! physical-map layer drives it with:
//!
//! - [`AddressSpace::lookup`] walks root to leaf without locking.
//! - [`AddressSpace::reserve`] makes the leaf PTE slot for an address exist,
//!   installing interior nodes and leaf pages on demand with a
//!   compare-and-swap against concurrent faults on other CPUs.
//! - [`AddressSpace::process`] enumerates the populated segments of a range
//!   and hands each one to a callback; it frees nothing.
//! - [`AddressSpace::destroy`] tears the whole tree down, reporting each leaf
//!   to an optional callback and recycling every page.
//!
//! ## Design
//!
//! - The root pointer is installed once and keeps its identity for the life
//!   of the space; only `destroy` clears it. Readers may therefore cache it.
//! - Install races are resolved slot-locally: whoever loses the CAS frees its
//!   never-published allocation back to the matching freelist and adopts the
//!   winner. No slot is ever overwritten once non-null.
//! - `process` and `destroy` assume the space is quiesced; `reserve` and
//!   `lookup` assume nothing.
//!
//! ## Safety
//!
//! The engine hands out raw PTE slot pointers. They stay valid until the
//! leaf's segment is torn down by `destroy`; writing through them is the PTE
//! policy's business, not this layer's.

use crate::audit::{audit_leaf_aligned, audit_node};
use crate::cache::SegtabCache;
use crate::node::{ROOT_SPAN, SEGTAB_FANOUT, SegIndex, Segtab};
use crate::pte::{LeafIndex, Pte, PtePage};
use crate::{PageAlloc, PoolMapper};
use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicPtr, Ordering};
use kernel_addresses::{SegSpan, Span, VirtualAddress};
use log::trace;

#[cfg(target_pointer_width = "64")]
use crate::node::XsegIndex;
#[cfg(target_pointer_width = "64")]
use kernel_addresses::XsegSpan;

bitflags::bitflags! {
    /// Behavior flags for [`AddressSpace::reserve`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct ReserveFlags: u32 {
        /// Report leaf-page exhaustion as an error instead of halting.
        ///
        /// Applies only to the leaf PTE page; interior node allocation
        /// always succeeds (it sleeps for memory instead).
        const CAN_FAIL = 1 << 0;
    }
}

/// The one reportable failure of this layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReserveError {
    /// No leaf PTE page could be allocated and the caller opted into
    /// [`ReserveFlags::CAN_FAIL`].
    #[error("out of memory for a leaf PTE page")]
    OutOfMemory,
}

/// Whether a space translates user or kernel addresses.
///
/// Kernel spaces exist in the same tree shape but are never published through
/// the per-CPU user-translation pointers; activation installs a trapping
/// sentinel for them instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpaceKind {
    User,
    Kernel,
}

/// Handle to one address space's segment table.
///
/// The space borrows its collaborators: the process-wide [`SegtabCache`], the
/// physical page allocator, and the pool mapper. In a kernel all three are
/// `'static`; tests pass locals.
pub struct AddressSpace<'s, A: PageAlloc, M: PoolMapper> {
    /// Root node. Stable (and non-null) from [`init`](Self::init) until
    /// [`destroy`](Self::destroy).
    root: AtomicPtr<Segtab>,
    /// Lowest legal virtual address of this space.
    min_addr: VirtualAddress,
    kind: SpaceKind,
    cache: &'s SegtabCache,
    alloc: &'s A,
    mapper: &'s M,
}

impl<'s, A: PageAlloc, M: PoolMapper> AddressSpace<'s, A, M> {
    /// Create a space and install its root (infallible; may sleep for
    /// memory).
    pub fn new(
        cache: &'s SegtabCache,
        alloc: &'s A,
        mapper: &'s M,
        kind: SpaceKind,
        min_addr: VirtualAddress,
    ) -> Self {
        let mut space = Self {
            root: AtomicPtr::new(null_mut()),
            min_addr,
            kind,
            cache,
            alloc,
            mapper,
        };
        space.init();
        space
    }

    /// Install a fresh root into a rootless space (newly created, or torn
    /// down by [`destroy`](Self::destroy)).
    ///
    /// # Panics
    /// When the space already has a root.
    pub fn init(&mut self) {
        assert!(
            self.root.get_mut().is_null(),
            "address space already has a root"
        );
        let root = self.cache.alloc_node(self.alloc, self.mapper);
        // SAFETY: freshly allocated, not yet shared.
        audit_node(unsafe { root.as_ref() }, "root install");
        *self.root.get_mut() = root.as_ptr();
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn min_addr(&self) -> VirtualAddress {
        self.min_addr
    }

    /// The current root pointer (null once destroyed).
    #[inline]
    pub(crate) fn root_ptr(&self) -> *mut Segtab {
        self.root.load(Ordering::Acquire)
    }

    /// Locate the leaf PTE slot for `va`, or `None` if any level of the walk
    /// is missing. Takes no locks and allocates nothing.
    ///
    /// Safe against concurrent [`reserve`](Self::reserve): children are only
    /// published fully zeroed, with release ordering, and never replaced.
    pub fn lookup(&self, va: VirtualAddress) -> Option<NonNull<Pte>> {
        let root = NonNull::new(self.root.load(Ordering::Acquire))?;

        #[cfg(target_pointer_width = "64")]
        let node: NonNull<Segtab> = {
            // SAFETY: the root stays valid for the space's lifetime; slots
            // are atomics, so shared access is sound during reserves.
            let child = unsafe { root.as_ref() }
                .seg_slot(XsegIndex::from(va))
                .load(Ordering::Acquire);
            NonNull::new(child.cast::<Segtab>())?
        };
        #[cfg(target_pointer_width = "32")]
        let node: NonNull<Segtab> = root;

        // SAFETY: published child pointers reference live nodes.
        let leaf = unsafe { node.as_ref() }
            .pte_slot(SegIndex::from(va))
            .load(Ordering::Acquire);
        let leaf = NonNull::new(leaf.cast::<PtePage>())?;
        Some(PtePage::entry_ptr(leaf, LeafIndex::from(va)))
    }

    /// Ensure the leaf PTE slot for `va` exists and return it.
    ///
    /// The fast path is a plain [`lookup`](Self::lookup). On a miss, the
    /// missing levels are allocated (cache first, allocator second) and
    /// installed with a release CAS; losing an install race recycles the
    /// loser's untouched allocation and adopts the winner's, so all racers
    /// return the same slot.
    ///
    /// # Errors
    /// [`ReserveError::OutOfMemory`] when no leaf page can be had and
    /// `flags` contains [`ReserveFlags::CAN_FAIL`].
    ///
    /// # Panics
    /// On leaf-page exhaustion without `CAN_FAIL`, and on use of a space
    /// whose root was torn down.
    pub fn reserve(
        &self,
        va: VirtualAddress,
        flags: ReserveFlags,
    ) -> Result<NonNull<Pte>, ReserveError> {
        if let Some(pte) = self.lookup(va) {
            return Ok(pte);
        }

        debug_assert!(va >= self.min_addr, "reserve below the space minimum: {va}");
        debug_assert!(va.as_u64() < ROOT_SPAN, "reserve beyond root coverage: {va}");

        let Some(root) = NonNull::new(self.root.load(Ordering::Acquire)) else {
            panic!("reserve on a torn-down address space");
        };

        #[cfg(target_pointer_width = "64")]
        let node = self.ensure_interior(root, va);
        #[cfg(target_pointer_width = "32")]
        let node = root;

        // SAFETY: `node` was just read (or installed) as a published child.
        let slot = unsafe { node.as_ref() }.pte_slot(SegIndex::from(va));
        let mut leaf = slot.load(Ordering::Acquire);
        if leaf.is_null() {
            let fresh = match self.cache.alloc_pte_page(self.alloc, self.mapper) {
                Some(page) => page,
                None if flags.contains(ReserveFlags::CAN_FAIL) => {
                    return Err(ReserveError::OutOfMemory);
                }
                None => panic!("segtab: out of memory for a leaf PTE page at {va}"),
            };
            match slot.compare_exchange(
                null_mut(),
                fresh.as_ptr().cast(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(
                        "installed leaf PTE page for segment {}",
                        va.align_down::<SegSpan>()
                    );
                    leaf = fresh.as_ptr().cast();
                }
                Err(winner) => {
                    // Lost the install race: the untouched page goes back
                    // where it came from, the winner's serves the request.
                    self.cache.free_pte_page(self.alloc, self.mapper, fresh);
                    leaf = winner;
                }
            }
        }
        // SAFETY: only non-null leaf pointers are ever published.
        let leaf = unsafe { NonNull::new_unchecked(leaf.cast::<PtePage>()) };
        Ok(PtePage::entry_ptr(leaf, LeafIndex::from(va)))
    }

    /// Get or install the interior node for `va`'s xsegment.
    #[cfg(target_pointer_width = "64")]
    fn ensure_interior(&self, root: NonNull<Segtab>, va: VirtualAddress) -> NonNull<Segtab> {
        // SAFETY: the root stays valid for the space's lifetime.
        let slot = unsafe { root.as_ref() }.seg_slot(XsegIndex::from(va));
        let cur = slot.load(Ordering::Acquire);
        if !cur.is_null() {
            // SAFETY: published slots only ever hold valid node pointers.
            return unsafe { NonNull::new_unchecked(cur.cast()) };
        }
        let fresh = self.cache.alloc_node(self.alloc, self.mapper);
        match slot.compare_exchange(
            null_mut(),
            fresh.as_ptr().cast(),
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                trace!(
                    "installed interior segtab for xsegment {}",
                    va.align_down::<XsegSpan>()
                );
                fresh
            }
            Err(winner) => {
                // Raced with another CPU; recycle the loser unused.
                self.cache.free_node(fresh);
                // SAFETY: the winning pointer was published non-null.
                unsafe { NonNull::new_unchecked(winner.cast()) }
            }
        }
    }

    /// Invoke `callback` once per populated segment of `[sva, eva)`.
    ///
    /// The callback receives the segment's clamped bounds and the PTE slot
    /// for its first address; it may edit PTEs freely. Nothing is freed and
    /// empty segments cost one failed lookup each.
    ///
    /// Must not run concurrently with [`reserve`](Self::reserve) on this
    /// space.
    pub fn process<F>(&self, mut sva: VirtualAddress, eva: VirtualAddress, mut callback: F)
    where
        F: FnMut(VirtualAddress, VirtualAddress, NonNull<Pte>),
    {
        while sva < eva {
            let seg_end = match sva.align_down::<SegSpan>().checked_add(SegSpan::SIZE) {
                Some(end) if end < eva => end,
                // Clamp to the requested end; this also covers the segment
                // boundary wrapping past the top of the address space.
                _ => eva,
            };
            if let Some(pte) = self.lookup(sva) {
                callback(sva, seg_end, pte);
            }
            sva = seg_end;
        }
    }

    /// Tear the whole tree down and clear the root.
    ///
    /// Every populated leaf is reported to `callback` (when one is given)
    /// with its segment bounds before its page is recycled; the callback must
    /// leave the PTEs zeroed. Interior nodes and the root return to the
    /// descriptor freelist, audited empty.
    ///
    /// The space must be quiesced: no other CPU may fault on it anymore.
    pub fn destroy(
        &mut self,
        mut callback: Option<&mut dyn FnMut(VirtualAddress, VirtualAddress, NonNull<Pte>)>,
    ) {
        let Some(root) = NonNull::new(*self.root.get_mut()) else {
            return;
        };

        #[cfg(target_pointer_width = "64")]
        let per_slot = XsegSpan::SIZE;
        #[cfg(target_pointer_width = "32")]
        let per_slot = SegSpan::SIZE;

        // SAFETY: `&mut self` is the caller's assertion that the space is
        // quiesced, so the subtree is private to this walk.
        unsafe { self.release_node(root, self.min_addr, per_slot, &mut callback) };
        self.cache.free_node(root);
        *self.root.get_mut() = null_mut();
        trace!("segment table torn down");
    }

    /// Recursively drain one node whose slots each cover `per_slot` bytes of
    /// virtual space, starting at the slot containing `va`.
    ///
    /// # Safety
    /// The subtree must be unreachable by other CPUs.
    unsafe fn release_node(
        &self,
        node: NonNull<Segtab>,
        mut va: VirtualAddress,
        per_slot: u64,
        callback: &mut Option<&mut dyn FnMut(VirtualAddress, VirtualAddress, NonNull<Pte>)>,
    ) {
        // SAFETY: the subtree is private per the function contract.
        let node_ref = unsafe { node.as_ref() };
        let first = ((va.as_u64() >> per_slot.trailing_zeros()) as usize) & (SEGTAB_FANOUT - 1);
        for i in first..SEGTAB_FANOUT {
            let child = node_ref.slot(i).load(Ordering::Relaxed);
            if !child.is_null() {
                if per_slot > SegSpan::SIZE {
                    // Interior child: drain it, then recycle the descriptor
                    // (the freelist insertion re-checks it is empty).
                    // SAFETY: non-null children of an interior level are nodes.
                    let child = unsafe { NonNull::new_unchecked(child.cast::<Segtab>()) };
                    unsafe {
                        self.release_node(
                            child,
                            va,
                            per_slot / SEGTAB_FANOUT as u64,
                            callback,
                        );
                    }
                    self.cache.free_node(child);
                } else {
                    // Leaf child: report it, then recycle the page. The
                    // callback is responsible for leaving the PTEs zero.
                    // SAFETY: non-null children of the last level are leaves.
                    let leaf = unsafe { NonNull::new_unchecked(child.cast::<PtePage>()) };
                    audit_leaf_aligned(leaf, "destroy");
                    if let Some(cb) = callback.as_mut() {
                        cb(
                            va,
                            va + SegSpan::SIZE,
                            PtePage::entry_ptr(leaf, LeafIndex::from(va)),
                        );
                    }
                    self.cache.free_pte_page(self.alloc, self.mapper, leaf);
                }
                node_ref.slot(i).store(null_mut(), Ordering::Relaxed);
            }
            va += per_slot;
        }
    }
}
