use crate::pte::PTE_PER_PAGE;
use core::sync::atomic::AtomicPtr;
use kernel_addresses::{PageSpan, SegSpan, Span, VirtualAddress};

#[cfg(target_pointer_width = "64")]
use kernel_addresses::XsegSpan;

/// Child slots per segment-table node.
pub const SEGTAB_FANOUT: usize = PageSpan::SIZE as usize / size_of::<*mut u8>();

/// Node descriptors carved out of one backing page.
pub const NODES_PER_PAGE: usize = PageSpan::SIZE as usize / size_of::<Segtab>();

/// Total virtual range addressable through one root node.
#[cfg(target_pointer_width = "64")]
pub const ROOT_SPAN: u64 = XsegSpan::SIZE << SEGTAB_FANOUT.trailing_zeros();
#[cfg(target_pointer_width = "32")]
pub const ROOT_SPAN: u64 = SegSpan::SIZE << SEGTAB_FANOUT.trailing_zeros();

// The span constants, the PTE word, and the node fanout must describe the
// same tree.
const _: () = assert!(size_of::<Segtab>() as u64 <= PageSpan::SIZE);
const _: () = assert!(PageSpan::SIZE as usize % size_of::<Segtab>() == 0);
const _: () = assert!(SegSpan::SHIFT == PageSpan::SHIFT + PTE_PER_PAGE.trailing_zeros());
#[cfg(target_pointer_width = "64")]
const _: () = assert!(XsegSpan::SHIFT == SegSpan::SHIFT + SEGTAB_FANOUT.trailing_zeros());

/// A segment-table node: the root or (on 64-bit targets) an interior level of
/// the tree.
///
/// Every slot is an owning pointer to the next level down. Which level that
/// is follows from the node's depth, not from the slot itself: the root of a
/// three-level tree holds interior nodes, everything else holds leaf PTE
/// pages. Slots are atomics because first-touch installation is published by
/// compare-and-swap while lock-free readers walk past.
///
/// Slot 0 doubles as the intrusive freelist link while a node sits on the
/// descriptor freelist; nodes enter the list audited zero and leave it with
/// the link cleared, so a node handed out is always observably empty.
#[repr(C)]
pub struct Segtab {
    slots: [AtomicPtr<u8>; SEGTAB_FANOUT],
}

impl Segtab {
    #[cfg(test)]
    pub(crate) const fn zeroed() -> Self {
        Self {
            slots: [const { AtomicPtr::new(core::ptr::null_mut()) }; SEGTAB_FANOUT],
        }
    }

    /// Raw slot access by position.
    #[inline]
    pub(crate) const fn slot(&self, i: usize) -> &AtomicPtr<u8> {
        &self.slots[i]
    }

    /// The slot holding the interior node for `i` (root of a 3-level tree).
    #[cfg(target_pointer_width = "64")]
    #[inline]
    pub(crate) const fn seg_slot(&self, i: XsegIndex) -> &AtomicPtr<u8> {
        &self.slots[i.as_usize()]
    }

    /// The slot holding the leaf PTE page for `i`.
    #[inline]
    pub(crate) const fn pte_slot(&self, i: SegIndex) -> &AtomicPtr<u8> {
        &self.slots[i.as_usize()]
    }

    /// Slot 0 viewed as the freelist link.
    #[inline]
    pub(crate) const fn link(&self) -> &AtomicPtr<u8> {
        &self.slots[0]
    }
}

/// Segment index: selects a leaf PTE page within its parent node.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SegIndex(u16);

impl SegIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> SegSpan::SHIFT) & (SEGTAB_FANOUT as u64 - 1)) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < SEGTAB_FANOUT);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Extended-segment index: selects an interior node within the root.
#[cfg(target_pointer_width = "64")]
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct XsegIndex(u16);

#[cfg(target_pointer_width = "64")]
impl XsegIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> XsegSpan::SHIFT) & (SEGTAB_FANOUT as u64 - 1)) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < SEGTAB_FANOUT);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}
