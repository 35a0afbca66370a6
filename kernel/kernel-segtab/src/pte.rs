use core::ptr::NonNull;
use kernel_addresses::{PageSpan, Span, VirtualAddress};

/// One page-table entry: an opaque machine word owned by the caller's PTE
/// policy. This layer only distinguishes zero ("empty") from non-zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Pte(usize);

/// Leaf PTE slots per page.
pub const PTE_PER_PAGE: usize = PageSpan::SIZE as usize / size_of::<Pte>();

impl Pte {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: usize) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// PTE index within a leaf page (address bits above the page offset).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LeafIndex(u16);

impl LeafIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> PageSpan::SHIFT) & (PTE_PER_PAGE as u64 - 1)) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < PTE_PER_PAGE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A page-aligned array of PTEs: the leaf of the segment table.
///
/// Leaf pages are never constructed by value. They come into existence when a
/// zero-filled page from the allocator is reinterpreted through the pool
/// mapper, and they are only ever reached through pointers because multiple
/// CPUs edit PTEs concurrently outside this engine's control.
#[repr(C, align(4096))]
pub struct PtePage {
    entries: [Pte; PTE_PER_PAGE],
}

const _: () = assert!(size_of::<PtePage>() as u64 == PageSpan::SIZE);

impl PtePage {
    /// Pointer to one PTE slot of `page`.
    #[inline]
    #[must_use]
    pub fn entry_ptr(page: NonNull<Self>, i: LeafIndex) -> NonNull<Pte> {
        // SAFETY: `i` is below PTE_PER_PAGE, so the offset stays inside the page.
        unsafe { NonNull::new_unchecked(page.as_ptr().cast::<Pte>().add(i.as_usize())) }
    }

    /// All PTE words of this page, for inspection while the page is private.
    #[inline]
    pub(crate) const fn entries(&self) -> &[Pte; PTE_PER_PAGE] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_index_extracts_the_page_field() {
        assert_eq!(LeafIndex::from(VirtualAddress::zero()).as_usize(), 0);
        assert_eq!(LeafIndex::from(VirtualAddress::new(0x1000)).as_usize(), 1);
        assert_eq!(LeafIndex::from(VirtualAddress::new(0x1FFF)).as_usize(), 1);
        assert_eq!(
            LeafIndex::from(VirtualAddress::new(
                (PTE_PER_PAGE as u64 - 1) << PageSpan::SHIFT
            ))
            .as_usize(),
            PTE_PER_PAGE - 1
        );
        // the field wraps at the segment boundary
        assert_eq!(
            LeafIndex::from(VirtualAddress::new(PTE_PER_PAGE as u64 * 4096)).as_usize(),
            0
        );
    }

    #[test]
    fn pte_word_is_pointer_sized() {
        assert_eq!(size_of::<Pte>(), size_of::<usize>());
        assert!(Pte::zero().is_zero());
        assert!(!Pte::from_raw(1).is_zero());
        assert_eq!(Pte::from_raw(0xDEAD).raw(), 0xDEAD);
    }
}
