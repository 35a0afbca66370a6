use crate::{PageSpan, PhysicalAddress};
use core::fmt;

/// A page-aligned physical page base.
///
/// This is the handle the physical page allocator hands out and takes back.
/// Conversions to and from the underlying address are explicit:
/// [`base`](Self::base) yields the physical address of the page and
/// [`from_addr`](Self::from_addr) reconstructs the handle from one.
///
/// ### Invariants
/// - The low [`PageSpan::SHIFT`] bits of the base are zero (debug-asserted
///   on construction; page walkers rely on this).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(PhysicalAddress);

impl PhysicalPage {
    #[inline]
    #[must_use]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_aligned::<PageSpan>(), "page base must be aligned");
        Self(pa)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage({:#018X})", self.0.as_u64())
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
