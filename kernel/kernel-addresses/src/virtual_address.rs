use crate::Span;
use core::fmt;
use core::ops::{Add, AddAssign};
use core::ptr::NonNull;

/// Virtual memory address.
///
/// A thin wrapper around `u64` that carries the *kind* of address at the type
/// level so virtual and physical values cannot be mixed. Canonicality is not
/// validated; the translation layer that consumes these decides which ranges
/// are legal.
///
/// ### Semantics
/// - [`align_down`](Self::align_down) and [`offset_in`](Self::offset_in)
///   split an address against a [`Span`] granularity.
/// - Arithmetic is available through `Add<u64>`/`AddAssign<u64>` and the
///   overflow-aware [`checked_add`](Self::checked_add); range walkers use the
///   latter to detect wrap at the top of the address space.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.addr() as u64)
    }

    #[inline]
    #[must_use]
    pub fn from_nonnull<T>(ptr: NonNull<T>) -> Self {
        Self::from_ptr(ptr.as_ptr())
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Round down to the nearest `S` boundary.
    #[inline]
    #[must_use]
    pub const fn align_down<S: Span>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    /// The offset of this address inside its surrounding `S` span.
    #[inline]
    #[must_use]
    pub const fn offset_in<S: Span>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: Span>(self) -> bool {
        self.offset_in::<S>() == 0
    }

    /// Add `rhs`, returning `None` when the sum wraps past `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
