use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `Span` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the address granularities of the translation tree.
pub trait Span:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug + 'static
{
    /// Span size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the in-span offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// One hardware page (4096 bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageSpan;
impl sealed::Sealed for PageSpan {}
impl Span for PageSpan {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "page"
    }
}

/// One segment: the virtual range whose leaf PTEs fit in a single page.
///
/// A page holds `PAGE_SIZE / size_of::<pte>()` entries, so a segment covers
/// 2 MiB with 8-byte PTEs (64-bit) and 4 MiB with 4-byte PTEs (32-bit).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SegSpan;
impl sealed::Sealed for SegSpan {}
impl Span for SegSpan {
    #[cfg(target_pointer_width = "64")]
    const SIZE: u64 = 1 << 21;
    #[cfg(target_pointer_width = "32")]
    const SIZE: u64 = 1 << 22;

    #[cfg(target_pointer_width = "64")]
    const SHIFT: u32 = 21;
    #[cfg(target_pointer_width = "32")]
    const SHIFT: u32 = 22;

    fn as_str() -> &'static str {
        "segment"
    }
}

/// One extended segment: the virtual range covered by a whole interior node
/// of the segment table (512 segments of 2 MiB, i.e. 1 GiB).
///
/// Only 64-bit targets have a third tree level; on 32-bit targets the root
/// indexes segments directly and this marker does not exist.
#[cfg(target_pointer_width = "64")]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct XsegSpan;
#[cfg(target_pointer_width = "64")]
impl sealed::Sealed for XsegSpan {}
#[cfg(target_pointer_width = "64")]
impl Span for XsegSpan {
    const SIZE: u64 = 1 << 30;
    const SHIFT: u32 = 30;

    fn as_str() -> &'static str {
        "xsegment"
    }
}
