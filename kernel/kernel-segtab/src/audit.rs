//! Zero-audit of recycled tree storage.
//!
//! Everything on the descriptor freelist and the leaf-page cache must be
//! observably empty: a node handed out as a fresh table level, or a leaf page
//! installed for a fault, is published without further initialization.
//! Debug builds verify the invariant at every insertion and removal and halt
//! on a violation, after logging each offending slot.

use crate::node::Segtab;
use crate::pte::PtePage;
use core::ptr::NonNull;

#[cfg(debug_assertions)]
use crate::node::SEGTAB_FANOUT;
#[cfg(debug_assertions)]
use core::sync::atomic::Ordering;
#[cfg(debug_assertions)]
use kernel_addresses::{PageSpan, Span};

/// Halt if any slot of `node` is non-null.
pub(crate) fn audit_node(node: &Segtab, why: &'static str) {
    #[cfg(debug_assertions)]
    {
        let mut dirty = 0_usize;
        for i in 0..SEGTAB_FANOUT {
            let p = node.slot(i).load(Ordering::Relaxed);
            if !p.is_null() {
                log::error!("segtab node {node:p} slot {i} holds {p:p} ({why})");
                dirty += 1;
            }
        }
        assert!(dirty == 0, "segtab node not zero ({why})");
    }
    #[cfg(not(debug_assertions))]
    let _ = (node, why);
}

/// Halt if `page` is misaligned or any of its PTE words is non-zero.
///
/// # Safety
/// `page` must point to a live leaf PTE page that is private to the caller
/// (off the tree, or being torn down with the space quiesced).
pub(crate) unsafe fn audit_leaf(page: NonNull<PtePage>, why: &'static str) {
    audit_leaf_aligned(page, why);
    #[cfg(debug_assertions)]
    {
        // SAFETY: per contract the page is private, so a shared borrow is sound.
        let leaf = unsafe { page.as_ref() };
        let mut dirty = 0_usize;
        for (i, pte) in leaf.entries().iter().enumerate() {
            if !pte.is_zero() {
                log::error!(
                    "leaf PTE page {:p} entry {i} holds {:#x} ({why})",
                    page.as_ptr(),
                    pte.raw()
                );
                dirty += 1;
            }
        }
        assert!(dirty == 0, "leaf PTE page not zero ({why})");
    }
}

/// Alignment half of the leaf audit.
///
/// Also runs on its own before the teardown callback fires, while the PTEs
/// may still hold live (non-zero) contents.
pub(crate) fn audit_leaf_aligned(page: NonNull<PtePage>, why: &'static str) {
    #[cfg(debug_assertions)]
    assert!(
        page.addr().get() & (PageSpan::SIZE as usize - 1) == 0,
        "leaf PTE page {page:p} misaligned ({why})"
    );
    #[cfg(not(debug_assertions))]
    let _ = (page, why);
}
