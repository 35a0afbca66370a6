//! # Per-CPU activation
//!
//! Binding an address space to the executing CPU publishes its segment table
//! through a small per-CPU record that the fault and MMU-reload paths read
//! without locks. Kernel spaces publish a trapping sentinel instead, so a
//! stray user-half access through the cached pointers faults immediately.

use crate::node::Segtab;
use crate::space::{AddressSpace, SpaceKind};
use crate::{PageAlloc, PoolMapper};
use core::ptr::without_provenance_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(target_pointer_width = "64")]
use core::ptr::{NonNull, null_mut};

/// Sentinel published while no user space is active (or for kernel spaces);
/// any dereference through it traps.
pub const SEGTAB_INVALID: *mut Segtab = without_provenance_mut(usize::MAX);

/// Architecture hook fired when translation state changes on a CPU.
pub trait MdActivation {
    /// Reload the hardware translation registers after `root` was published
    /// for the executing CPU ([`SEGTAB_INVALID`] for kernel spaces).
    fn md_activate(&self, root: *mut Segtab);

    /// Drop the hardware translation state on context-switch-out.
    fn md_deactivate(&self);
}

/// The per-CPU segment-table publish record.
///
/// One instance lives in each CPU's local area. Aligned to a cache line so
/// the hot fault-path reads never false-share.
#[repr(C, align(64))]
pub struct CpuSegtabState {
    /// Root segment table of the space active on this CPU.
    user_segtab: AtomicPtr<Segtab>,
    /// Slot-0 interior node of the active root. The MMU reload path wants
    /// the second-level pointer without an extra dereference.
    #[cfg(target_pointer_width = "64")]
    user_seg0tab: AtomicPtr<Segtab>,
}

impl CpuSegtabState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            user_segtab: AtomicPtr::new(SEGTAB_INVALID),
            #[cfg(target_pointer_width = "64")]
            user_seg0tab: AtomicPtr::new(SEGTAB_INVALID),
        }
    }

    /// The published root (sentinel when nothing is active).
    #[inline]
    pub fn user_segtab(&self) -> *mut Segtab {
        self.user_segtab.load(Ordering::Acquire)
    }

    /// The published slot-0 interior node.
    #[cfg(target_pointer_width = "64")]
    #[inline]
    pub fn user_seg0tab(&self) -> *mut Segtab {
        self.user_seg0tab.load(Ordering::Acquire)
    }
}

impl Default for CpuSegtabState {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PageAlloc, M: PoolMapper> AddressSpace<'_, A, M> {
    /// Publish this space's tables to the executing CPU and reload the
    /// hardware translation registers.
    ///
    /// `cpu` must be the local CPU's record: publishing a space to a remote
    /// CPU's slot would hand that CPU tables it never switched to.
    pub fn activate(&self, cpu: &CpuSegtabState, md: &impl MdActivation) {
        let root = match self.kind() {
            // Kernel spaces are reached through the permanent kernel
            // mappings; user-half accesses must trap.
            SpaceKind::Kernel => SEGTAB_INVALID,
            SpaceKind::User => self.root_ptr(),
        };
        cpu.user_segtab.store(root, Ordering::Release);

        #[cfg(target_pointer_width = "64")]
        {
            let seg0 = if root == SEGTAB_INVALID {
                SEGTAB_INVALID
            } else {
                match NonNull::new(root) {
                    // SAFETY: a live root stays valid while the space does.
                    Some(r) => unsafe { r.as_ref() }
                        .slot(0)
                        .load(Ordering::Acquire)
                        .cast::<Segtab>(),
                    None => null_mut(),
                }
            };
            cpu.user_seg0tab.store(seg0, Ordering::Release);
        }

        md.md_activate(root);
    }

    /// Invalidate the executing CPU's published pointers and drop the
    /// hardware translation state. Safe to call whether or not this space is
    /// the one currently active.
    pub fn deactivate(&self, cpu: &CpuSegtabState, md: &impl MdActivation) {
        cpu.user_segtab.store(SEGTAB_INVALID, Ordering::Release);
        #[cfg(target_pointer_width = "64")]
        cpu.user_seg0tab.store(SEGTAB_INVALID, Ordering::Release);
        md.md_deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{ReserveFlags, SpaceKind};
    use crate::test_pool::{DirectMap, TestPool};
    use crate::{AddressSpace, SegtabCache};
    use kernel_addresses::VirtualAddress;
    use std::cell::Cell;

    #[derive(Default)]
    struct RecordingMd {
        activated: Cell<Option<*mut Segtab>>,
        deactivated: Cell<usize>,
    }

    impl MdActivation for RecordingMd {
        fn md_activate(&self, root: *mut Segtab) {
            self.activated.set(Some(root));
        }

        fn md_deactivate(&self) {
            self.deactivated.set(self.deactivated.get() + 1);
        }
    }

    #[test]
    fn user_space_publishes_root_and_first_interior() {
        let cache = SegtabCache::new();
        let pool = TestPool::new();
        let mapper = DirectMap;
        let mut space = AddressSpace::new(
            &cache,
            &pool,
            &mapper,
            SpaceKind::User,
            VirtualAddress::zero(),
        );
        let cpu = CpuSegtabState::new();
        let md = RecordingMd::default();
        assert_eq!(cpu.user_segtab(), SEGTAB_INVALID);

        // populate slot 0 of the root so the shortcut has something to find
        space
            .reserve(VirtualAddress::new(0x1000), ReserveFlags::empty())
            .unwrap();

        space.activate(&cpu, &md);
        let root = cpu.user_segtab();
        assert!(!root.is_null());
        assert_ne!(root, SEGTAB_INVALID);
        assert_eq!(md.activated.get(), Some(root));
        #[cfg(target_pointer_width = "64")]
        {
            let seg0 = cpu.user_seg0tab();
            assert!(!seg0.is_null());
            assert_ne!(seg0, SEGTAB_INVALID);
            assert_ne!(seg0, root);
        }

        space.deactivate(&cpu, &md);
        assert_eq!(cpu.user_segtab(), SEGTAB_INVALID);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(cpu.user_seg0tab(), SEGTAB_INVALID);
        assert_eq!(md.deactivated.get(), 1);

        space.destroy(None);
    }

    #[test]
    fn kernel_space_publishes_the_trapping_sentinel() {
        let cache = SegtabCache::new();
        let pool = TestPool::new();
        let mapper = DirectMap;
        let mut space = AddressSpace::new(
            &cache,
            &pool,
            &mapper,
            SpaceKind::Kernel,
            VirtualAddress::zero(),
        );
        let cpu = CpuSegtabState::new();
        let md = RecordingMd::default();

        space.activate(&cpu, &md);
        assert_eq!(cpu.user_segtab(), SEGTAB_INVALID);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(cpu.user_seg0tab(), SEGTAB_INVALID);
        assert_eq!(md.activated.get(), Some(SEGTAB_INVALID));

        space.destroy(None);
    }
}
