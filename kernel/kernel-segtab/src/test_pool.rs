//! Mock collaborators for the test suites: a physical "RAM" of owned,
//! page-aligned heap frames, and an identity pool mapper over it.

use crate::{PageAlloc, PoolMapper};
use core::ptr::NonNull;
use kernel_addresses::{PhysicalAddress, PhysicalPage};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One simulated physical page.
#[repr(C, align(4096))]
struct Frame(#[allow(dead_code)] [u8; 4096]);

/// A page allocator over heap frames. "Physical" addresses are the frames'
/// actual heap addresses, so [`DirectMap`] can translate them back by
/// identity, the way a direct-mapped kernel would.
///
/// Tracks the number of pages currently handed out so tests can assert exact
/// allocation and leak behavior, and supports a growth cut-off to simulate
/// an exhausted system.
pub struct TestPool {
    /// Frames returned through `free_page`, ready for reuse.
    free: Mutex<Vec<*mut Frame>>,
    /// Every frame ever created; owned here so a panicking test leaks
    /// nothing.
    all: Mutex<Vec<*mut Frame>>,
    outstanding: AtomicUsize,
    created: AtomicUsize,
    limit: AtomicUsize,
}

// SAFETY: the raw frame pointers are only handed out under the engine's own
// ownership discipline; the vectors themselves are lock-protected.
unsafe impl Send for TestPool {}
unsafe impl Sync for TestPool {}

impl TestPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            all: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            limit: AtomicUsize::new(usize::MAX),
        }
    }

    /// Pages currently handed out and not yet freed back.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Forbid further growth: from now on only frames freed back can be
    /// served, as if the system were out of memory.
    pub fn cut_off(&self) {
        self.limit
            .store(self.created.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

impl Drop for TestPool {
    fn drop(&mut self) {
        for &frame in self.all.get_mut().unwrap().iter() {
            // SAFETY: every pointer in `all` came from Box::into_raw and is
            // dropped exactly once, here.
            drop(unsafe { Box::from_raw(frame) });
        }
    }
}

impl PageAlloc for TestPool {
    fn alloc_zero_page(&self) -> Option<PhysicalPage> {
        let frame = match self.free.lock().unwrap().pop() {
            Some(frame) => frame,
            None => {
                if self.created.load(Ordering::SeqCst) >= self.limit.load(Ordering::SeqCst) {
                    return None;
                }
                let frame = Box::into_raw(Box::new(Frame([0u8; 4096])));
                self.all.lock().unwrap().push(frame);
                self.created.fetch_add(1, Ordering::SeqCst);
                frame
            }
        };
        // SAFETY: the frame is unowned at this point.
        unsafe { core::ptr::write_bytes(frame.cast::<u8>(), 0, 4096) };
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(PhysicalPage::from_addr(PhysicalAddress::new(
            frame.addr() as u64
        )))
    }

    fn free_page(&self, page: PhysicalPage) {
        let frame = page.base().as_u64() as usize as *mut Frame;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.free.lock().unwrap().push(frame);
    }

    fn wait_for_memory(&self, wchan: &'static str) {
        // A real kernel sleeps here until pages are reclaimed; in a test
        // nothing will ever wake us, so fail loudly instead of hanging.
        panic!("wait_for_memory({wchan}) would block forever in tests");
    }
}

/// Identity mapper: simulated physical addresses *are* heap addresses.
pub struct DirectMap;

impl PoolMapper for DirectMap {
    unsafe fn map_pool_page<T>(&self, pa: PhysicalAddress) -> NonNull<T> {
        NonNull::new(pa.as_u64() as usize as *mut T).expect("pool pages are never at address zero")
    }

    unsafe fn unmap_pool_page<T>(&self, ptr: NonNull<T>) -> PhysicalAddress {
        PhysicalAddress::new(ptr.as_ptr().addr() as u64)
    }
}
