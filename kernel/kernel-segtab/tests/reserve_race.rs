//! Multiprocessor install races: concurrent reserves of the same address
//! must converge on one committed allocation, with every loser recycled.

use kernel_segtab::addresses::{PhysicalAddress, PhysicalPage, SegSpan, Span, VirtualAddress};
use kernel_segtab::{
    AddressSpace, PageAlloc, PoolMapper, ReserveFlags, SegtabCache, SpaceKind,
};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};

/// Pages of a fully populated one-segment tree: root + interior + leaf on a
/// 3-level tree, root + leaf on a 2-level one.
const ONE_SEGMENT_TREE: usize = if cfg!(target_pointer_width = "64") { 3 } else { 2 };

#[repr(C, align(4096))]
struct Frame(#[allow(dead_code)] [u8; 4096]);

/// Thread-safe page allocator over owned heap frames; "physical" addresses
/// are the frames' heap addresses, translated back by identity.
struct RacePool {
    free: Mutex<Vec<*mut Frame>>,
    all: Mutex<Vec<*mut Frame>>,
    outstanding: AtomicUsize,
}

unsafe impl Send for RacePool {}
unsafe impl Sync for RacePool {}

impl RacePool {
    fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            all: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl Drop for RacePool {
    fn drop(&mut self) {
        for &frame in self.all.get_mut().unwrap().iter() {
            drop(unsafe { Box::from_raw(frame) });
        }
    }
}

impl PageAlloc for RacePool {
    fn alloc_zero_page(&self) -> Option<PhysicalPage> {
        let frame = match self.free.lock().unwrap().pop() {
            Some(frame) => frame,
            None => {
                let frame = Box::into_raw(Box::new(Frame([0u8; 4096])));
                self.all.lock().unwrap().push(frame);
                frame
            }
        };
        unsafe { std::ptr::write_bytes(frame.cast::<u8>(), 0, 4096) };
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
        panic!("wait_for_memory({wchan}) would block forever in tests");
    }
}

struct DirectMap;

impl PoolMapper for DirectMap {
    unsafe fn map_pool_page<T>(&self, pa: PhysicalAddress) -> NonNull<T> {
        NonNull::new(pa.as_u64() as usize as *mut T).expect("pool pages are never at address zero")
    }

    unsafe fn unmap_pool_page<T>(&self, ptr: NonNull<T>) -> PhysicalAddress {
        PhysicalAddress::new(ptr.as_ptr().addr() as u64)
    }
}

#[test]
fn racing_reserves_of_one_address_converge() {
    const THREADS: usize = 8;

    let cache = SegtabCache::new();
    let pool = RacePool::new();
    let mapper = DirectMap;
    let mut space = AddressSpace::new(
        &cache,
        &pool,
        &mapper,
        SpaceKind::User,
        VirtualAddress::zero(),
    );
    let start = Barrier::new(THREADS);
    let va = VirtualAddress::new(0x1000);

    let slots: Vec<usize> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    start.wait();
                    let pte = space.reserve(va, ReserveFlags::empty()).unwrap();
                    pte.as_ptr().addr()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // every racer got the same PTE slot
    assert!(slots.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(Some(slots[0]), space.lookup(va).map(|p| p.as_ptr().addr()));

    // exactly one allocation per level was committed; every loser's page is
    // parked in a freelist, not leaked and not double-freed
    assert_eq!(
        pool.outstanding(),
        ONE_SEGMENT_TREE + cache.free_node_count() + cache.cached_pte_pages()
    );

    space.destroy(None);
    cache.drain(&pool, &mapper);
    assert_eq!(pool.outstanding(), cache.free_node_count());
}

#[test]
fn racing_reserves_of_neighboring_segments_share_the_interior() {
    let cache = SegtabCache::new();
    let pool = RacePool::new();
    let mapper = DirectMap;
    let mut space = AddressSpace::new(
        &cache,
        &pool,
        &mapper,
        SpaceKind::User,
        VirtualAddress::zero(),
    );
    let start = Barrier::new(2);

    // both addresses live under the same first-level slot but in different
    // segments, so the racers contend on the interior install only
    let vas = [VirtualAddress::zero(), VirtualAddress::new(SegSpan::SIZE)];

    std::thread::scope(|s| {
        let space = &space;
        let start = &start;
        for va in vas {
            s.spawn(move || {
                start.wait();
                space.reserve(va, ReserveFlags::empty()).unwrap();
            });
        }
    });

    // two leaves, one shared path above them
    let live = ONE_SEGMENT_TREE + 1;
    assert_eq!(
        pool.outstanding(),
        live + cache.free_node_count() + cache.cached_pte_pages()
    );
    assert!(space.lookup(vas[0]).is_some());
    assert!(space.lookup(vas[1]).is_some());

    space.destroy(None);
    cache.drain(&pool, &mapper);
    assert_eq!(pool.outstanding(), cache.free_node_count());
}
