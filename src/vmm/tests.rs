use super::*;
use crate::os::fake_source::{FakeSource, FAKE_PAGE_SIZE};
use crate::page_cache::LINE_CAPACITY;

const PAGE: usize = FAKE_PAGE_SIZE;

fn allocator(arena_pages: usize) -> PageAllocator<FakeSource> {
    PageAllocator::with_source(FakeSource::with_pages(arena_pages))
}

fn owned_pages_in(map: &[Fragment]) -> usize {
    map.iter()
        .filter(|f| f.kind == FragmentKind::Owned)
        .map(|f| f.len() / PAGE)
        .sum()
}

#[test]
fn test_1() {
    // Basic allocation: page-aligned, writable, tracked, and the books
    // return to zero after the matching free.
    let a = allocator(16);
    let p = a.alloc(PAGE);
    assert_eq!(p.as_ptr() as usize % PAGE, 0);
    unsafe {
        p.as_ptr().write(7);
        assert_eq!(p.as_ptr().read(), 7);
    }

    let map = a.dump_map();
    assert_eq!(map.len(), 1);
    assert_eq!(map[0].len(), PAGE);
    assert_eq!(map[0].kind, FragmentKind::Owned);
    assert_eq!(a.stats().user.pages, 1);

    a.free(p, PAGE);
    assert!(a.dump_map().is_empty(), "parked runs leave the map");
    assert_eq!(a.stats().user.pages, 0);
    assert_eq!(a.stats().user.live, 0);
}

#[test]
fn test_2() {
    // Cache round trip: alloc, free, alloc returns the identical address.
    let a = allocator(16);
    let p = a.alloc(2 * PAGE);
    a.free(p, 2 * PAGE);
    let q = a.alloc(2 * PAGE);
    assert_eq!(p, q);

    let stats = a.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
}

#[test]
fn test_3() {
    // Sizes round up to whole pages, symmetric between alloc and free.
    let a = allocator(16);
    let p = a.alloc(100);
    assert_eq!(a.dump_map()[0].len(), PAGE);
    let q = a.alloc(PAGE + 1);
    assert_eq!(owned_pages_in(&a.dump_map()), 3);
    a.free(q, PAGE + 1);
    a.free(p, 100);
    assert_eq!(a.stats().user.pages, 0);
}

#[test]
fn test_4() {
    // Sequential allocations are placed adjacently via the gap hint and
    // coalesce into a single map fragment.
    let a = allocator(16);
    let p1 = a.alloc(PAGE);
    let p2 = a.alloc(PAGE);
    assert_eq!(unsafe { p1.as_ptr().add(PAGE) }, p2.as_ptr());

    let map = a.dump_map();
    assert_eq!(map.len(), 1, "adjacent same-kind fragments must coalesce");
    assert_eq!(map[0].len(), 2 * PAGE);
    assert!(a.stats().hints_honored >= 1);
    assert!(a.stats().map_coalesced >= 1);
}

#[test]
fn test_5() {
    // alloc_zeroed clears recycled pages; fresh mappings are clean by
    // construction.
    let a = allocator(16);
    let p = a.alloc(PAGE);
    unsafe { p.as_ptr().write_bytes(0xFF, PAGE) };
    a.free(p, PAGE);

    let q = a.alloc_zeroed(PAGE);
    assert_eq!(p, q, "must come from the cache for this to test anything");
    let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), PAGE) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn test_6() {
    // Split and reuse: a partial free of the leading page leaves a 2-page
    // Owned fragment, and the freed page is reused in preference to the
    // still-owned block.
    let a = allocator(16);
    let p = a.alloc(3 * PAGE);
    a.free(p, PAGE);

    let map = a.dump_map();
    assert_eq!(map.len(), 1);
    assert_eq!(map[0].start, p.as_ptr() as usize + PAGE);
    assert_eq!(map[0].len(), 2 * PAGE);

    // Parked pages are not tracked; the live remainder is.
    assert_eq!(a.contains(p.as_ptr() as usize), None);
    assert_eq!(a.contains(p.as_ptr() as usize + PAGE), Some(FragmentKind::Owned));

    let q = a.alloc(PAGE);
    assert_eq!(p, q, "the freed page is reused, not fresh space");
    let map = a.dump_map();
    assert_eq!(map.len(), 1);
    assert_eq!(map[0].len(), 3 * PAGE);
}

#[test]
fn test_7() {
    // Hint miss against genuinely occupied space: the allocation is
    // linked at the OS-chosen address and the hint page is marked
    // Foreign, so later hints route around it.
    let a = allocator(16);
    let p1 = a.alloc(PAGE);
    assert_eq!(p1.as_ptr() as usize, a.source.page_addr(0));

    // The next gap hint is page 1; plant a foreign resident there.
    a.source.occupy(1, 1);
    let p2 = a.alloc(PAGE);
    assert_eq!(p2.as_ptr() as usize, a.source.page_addr(2), "linked at the actual address");

    let map = a.dump_map();
    let kinds: Vec<(usize, FragmentKind)> = map.iter().map(|f| (f.start, f.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (a.source.page_addr(0), FragmentKind::Owned),
            (a.source.page_addr(1), FragmentKind::Foreign),
            (a.source.page_addr(2), FragmentKind::Owned),
        ]
    );
    let stats = a.stats();
    assert_eq!(stats.hints_missed, 1);
    assert_eq!(stats.hints_foreign, 1);

    // The Foreign record steers the next hint past the resident.
    let p3 = a.alloc(PAGE);
    assert_eq!(p3.as_ptr() as usize, a.source.page_addr(3));
}

#[test]
fn test_8() {
    // Transient hint miss: the probe finds the hint free, so nothing is
    // blacklisted.
    let a = allocator(16);
    let _p1 = a.alloc(PAGE);
    a.source.refuse_hints(1);
    let _p2 = a.alloc(PAGE);

    let stats = a.stats();
    assert_eq!(stats.hints_missed, 1);
    assert_eq!(stats.hints_transient, 1);
    assert_eq!(stats.hints_foreign, 0);
    assert!(a.dump_map().iter().all(|f| f.kind != FragmentKind::Foreign));
}

#[test]
fn test_9() {
    // Eviction bound: one insertion beyond a line's capacity evicts
    // exactly one run, which goes back to the OS.
    let a = allocator(128);
    for i in 0..=LINE_CAPACITY {
        let p = a.alloc(2 * PAGE);
        assert_eq!(p.as_ptr() as usize, a.source.page_addr(2 * i));
        // Freeing only the head page leaves gaps, so cached entries
        // never coalesce away.
        a.free(p, PAGE);
        let expected_evictions = u64::from(i == LINE_CAPACITY);
        assert_eq!(a.stats().evictions, expected_evictions);
    }
    // 2 pages mapped per round, exactly one page released by eviction.
    assert_eq!(a.source.mapped_pages(), 2 * (LINE_CAPACITY + 1) - 1);
}

#[test]
fn test_10() {
    // Accounting closure across an interleaving of user and core work:
    // the Owned-page total tracks user + core at every step and the books
    // balance at shutdown.
    let a = allocator(64);
    let p1 = a.alloc(2 * PAGE);
    let c1 = a.alloc_core(3 * PAGE);
    let p2 = a.alloc(PAGE);

    let stats = a.stats();
    assert_eq!(stats.user.pages, 3);
    assert_eq!(stats.core.pages, 3);
    assert_eq!(owned_pages_in(&a.dump_map()), stats.user.pages + stats.core.pages);

    a.free(p1, 2 * PAGE);
    let stats = a.stats();
    assert_eq!(owned_pages_in(&a.dump_map()), stats.user.pages + stats.core.pages);

    a.free_core(c1, 3 * PAGE);
    a.free(p2, PAGE);

    let stats = a.stats();
    assert_eq!(stats.user.pages, 0);
    assert_eq!(stats.core.pages, 0);
    assert_eq!(stats.user.live, 0);
    assert_eq!(stats.core.live, 0);

    let report = a.shutdown_report();
    assert!(report.books_balanced());
    assert!(!report.leaked());
    assert_eq!(report.owned_pages, 0);
}

#[test]
fn test_11() {
    // Shrink frees the trailing suffix through the cache, where the next
    // fitting allocation picks it up.
    let a = allocator(16);
    let p = a.alloc(4 * PAGE);
    a.shrink(p, 4 * PAGE, PAGE);

    let map = a.dump_map();
    assert_eq!(map.len(), 1);
    assert_eq!(map[0].len(), PAGE);
    assert_eq!(a.stats().user.pages, 1);
    assert_eq!(a.stats().user.live, 1);

    // Same rounded size is a no-op.
    a.shrink(p, PAGE, PAGE);

    let q = a.alloc(3 * PAGE);
    assert_eq!(q.as_ptr() as usize, p.as_ptr() as usize + PAGE);
    assert_eq!(a.stats().cache_hits, 1);
}

#[test]
#[should_panic(expected = "shrink")]
fn test_12() {
    let a = allocator(16);
    let p = a.alloc(PAGE);
    a.shrink(p, PAGE, 2 * PAGE);
}

#[test]
#[should_panic(expected = "exceeds")]
fn test_13() {
    // Freeing more than is tracked is a size mismatch, which is fatal.
    let a = allocator(16);
    let p = a.alloc(PAGE);
    a.free(p, 2 * PAGE);
}

#[test]
#[should_panic(expected = "untracked")]
fn test_14() {
    // A double free hits the removal search as an untracked range.
    let a = allocator(16);
    let p = a.alloc(PAGE);
    a.free(p, PAGE);
    a.free(p, PAGE);
}

#[test]
fn test_15() {
    // The forced-free path bypasses the cache entirely.
    let a = allocator(16);
    let p = a.alloc(PAGE);
    a.free_isolated(p, PAGE);

    assert!(a.dump_map().is_empty());
    assert_eq!(a.source.mapped_pages(), 0, "went straight back to the OS");
    assert_eq!(a.stats().user.live, 0);

    let q = a.alloc(PAGE);
    assert_eq!(a.stats().cache_hits, 0);
    a.free(q, PAGE);
}

#[test]
fn test_16() {
    // Raw mappings funnel through the bookkeeping as Mapped fragments and
    // never count as Owned.
    let a = allocator(16);
    let r = a.map_raw(2 * PAGE).unwrap();
    let map = a.dump_map();
    assert_eq!(map.len(), 1);
    assert_eq!(map[0].kind, FragmentKind::Mapped);
    assert_eq!(owned_pages_in(&map), 0);

    // Hints steer ordinary allocations around the raw mapping.
    let p = a.alloc(PAGE);
    assert_ne!(p.as_ptr() as usize, r.as_ptr() as usize);

    a.free(p, PAGE);
    a.unmap_raw(r, 2 * PAGE);
    let report = a.shutdown_report();
    assert!(report.books_balanced());
    assert_eq!(report.owned_pages, 0);
}

#[test]
fn test_17() {
    // Expiry eventually returns an unneeded parked run to the OS.
    let a = allocator(16);
    let p = a.alloc(PAGE);
    a.free(p, PAGE);
    assert_eq!(a.source.mapped_pages(), 1);

    for _ in 0..crate::page_cache::EXPIRE_FORCE_TICKS + crate::page_cache::LINE_COUNT as u64 {
        a.expire_tick();
        if a.source.mapped_pages() == 0 {
            break;
        }
    }
    assert_eq!(a.source.mapped_pages(), 0);
    assert_eq!(a.stats().expiries, 1);
}

#[test]
fn test_18() {
    // The early expiry tier spares runs still flanked by owned memory
    // (they may yet coalesce); the forced tier takes them regardless.
    let a = allocator(16);
    let p = a.alloc(2 * PAGE);
    a.free(p, PAGE);
    assert_eq!(a.source.mapped_pages(), 2);

    // Enough ticks for several early sweeps but no forced one.
    for _ in 0..crate::page_cache::EXPIRE_FORCE_TICKS - 8 {
        a.expire_tick();
    }
    assert_eq!(a.source.mapped_pages(), 2, "flanked run survives the early tier");

    for _ in 0..2 * crate::page_cache::LINE_COUNT as u64 + 16 {
        a.expire_tick();
    }
    assert_eq!(a.source.mapped_pages(), 1, "forced tier released the parked page");
    assert_eq!(a.stats().expiries, 1);
}

#[test]
fn test_19() {
    // Big runs are split across the catch-all on free and remerged on
    // demand.
    let a = allocator(64);
    let p = a.alloc(32 * PAGE);
    a.free(p, 32 * PAGE);
    let q = a.alloc(32 * PAGE);
    assert_eq!(p, q);
    assert_eq!(a.stats().cache_hits, 1);
    assert!(a.stats().cache_coalesced >= 1, "two 16-page chunks remerged");
    a.free(q, 32 * PAGE);
}

#[test]
fn test_20() {
    // A partial take from a merged chain re-caches the surplus, and the
    // whole range keeps coalescing back to one fragment.
    let a = allocator(64);
    let p = a.alloc(40 * PAGE);
    a.free(p, 40 * PAGE);

    let q = a.alloc(24 * PAGE);
    assert_eq!(p, q);
    let map = a.dump_map();
    assert_eq!(map.len(), 1);
    assert_eq!(map[0].len(), 24 * PAGE);

    let tail = a.alloc(16 * PAGE);
    assert_eq!(tail.as_ptr() as usize, p.as_ptr() as usize + 24 * PAGE);
    let map = a.dump_map();
    assert_eq!(map.len(), 1, "reused ranges coalesce back into one fragment");
    assert_eq!(map[0].len(), 40 * PAGE);
}

#[test]
fn test_21() {
    // The allocator-api bridge: collections live directly on the manager
    // and the books close when they drop.
    let a = allocator(64);
    {
        let mut v: Vec<u64, &PageAllocator<FakeSource>> = Vec::with_capacity_in(4, &a);
        for i in 0..1024 {
            v.push(i);
        }
        assert_eq!(v.iter().sum::<u64>(), 1023 * 1024 / 2);
    }
    assert_eq!(a.stats().user.live, 0);
    assert_eq!(a.stats().user.pages, 0);

    // Alignments beyond a page cannot be honored.
    let layout = core::alloc::Layout::from_size_align(PAGE, 2 * PAGE).unwrap();
    assert!(a.allocate(layout).is_err());
}

#[test]
fn test_22() {
    // Tracking mode records live call sites and forgets freed ones.
    let a = allocator(16);
    a.enable_tracking();
    let p = a.alloc(2 * PAGE);
    let c = a.alloc_core(PAGE);

    let sites = a.tracked_sites();
    assert_eq!(sites.len(), 2);
    assert!(sites.iter().any(|s| s.base == p.as_ptr() as usize
        && s.len == 2 * PAGE
        && s.tag == MemoryTag::User));
    assert!(sites.iter().any(|s| s.tag == MemoryTag::Core));
    assert!(sites[0].site.file().ends_with("tests.rs"));

    a.free(p, 2 * PAGE);
    a.free_core(c, PAGE);
    assert!(a.tracked_sites().is_empty());
}

#[test]
fn test_23() {
    // The map reload path is present but reports itself unsupported.
    let a = allocator(16);
    assert_eq!(a.reload_map(), Err(crate::region_map::ReloadError::Unsupported));
}

#[test]
fn test_24() {
    // Address-space pressure: a failing mapping purges the cache, the
    // retry succeeds, and the purge shows up as evictions.
    let a = allocator(8);
    let p = a.alloc(4 * PAGE);
    a.free(p, 4 * PAGE);
    assert_eq!(a.source.mapped_pages(), 4, "parked run still occupies the arena");

    let q = a.alloc(8 * PAGE);
    assert_eq!(q.as_ptr() as usize, a.source.page_addr(0));
    assert_eq!(a.stats().evictions, 1);
    a.free(q, 8 * PAGE);
}

#[test]
#[should_panic(expected = "out of address space")]
fn test_25() {
    // With nothing left to reclaim, exhaustion is fatal.
    let a = allocator(4);
    let _p = a.alloc(8 * PAGE);
}
