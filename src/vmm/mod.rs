//! The allocator core: the only entry point the rest of the system uses.
//!
// For a general view of the manager's operational semantics see the
// [`crate`] level documentation.
//
// # Additional implementation notes
// ## Lock order
// Each page-cache line has its own lock and the region map has one more;
// no global lock serializes unrelated lines. Cross-line promotion inside
// the cache acquires line locks in ascending index order only, and the
// map lock is taken strictly after every line lock has been released:
// runs come *out* of the cache as plain values and are unmapped or
// re-registered here, never under a line lock.
//
// ## Ownership of parked runs
// A run parked in the page cache stays mapped in the OS but leaves the
// region map: the map models live memory, so the accounting identity
// (Owned pages == user + core pages) holds at every instant. A cache hit
// re-inserts the run as Owned, and the insertion's overlap check *is* the
// map consistency assertion for the hit path.
//
// ## Fill direction
// "Low" and "past" are meaningless on raw addresses; every such
// comparison goes through the detected [`GrowthDirection`].

use crate::fragment::{Fragment, FragmentKind};
use crate::os::{GrowthDirection, MemorySource, MmapSource};
use crate::page_cache::{CachedRun, PageCache};
use crate::region_map::{RegionMap, ReloadError};
use crate::stats::{AllocTracker, AllocationSite, MemoryTag, Stats, StatsSnapshot, TagSnapshot};
use crate::util::{is_page_aligned, round_to_pages};

use core::alloc::{AllocError, Allocator, Layout};
use core::panic::Location;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU64;
use std::sync::Mutex;

use tracing::{debug, error, info, instrument, warn, Level};

/// How many cache purges to attempt before a failing mandatory mapping
/// becomes fatal. There is no safe degraded mode below this layer, so no
/// retry-forever loop either.
const RECLAIM_ATTEMPTS: u32 = 2;

/// A page-granularity virtual memory manager.
///
/// Obtains, tracks, recycles and releases whole-page address ranges.
/// Thread safe: the tracked *metadata* is synchronized (the contents of
/// handed-out memory are the caller's business).
pub struct PageAllocator<S: MemorySource = MmapSource> {
    source: S,
    page_size: usize,
    dir: GrowthDirection,
    map: Mutex<RegionMap>,
    cache: PageCache,
    stats: Stats,
    tracker: Mutex<AllocTracker>,
}

impl<S: MemorySource> core::fmt::Debug for PageAllocator<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageAllocator")
            .field("page_size", &self.page_size)
            .field("dir", &self.dir)
            .finish()
    }
}

/// The closing of the books produced by
/// [`PageAllocator::shutdown_report`].
#[derive(Copy, Clone, Debug)]
pub struct ShutdownReport {
    pub user: TagSnapshot,
    pub core: TagSnapshot,
    /// Owned pages still in the region map after the cache purge.
    pub owned_pages: usize,
}

impl ShutdownReport {
    /// Whether the map agrees with the accounting. A `false` here is a
    /// bookkeeping bug in the manager, not a caller leak.
    #[inline]
    pub fn books_balanced(&self) -> bool {
        self.user.pages + self.core.pages == self.owned_pages
    }

    /// Whether any allocation outlived its owner.
    #[inline]
    pub fn leaked(&self) -> bool {
        self.user.live != 0 || self.core.live != 0
    }
}

impl PageAllocator<MmapSource> {
    /// Creates a manager over the operating system's mapping facility.
    pub fn new() -> PageAllocator<MmapSource> {
        PageAllocator::with_source(MmapSource::new())
    }
}

impl Default for PageAllocator<MmapSource> {
    fn default() -> Self {
        Self::new()
    }
}

#[inline(always)]
unsafe fn nn(addr: usize) -> NonNull<u8> {
    debug_assert_ne!(addr, 0);
    NonNull::new_unchecked(addr as *mut u8)
}

impl<S: MemorySource> PageAllocator<S> {
    /// Creates a manager over a custom [`MemorySource`].
    pub fn with_source(source: S) -> PageAllocator<S> {
        let page_size = source.page_size();
        debug_assert!(page_size.is_power_of_two());
        let dir = GrowthDirection::detect(&source);
        PageAllocator {
            page_size,
            dir,
            map: Mutex::new(RegionMap::new()),
            cache: PageCache::new(page_size, dir),
            stats: Stats::default(),
            tracker: Mutex::new(AllocTracker::default()),
            source,
        }
    }

    #[inline(always)]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline(always)]
    pub fn growth_direction(&self) -> GrowthDirection {
        self.dir
    }

    //---------------user-memory operations---------------//

    /// Allocates `len` bytes (rounded up to whole pages) of caller-visible
    /// memory. Out of address space is fatal: callers of the lowest layer
    /// have no recovery of their own.
    #[track_caller]
    pub fn alloc(&self, len: usize) -> NonNull<u8> {
        self.alloc_tagged(len, MemoryTag::User, false, Location::caller())
    }

    /// Like [`alloc`](Self::alloc), with contents guaranteed zero.
    #[track_caller]
    pub fn alloc_zeroed(&self, len: usize) -> NonNull<u8> {
        self.alloc_tagged(len, MemoryTag::User, true, Location::caller())
    }

    /// Returns memory obtained from [`alloc`](Self::alloc). Freeing a
    /// leading or trailing page-aligned subrange of an allocation is
    /// allowed; the map keeps the remainder.
    pub fn free(&self, base: NonNull<u8>, len: usize) {
        self.free_tagged(base, len, MemoryTag::User)
    }

    /// Gives back the trailing `old_len - new_len` bytes of an allocation,
    /// at page granularity.
    pub fn shrink(&self, base: NonNull<u8>, old_len: usize, new_len: usize) {
        self.shrink_tagged(base, old_len, new_len, MemoryTag::User)
    }

    /// Forced-free for a region known to be an isolated fragment: skips
    /// the cache and the general removal search. The region goes straight
    /// back to the OS.
    pub fn free_isolated(&self, base: NonNull<u8>, len: usize) {
        let addr = base.as_ptr() as usize;
        let len = self.page_len(len);
        debug_assert!(is_page_aligned(addr, self.page_size));

        self.stats.on_free(MemoryTag::User, len, len / self.page_size);
        self.tracker.lock().unwrap().forget(addr);
        unsafe { self.source.unmap(base, len) };
        self.map.lock().unwrap().remove_isolated(addr, len, FragmentKind::Owned);
    }

    //---------------core-memory operations---------------//

    /// [`alloc`](Self::alloc) charged to the internal-supply ("core")
    /// books: memory consumed by allocators layered on top.
    #[track_caller]
    pub fn alloc_core(&self, len: usize) -> NonNull<u8> {
        self.alloc_tagged(len, MemoryTag::Core, false, Location::caller())
    }

    #[track_caller]
    pub fn alloc_zeroed_core(&self, len: usize) -> NonNull<u8> {
        self.alloc_tagged(len, MemoryTag::Core, true, Location::caller())
    }

    pub fn free_core(&self, base: NonNull<u8>, len: usize) {
        self.free_tagged(base, len, MemoryTag::Core)
    }

    pub fn shrink_core(&self, base: NonNull<u8>, old_len: usize, new_len: usize) {
        self.shrink_tagged(base, old_len, new_len, MemoryTag::Core)
    }

    //---------------raw mapping wrappers---------------//

    /// Obtains a raw OS mapping through the manager's bookkeeping. The
    /// region is registered as externally-mapped, never cached or
    /// recycled, and must be released with [`unmap_raw`](Self::unmap_raw).
    pub fn map_raw(&self, len: usize) -> Result<NonNull<u8>, ()> {
        let len = self.page_len(len);
        let base = unsafe { self.source.map(None, len)? };
        let addr = base.as_ptr() as usize;
        let tick = self.cache.now();

        let mut map = self.map.lock().unwrap();
        // The OS chose the address; anything we presumed Foreign there
        // was a stale guess.
        map.overrule(addr, len, tick);
        map.insert(addr, len, FragmentKind::Mapped, tick);
        debug!(addr, len, "Raw mapping registered.");
        Ok(base)
    }

    /// Releases a region obtained from [`map_raw`](Self::map_raw).
    pub fn unmap_raw(&self, base: NonNull<u8>, len: usize) {
        let len = self.page_len(len);
        let addr = base.as_ptr() as usize;
        unsafe { self.source.unmap(base, len) };
        self.map.lock().unwrap().remove(addr, len, FragmentKind::Mapped, self.cache.now());
    }

    //---------------maintenance and diagnostics---------------//

    /// One step of the periodic cache expiry, meant to be driven by an
    /// external timer on a fixed interval. Advances the expiry clock and
    /// sweeps one cache line round-robin.
    pub fn expire_tick(&self) {
        let report = self.cache.expire_tick();
        self.release_runs(&report.forced, &self.stats.expiries);

        for run in report.candidates {
            // Decided against the map with no line lock held. A run still
            // flanked by owned memory may yet coalesce with it when that
            // memory is freed, so it gets more time before being broken
            // out and returned to the OS.
            let end = run.base + run.pages * self.page_size;
            let still_coalescing = {
                let map = self.map.lock().unwrap();
                let left = run.base.checked_sub(1).is_some_and(|a| {
                    map.lookup(a)
                        .is_ok_and(|(_, f)| f.kind == FragmentKind::Owned && f.end == run.base)
                });
                let right = map
                    .lookup(end)
                    .is_ok_and(|(_, f)| f.kind == FragmentKind::Owned && f.start == end);
                left || right
            };
            if !still_coalescing && self.cache.take_exact(run) {
                self.release_runs(core::slice::from_ref(&run), &self.stats.expiries);
            }
        }
    }

    /// Rebuilds the region map from the OS's authoritative view.
    /// Currently reports [`ReloadError::Unsupported`].
    pub fn reload_map(&self) -> Result<(), ReloadError> {
        self.map.lock().unwrap().reload()
    }

    /// Snapshot of the region map, for diagnostics.
    pub fn dump_map(&self) -> Vec<Fragment> {
        self.map.lock().unwrap().fragments().to_vec()
    }

    /// The kind of the tracked fragment containing `addr`, if any.
    /// Parked (cached) runs are not tracked and answer `None`.
    pub fn contains(&self, addr: usize) -> Option<FragmentKind> {
        self.map.lock().unwrap().kind_at(addr)
    }

    /// Snapshot of the aggregate statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Turns on allocation-site recording for every later allocation.
    pub fn enable_tracking(&self) {
        self.tracker.lock().unwrap().enable();
    }

    /// Live allocations recorded by the tracking mode, sorted by address.
    pub fn tracked_sites(&self) -> Vec<AllocationSite> {
        self.tracker.lock().unwrap().sites()
    }

    /// Purges the cache and closes the books: the Owned pages left in the
    /// map must equal the user and core page totals.
    pub fn shutdown_report(&self) -> ShutdownReport {
        let drained = self.cache.purge();
        self.release_runs(&drained, &self.stats.evictions);
        let snap = self.stats.snapshot();
        let owned_pages = self.map.lock().unwrap().owned_pages(self.page_size);
        ShutdownReport { user: snap.user, core: snap.core, owned_pages }
    }

    //---------------internals---------------//

    #[instrument(level = "info", skip(self), ret(level = Level::INFO))]
    fn alloc_tagged(
        &self,
        len: usize,
        tag: MemoryTag,
        zeroed: bool,
        site: &'static Location<'static>,
    ) -> NonNull<u8> {
        let Some(len) = round_to_pages(len, self.page_size) else {
            self.die(format_args!("allocation size overflows the address space"));
        };
        let pages = len / self.page_size;

        let hint = self.map.lock().unwrap().lowest_gap(len, self.dir);

        if self.cache.accepts(pages) {
            if let Some(hit) = self.cache.find(pages, hint) {
                debug!(base = hit.base, pages, "Satisfied from the page cache.");
                Stats::bump(&self.stats.cache_hits, 1);
                Stats::bump(&self.stats.cache_coalesced, hit.coalesced);
                self.release_runs(&hit.evicted, &self.stats.evictions);

                let base = unsafe { nn(hit.base) };
                unsafe { self.source.revive(base, len) };
                self.relink(hit.base, len);
                if zeroed {
                    unsafe { core::ptr::write_bytes(base.as_ptr(), 0, len) };
                }
                self.stats.on_alloc(tag, len, pages);
                self.tracker.lock().unwrap().record(hit.base, len, tag, site);
                return base;
            }
        }
        Stats::bump(&self.stats.cache_misses, 1);

        let base = self.map_fresh(hint, len);
        // Fresh anonymous mappings are zero by construction.
        self.stats.on_alloc(tag, len, pages);
        self.tracker.lock().unwrap().record(base.as_ptr() as usize, len, tag, site);
        base
    }

    /// Re-registers a run leaving the cache as Owned. The insertion's
    /// overlap check is the consistency assertion for the hit path; a
    /// stale Foreign record left by a hint probe that once landed on the
    /// parked pages is overruled first, since the cache hit proves the
    /// pages are ours.
    fn relink(&self, addr: usize, len: usize) {
        let tick = self.cache.now();
        let mut map = self.map.lock().unwrap();
        map.overrule(addr, len, tick);
        let out = map.insert(addr, len, FragmentKind::Owned, tick);
        Stats::bump(&self.stats.map_coalesced, out.coalesced());
    }

    /// Maps a fresh region from the OS, reconciling the map when the hint
    /// is not honored and reclaiming cached pages when address space runs
    /// dry.
    fn map_fresh(&self, hint: Option<usize>, len: usize) -> NonNull<u8> {
        let mut attempts = 0;
        let base = loop {
            let hint_ptr = hint.map(|h| unsafe { nn(h) });
            match unsafe { self.source.map(hint_ptr, len) } {
                Ok(base) => break base,
                Err(()) if attempts < RECLAIM_ATTEMPTS => {
                    attempts += 1;
                    warn!(len, attempts, "Mapping failed, purging the page cache and retrying.");
                    let drained = self.cache.purge();
                    self.release_runs(&drained, &self.stats.evictions);
                }
                Err(()) => {
                    self.die(format_args!("out of address space mapping {len:#x} bytes"));
                }
            }
        };

        let addr = base.as_ptr() as usize;
        let tick = self.cache.now();
        match hint {
            Some(h) if addr != h => {
                debug!(hint = h, addr, "Placement hint not honored.");
                Stats::bump(&self.stats.hints_missed, 1);
                {
                    let mut map = self.map.lock().unwrap();
                    map.overrule(addr, len, tick);
                    let out = map.insert(addr, len, FragmentKind::Owned, tick);
                    Stats::bump(&self.stats.map_coalesced, out.coalesced());
                }
                self.probe_hint(h);
            }
            hint => {
                if hint.is_some() {
                    Stats::bump(&self.stats.hints_honored, 1);
                }
                // The hint came from a gap in the map (or the map is
                // empty), so nothing tracked can overlap here.
                let mut map = self.map.lock().unwrap();
                let out = map.insert(addr, len, FragmentKind::Owned, tick);
                Stats::bump(&self.stats.map_coalesced, out.coalesced());
            }
        }
        base
    }

    /// Decides whether an ignored hint points at genuinely occupied space
    /// by requesting a single page at exactly the hint address. Occupied:
    /// recorded as Foreign so later hints route around it. Honored: the
    /// miss was transient and the map is left untouched. The probe page
    /// itself is always returned to the OS.
    #[instrument(level = "debug", skip(self))]
    fn probe_hint(&self, hint: usize) {
        let page = self.page_size;
        match unsafe { self.source.map(Some(nn(hint)), page) } {
            Ok(probe) if probe.as_ptr() as usize == hint => {
                debug!(hint, "Hint location is free after all, transient miss.");
                Stats::bump(&self.stats.hints_transient, 1);
                unsafe { self.source.unmap(probe, page) };
            }
            Ok(probe) => {
                debug!(hint, "Hint location is occupied, marking Foreign.");
                Stats::bump(&self.stats.hints_foreign, 1);
                unsafe { self.source.unmap(probe, page) };
                let mut map = self.map.lock().unwrap();
                // The gap may have been claimed while we probed; a tracked
                // range is better information than the probe's.
                if map.lookup(hint).is_err() {
                    map.insert(hint, page, FragmentKind::Foreign, self.cache.now());
                }
            }
            Err(()) => {
                // Nothing mappable at all; don't blacklist on no evidence.
                Stats::bump(&self.stats.hints_transient, 1);
            }
        }
    }

    #[instrument(level = "info", skip(self))]
    fn free_tagged(&self, base: NonNull<u8>, len: usize, tag: MemoryTag) {
        let addr = base.as_ptr() as usize;
        let len = self.page_len(len);
        let pages = len / self.page_size;
        if !is_page_aligned(addr, self.page_size) {
            self.die(format_args!("free of a non-page-aligned address {addr:#x}"));
        }

        self.stats.on_free(tag, len, pages);
        self.tracker.lock().unwrap().forget(addr);
        // The general removal search also catches frees of untracked or
        // mis-sized ranges; both are fatal inside.
        self.map.lock().unwrap().remove(addr, len, FragmentKind::Owned, self.cache.now());
        self.park_or_release(addr, len);
    }

    #[instrument(level = "info", skip(self))]
    fn shrink_tagged(&self, base: NonNull<u8>, old_len: usize, new_len: usize, tag: MemoryTag) {
        let addr = base.as_ptr() as usize;
        let old_len = self.page_len(old_len);
        let new_len = self.page_len(new_len);
        if new_len > old_len {
            self.die(format_args!("shrink of {addr:#x} from {old_len:#x} grows to {new_len:#x}"));
        }
        if new_len == old_len {
            return;
        }

        // Equivalent to freeing the trailing suffix.
        let suffix = old_len - new_len;
        self.stats.on_shrink(tag, suffix, suffix / self.page_size);
        self.tracker.lock().unwrap().resize(addr, new_len);
        self.map.lock().unwrap().remove(
            addr + new_len,
            suffix,
            FragmentKind::Owned,
            self.cache.now(),
        );
        self.park_or_release(addr + new_len, suffix);
    }

    /// Common tail of the free paths: park the region in the cache when it
    /// is worth keeping, otherwise hand it back to the OS immediately. The
    /// region has already left the map.
    fn park_or_release(&self, addr: usize, len: usize) {
        let pages = len / self.page_size;
        if self.cache.accepts(pages) {
            unsafe { self.source.retire(nn(addr), len) };
            let report = self.cache.insert(addr, pages);
            Stats::bump(&self.stats.cache_coalesced, report.coalesced);
            self.release_runs(&report.evicted, &self.stats.evictions);
        } else {
            debug!(addr, pages, "Run too large to cache, unmapping directly.");
            unsafe { self.source.unmap(nn(addr), len) };
        }
    }

    /// Returns runs the cache let go of to the OS. Parked runs are not in
    /// the map, so this is purely an OS matter. Called with no line lock
    /// held.
    fn release_runs(&self, runs: &[CachedRun], counter: &AtomicU64) {
        for run in runs {
            let len = run.pages * self.page_size;
            debug!(base = run.base, pages = run.pages, "Releasing run to the OS.");
            unsafe { self.source.unmap(nn(run.base), len) };
            Stats::bump(counter, 1);
        }
    }

    #[inline(always)]
    fn page_len(&self, len: usize) -> usize {
        match round_to_pages(len, self.page_size) {
            Some(len) => len,
            None => self.die(format_args!("size {len:#x} overflows the address space")),
        }
    }

    #[cold]
    fn die(&self, msg: core::fmt::Arguments<'_>) -> ! {
        error!(stats = %self.stats.snapshot(), "Fatal: {msg}");
        panic!("page allocator contract violation: {msg}");
    }
}

impl<S: MemorySource> Drop for PageAllocator<S> {
    fn drop(&mut self) {
        // A poisoned lock during unwinding must not turn into an abort.
        if std::thread::panicking() {
            return;
        }
        let report = self.shutdown_report();
        if report.leaked() {
            warn!(
                user_live = report.user.live,
                core_live = report.core.live,
                "Shutting down with live allocations."
            );
            for site in self.tracked_sites() {
                warn!(base = site.base, len = site.len, %site.site, ?site.tag, "Leaked here.");
            }
        }
        if !report.books_balanced() {
            error!(
                user_pages = report.user.pages,
                core_pages = report.core.pages,
                owned_pages = report.owned_pages,
                "Accounting does not match the region map; this is a bookkeeping bug."
            );
        } else {
            info!(stats = %self.stats.snapshot(), "Page allocator shut down.");
        }
    }
}

//---------------impl Allocator for PageAllocator---------------//

// The allocator-api bridge hands out whole pages per allocation; it exists
// so collection types can sit directly on the manager. All bridged memory
// is charged to the user books.
unsafe impl<S: MemorySource> Allocator for PageAllocator<S> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > self.page_size {
            return Err(AllocError);
        }
        let len = round_to_pages(layout.size(), self.page_size).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(self.alloc(layout.size()), len))
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > self.page_size {
            return Err(AllocError);
        }
        let len = round_to_pages(layout.size(), self.page_size).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(self.alloc_zeroed(layout.size()), len))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.free(ptr, layout.size())
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(old_layout.size() <= new_layout.size());
        let old_len = round_to_pages(old_layout.size(), self.page_size).ok_or(AllocError)?;
        let new_len = round_to_pages(new_layout.size(), self.page_size).ok_or(AllocError)?;
        if new_len == old_len {
            return Ok(NonNull::slice_from_raw_parts(ptr, new_len));
        }

        let new = self.allocate(new_layout)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr().cast(), old_layout.size());
        self.free(ptr, old_layout.size());
        Ok(new)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(old_layout.size() >= new_layout.size());
        let old_len = round_to_pages(old_layout.size(), self.page_size).ok_or(AllocError)?;
        let new_len = round_to_pages(new_layout.size(), self.page_size).ok_or(AllocError)?;
        if new_len < old_len {
            PageAllocator::shrink(self, ptr, old_layout.size(), new_layout.size());
        }
        Ok(NonNull::slice_from_raw_parts(ptr, new_len))
    }
}

impl<S: MemorySource> PartialEq for PageAllocator<S> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl<S: MemorySource> Eq for PageAllocator<S> {}

#[cfg(test)]
mod tests;
