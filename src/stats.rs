//! Accounting state: who is holding the manager's memory and how the
//! caches are behaving.
//!
//! Two sets of running totals are kept, one for "user" memory handed
//! directly to callers and one for "core" memory consumed by the
//! allocators built on top of the manager. Keeping them apart makes the
//! shutdown books meaningful: leaked user regions are a caller bug,
//! while a mismatch between the combined totals and the region map is a
//! bookkeeping bug in the manager itself.

use core::fmt;
use core::panic::Location;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::HashMap;

/// Who an allocation is charged to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryTag {
    /// Returned directly to a caller of the public API.
    User,
    /// Consumed internally by higher allocation layers.
    Core,
}

#[derive(Debug, Default)]
pub(crate) struct TagTotals {
    bytes: AtomicUsize,
    pages: AtomicUsize,
    live: AtomicUsize,
}

/// Subtraction that clamps at zero: a transiently skewed counter must
/// stay a diagnostic oddity, never wrap into nonsense.
fn sub_saturating(counter: &AtomicUsize, by: usize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(by))
    });
}

impl TagTotals {
    fn on_alloc(&self, bytes: usize, pages: usize) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.pages.fetch_add(pages, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    fn on_free(&self, bytes: usize, pages: usize) {
        sub_saturating(&self.bytes, bytes);
        sub_saturating(&self.pages, pages);
        sub_saturating(&self.live, 1);
    }

    fn on_shrink(&self, bytes: usize, pages: usize) {
        sub_saturating(&self.bytes, bytes);
        sub_saturating(&self.pages, pages);
    }

    fn snapshot(&self) -> TagSnapshot {
        TagSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            live: self.live.load(Ordering::Relaxed),
        }
    }
}

/// Free-running counters plus the dual totals. All relaxed: the numbers
/// feed diagnostics, not control flow.
#[derive(Debug, Default)]
pub struct Stats {
    user: TagTotals,
    core: TagTotals,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) expiries: AtomicU64,
    pub(crate) map_coalesced: AtomicU64,
    pub(crate) cache_coalesced: AtomicU64,
    pub(crate) hints_honored: AtomicU64,
    pub(crate) hints_missed: AtomicU64,
    pub(crate) hints_foreign: AtomicU64,
    pub(crate) hints_transient: AtomicU64,
}

impl Stats {
    #[inline(always)]
    fn totals(&self, tag: MemoryTag) -> &TagTotals {
        match tag {
            MemoryTag::User => &self.user,
            MemoryTag::Core => &self.core,
        }
    }

    pub(crate) fn on_alloc(&self, tag: MemoryTag, bytes: usize, pages: usize) {
        self.totals(tag).on_alloc(bytes, pages);
    }

    pub(crate) fn on_free(&self, tag: MemoryTag, bytes: usize, pages: usize) {
        self.totals(tag).on_free(bytes, pages);
    }

    pub(crate) fn on_shrink(&self, tag: MemoryTag, bytes: usize, pages: usize) {
        self.totals(tag).on_shrink(bytes, pages);
    }

    #[inline(always)]
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            user: self.user.snapshot(),
            core: self.core.snapshot(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expiries: self.expiries.load(Ordering::Relaxed),
            map_coalesced: self.map_coalesced.load(Ordering::Relaxed),
            cache_coalesced: self.cache_coalesced.load(Ordering::Relaxed),
            hints_honored: self.hints_honored.load(Ordering::Relaxed),
            hints_missed: self.hints_missed.load(Ordering::Relaxed),
            hints_foreign: self.hints_foreign.load(Ordering::Relaxed),
            hints_transient: self.hints_transient.load(Ordering::Relaxed),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TagSnapshot {
    pub bytes: usize,
    pub pages: usize,
    pub live: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub user: TagSnapshot,
    pub core: TagSnapshot,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub expiries: u64,
    pub map_coalesced: u64,
    pub cache_coalesced: u64,
    pub hints_honored: u64,
    pub hints_missed: u64,
    pub hints_foreign: u64,
    pub hints_transient: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "user:  {} live, {} pages, {} bytes",
            self.user.live, self.user.pages, self.user.bytes
        )?;
        writeln!(
            f,
            "core:  {} live, {} pages, {} bytes",
            self.core.live, self.core.pages, self.core.bytes
        )?;
        writeln!(
            f,
            "cache: {} hits, {} misses, {} evictions, {} expiries",
            self.cache_hits, self.cache_misses, self.evictions, self.expiries
        )?;
        writeln!(
            f,
            "coalesced: {} map, {} cache",
            self.map_coalesced, self.cache_coalesced
        )?;
        write!(
            f,
            "hints: {} honored, {} missed, {} foreign, {} transient",
            self.hints_honored, self.hints_missed, self.hints_foreign, self.hints_transient
        )
    }
}

/// One live allocation recorded by the tracking mode.
#[derive(Copy, Clone, Debug)]
pub struct AllocationSite {
    pub base: usize,
    pub len: usize,
    pub tag: MemoryTag,
    pub site: &'static Location<'static>,
}

/// Optional allocation-site recorder for leak debugging. Off by default;
/// when enabled every alloc stores its `#[track_caller]` location until
/// the matching free.
#[derive(Debug, Default)]
pub(crate) struct AllocTracker {
    enabled: bool,
    live: HashMap<usize, (usize, MemoryTag, &'static Location<'static>)>,
}

impl AllocTracker {
    pub(crate) fn enable(&mut self) {
        self.enabled = true;
    }

    pub(crate) fn record(
        &mut self,
        base: usize,
        len: usize,
        tag: MemoryTag,
        site: &'static Location<'static>,
    ) {
        if self.enabled {
            self.live.insert(base, (len, tag, site));
        }
    }

    pub(crate) fn forget(&mut self, base: usize) {
        if self.enabled {
            self.live.remove(&base);
        }
    }

    pub(crate) fn resize(&mut self, base: usize, new_len: usize) {
        if self.enabled {
            if let Some(entry) = self.live.get_mut(&base) {
                entry.0 = new_len;
            }
        }
    }

    pub(crate) fn sites(&self) -> Vec<AllocationSite> {
        let mut sites: Vec<AllocationSite> = self
            .live
            .iter()
            .map(|(&base, &(len, tag, site))| AllocationSite { base, len, tag, site })
            .collect();
        sites.sort_by_key(|s| s.base);
        sites
    }
}
