//! Defines the [`PageCache`] struct: tiered recycling of freed page runs.
//!
//! Freed regions small enough to be worth keeping are parked here instead
//! of being returned to the OS, so a later allocation of the same page
//! count can reuse them without a fresh mapping call. The cache is a set
//! of bounded lines, one per small page count plus a catch-all for big
//! runs; each line is guarded by its own lock. Cross-line work (promoting
//! a coalesced run into a bigger line) acquires line locks in ascending
//! index order only, and nothing OS- or map-related ever happens under a
//! line lock: evicted runs are handed back to the caller for release.

use crate::os::GrowthDirection;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use static_assertions::const_assert;
use tracing::{debug, trace};

/// Page counts `1..=SMALL_LINES` each get a dedicated line.
pub(crate) const SMALL_LINES: usize = 15;
/// Runs of at least this many pages land in the final catch-all line.
pub(crate) const CATCHALL_MIN_PAGES: usize = SMALL_LINES + 1;
pub(crate) const LINE_COUNT: usize = SMALL_LINES + 1;
/// Bound on entries per line; one entry is evicted to make room when a
/// full line is inserted into.
pub(crate) const LINE_CAPACITY: usize = 32;

/// Sweep age (in expiry ticks) past which an entry may be evicted if it is
/// no longer part of a larger tracked region.
pub(crate) const EXPIRE_EARLY_TICKS: u64 = 20;
/// Sweep age past which an entry is evicted unconditionally.
pub(crate) const EXPIRE_FORCE_TICKS: u64 = 64;

const_assert!(SMALL_LINES >= 1);
const_assert!(LINE_CAPACITY >= 2);
const_assert!(EXPIRE_EARLY_TICKS < EXPIRE_FORCE_TICKS);
// Every line is revisited well before the forced threshold.
const_assert!(LINE_COUNT as u64 <= EXPIRE_EARLY_TICKS);

/// One parked region. `base` is page-aligned; the run covers exactly
/// `pages` pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CachedRun {
    pub base: usize,
    pub pages: usize,
    pub inserted_at: u64,
}

impl CachedRun {
    #[inline(always)]
    fn end(&self, page_size: usize) -> usize {
        self.base + self.pages * page_size
    }
}

/// What an insertion did: runs pushed out of full lines (the caller must
/// release them to the OS) and the number of coalescing events.
#[derive(Debug, Default)]
pub struct InsertReport {
    pub evicted: Vec<CachedRun>,
    pub coalesced: u64,
}

/// A successful [`PageCache::find`]: the reusable base address plus the
/// side effects of re-caching the unused edges of a larger run.
#[derive(Debug)]
pub struct FindReport {
    pub base: usize,
    pub evicted: Vec<CachedRun>,
    pub coalesced: u64,
}

/// One sweep step. `forced` entries are already out of the cache and must
/// be released. `candidates` are still cached: the caller decides their
/// fate against the region map and removes the losers via
/// [`PageCache::take_exact`].
#[derive(Debug, Default)]
pub struct SweepReport {
    pub forced: Vec<CachedRun>,
    pub candidates: Vec<CachedRun>,
}

#[derive(Debug, Default)]
struct CacheLine {
    /// Sorted by `base`; never longer than [`LINE_CAPACITY`].
    runs: Vec<CachedRun>,
}

#[derive(Debug)]
pub struct PageCache {
    lines: [Mutex<CacheLine>; LINE_COUNT],
    /// Expiry clock, advanced once per [`expire_tick`](Self::expire_tick).
    tick: AtomicU64,
    /// Round-robin position of the sweep.
    sweep_cursor: AtomicUsize,
    page_size: usize,
    dir: GrowthDirection,
}

/// Line index responsible for runs of `pages` pages.
#[inline(always)]
fn line_for(pages: usize) -> usize {
    debug_assert!(pages >= 1);
    if pages <= SMALL_LINES {
        pages - 1
    } else {
        LINE_COUNT - 1
    }
}

impl PageCache {
    pub fn new(page_size: usize, dir: GrowthDirection) -> PageCache {
        PageCache {
            lines: core::array::from_fn(|_| Mutex::new(CacheLine::default())),
            tick: AtomicU64::new(0),
            sweep_cursor: AtomicUsize::new(0),
            page_size,
            dir,
        }
    }

    /// Current value of the expiry clock.
    #[inline(always)]
    pub fn now(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Whether a run of `pages` is eligible for caching at all.
    /// Splitting keeps every stored entry bounded, but far oversized runs
    /// are cheaper to hand straight back to the OS.
    #[inline(always)]
    pub fn accepts(&self, pages: usize) -> bool {
        pages <= LINE_CAPACITY * CATCHALL_MIN_PAGES
    }

    /// Parks a freed run. Runs longer than the catch-all grain are split
    /// into catch-all-sized chunks plus a remainder, each inserted on its
    /// own so each can coalesce independently.
    pub fn insert(&self, base: usize, pages: usize) -> InsertReport {
        let mut report = InsertReport::default();
        let now = self.now();
        let mut base = base;
        let mut pages = pages;

        while pages > CATCHALL_MIN_PAGES {
            let chunk = CachedRun { base, pages: CATCHALL_MIN_PAGES, inserted_at: now };
            self.insert_at(line_for(CATCHALL_MIN_PAGES), chunk, &mut report);
            base += CATCHALL_MIN_PAGES * self.page_size;
            pages -= CATCHALL_MIN_PAGES;
        }
        let run = CachedRun { base, pages, inserted_at: now };
        self.insert_at(line_for(pages), run, &mut report);
        report
    }

    /// Inserts `run` into line `idx`, coalescing with address-adjacent
    /// entries and promoting the merged run into the line for its new
    /// size. The current line's lock is held across the promotion, so
    /// locks are always acquired in ascending line order.
    fn insert_at(&self, idx: usize, mut run: CachedRun, report: &mut InsertReport) {
        let mut line = self.lines[idx].lock().unwrap();

        if idx < LINE_COUNT - 1 {
            let pos = line.runs.partition_point(|r| r.base < run.base);
            let left = pos
                .checked_sub(1)
                .filter(|&i| line.runs[i].end(self.page_size) == run.base);
            let right = (pos < line.runs.len()
                && run.end(self.page_size) == line.runs[pos].base)
                .then_some(pos);

            if left.is_some() || right.is_some() {
                if let Some(r) = right {
                    let neighbor = line.runs.remove(r);
                    run.pages += neighbor.pages;
                    report.coalesced += 1;
                }
                if let Some(l) = left {
                    let neighbor = line.runs.remove(l);
                    run.base = neighbor.base;
                    run.pages += neighbor.pages;
                    report.coalesced += 1;
                }
                let target = line_for(run.pages);
                debug_assert!(target > idx);
                trace!(base = run.base, pages = run.pages, target, "Promoting coalesced run.");
                self.insert_at(target, run, report);
                return;
            }
        }
        // Once a run reaches the catch-all it is cached as-is; merge work
        // for big requests happens at find time instead.

        if line.runs.len() == LINE_CAPACITY {
            // Full line: push out the entry nearest the trailing edge of
            // the growth direction.
            let victim = match self.dir {
                GrowthDirection::Upward => line.runs.pop().unwrap(),
                GrowthDirection::Downward => line.runs.remove(0),
            };
            debug!(?victim, line = idx, "Line full, evicting trailing entry.");
            report.evicted.push(victim);
        }

        let pos = line.runs.partition_point(|r| r.base < run.base);
        line.runs.insert(pos, run);
    }

    /// Looks for a cached run able to satisfy `pages`. `hint` is the
    /// lowest known unused gap: entries past it in fill order are left for
    /// the expiry sweep, keeping the live address range compact.
    pub fn find(&self, pages: usize, hint: Option<usize>) -> Option<FindReport> {
        if pages >= CATCHALL_MIN_PAGES {
            return self.find_large(pages, hint);
        }

        // Exact line first: a hit needs no splitting at all.
        {
            let mut line = self.lines[line_for(pages)].lock().unwrap();
            if let Some(run) = self.take_nearest_origin(&mut line, hint) {
                return Some(FindReport { base: run.base, evicted: Vec::new(), coalesced: 0 });
            }
        }

        // Miss: take the biggest eligible run anywhere above and place the
        // request centrally inside it, so both leftover edges are as large
        // (and as independently reusable) as possible.
        let mut taken = None;
        for idx in (line_for(pages) + 1..LINE_COUNT).rev() {
            let mut line = self.lines[idx].lock().unwrap();
            let candidate = if idx == LINE_COUNT - 1 {
                self.take_widest(&mut line, hint)
            } else {
                self.take_nearest_origin(&mut line, hint)
            };
            if let Some(run) = candidate {
                taken = Some(run);
                break;
            }
        }
        let run = taken?;

        let spare = run.pages - pages;
        let left = spare / 2;
        let right = spare - left;
        let base = run.base + left * self.page_size;
        debug!(
            from = run.base,
            pages = run.pages,
            base,
            left,
            right,
            "Splitting a larger cached run centrally."
        );

        let mut report = FindReport { base, evicted: Vec::new(), coalesced: 0 };
        if left > 0 {
            self.merge_into(&mut report, self.insert(run.base, left));
        }
        if right > 0 {
            self.merge_into(&mut report, self.insert(base + pages * self.page_size, right));
        }
        Some(report)
    }

    fn find_large(&self, pages: usize, hint: Option<usize>) -> Option<FindReport> {
        let (run, coalesced) = {
            let mut line = self.lines[LINE_COUNT - 1].lock().unwrap();
            match self.take_best_fit(&mut line, pages, hint) {
                Some(run) => (run, 0),
                None => self.take_merged_chain(&mut line, pages, hint)?,
            }
        };

        // Carve at the fill-origin edge and re-cache the remainder.
        let spare = run.pages - pages;
        let base = match self.dir {
            GrowthDirection::Upward => run.base,
            GrowthDirection::Downward => run.base + spare * self.page_size,
        };
        let mut report = FindReport { base, evicted: Vec::new(), coalesced };
        if spare > 0 {
            let rem_base = match self.dir {
                GrowthDirection::Upward => run.base + pages * self.page_size,
                GrowthDirection::Downward => run.base,
            };
            self.merge_into(&mut report, self.insert(rem_base, spare));
        }
        Some(report)
    }

    #[inline]
    fn merge_into(&self, report: &mut FindReport, inserted: InsertReport) {
        report.evicted.extend(inserted.evicted);
        report.coalesced += inserted.coalesced;
    }

    #[inline(always)]
    fn eligible(&self, run: &CachedRun, hint: Option<usize>) -> bool {
        hint.map_or(true, |h| !self.dir.past(run.base, h))
    }

    /// Removes and returns the eligible entry nearest the fill origin.
    fn take_nearest_origin(
        &self,
        line: &mut CacheLine,
        hint: Option<usize>,
    ) -> Option<CachedRun> {
        let idx = match self.dir {
            GrowthDirection::Upward => line.runs.iter().position(|r| self.eligible(r, hint)),
            GrowthDirection::Downward => line.runs.iter().rposition(|r| self.eligible(r, hint)),
        }?;
        Some(line.runs.remove(idx))
    }

    /// Removes and returns the widest eligible entry (catch-all only),
    /// preferring the fill origin on ties.
    fn take_widest(&self, line: &mut CacheLine, hint: Option<usize>) -> Option<CachedRun> {
        let mut best: Option<usize> = None;
        for (i, r) in line.runs.iter().enumerate() {
            if !self.eligible(r, hint) {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let better = r.pages > line.runs[b].pages
                        || (r.pages == line.runs[b].pages
                            && self.dir.precedes(r.base, line.runs[b].base));
                    if better { Some(i) } else { Some(b) }
                }
            };
        }
        best.map(|i| line.runs.remove(i))
    }

    /// Removes and returns the smallest eligible entry of at least `pages`
    /// pages, preferring the fill origin on ties.
    fn take_best_fit(
        &self,
        line: &mut CacheLine,
        pages: usize,
        hint: Option<usize>,
    ) -> Option<CachedRun> {
        let mut best: Option<usize> = None;
        for (i, r) in line.runs.iter().enumerate() {
            if r.pages < pages || !self.eligible(r, hint) {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let better = r.pages < line.runs[b].pages
                        || (r.pages == line.runs[b].pages
                            && self.dir.precedes(r.base, line.runs[b].base));
                    if better { Some(i) } else { Some(b) }
                }
            };
        }
        best.map(|i| line.runs.remove(i))
    }

    /// Merges the first (in fill order) chain of address-consecutive
    /// eligible entries totalling at least `pages` pages into one run,
    /// removing its parts from the line.
    fn take_merged_chain(
        &self,
        line: &mut CacheLine,
        pages: usize,
        hint: Option<usize>,
    ) -> Option<(CachedRun, u64)> {
        let mut start = 0;
        while start < line.runs.len() {
            if !self.eligible(&line.runs[start], hint) {
                start += 1;
                continue;
            }
            let mut total = line.runs[start].pages;
            let mut end = start + 1;
            while total < pages
                && end < line.runs.len()
                && line.runs[end - 1].end(self.page_size) == line.runs[end].base
                && self.eligible(&line.runs[end], hint)
            {
                total += line.runs[end].pages;
                end += 1;
            }
            if total >= pages {
                let merged = CachedRun {
                    base: line.runs[start].base,
                    pages: total,
                    inserted_at: line.runs[start].inserted_at,
                };
                let parts = (end - start) as u64;
                line.runs.drain(start..end);
                debug!(base = merged.base, pages = merged.pages, parts, "Merged catch-all chain.");
                return Some((merged, parts - 1));
            }
            start = end;
        }
        None
    }

    /// Advances the expiry clock and sweeps the next line round-robin.
    pub fn expire_tick(&self) -> SweepReport {
        let now = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let idx = self.sweep_cursor.fetch_add(1, Ordering::Relaxed) % LINE_COUNT;

        let mut report = SweepReport::default();
        let mut line = self.lines[idx].lock().unwrap();
        line.runs.retain(|run| {
            let age = now.saturating_sub(run.inserted_at);
            if age >= EXPIRE_FORCE_TICKS {
                report.forced.push(*run);
                return false;
            }
            if age >= EXPIRE_EARLY_TICKS {
                report.candidates.push(*run);
            }
            true
        });
        if !report.forced.is_empty() || !report.candidates.is_empty() {
            debug!(
                line = idx,
                forced = report.forced.len(),
                candidates = report.candidates.len(),
                "Expiry sweep."
            );
        }
        report
    }

    /// Removes `run` if it is still cached unchanged. Used for the early
    /// expiry tier, where the keep-or-evict decision is made against the
    /// region map after the line lock was dropped.
    pub fn take_exact(&self, run: CachedRun) -> bool {
        let mut line = self.lines[line_for(run.pages)].lock().unwrap();
        let pos = line.runs.partition_point(|r| r.base < run.base);
        if line.runs.get(pos) == Some(&run) {
            line.runs.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drains every line. Used at shutdown and under memory pressure; the
    /// caller releases the returned runs to the OS.
    pub fn purge(&self) -> Vec<CachedRun> {
        let mut all = Vec::new();
        for line in &self.lines {
            all.append(&mut line.lock().unwrap().runs);
        }
        all
    }

    /// Snapshot of every cached run, for diagnostics and tests.
    pub fn cached_runs(&self) -> Vec<CachedRun> {
        let mut all = Vec::new();
        for line in &self.lines {
            all.extend(line.lock().unwrap().runs.iter().copied());
        }
        all
    }

    /// Total parked pages.
    pub fn cached_pages(&self) -> usize {
        self.lines
            .iter()
            .map(|l| l.lock().unwrap().runs.iter().map(|r| r.pages).sum::<usize>())
            .sum()
    }
}
