//! Defines the [`RegionMap`] struct: the manager's model of the address space.
//!
//! The map is a sorted array of non-overlapping [`Fragment`]s covering
//! every range the process has obtained (or observed) through the manager.
//! Adjacent same-kind fragments are always coalesced on insertion, so the
//! array is the minimal description of the space. A corrupted map would
//! poison every later placement decision, which is why all invariant
//! violations here abort the process instead of surfacing as errors.

use crate::fragment::{Fragment, FragmentKind};
use crate::os::GrowthDirection;
use crate::util::checked_end;

use tracing::{debug, error, warn};

/// Initial capacity of the backing array. Growth doubles from here and the
/// array never shrinks for the lifetime of the process, so an in-flight
/// lookup can never observe its storage being torn down.
pub(crate) const BOOT_CAPACITY: usize = 128;

/// What [`RegionMap::insert`] did at the seams of the new range.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub coalesced_left: bool,
    pub coalesced_right: bool,
}

impl InsertOutcome {
    #[inline(always)]
    pub fn coalesced(&self) -> u64 {
        u64::from(self.coalesced_left) + u64::from(self.coalesced_right)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReloadError {
    /// Reconstructing the map from the OS's authoritative view is not
    /// supported on this build.
    Unsupported,
}

#[derive(Debug)]
pub struct RegionMap {
    entries: Vec<Fragment>,
    /// Bumped whenever the map is wholly reloaded from the OS view.
    generation: u64,
    /// A reload is in progress; insertions must be deferred.
    loading: bool,
    /// The backing array is being grown; a re-entrant [`extend`](Self::extend)
    /// must not double-extend.
    extending: bool,
    /// An extension happened while a reload was in flight; the reload
    /// must retry.
    resized: bool,
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionMap {
    pub fn new() -> RegionMap {
        RegionMap {
            entries: Vec::with_capacity(BOOT_CAPACITY),
            generation: 0,
            loading: false,
            extending: false,
            resized: false,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read-only view of the fragments, for diagnostics dumps.
    #[inline(always)]
    pub fn fragments(&self) -> &[Fragment] {
        &self.entries
    }

    /// Finds the fragment containing `addr`. On a miss the insertion index
    /// for a fragment starting at `addr` is returned instead.
    pub fn lookup(&self, addr: usize) -> Result<(usize, &Fragment), usize> {
        let idx = self.entries.partition_point(|f| f.start <= addr);
        match idx.checked_sub(1) {
            Some(prev) if self.entries[prev].contains(addr) => Ok((prev, &self.entries[prev])),
            _ => Err(idx),
        }
    }

    /// The kind of the fragment containing `addr`, if any.
    #[inline]
    pub fn kind_at(&self, addr: usize) -> Option<FragmentKind> {
        self.lookup(addr).ok().map(|(_, f)| f.kind)
    }

    /// Total number of Owned-kind pages currently tracked.
    pub fn owned_pages(&self, page_size: usize) -> usize {
        self.entries
            .iter()
            .filter(|f| f.kind == FragmentKind::Owned)
            .map(|f| f.len() / page_size)
            .sum()
    }

    /// Inserts a new fragment, coalescing with the immediate predecessor
    /// and/or successor when they share a boundary and the kind.
    ///
    /// Any overlap with an existing fragment is a contract violation: the
    /// caller is expected to have reconciled the map (see
    /// [`overrule`](Self::overrule)) before inserting.
    pub fn insert(
        &mut self,
        start: usize,
        len: usize,
        kind: FragmentKind,
        tick: u64,
    ) -> InsertOutcome {
        debug_assert!(!self.loading, "insertions are deferred during a reload");
        let Some(end) = checked_end(start, len) else {
            self.die(format_args!("insert of {start:#x}+{len:#x} wraps the address space"));
        };
        debug_assert!(len > 0);

        let idx = self.entries.partition_point(|f| f.start < start);

        if let Some(pred) = idx.checked_sub(1).map(|i| &self.entries[i]) {
            if pred.end > start {
                self.die(format_args!(
                    "insert of {:?} {start:#x}..{end:#x} overlaps {pred:?}",
                    kind
                ));
            }
        }
        if let Some(succ) = self.entries.get(idx) {
            if succ.start < end {
                self.die(format_args!(
                    "insert of {:?} {start:#x}..{end:#x} overlaps {succ:?}",
                    kind
                ));
            }
        }

        let merge_left = idx
            .checked_sub(1)
            .is_some_and(|i| self.entries[i].end == start && self.entries[i].kind == kind);
        let merge_right = self
            .entries
            .get(idx)
            .is_some_and(|f| f.start == end && f.kind == kind);

        match (merge_left, merge_right) {
            (true, true) => {
                // Bridging two fragments: the successor entry is absorbed
                // and compacted away.
                let succ_end = self.entries[idx].end;
                self.entries[idx - 1].end = succ_end;
                self.entries[idx - 1].last_touched = tick;
                self.entries.remove(idx);
            }
            (true, false) => {
                self.entries[idx - 1].end = end;
                self.entries[idx - 1].last_touched = tick;
            }
            (false, true) => {
                self.entries[idx].start = start;
                self.entries[idx].last_touched = tick;
            }
            (false, false) => {
                self.ensure_capacity();
                self.entries.insert(idx, Fragment::new(start, end, kind, tick));
            }
        }

        debug!(?kind, start, end, merge_left, merge_right, "Fragment inserted.");
        self.debug_validate();
        InsertOutcome { coalesced_left: merge_left, coalesced_right: merge_right }
    }

    /// Removes `[start, start + len)` from the fragment owning it.
    ///
    /// Removing a strict subrange from the middle truncates the fragment up
    /// to the removed range and re-inserts the trailing remainder as a new
    /// fragment of the same kind. The range must be fully covered by one
    /// fragment of the expected kind; anything else means the caller's idea
    /// of the address space has diverged from the map and is fatal.
    pub fn remove(&mut self, start: usize, len: usize, kind: FragmentKind, tick: u64) {
        let Some(end) = checked_end(start, len) else {
            self.die(format_args!("remove of {start:#x}+{len:#x} wraps the address space"));
        };

        let Ok((idx, f)) = self.lookup(start) else {
            self.die(format_args!("remove of untracked range {start:#x}..{end:#x}"));
        };
        if f.kind != kind {
            self.die(format_args!(
                "remove of {start:#x}..{end:#x} expected {kind:?}, found {f:?}"
            ));
        }
        if !f.covers(start, end) {
            self.die(format_args!("remove of {start:#x}..{end:#x} exceeds {f:?}"));
        }

        let (f_start, f_end) = (f.start, f.end);
        match (f_start == start, f_end == end) {
            (true, true) => {
                self.entries.remove(idx);
            }
            (true, false) => {
                self.entries[idx].start = end;
                self.entries[idx].last_touched = tick;
            }
            (false, true) => {
                self.entries[idx].end = start;
                self.entries[idx].last_touched = tick;
            }
            (false, false) => {
                // The trailing remainder is never dropped.
                self.entries[idx].end = start;
                self.entries[idx].last_touched = tick;
                self.ensure_capacity();
                self.entries.insert(idx + 1, Fragment::new(end, f_end, kind, tick));
            }
        }

        debug!(?kind, start, end, "Fragment range removed.");
        self.debug_validate();
    }

    /// Removes a fragment known to stand alone: `[start, start + len)`
    /// must be exactly one whole fragment of `kind`. The forced-free path
    /// uses this instead of the general truncation logic of
    /// [`remove`](Self::remove).
    pub fn remove_isolated(&mut self, start: usize, len: usize, kind: FragmentKind) {
        let Some(end) = checked_end(start, len) else {
            self.die(format_args!("remove of {start:#x}+{len:#x} wraps the address space"));
        };
        let Ok((idx, f)) = self.lookup(start) else {
            self.die(format_args!("remove of untracked range {start:#x}..{end:#x}"));
        };
        if f.kind != kind || f.start != start || f.end != end {
            self.die(format_args!("range {start:#x}..{end:#x} is not an isolated {kind:?}, found {f:?}"));
        }
        self.entries.remove(idx);
        debug!(?kind, start, end, "Isolated fragment removed.");
    }

    /// Reconciles the map with reality after the OS placed a mapping inside
    /// ranges we presumed Foreign: every Foreign fragment overlapping
    /// `[start, start + len)` is trimmed down or removed.
    ///
    /// Overlapping an Owned or Mapped fragment here means the manager
    /// handed out the same range twice, which is fatal.
    pub fn overrule(&mut self, start: usize, len: usize, tick: u64) {
        let Some(end) = checked_end(start, len) else {
            self.die(format_args!("overrule of {start:#x}+{len:#x} wraps the address space"));
        };

        let mut idx = self.entries.partition_point(|f| f.end <= start);
        while idx < self.entries.len() && self.entries[idx].start < end {
            let f = self.entries[idx];
            if f.kind != FragmentKind::Foreign {
                self.die(format_args!(
                    "OS mapping {start:#x}..{end:#x} landed inside non-Foreign {f:?}"
                ));
            }
            warn!(?f, start, end, "Foreign fragment overruled by an actual mapping.");

            match (f.start < start, end < f.end) {
                (false, false) => {
                    // Fully covered.
                    self.entries.remove(idx);
                }
                (true, false) => {
                    self.entries[idx].end = start;
                    self.entries[idx].last_touched = tick;
                    idx += 1;
                }
                (false, true) => {
                    self.entries[idx].start = end;
                    self.entries[idx].last_touched = tick;
                    idx += 1;
                }
                (true, true) => {
                    // The overruled range punches a hole in the middle.
                    self.entries[idx].end = start;
                    self.entries[idx].last_touched = tick;
                    self.ensure_capacity();
                    self.entries
                        .insert(idx + 1, Fragment::new(end, f.end, FragmentKind::Foreign, tick));
                    idx += 2;
                }
            }
        }
        self.debug_validate();
    }

    /// Doubles the capacity of the backing array.
    ///
    /// Guarded by the `extending` flag: if growing ends up re-entering this
    /// function (because obtaining backing storage itself needed the map to
    /// grow), the recursive call observes the flag, checks that the array
    /// already satisfies the need and returns without double-extending.
    pub fn extend(&mut self) {
        if self.extending {
            if self.entries.len() < self.entries.capacity() {
                return;
            }
            self.die(format_args!("re-entered extend() without spare capacity"));
        }
        self.extending = true;

        let new_cap = (self.entries.capacity() * 2).max(BOOT_CAPACITY);
        // Exhausting address space for the map itself has no recovery.
        self.entries.reserve_exact(new_cap - self.entries.len());
        debug!(capacity = self.entries.capacity(), "Region map storage extended.");

        if self.loading {
            self.resized = true;
        }
        self.extending = false;
    }

    #[inline]
    fn ensure_capacity(&mut self) {
        if self.entries.len() == self.entries.capacity() {
            self.extend();
        }
    }

    /// Lowest unused gap able to hold `len` bytes, in fill order, derived
    /// from the tracked fragments. Used as the placement hint for fresh
    /// mappings. `None` when the map tracks nothing yet.
    pub fn lowest_gap(&self, len: usize, dir: GrowthDirection) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        match dir {
            GrowthDirection::Upward => {
                for w in self.entries.windows(2) {
                    if w[1].start - w[0].end >= len {
                        return Some(w[0].end);
                    }
                }
                let last = self.entries.last().unwrap();
                checked_end(last.end, len).map(|_| last.end)
            }
            GrowthDirection::Downward => {
                for i in (1..self.entries.len()).rev() {
                    if self.entries[i].start - self.entries[i - 1].end >= len {
                        return Some(self.entries[i].start - len);
                    }
                }
                self.entries[0].start.checked_sub(len)
            }
        }
    }

    /// Reconstructs the map from the OS's authoritative view of the address
    /// space, retrying if the backing array is grown mid-load.
    ///
    /// The load itself is not supported: the reconciliation semantics for
    /// fragments observed mid-flight are unresolved, so this reports
    /// [`ReloadError::Unsupported`] rather than guessing. The retry
    /// protocol around it is kept live for when it is.
    pub fn reload(&mut self) -> Result<(), ReloadError> {
        debug_assert!(!self.loading);
        loop {
            self.loading = true;
            self.resized = false;
            let loaded = self.load_authoritative();
            self.loading = false;
            match loaded {
                Err(e) => return Err(e),
                Ok(()) if self.resized => {
                    debug!("Region map resized mid-reload, retrying.");
                    continue;
                }
                Ok(()) => {
                    self.generation += 1;
                    return Ok(());
                }
            }
        }
    }

    fn load_authoritative(&mut self) -> Result<(), ReloadError> {
        warn!("Reloading the region map from the OS view is not supported.");
        Err(ReloadError::Unsupported)
    }

    /// Checks sortedness, non-overlap and coalescing closure over the whole
    /// map; any violation is fatal. Cheap enough for tests, too expensive
    /// for release-mode hot paths (see [`debug_validate`](Self::debug_validate)).
    pub fn validate(&self) {
        for f in &self.entries {
            if f.start >= f.end {
                self.die(format_args!("empty or inverted fragment {f:?}"));
            }
        }
        for w in self.entries.windows(2) {
            if w[0].end > w[1].start {
                self.die(format_args!("fragments out of order: {:?} then {:?}", w[0], w[1]));
            }
            if w[0].end == w[1].start && w[0].kind == w[1].kind {
                self.die(format_args!(
                    "adjacent same-kind fragments not coalesced: {:?} then {:?}",
                    w[0], w[1]
                ));
            }
        }
    }

    #[inline]
    fn debug_validate(&self) {
        #[cfg(debug_assertions)]
        self.validate();
    }

    #[cold]
    fn die(&self, msg: core::fmt::Arguments<'_>) -> ! {
        error!(map = ?self.entries, "Region map contract violation: {msg}");
        panic!("region map contract violation: {msg}");
    }
}
