//! [`MemorySource`] trait and structures that implement it.
//!
//! The [`MemorySource`] trait is the manager's only window onto the
//! operating system: an anonymous-mapping facility with an optional
//! placement hint, the matching unmap facility, and the advisory calls
//! used when page runs park in and leave the cache. Everything above this
//! module reasons about plain page-aligned address ranges.

use core::ptr::NonNull;

use tracing::debug;

/// A trait for types that hand out anonymous page-aligned memory regions.
///
/// # Safety
/// * `map` must return regions that are page-aligned, at least `len` bytes
///   long, readable and writable, and disjoint from every region previously
///   returned and not yet unmapped.
/// * copying or moving the source must not invalidate regions it handed out.
pub unsafe trait MemorySource {
    /// The granularity of the source in bytes. Constant for the lifetime
    /// of the source and a power of two.
    fn page_size(&self) -> usize;

    /// Requests a fresh region of `len` bytes, preferably at `hint`.
    /// The hint is advisory: the source may place the region anywhere.
    /// Returns `Err(())` if no address space is available.
    ///
    /// # Safety
    /// `len` must be a nonzero page multiple and `hint`, if given,
    /// page-aligned.
    unsafe fn map(&self, hint: Option<NonNull<u8>>, len: usize) -> Result<NonNull<u8>, ()>;

    /// Releases a region (or a page-aligned subrange of one) back to the
    /// operating system.
    ///
    /// # Safety
    /// `[base, base + len)` must lie within regions previously returned by
    /// [`map`](MemorySource::map) and must not be accessed afterwards.
    unsafe fn unmap(&self, base: NonNull<u8>, len: usize);

    /// Marks a region as parked: its contents may be discarded and access
    /// to it revoked until [`revive`](MemorySource::revive) is called.
    ///
    /// # Safety
    /// Same range requirements as [`unmap`](MemorySource::unmap); the range
    /// must not be accessed until revived.
    unsafe fn retire(&self, base: NonNull<u8>, len: usize);

    /// Makes a previously retired region accessible again. Its contents
    /// are unspecified.
    ///
    /// # Safety
    /// The range must have been retired and not unmapped since.
    unsafe fn revive(&self, base: NonNull<u8>, len: usize);
}

/// Fill direction of the address space: whether the OS tends to place
/// fresh mappings at increasing or decreasing addresses.
///
/// All "lower"/"past" comparisons between addresses go through this type;
/// raw pointer ordering is meaningless without it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GrowthDirection {
    Upward,
    Downward,
}

impl GrowthDirection {
    /// Detects the fill direction by comparing two trial mappings.
    /// Both probes are released before returning.
    pub fn detect<S: MemorySource>(source: &S) -> GrowthDirection {
        let page = source.page_size();
        unsafe {
            let (Ok(first), Ok(second)) = (source.map(None, page), source.map(None, page))
            else {
                // Nothing mappable this early is fatal later anyway;
                // assume the common layout.
                return GrowthDirection::Upward;
            };
            let dir = if (second.as_ptr() as usize) >= (first.as_ptr() as usize) {
                GrowthDirection::Upward
            } else {
                GrowthDirection::Downward
            };
            source.unmap(first, page);
            source.unmap(second, page);
            debug!(?dir, "Detected address-space growth direction.");
            dir
        }
    }

    /// Whether `a` is strictly nearer the fill origin than `b`.
    #[inline(always)]
    pub fn precedes(&self, a: usize, b: usize) -> bool {
        match self {
            GrowthDirection::Upward => a < b,
            GrowthDirection::Downward => a > b,
        }
    }

    /// Whether `a` is strictly past `b`, i.e. further from the fill origin.
    #[inline(always)]
    pub fn past(&self, a: usize, b: usize) -> bool {
        self.precedes(b, a)
    }
}

/// The canonical source: anonymous private mappings via [`libc::mmap`].
#[derive(Debug, Default)]
pub struct MmapSource {
    page_size: std::sync::OnceLock<usize>,
}

impl MmapSource {
    #[inline(always)]
    pub const fn new() -> Self {
        MmapSource { page_size: std::sync::OnceLock::new() }
    }
}

unsafe impl MemorySource for MmapSource {
    fn page_size(&self) -> usize {
        *self
            .page_size
            .get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize })
    }

    unsafe fn map(&self, hint: Option<NonNull<u8>>, len: usize) -> Result<NonNull<u8>, ()> {
        let addr = hint.map_or(core::ptr::null_mut(), |p| p.as_ptr().cast::<libc::c_void>());
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        match libc::mmap(addr, len as libc::size_t, prot, flags, -1, 0) {
            libc::MAP_FAILED => Err(()),
            p => Ok(NonNull::new_unchecked(p.cast::<u8>())),
        }
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) {
        let rc = libc::munmap(base.as_ptr().cast(), len as libc::size_t);
        debug_assert_eq!(rc, 0, "munmap of a tracked region should never fail");
    }

    unsafe fn retire(&self, base: NonNull<u8>, len: usize) {
        // The advisory discard may legitimately fail (e.g. locked memory);
        // the protection change is what the cache relies on.
        libc::madvise(base.as_ptr().cast(), len as libc::size_t, libc::MADV_DONTNEED);
        let rc = libc::mprotect(base.as_ptr().cast(), len as libc::size_t, libc::PROT_NONE);
        debug_assert_eq!(rc, 0, "mprotect of a tracked region should never fail");
    }

    unsafe fn revive(&self, base: NonNull<u8>, len: usize) {
        let rc = libc::mprotect(
            base.as_ptr().cast(),
            len as libc::size_t,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        debug_assert_eq!(rc, 0, "mprotect of a tracked region should never fail");
    }
}


#[cfg(test)]
mod tests {
    use super::fake_source::{FakeSource, FAKE_PAGE_SIZE};
    use super::*;

    #[test]
    fn test_mmap_source_1() {
        let source = MmapSource::new();
        let page = source.page_size();
        assert!(page.is_power_of_two());
        unsafe {
            let p = source.map(None, 2 * page).unwrap();
            assert_eq!(p.as_ptr() as usize % page, 0);
            p.as_ptr().write(0xA5);
            assert_eq!(p.as_ptr().read(), 0xA5);
            source.unmap(p, 2 * page);
        }
    }

    #[test]
    fn test_mmap_source_2() {
        let source = MmapSource::new();
        let dir = GrowthDirection::detect(&source);
        // Whatever the platform answers, the ordering helpers must agree.
        assert_eq!(dir.precedes(1, 2), !dir.precedes(2, 1));
        assert!(!dir.precedes(1, 1));
        assert!(!dir.past(1, 1));
    }

    #[test]
    fn test_fake_source_1() {
        let source = FakeSource::with_pages(8);
        unsafe {
            let a = source.map(None, 2 * FAKE_PAGE_SIZE).unwrap();
            assert_eq!(a.as_ptr() as usize, source.page_addr(0));
            let b = source.map(None, FAKE_PAGE_SIZE).unwrap();
            assert_eq!(b.as_ptr() as usize, source.page_addr(2));
            source.unmap(a, 2 * FAKE_PAGE_SIZE);
            let c = source.map(None, FAKE_PAGE_SIZE).unwrap();
            assert_eq!(c.as_ptr() as usize, source.page_addr(0));
        }
    }

    #[test]
    fn test_fake_source_2() {
        // Honored hint, refused hint, and a hint into foreign pages.
        let source = FakeSource::with_pages(8);
        unsafe {
            let hint = NonNull::new(source.page_addr(4) as *mut u8).unwrap();
            let a = source.map(Some(hint), FAKE_PAGE_SIZE).unwrap();
            assert_eq!(a.as_ptr() as usize, source.page_addr(4));

            source.refuse_hints(1);
            let hint = NonNull::new(source.page_addr(6) as *mut u8).unwrap();
            let b = source.map(Some(hint), FAKE_PAGE_SIZE).unwrap();
            assert_ne!(b.as_ptr() as usize, source.page_addr(6));

            source.occupy(2, 1);
            let hint = NonNull::new(source.page_addr(2) as *mut u8).unwrap();
            let c = source.map(Some(hint), FAKE_PAGE_SIZE).unwrap();
            assert_ne!(c.as_ptr() as usize, source.page_addr(2));
        }
    }

    #[test]
    fn test_fake_source_3() {
        let source = FakeSource::with_pages(4);
        unsafe {
            let a = source.map(None, 4 * FAKE_PAGE_SIZE).unwrap();
            assert!(source.map(None, FAKE_PAGE_SIZE).is_err());

            // Partial unmap frees only the tail pages.
            let tail = NonNull::new(a.as_ptr().add(2 * FAKE_PAGE_SIZE)).unwrap();
            source.unmap(tail, 2 * FAKE_PAGE_SIZE);
            assert_eq!(source.mapped_pages(), 2);
            let b = source.map(None, 2 * FAKE_PAGE_SIZE).unwrap();
            assert_eq!(b.as_ptr() as usize, source.page_addr(2));
        }
    }

    #[test]
    fn test_fake_source_4() {
        let source = FakeSource::with_pages(4);
        unsafe {
            let a = source.map(None, 2 * FAKE_PAGE_SIZE).unwrap();
            source.retire(a, 2 * FAKE_PAGE_SIZE);
            assert!(source.is_protected(a.as_ptr() as usize));
            source.revive(a, 2 * FAKE_PAGE_SIZE);
            assert!(!source.is_protected(a.as_ptr() as usize));
        }
    }
}
