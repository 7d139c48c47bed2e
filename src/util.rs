//! Utility functions for page-granular address arithmetic.

/// Returns the number of pages needed to hold `len` bytes.
/// A zero `len` still occupies one page since the manager never
/// hands out empty regions.
///
/// # Panics
/// Panics if `page_size` is 0.
#[inline]
pub(crate) fn pages_for(len: usize, page_size: usize) -> usize {
    if len == 0 {
        return 1;
    }
    len / page_size + usize::from(len % page_size != 0)
}

/// Returns the smallest page multiple that can hold `len` bytes
/// or `None` if that multiple can not be contained in a `usize`.
///
/// # Panics
/// Panics if `page_size` is 0.
#[inline]
pub(crate) fn round_to_pages(len: usize, page_size: usize) -> Option<usize> {
    pages_for(len, page_size).checked_mul(page_size)
}

/// Returns the one-past-the-end address of a region
/// or `None` if the region would wrap the address space.
#[inline(always)]
pub(crate) fn checked_end(base: usize, len: usize) -> Option<usize> {
    base.checked_add(len)
}

#[inline(always)]
pub(crate) fn is_page_aligned(addr: usize, page_size: usize) -> bool {
    addr % page_size == 0
}
