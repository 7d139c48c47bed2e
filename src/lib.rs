//! A page-granularity virtual memory manager written in Rust.
//!
//! This crate implements the lowest allocation layer of a process: it
//! obtains, tracks, recycles and releases address-space regions at the
//! granularity of the operating system's page size. General-purpose heaps
//! and object pools are meant to be built *on top* of it; nothing here
//! hands out anything smaller than a page.
//!
//! # Usage
//! ```
//! use rusty_pages::PageAllocator;
//!
//! let vmm = PageAllocator::new();
//! let page = vmm.page_size();
//!
//! let p = vmm.alloc(2 * page);
//! unsafe { p.as_ptr().write(42) };
//! vmm.free(p, 2 * page);
//! ```
//!
//! The manager also implements [`Allocator`](core::alloc::Allocator), so
//! collection types can sit directly on it when whole-page allocations are
//! acceptable.
//!
//! # Mode of operation
//! Every allocation first consults the [page cache](#page-cache); a miss
//! falls through to the OS mapping facility with a placement
//! [hint](#hints) derived from the [region map](#region-map). Frees run
//! the same path backwards: small runs park in the cache, big ones are
//! unmapped immediately.
//!
//! ## Region map
//! A sorted array of non-overlapping fragments describing every range the
//! manager knows about, each tagged `Owned` (obtained and live), `Mapped`
//! (obtained through the raw wrappers for some other purpose) or
//! `Foreign` (believed to belong to something else, e.g. a shared
//! library). Adjacent same-kind fragments are always coalesced, and any
//! invariant violation is fatal by design: a corrupted map would poison
//! every later placement decision, and the callers of the lowest layer
//! have no recovery of their own.
//!
//! ## Page cache
//! Freed runs are parked in bounded per-page-count lines (plus a
//! catch-all for large runs) instead of being returned to the OS, so
//! matching allocations can be satisfied without a mapping call.
//! Address-adjacent entries coalesce and promote into larger lines, full
//! lines evict their trailing entry, and a periodic sweep expires entries
//! that overstay — aggressively once they are old, leniently while they
//! still border owned memory they might coalesce with.
//!
//! ## Hints
//! Fresh mappings are requested at the lowest unused gap the map knows
//! of, keeping the live address range compact. The OS is free to ignore
//! the hint; when it does, the manager adopts the actual address,
//! overrules any `Foreign` fragments it overlapped, and probes the hinted
//! address with a one-page mapping to decide whether it is genuinely
//! occupied (recorded `Foreign`) or was only transiently busy (left
//! untouched).
//!
//! ## Accounting
//! Every operation is charged to either the "user" books (memory handed
//! to callers) or the "core" books (memory consumed by higher allocation
//! layers). At shutdown the combined page totals must equal the Owned
//! pages left in the region map: a difference is a bookkeeping bug in the
//! manager and is reported separately from genuinely leaked regions. An
//! optional tracking mode records the call site of every live allocation
//! for leak hunting.
#![feature(allocator_api)]

pub use crate::fragment::{Fragment, FragmentKind};
pub use crate::os::{GrowthDirection, MemorySource, MmapSource};
pub use crate::region_map::ReloadError;
pub use crate::stats::{AllocationSite, MemoryTag, StatsSnapshot, TagSnapshot};
pub use crate::vmm::{PageAllocator, ShutdownReport};

pub mod fragment;
pub mod os;
pub mod page_cache;
pub mod region_map;
pub mod stats;
mod util;
pub mod vmm;
