#![allow(clippy::missing_safety_doc)]

//! Segregated-fit heap with boundary-tag coalescing and per-thread caches.
//!
//! [`Heap`] is a self-contained allocator over a [`PageProvider`]. Small requests are rounded up
//! to a size class and served from address-ordered spans whose free chunks are merged with their
//! neighbours as soon as they are freed; requests above the large object threshold get their own
//! mapping. A [`ThreadCache`] keeps recently freed chunks per size class so that the common
//! alloc/free cycle never takes the heap lock.
//!
//! [`Allocator`] plugs a lazily created process-wide heap into `#[global_allocator]`, and the
//! `c_api` feature exports `malloc` and friends.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  ptr::{self, NonNull, null_mut},
};
use std::sync::OnceLock;

mod arena;
mod cache;
mod chunk;
pub mod config;
mod error;
mod heap;
pub mod page;
mod size_class;
mod stats;

pub use cache::ThreadCache;
pub use config::Config;
pub use error::{AuditError, ConfigError, Error};
pub use heap::Heap;
pub use page::{BudgetedPages, OsPages, PageProvider};
pub use size_class::MAX_SIZE_CLASSES;
pub use stats::{HeapReport, HeapStats};

use chunk::ALIGNMENT;

// =============================================================================
// Process-wide heap
// =============================================================================

static HEAP: OnceLock<Heap> = OnceLock::new();

/// The heap behind [`Allocator`], [`allocate`] and [`deallocate`], created on first use.
pub fn global_heap() -> &'static Heap {
  HEAP.get_or_init(|| Heap::from_validated(Config::DEFAULT, OsPages::new()))
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static CACHE: UnsafeCell<Option<ThreadCache<'static>>> = const { UnsafeCell::new(None) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` with this thread's cache, or with `None` when the cache is unavailable: re-entered
/// from inside the allocator (e.g. while the TLS destructor is registered) or already torn down at
/// thread exit. `f` must then use the heap directly.
fn with_cache<R, F>(f: F) -> R
where
  F: FnOnce(Option<&mut ThreadCache<'static>>) -> R + Copy,
{
  let entered = IN_ALLOC.try_with(|flag| !flag.replace(true)).unwrap_or(false);
  if !entered {
    return f(None);
  }

  let result = CACHE.try_with(|slot| {
    let cache = unsafe { &mut *slot.get() }.get_or_insert_with(|| global_heap().thread_cache());
    f(Some(cache))
  });

  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  result.unwrap_or_else(|_| f(None))
}

/// Allocates from the process-wide heap through the calling thread's cache.
pub fn allocate(size: usize) -> Result<NonNull<u8>, Error> {
  with_cache(|cache| match cache {
    Some(cache) => cache.allocate(size),
    None => global_heap().allocate(size),
  })
}

/// Frees a pointer obtained from [`allocate`] or [`Allocator`]. Null is ignored.
pub unsafe fn deallocate(ptr: *mut u8) {
  with_cache(|cache| match cache {
    Some(cache) => unsafe { cache.deallocate(ptr) },
    None => unsafe { global_heap().deallocate(ptr) },
  })
}

fn allocate_layout(size: usize, align: usize) -> *mut u8 {
  let result = if align > ALIGNMENT {
    global_heap().allocate_aligned(size, align)
  } else {
    allocate(size)
  };
  result.map_or(null_mut(), NonNull::as_ptr)
}

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    allocate_layout(layout.size(), layout.align())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { deallocate(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    // Keep the block while the new size fits and does not waste more than half of it.
    let usable = unsafe { global_heap().usable_size(ptr) };
    if new_size <= usable && new_size >= usable / 2 {
      return ptr;
    }

    let new_ptr = allocate_layout(new_size, layout.align());
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        deallocate(ptr);
      }
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  allocate(size).map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { deallocate(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  let ptr = unsafe { malloc(total) };
  if !ptr.is_null() {
    unsafe { ptr::write_bytes(ptr, 0, total) };
  }
  ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return unsafe { malloc(size) };
  }

  if size == 0 {
    unsafe { free(ptr) };
    return null_mut();
  }

  let usable = unsafe { global_heap().usable_size(ptr) };
  if size <= usable && size >= usable / 2 {
    return ptr;
  }

  let new_ptr = unsafe { malloc(size) };
  if !new_ptr.is_null() {
    unsafe {
      ptr::copy_nonoverlapping(ptr, new_ptr, usable.min(size));
      free(ptr);
    }
  }
  new_ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  let ptr = allocate_layout(size, alignment);
  if ptr.is_null() {
    return libc::ENOMEM;
  }

  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { global_heap().usable_size(ptr) }
}
