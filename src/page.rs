use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{config::align_up, error::Error};

/// OS page size, queried once.
pub fn page_size() -> usize {
  static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
  let cached = PAGE_SIZE.load(Ordering::Relaxed);
  if cached != 0 {
    return cached;
  }
  let size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
    n if n > 0 => n as usize,
    _ => 4096,
  };
  PAGE_SIZE.store(size, Ordering::Relaxed);
  size
}

/// Source of page-granular address ranges for a [`Heap`](crate::Heap).
///
/// # Safety
/// `reserve` must return a zero-initialized, page-aligned, read/write mapping of at least `size`
/// bytes that nothing else uses until it is passed back to `release`.
pub unsafe trait PageProvider: Send + Sync {
  fn page_size(&self) -> usize;

  /// Reserves at least `size` bytes, rounded up to the page size.
  fn reserve(&self, size: usize) -> Result<NonNull<u8>, Error>;

  /// # Safety
  /// `ptr` and `size` must match a prior `reserve` exactly, and the range must no longer be used.
  unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

unsafe impl<P: PageProvider + ?Sized> PageProvider for &P {
  fn page_size(&self) -> usize {
    (**self).page_size()
  }

  fn reserve(&self, size: usize) -> Result<NonNull<u8>, Error> {
    (**self).reserve(size)
  }

  unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
    unsafe { (**self).release(ptr, size) }
  }
}

/// Anonymous private mappings from the OS (`mmap`/`munmap`).
#[derive(Debug, Default)]
pub struct OsPages {
  mappings: AtomicUsize,
  bytes: AtomicUsize,
}

impl OsPages {
  pub const fn new() -> Self {
    Self {
      mappings: AtomicUsize::new(0),
      bytes: AtomicUsize::new(0),
    }
  }

  /// Mappings and bytes currently reserved through this provider.
  pub fn outstanding(&self) -> (usize, usize) {
    (
      self.mappings.load(Ordering::Relaxed),
      self.bytes.load(Ordering::Relaxed),
    )
  }
}

unsafe impl PageProvider for OsPages {
  fn page_size(&self) -> usize {
    page_size()
  }

  fn reserve(&self, size: usize) -> Result<NonNull<u8>, Error> {
    let page = page_size();
    if size == 0 || size > isize::MAX as usize - page {
      return Err(Error::OutOfMemory { requested: size });
    }
    let len = align_up(size, page);

    let ptr = unsafe {
      libc::mmap(
        null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };

    if ptr == libc::MAP_FAILED {
      return Err(Error::OutOfMemory { requested: size });
    }

    self.mappings.fetch_add(1, Ordering::Relaxed);
    self.bytes.fetch_add(len, Ordering::Relaxed);
    NonNull::new(ptr.cast()).ok_or(Error::OutOfMemory { requested: size })
  }

  unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
    let len = align_up(size, page_size());
    unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    self.mappings.fetch_sub(1, Ordering::Relaxed);
    self.bytes.fetch_sub(len, Ordering::Relaxed);
  }
}

/// Caps the bytes another provider may have outstanding. Going over the budget fails like the OS
/// refusing a mapping.
#[derive(Debug)]
pub struct BudgetedPages<P = OsPages> {
  inner: P,
  budget: usize,
  used: AtomicUsize,
}

impl<P: PageProvider> BudgetedPages<P> {
  pub const fn new(inner: P, budget: usize) -> Self {
    Self {
      inner,
      budget,
      used: AtomicUsize::new(0),
    }
  }

  pub fn budget(&self) -> usize {
    self.budget
  }

  pub fn used(&self) -> usize {
    self.used.load(Ordering::Relaxed)
  }

  pub fn inner(&self) -> &P {
    &self.inner
  }
}

unsafe impl<P: PageProvider> PageProvider for BudgetedPages<P> {
  fn page_size(&self) -> usize {
    self.inner.page_size()
  }

  fn reserve(&self, size: usize) -> Result<NonNull<u8>, Error> {
    let oom = Error::OutOfMemory { requested: size };
    let page = self.inner.page_size();
    let len = size.checked_add(page - 1).ok_or(oom)? & !(page - 1);

    self
      .used
      .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |used| {
        used.checked_add(len).filter(|&total| total <= self.budget)
      })
      .map_err(|_| oom)?;

    self.inner.reserve(size).inspect_err(|_| {
      self.used.fetch_sub(len, Ordering::Relaxed);
    })
  }

  unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
    let page = self.inner.page_size();
    unsafe { self.inner.release(ptr, size) };
    self.used.fetch_sub(align_up(size, page), Ordering::Relaxed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_size_is_a_power_of_two() {
    assert!(page_size().is_power_of_two());
    assert!(page_size() >= 4096);
  }

  #[test]
  fn reserve_gives_zeroed_page_aligned_memory() {
    let pages = OsPages::new();
    let size = 3 * page_size() + 1;
    let ptr = pages.reserve(size).unwrap();
    assert_eq!(ptr.as_ptr() as usize % page_size(), 0);
    assert_eq!(pages.outstanding(), (1, 4 * page_size()));

    let bytes = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
    assert!(bytes.iter().all(|&b| b == 0));
    bytes.fill(0xAB);

    unsafe { pages.release(ptr, size) };
    assert_eq!(pages.outstanding(), (0, 0));
  }

  #[test]
  fn oversized_reservation_fails() {
    let pages = OsPages::new();
    assert_eq!(
      pages.reserve(usize::MAX),
      Err(Error::OutOfMemory { requested: usize::MAX })
    );
    assert!(pages.reserve(0).is_err());
    assert_eq!(pages.outstanding(), (0, 0));
  }

  #[test]
  fn budget_is_enforced_and_refunded() {
    let page = page_size();
    let pages = BudgetedPages::new(OsPages::new(), 4 * page);

    let a = pages.reserve(3 * page).unwrap();
    assert_eq!(pages.used(), 3 * page);
    assert_eq!(
      pages.reserve(2 * page),
      Err(Error::OutOfMemory { requested: 2 * page })
    );
    let b = pages.reserve(1).unwrap();
    assert_eq!(pages.used(), 4 * page);

    unsafe {
      pages.release(a, 3 * page);
      pages.release(b, 1);
    }
    assert_eq!(pages.used(), 0);
    assert_eq!(pages.inner().outstanding(), (0, 0));
  }
}
