use core::ptr::NonNull;

use crate::{
  chunk::Chunk,
  error::Error,
  heap::{Heap, check_free},
  page::{OsPages, PageProvider},
  size_class::MAX_SIZE_CLASSES,
};

/// Per-thread stacks of recently freed chunks, one per size class.
///
/// Hits and frees into a bin that has room never touch the heap lock. A full bin hands half of
/// its chunks back to the heap in one batch. The handle holds raw chunk pointers and is therefore
/// neither `Send` nor `Sync`: it belongs to the thread that created it.
pub struct ThreadCache<'h, P: PageProvider = OsPages> {
  heap: &'h Heap<P>,
  capacity: usize,
  /// Singly linked through the chunk payload. Bin `k` only holds chunks of at least
  /// `bound(k)` bytes.
  bins: [Option<Chunk>; MAX_SIZE_CLASSES],
  lens: [usize; MAX_SIZE_CLASSES],
}

impl<'h, P: PageProvider> ThreadCache<'h, P> {
  pub(crate) fn new(heap: &'h Heap<P>) -> Self {
    Self {
      heap,
      capacity: heap.config().thread_cache_capacity,
      bins: [None; MAX_SIZE_CLASSES],
      lens: [0; MAX_SIZE_CLASSES],
    }
  }

  pub fn heap(&self) -> &'h Heap<P> {
    self.heap
  }

  /// Like [`Heap::allocate`], served from this thread's bins when possible.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
    let threshold = self.heap.config().large_object_threshold;
    let Some((class, need)) = self.heap.classes().request(size, threshold) else {
      return self.heap.allocate(size);
    };

    if let Some(chunk) = self.pop(class) {
      self.heap.counters().cache_hit();
      return Ok(chunk.user_ptr());
    }

    self.heap.counters().cache_miss();
    self.heap.alloc_chunk(size, class, need).map(Chunk::user_ptr)
  }

  /// Parks a small chunk in this thread's bins; large objects go straight back to the heap.
  ///
  /// # Safety
  /// Same contract as [`Heap::deallocate`] on the heap this cache belongs to.
  pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    unsafe {
      let chunk = Chunk::from_user(ptr);
      check_free(chunk);
      if chunk.is_large() || self.capacity == 0 {
        return self.heap.deallocate(ptr.as_ptr());
      }

      let class = self.heap.classes().floor_class(chunk.size());
      if self.lens[class] >= self.capacity {
        self.drain(class, (self.capacity / 2).max(1));
      }
      chunk.set_cached(true);
      chunk.set_link_next(self.bins[class]);
      self.bins[class] = Some(chunk);
      self.lens[class] += 1;
    }
  }

  /// Returns every cached chunk to the heap under a single lock acquisition.
  pub fn flush(&mut self) {
    if self.cached() == 0 {
      return;
    }

    let bins = &mut self.bins;
    let lens = &mut self.lens;
    let mut class = 0;
    let chunks = core::iter::from_fn(|| {
      loop {
        let slot = bins.get_mut(class)?;
        match *slot {
          Some(chunk) => {
            *slot = unsafe { chunk.link_next() };
            lens[class] -= 1;
            return Some(chunk);
          }
          None => class += 1,
        }
      }
    });
    unsafe { self.heap.free_batch(chunks) };
    self.heap.counters().cache_flush();
  }

  /// Chunks currently parked in this cache.
  pub fn cached(&self) -> usize {
    self.lens.iter().sum()
  }

  fn pop(&mut self, class: usize) -> Option<Chunk> {
    let chunk = self.bins[class]?;
    unsafe {
      self.bins[class] = chunk.link_next();
      chunk.set_cached(false);
    }
    self.lens[class] -= 1;
    Some(chunk)
  }

  fn drain(&mut self, class: usize, count: usize) {
    let bin = &mut self.bins[class];
    let len = &mut self.lens[class];
    let chunks = core::iter::from_fn(|| {
      let chunk = (*bin)?;
      *bin = unsafe { chunk.link_next() };
      *len -= 1;
      Some(chunk)
    })
    .take(count);
    unsafe { self.heap.free_batch(chunks) };
    self.heap.counters().cache_flush();
  }
}

impl<P: PageProvider> Drop for ThreadCache<'_, P> {
  fn drop(&mut self) {
    self.flush();
  }
}

#[cfg(test)]
mod tests {
  use crate::{Config, Heap};

  #[test]
  fn freed_chunk_is_reused_without_the_heap() {
    let heap = Heap::new(Config::DEFAULT).unwrap();
    let mut cache = heap.thread_cache();

    let a = cache.allocate(100).unwrap();
    unsafe { cache.deallocate(a.as_ptr()) };
    assert_eq!(cache.cached(), 1);

    let report = heap.audit().unwrap();
    assert_eq!(report.cached_chunks, 1);
    assert_eq!(report.allocated_chunks, 1);

    let b = cache.allocate(110).unwrap();
    assert_eq!(a, b);
    assert_eq!(cache.cached(), 0);

    let stats = heap.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    unsafe { cache.deallocate(b.as_ptr()) };
  }

  #[test]
  fn full_bin_flushes_half() {
    let heap = Heap::new(Config::new().with_thread_cache_capacity(4)).unwrap();
    let mut cache = heap.thread_cache();

    let ptrs: Vec<_> = (0..5).map(|_| cache.allocate(64).unwrap()).collect();
    for &ptr in &ptrs[..4] {
      unsafe { cache.deallocate(ptr.as_ptr()) };
    }
    assert_eq!(cache.cached(), 4);
    assert_eq!(heap.stats().cache_flushes, 0);

    unsafe { cache.deallocate(ptrs[4].as_ptr()) };
    assert_eq!(cache.cached(), 3);
    assert_eq!(heap.stats().cache_flushes, 1);

    let report = heap.audit().unwrap();
    assert_eq!(report.cached_chunks, 3);
    assert_eq!(report.allocated_chunks, 3);
  }

  #[test]
  fn dropping_the_cache_returns_everything() {
    let heap = Heap::new(Config::DEFAULT).unwrap();
    {
      let mut cache = heap.thread_cache();
      let ptrs: Vec<_> = (1..=200).map(|n| cache.allocate(n * 7).unwrap()).collect();
      for ptr in ptrs {
        unsafe { cache.deallocate(ptr.as_ptr()) };
      }
      assert!(cache.cached() > 0);
    }

    let report = heap.audit().unwrap();
    assert_eq!(report.allocated_chunks, 0);
    assert_eq!(report.free_chunks, 1);
    assert_eq!(report.vacant_spans, 1);
  }

  #[test]
  fn zero_capacity_bypasses_the_bins() {
    let heap = Heap::new(Config::new().with_thread_cache_capacity(0)).unwrap();
    let mut cache = heap.thread_cache();
    let ptr = cache.allocate(32).unwrap();
    unsafe { cache.deallocate(ptr.as_ptr()) };
    assert_eq!(cache.cached(), 0);
    assert_eq!(heap.audit().unwrap().allocated_chunks, 0);
  }

  #[test]
  fn large_objects_skip_the_cache() {
    let heap = Heap::new(Config::DEFAULT).unwrap();
    let mut cache = heap.thread_cache();
    let size = heap.config().large_object_threshold + 1;
    let ptr = cache.allocate(size).unwrap();
    assert_eq!(heap.stats().large_objects, 1);
    unsafe { cache.deallocate(ptr.as_ptr()) };
    assert_eq!(cache.cached(), 0);
    assert_eq!(heap.stats().large_objects, 0);
    assert_eq!(heap.stats().cache_misses, 0);
  }
}
