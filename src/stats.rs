//! Heap counters.
//!
//! All counters use `Relaxed` ordering: a snapshot taken while other threads allocate may be
//! transiently inconsistent across fields. Use [`Heap::audit`](crate::Heap::audit) for an exact
//! picture.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time copy of the heap counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Bytes currently mapped from the page provider (spans and large objects).
  pub reserved_bytes: usize,
  /// Highest value `reserved_bytes` ever reached.
  pub peak_reserved_bytes: usize,
  /// Small-object spans currently mapped.
  pub spans: usize,
  /// Large objects currently mapped.
  pub large_objects: usize,
  pub span_carves: usize,
  pub span_releases: usize,
  pub cache_hits: usize,
  pub cache_misses: usize,
  pub cache_flushes: usize,
}

/// Exact heap shape computed by walking every span.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapReport {
  pub spans: usize,
  /// Spans made of a single free chunk.
  pub vacant_spans: usize,
  pub free_chunks: usize,
  /// Chunks in use, including the ones parked in thread caches.
  pub allocated_chunks: usize,
  pub cached_chunks: usize,
  pub free_bytes: usize,
  pub allocated_bytes: usize,
  pub largest_free_chunk: usize,
  pub large_objects: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
  reserved_bytes: AtomicUsize,
  peak_reserved_bytes: AtomicUsize,
  spans: AtomicUsize,
  large_objects: AtomicUsize,
  span_carves: AtomicUsize,
  span_releases: AtomicUsize,
  cache_hits: AtomicUsize,
  cache_misses: AtomicUsize,
  cache_flushes: AtomicUsize,
}

impl Stats {
  pub(crate) const fn new() -> Self {
    Self {
      reserved_bytes: AtomicUsize::new(0),
      peak_reserved_bytes: AtomicUsize::new(0),
      spans: AtomicUsize::new(0),
      large_objects: AtomicUsize::new(0),
      span_carves: AtomicUsize::new(0),
      span_releases: AtomicUsize::new(0),
      cache_hits: AtomicUsize::new(0),
      cache_misses: AtomicUsize::new(0),
      cache_flushes: AtomicUsize::new(0),
    }
  }

  fn reserve(&self, bytes: usize) {
    let now = self.reserved_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
    self.peak_reserved_bytes.fetch_max(now, Ordering::Relaxed);
  }

  pub(crate) fn span_carved(&self, bytes: usize) {
    self.reserve(bytes);
    self.spans.fetch_add(1, Ordering::Relaxed);
    self.span_carves.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn span_released(&self, bytes: usize) {
    self.reserved_bytes.fetch_sub(bytes, Ordering::Relaxed);
    self.spans.fetch_sub(1, Ordering::Relaxed);
    self.span_releases.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn large_mapped(&self, bytes: usize) {
    self.reserve(bytes);
    self.large_objects.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn large_unmapped(&self, bytes: usize) {
    self.reserved_bytes.fetch_sub(bytes, Ordering::Relaxed);
    self.large_objects.fetch_sub(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn cache_hit(&self) {
    self.cache_hits.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn cache_miss(&self) {
    self.cache_misses.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn cache_flush(&self) {
    self.cache_flushes.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn snapshot(&self) -> HeapStats {
    HeapStats {
      reserved_bytes: self.reserved_bytes.load(Ordering::Relaxed),
      peak_reserved_bytes: self.peak_reserved_bytes.load(Ordering::Relaxed),
      spans: self.spans.load(Ordering::Relaxed),
      large_objects: self.large_objects.load(Ordering::Relaxed),
      span_carves: self.span_carves.load(Ordering::Relaxed),
      span_releases: self.span_releases.load(Ordering::Relaxed),
      cache_hits: self.cache_hits.load(Ordering::Relaxed),
      cache_misses: self.cache_misses.load(Ordering::Relaxed),
      cache_flushes: self.cache_flushes.load(Ordering::Relaxed),
    }
  }
}
