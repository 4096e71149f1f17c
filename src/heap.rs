use core::{iter, ptr::NonNull};

use spin::Mutex;

use crate::{
  arena::{Arena, Detached},
  cache::ThreadCache,
  chunk::{ALIGNMENT, Chunk, HEADER_SIZE, SPAN_HEADER_SIZE, SPAN_OVERHEAD, Span, SpanKind},
  config::{Config, align_up},
  error::{AuditError, Error},
  page::{OsPages, PageProvider},
  size_class::SizeClasses,
  stats::{HeapReport, HeapStats, Stats},
};

/// Room in front of a large object's user pointer: span header plus chunk header.
const LARGE_PREFIX: usize = SPAN_HEADER_SIZE + HEADER_SIZE;

/// A self-contained allocator: size-class free lists and span bookkeeping behind one lock, on top
/// of a [`PageProvider`].
///
/// Every method takes `&self`; share a heap between threads by reference and give each thread its
/// own [`ThreadCache`] for lock-free reuse of recently freed chunks. Dropping the heap releases
/// every span and large mapping it still owns, so pointers obtained from it must not outlive it.
pub struct Heap<P: PageProvider = OsPages> {
  config: Config,
  classes: SizeClasses,
  provider: P,
  arena: Mutex<Arena>,
  stats: Stats,
}

impl Heap<OsPages> {
  /// Heap backed by anonymous OS mappings.
  pub fn new(config: Config) -> Result<Self, Error> {
    Self::with_provider(config, OsPages::new())
  }
}

impl<P: PageProvider> Heap<P> {
  pub fn with_provider(config: Config, provider: P) -> Result<Self, Error> {
    config.validate()?;
    Ok(Self::from_validated(config, provider))
  }

  pub(crate) fn from_validated(config: Config, provider: P) -> Self {
    Self {
      classes: SizeClasses::new(&config),
      config,
      provider,
      arena: Mutex::new(Arena::new()),
      stats: Stats::new(),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn provider(&self) -> &P {
    &self.provider
  }

  /// A cache handle for the calling thread. Chunks it holds go back to the heap when it is
  /// flushed or dropped.
  pub fn thread_cache(&self) -> ThreadCache<'_, P> {
    ThreadCache::new(self)
  }

  #[inline]
  pub(crate) fn classes(&self) -> &SizeClasses {
    &self.classes
  }

  #[inline]
  pub(crate) fn counters(&self) -> &Stats {
    &self.stats
  }

  /// Allocates at least `size` bytes aligned to 16, taking the arena lock.
  ///
  /// `size == 0` yields a minimal chunk that must be deallocated like any other.
  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, Error> {
    match self.classes.request(size, self.config.large_object_threshold) {
      Some((class, need)) => self.alloc_chunk(size, class, need).map(Chunk::user_ptr),
      None => self.alloc_large(size, ALIGNMENT),
    }
  }

  /// Allocates at least `size` bytes aligned to `align`. Alignments above 16 get a dedicated
  /// mapping.
  pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, Error> {
    if !align.is_power_of_two() {
      return Err(Error::InvalidAlignment { align });
    }
    if align <= ALIGNMENT {
      return self.allocate(size);
    }
    self.alloc_large(size, align)
  }

  /// Returns a pointer to the heap. Null is ignored.
  ///
  /// # Safety
  /// `ptr` must be null or a live allocation from this heap (directly or through one of its
  /// thread caches) that is not used afterwards.
  pub unsafe fn deallocate(&self, ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    unsafe {
      let chunk = Chunk::from_user(ptr);
      check_free(chunk);
      if chunk.is_large() {
        self.free_large(chunk);
      } else {
        self.free_batch(iter::once(chunk));
      }
    }
  }

  /// Bytes that may be written at `ptr`; 0 for null.
  ///
  /// # Safety
  /// `ptr` must be null or a live allocation from this heap.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    let Some(ptr) = NonNull::new(ptr) else {
      return 0;
    };
    unsafe {
      let chunk = Chunk::from_user(ptr);
      if chunk.is_large() {
        chunk.size() - chunk.prev_size() - HEADER_SIZE
      } else {
        chunk.size() - HEADER_SIZE
      }
    }
  }

  pub fn stats(&self) -> HeapStats {
    self.stats.snapshot()
  }

  /// Walks every span under the lock and verifies the heap invariants.
  pub fn audit(&self) -> Result<HeapReport, AuditError> {
    self.arena.lock().audit(&self.classes)
  }

  /// Returns every vacant span to the page provider. Returns the bytes released.
  pub fn trim(&self) -> usize {
    let detached = self.arena.lock().detach_vacant(&self.classes);
    let released = self.release_spans(detached);
    tracing::debug!(released, "trimmed heap");
    released
  }

  /// Takes a `need`-byte chunk from the free lists, carving a new span when none fits. `size` is
  /// the caller's request, reported on failure.
  pub(crate) fn alloc_chunk(&self, size: usize, class: usize, need: usize) -> Result<Chunk, Error> {
    let split = self.config.split_threshold;
    if let Some(chunk) = self.arena.lock().take(&self.classes, class, need, split) {
      return Ok(chunk);
    }

    let span = self.carve_span(size, need)?;
    Ok(unsafe { self.arena.lock().adopt_span(&self.classes, span, need, split) })
  }

  /// Frees small chunks under a single lock acquisition. Spans left vacant beyond the retention
  /// limit are unmapped once the lock is dropped.
  ///
  /// # Safety
  /// Every chunk must be an allocated small chunk of this heap.
  pub(crate) unsafe fn free_batch(&self, chunks: impl Iterator<Item = Chunk>) {
    let retain = self.config.retain_empty_spans;
    let mut detached = Detached::default();
    {
      let mut arena = self.arena.lock();
      for chunk in chunks {
        unsafe { arena.release(&self.classes, chunk, retain, &mut detached) };
      }
    }
    if !detached.is_empty() {
      self.release_spans(detached);
    }
  }

  /// Maps a fresh small span able to hold a `need`-byte chunk, formatted as one free chunk.
  fn carve_span(&self, requested: usize, need: usize) -> Result<Span, Error> {
    let oom = Error::OutOfMemory { requested };
    let needed = need.checked_add(SPAN_OVERHEAD).ok_or(oom)?;
    let page = self.provider.page_size();
    let size = (self.config.span_growth_policy)(needed).max(needed);
    if size > isize::MAX as usize - page {
      return Err(oom);
    }
    let size = align_up(size, page);

    let base = self.provider.reserve(size).map_err(|_| {
      tracing::warn!(size, need, "page provider refused a span");
      oom
    })?;

    let span = unsafe { Span::init(base, size, SpanKind::Small) };
    unsafe { span.format_small() };
    self.stats.span_carved(size);
    tracing::debug!(base = span.addr(), size, need, "carved span");
    Ok(span)
  }

  fn release_spans(&self, detached: Detached) -> usize {
    let mut released = 0;
    for span in detached {
      let size = unsafe { span.size() };
      unsafe { self.provider.release(span.base(), size) };
      self.stats.span_released(size);
      tracing::debug!(base = span.addr(), size, "released span");
      released += size;
    }
    released
  }

  fn alloc_large(&self, size: usize, align: usize) -> Result<NonNull<u8>, Error> {
    let oom = Error::OutOfMemory { requested: size };
    let page = self.provider.page_size();
    let len = size
      .checked_add(LARGE_PREFIX + align - ALIGNMENT)
      .filter(|&len| len <= isize::MAX as usize - page)
      .ok_or(oom)?;
    let len = align_up(len, page);

    let base = self.provider.reserve(len).map_err(|_| {
      tracing::warn!(size, align, "page provider refused a large object");
      oom
    })?;

    let span = unsafe { Span::init(base, len, SpanKind::Large) };
    let user = align_up(span.addr() + LARGE_PREFIX, align);
    let chunk = unsafe { span.place_large(user) };
    unsafe { self.arena.lock().link_large(span) };

    self.stats.large_mapped(len);
    tracing::trace!(base = span.addr(), len, size, align, "mapped large object");
    Ok(chunk.user_ptr())
  }

  unsafe fn free_large(&self, chunk: Chunk) {
    unsafe {
      let span = chunk.span_of_large();
      let len = span.size();
      self.arena.lock().unlink_large(span);
      self.provider.release(span.base(), len);
      self.stats.large_unmapped(len);
      tracing::trace!(base = span.addr(), len, "unmapped large object");
    }
  }
}

impl<P: PageProvider> Drop for Heap<P> {
  fn drop(&mut self) {
    let (spans, large) = self.arena.get_mut().detach_all();
    self.release_spans(spans);
    for span in large {
      unsafe {
        let len = span.size();
        self.provider.release(span.base(), len);
        self.stats.large_unmapped(len);
      }
    }
  }
}

/// Aborts on a free of a chunk that is not in use.
#[cfg(feature = "debug-tripwire")]
pub(crate) unsafe fn check_free(chunk: Chunk) {
  let (allocated, cached) = unsafe { (chunk.is_allocated(), chunk.is_cached()) };
  if !allocated || cached {
    tracing::error!(chunk = chunk.addr(), allocated, cached, "invalid free");
    std::process::abort();
  }
}

#[cfg(not(feature = "debug-tripwire"))]
#[inline(always)]
pub(crate) unsafe fn check_free(chunk: Chunk) {
  debug_assert!(
    unsafe { chunk.is_allocated() && !chunk.is_cached() },
    "invalid free of chunk {:#x}",
    chunk.addr()
  );
}
