//! Lock-protected global state: segregated free lists, span bookkeeping, splitting and
//! coalescing. Every method expects the caller to hold the heap's arena lock; the page provider
//! is never called from here, detached spans are handed back to be unmapped after unlocking.

use crate::{
  chunk::{ALIGNMENT, Chunk, MIN_CHUNK_SIZE, Span, SpanKind},
  error::AuditError,
  size_class::{MAX_SIZE_CLASSES, SizeClasses},
  stats::HeapReport,
};

/// Free chunks inspected in the request's own class before moving on to larger classes.
const FIRST_FIT_SCAN: usize = 8;

pub(crate) struct Arena {
  /// Doubly linked free list per size class.
  bins: [Option<Chunk>; MAX_SIZE_CLASSES],
  bin_lens: [usize; MAX_SIZE_CLASSES],
  spans: Option<Span>,
  /// Spans covered by a single free chunk that were kept mapped.
  vacant_spans: usize,
  large: Option<Span>,
}

// Chunks and spans are only reached through the arena lock.
unsafe impl Send for Arena {}

/// Spans unlinked from the arena, chained through their list links until they are unmapped.
#[derive(Debug, Default)]
pub(crate) struct Detached {
  head: Option<Span>,
}

impl Detached {
  unsafe fn push(&mut self, span: Span) {
    unsafe {
      span.set_prev(None);
      span.set_next(self.head);
    }
    self.head = Some(span);
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.head.is_none()
  }
}

impl Iterator for Detached {
  type Item = Span;

  // Reads the link before the caller gets a chance to unmap the span.
  fn next(&mut self) -> Option<Span> {
    let span = self.head?;
    self.head = unsafe { span.next() };
    Some(span)
  }
}

unsafe fn link_span(head: &mut Option<Span>, span: Span) {
  unsafe {
    span.set_prev(None);
    span.set_next(*head);
    if let Some(old) = *head {
      old.set_prev(Some(span));
    }
  }
  *head = Some(span);
}

unsafe fn unlink_span(head: &mut Option<Span>, span: Span) {
  unsafe {
    let prev = span.prev();
    let next = span.next();
    match prev {
      Some(prev) => prev.set_next(next),
      None => *head = next,
    }
    if let Some(next) = next {
      next.set_prev(prev);
    }
  }
}

impl Arena {
  pub(crate) const fn new() -> Self {
    Self {
      bins: [None; MAX_SIZE_CLASSES],
      bin_lens: [0; MAX_SIZE_CLASSES],
      spans: None,
      vacant_spans: 0,
      large: None,
    }
  }

  unsafe fn push_free(&mut self, classes: &SizeClasses, chunk: Chunk) {
    let class = classes.class_of(unsafe { chunk.size() });
    unsafe {
      chunk.set_link_prev(None);
      chunk.set_link_next(self.bins[class]);
      if let Some(head) = self.bins[class] {
        head.set_link_prev(Some(chunk));
      }
    }
    self.bins[class] = Some(chunk);
    self.bin_lens[class] += 1;
  }

  /// The chunk's size must be the one it was filed under.
  unsafe fn unlink_free(&mut self, classes: &SizeClasses, chunk: Chunk) {
    let class = classes.class_of(unsafe { chunk.size() });
    unsafe {
      let prev = chunk.link_prev();
      let next = chunk.link_next();
      match prev {
        Some(prev) => prev.set_link_next(next),
        None => self.bins[class] = next,
      }
      if let Some(next) = next {
        next.set_link_prev(prev);
      }
    }
    self.bin_lens[class] -= 1;
  }

  /// Bounded first fit in `class`, then the head of the first non-empty larger class, then the
  /// rest of `class`. Every chunk filed above `class` is larger than `class`'s bound, hence large
  /// enough for `need`. `None` means no free chunk of the arena fits.
  unsafe fn find_fit(&self, classes: &SizeClasses, class: usize, need: usize) -> Option<Chunk> {
    let mut cursor = self.bins[class];
    let mut scanned = 0;
    while let Some(chunk) = cursor {
      if scanned == FIRST_FIT_SCAN {
        break;
      }
      if unsafe { chunk.size() } >= need {
        return Some(chunk);
      }
      cursor = unsafe { chunk.link_next() };
      scanned += 1;
    }

    if let Some(chunk) = (class + 1..classes.count()).find_map(|larger| self.bins[larger]) {
      return Some(chunk);
    }

    while let Some(chunk) = cursor {
      if unsafe { chunk.size() } >= need {
        return Some(chunk);
      }
      cursor = unsafe { chunk.link_next() };
    }
    None
  }

  /// Pops a free chunk of at least `need` bytes and turns it into an allocated chunk.
  pub(crate) fn take(
    &mut self,
    classes: &SizeClasses,
    class: usize,
    need: usize,
    split_threshold: usize,
  ) -> Option<Chunk> {
    unsafe {
      let chunk = self.find_fit(classes, class, need)?;
      debug_assert!(chunk.size() >= need);
      self.unlink_free(classes, chunk);
      Some(self.carve(classes, chunk, need, split_threshold))
    }
  }

  /// Marks an unlinked free chunk allocated, splitting off the tail when it is worth keeping.
  unsafe fn carve(
    &mut self,
    classes: &SizeClasses,
    chunk: Chunk,
    need: usize,
    split_threshold: usize,
  ) -> Chunk {
    unsafe {
      if chunk.is_first() && chunk.next().is_fencepost() {
        self.vacant_spans -= 1;
      }

      let rest = chunk.size() - need;
      if rest >= split_threshold {
        chunk.set_size(need, true);
        let remainder = chunk.next();
        remainder.init_free(need, rest);
        remainder.next().set_prev_size(rest);
        self.push_free(classes, remainder);
      } else {
        chunk.set_allocated(true);
      }
      chunk
    }
  }

  /// Links a freshly formatted span and allocates `need` bytes from its start.
  ///
  /// # Safety
  /// `span` must have been set up with [`Span::format_small`] and not be linked yet.
  pub(crate) unsafe fn adopt_span(
    &mut self,
    classes: &SizeClasses,
    span: Span,
    need: usize,
    split_threshold: usize,
  ) -> Chunk {
    unsafe {
      link_span(&mut self.spans, span);
      self.vacant_spans += 1;
      self.carve(classes, span.first_chunk(), need, split_threshold)
    }
  }

  /// Frees an allocated chunk, merging it with its free neighbours.
  ///
  /// When this leaves the span vacant and `retain` vacant spans are already kept, the span is
  /// unlinked and pushed onto `detached`, to be unmapped by the caller.
  ///
  /// # Safety
  /// `chunk` must be an allocated small chunk of a span owned by this arena.
  pub(crate) unsafe fn release(
    &mut self,
    classes: &SizeClasses,
    chunk: Chunk,
    retain: usize,
    detached: &mut Detached,
  ) {
    unsafe {
      let chunk = self.coalesce(classes, chunk);
      if chunk.is_first() && chunk.next().is_fencepost() {
        let span = chunk.span_of_first();
        if self.vacant_spans >= retain {
          unlink_span(&mut self.spans, span);
          detached.push(span);
          return;
        }
        self.vacant_spans += 1;
      }
      self.push_free(classes, chunk);
    }
  }

  /// Eager merge with both physical neighbours; at most two neighbours are touched.
  unsafe fn coalesce(&mut self, classes: &SizeClasses, chunk: Chunk) -> Chunk {
    unsafe {
      let mut chunk = chunk;
      let mut size = chunk.size();

      let next = chunk.next();
      if !next.is_allocated() {
        self.unlink_free(classes, next);
        size += next.size();
      }

      if let Some(prev) = chunk.prev()
        && !prev.is_allocated()
      {
        self.unlink_free(classes, prev);
        size += prev.size();
        chunk = prev;
      }

      chunk.set_size(size, false);
      chunk.next().set_prev_size(size);
      chunk
    }
  }

  /// Unlinks every vacant span.
  pub(crate) fn detach_vacant(&mut self, classes: &SizeClasses) -> Detached {
    let mut detached = Detached::default();
    let mut cursor = self.spans;
    while let Some(span) = cursor {
      unsafe {
        cursor = span.next();
        if span.is_vacant() {
          self.unlink_free(classes, span.first_chunk());
          unlink_span(&mut self.spans, span);
          self.vacant_spans -= 1;
          detached.push(span);
        }
      }
    }
    detached
  }

  /// Unlinks everything, leaving an empty arena. Returns (small spans, large mappings).
  pub(crate) fn detach_all(&mut self) -> (Detached, Detached) {
    let spans = Detached {
      head: self.spans.take(),
    };
    let large = Detached {
      head: self.large.take(),
    };
    *self = Self::new();
    (spans, large)
  }

  pub(crate) unsafe fn link_large(&mut self, span: Span) {
    unsafe { link_span(&mut self.large, span) };
  }

  pub(crate) unsafe fn unlink_large(&mut self, span: Span) {
    unsafe { unlink_span(&mut self.large, span) };
  }

  /// Walks every span and free list, checking tiling, neighbour links, coalescing and filing.
  pub(crate) fn audit(&self, classes: &SizeClasses) -> Result<HeapReport, AuditError> {
    let mut report = HeapReport::default();

    let mut cursor = self.spans;
    while let Some(span) = cursor {
      unsafe {
        if !span.is_valid() || span.kind() != SpanKind::Small {
          return Err(AuditError::BadSpanMagic { span: span.addr() });
        }
        self.audit_span(span, &mut report)?;
        cursor = span.next();
      }
    }

    let mut listed = 0;
    for class in 0..classes.count() {
      let mut cursor = self.bins[class];
      while let Some(chunk) = cursor {
        unsafe {
          let size = chunk.size();
          if chunk.is_allocated() || classes.class_of(size) != class {
            return Err(AuditError::MisfiledFreeChunk {
              addr: chunk.addr(),
              size,
              class,
            });
          }
          cursor = chunk.link_next();
        }
        listed += 1;
      }
    }
    if listed != report.free_chunks {
      return Err(AuditError::FreeListMismatch {
        listed,
        walked: report.free_chunks,
      });
    }

    let mut cursor = self.large;
    while let Some(span) = cursor {
      unsafe {
        if !span.is_valid() || span.kind() != SpanKind::Large {
          return Err(AuditError::BadSpanMagic { span: span.addr() });
        }
        cursor = span.next();
      }
      report.large_objects += 1;
    }

    Ok(report)
  }

  unsafe fn audit_span(&self, span: Span, report: &mut HeapReport) -> Result<(), AuditError> {
    unsafe {
      report.spans += 1;
      if span.is_vacant() {
        report.vacant_spans += 1;
      }

      let fence = span.fencepost();
      let end = fence.addr();
      let mut chunk = span.first_chunk();
      let mut prev_size = 0;
      let mut prev_free = false;

      while chunk.addr() < end {
        let size = chunk.size();
        if size < MIN_CHUNK_SIZE || size % ALIGNMENT != 0 || chunk.addr() + size > end {
          return Err(AuditError::MisalignedChunk {
            addr: chunk.addr(),
            size,
          });
        }
        if chunk.prev_size() != prev_size || chunk.is_first() != (prev_size == 0) {
          return Err(AuditError::BrokenPrevSize {
            addr: chunk.addr(),
            recorded: chunk.prev_size(),
            actual: prev_size,
          });
        }

        if chunk.is_allocated() {
          report.allocated_chunks += 1;
          report.allocated_bytes += size;
          if chunk.is_cached() {
            report.cached_chunks += 1;
          }
          prev_free = false;
        } else {
          if prev_free {
            return Err(AuditError::UncoalescedNeighbors { addr: chunk.addr() });
          }
          report.free_chunks += 1;
          report.free_bytes += size;
          report.largest_free_chunk = report.largest_free_chunk.max(size);
          prev_free = true;
        }

        prev_size = size;
        chunk = chunk.next();
      }

      let covered = chunk.addr() - span.first_chunk().addr();
      if covered != span.chunk_capacity() || fence.prev_size() != prev_size {
        return Err(AuditError::TilingMismatch {
          span: span.addr(),
          covered,
          expected: span.chunk_capacity(),
        });
      }
      Ok(())
    }
  }
}
