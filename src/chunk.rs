//! Raw layout of spans and chunks. All pointer arithmetic on heap memory lives here.
//!
//! A small span looks like:
//!
//! ```text
//! | SpanHeader | chunk | chunk | ... | chunk | fencepost |
//!              ^ FIRST                       ^ ALLOCATED, size 0
//! ```
//!
//! Every chunk starts with a [`ChunkHeader`]; the user pointer follows it. `prev_size` always
//! holds the size of the physical predecessor, so both neighbours are reachable in O(1). A large
//! mapping holds a `SpanHeader` at its base and a single `LARGE` chunk header right before the
//! (possibly over-aligned) user pointer; there `prev_size` is the header's offset from the base.

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
};

pub(crate) const ALIGNMENT: usize = 16;
pub(crate) const HEADER_SIZE: usize = size_of::<ChunkHeader>();
/// Header plus the two free-list links.
pub(crate) const MIN_CHUNK_SIZE: usize = size_of::<FreeChunk>();
pub(crate) const MIN_PAYLOAD: usize = MIN_CHUNK_SIZE - HEADER_SIZE;
pub(crate) const SPAN_HEADER_SIZE: usize = size_of::<SpanHeader>();
/// Span header, first chunk header and fencepost.
pub(crate) const SPAN_OVERHEAD: usize = SPAN_HEADER_SIZE + HEADER_SIZE;

/// Magic number to identify valid SpanHeaders
const SPAN_MAGIC: u64 = 0x5345_4748_4541_5021; // "SEGHEAP!"

const ALLOCATED: usize = 1;
const FIRST: usize = 1 << 1;
const LARGE: usize = 1 << 2;
const CACHED: usize = 1 << 3;
const FLAG_MASK: usize = ALIGNMENT - 1;

const _: () = assert!(HEADER_SIZE == ALIGNMENT);
const _: () = assert!(MIN_CHUNK_SIZE == 2 * ALIGNMENT);
const _: () = assert!(SPAN_HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(FLAG_MASK >= (ALLOCATED | FIRST | LARGE | CACHED));

#[repr(C)]
pub(crate) struct ChunkHeader {
  prev_size: usize,
  size_flags: usize,
}

#[repr(C)]
struct FreeChunk {
  _header: ChunkHeader,
  next: *mut ChunkHeader,
  prev: *mut ChunkHeader,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SpanKind {
  Small = 0,
  Large = 1,
}

/// Sits at offset 0 of every mapping obtained from the page provider.
#[repr(C, align(16))]
pub(crate) struct SpanHeader {
  magic: u64,
  /// Total mapping size.
  size: usize,
  /// Intrusive links in the arena's span (or large object) list.
  next: *mut SpanHeader,
  prev: *mut SpanHeader,
  kind: SpanKind,
}

/// Handle to a chunk header somewhere inside a span.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Chunk(NonNull<ChunkHeader>);

impl Chunk {
  /// # Safety
  /// `addr` must point at a chunk header inside a live span.
  #[inline]
  pub(crate) unsafe fn at(addr: usize) -> Self {
    Self(unsafe { NonNull::new_unchecked(addr as *mut ChunkHeader) })
  }

  /// # Safety
  /// `ptr` must be a user pointer previously handed out by this heap.
  #[inline]
  pub(crate) unsafe fn from_user(ptr: NonNull<u8>) -> Self {
    unsafe { Self::at(ptr.as_ptr() as usize - HEADER_SIZE) }
  }

  #[inline]
  fn from_raw(ptr: *mut ChunkHeader) -> Option<Self> {
    NonNull::new(ptr).map(Self)
  }

  #[inline]
  pub(crate) fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  #[inline]
  pub(crate) fn user_ptr(self) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked((self.addr() + HEADER_SIZE) as *mut u8) }
  }

  #[inline]
  fn raw(self) -> *mut ChunkHeader {
    self.0.as_ptr()
  }

  #[inline]
  fn free(self) -> *mut FreeChunk {
    self.0.as_ptr().cast()
  }

  #[inline]
  pub(crate) unsafe fn size(self) -> usize {
    unsafe { (*self.raw()).size_flags & !FLAG_MASK }
  }

  #[inline]
  pub(crate) unsafe fn prev_size(self) -> usize {
    unsafe { (*self.raw()).prev_size }
  }

  #[inline]
  pub(crate) unsafe fn set_prev_size(self, prev_size: usize) {
    unsafe { (*self.raw()).prev_size = prev_size };
  }

  #[inline]
  unsafe fn flags(self) -> usize {
    unsafe { (*self.raw()).size_flags & FLAG_MASK }
  }

  #[inline]
  unsafe fn set_size_flags(self, size: usize, flags: usize) {
    debug_assert!(size % ALIGNMENT == 0);
    unsafe { (*self.raw()).size_flags = size | flags };
  }

  #[inline]
  pub(crate) unsafe fn is_allocated(self) -> bool {
    unsafe { self.flags() & ALLOCATED != 0 }
  }

  #[inline]
  pub(crate) unsafe fn is_first(self) -> bool {
    unsafe { self.flags() & FIRST != 0 }
  }

  #[inline]
  pub(crate) unsafe fn is_large(self) -> bool {
    unsafe { self.flags() & LARGE != 0 }
  }

  #[inline]
  pub(crate) unsafe fn is_cached(self) -> bool {
    unsafe { self.flags() & CACHED != 0 }
  }

  /// Rewrites the size, keeping FIRST and setting ALLOCATED as asked.
  #[inline]
  pub(crate) unsafe fn set_size(self, size: usize, allocated: bool) {
    unsafe {
      let first = self.flags() & FIRST;
      self.set_size_flags(size, first | if allocated { ALLOCATED } else { 0 });
    }
  }

  #[inline]
  pub(crate) unsafe fn set_allocated(self, allocated: bool) {
    unsafe { self.set_size(self.size(), allocated) };
  }

  #[inline]
  pub(crate) unsafe fn set_cached(self, cached: bool) {
    unsafe {
      let flags = self.flags();
      let flags = if cached { flags | CACHED } else { flags & !CACHED };
      self.set_size_flags(self.size(), flags);
    }
  }

  /// Writes a fresh FREE chunk header.
  #[inline]
  pub(crate) unsafe fn init_free(self, prev_size: usize, size: usize) {
    unsafe {
      self.set_prev_size(prev_size);
      self.set_size_flags(size, 0);
    }
  }

  /// Physically next chunk (or the fencepost).
  #[inline]
  pub(crate) unsafe fn next(self) -> Chunk {
    unsafe { Self::at(self.addr() + self.size()) }
  }

  /// Physically previous chunk, `None` for the first chunk of a span.
  #[inline]
  pub(crate) unsafe fn prev(self) -> Option<Chunk> {
    unsafe {
      if self.is_first() {
        None
      } else {
        Some(Self::at(self.addr() - self.prev_size()))
      }
    }
  }

  /// Whether this is the zero-sized fencepost closing a span.
  #[inline]
  pub(crate) unsafe fn is_fencepost(self) -> bool {
    unsafe { self.size() == 0 }
  }

  /// Span owning a FIRST chunk.
  #[inline]
  pub(crate) unsafe fn span_of_first(self) -> Span {
    debug_assert!(unsafe { self.is_first() });
    unsafe { Span::at(self.addr() - SPAN_HEADER_SIZE) }
  }

  /// Span (mapping) owning a LARGE chunk.
  #[inline]
  pub(crate) unsafe fn span_of_large(self) -> Span {
    debug_assert!(unsafe { self.is_large() });
    unsafe { Span::at(self.addr() - self.prev_size()) }
  }

  /// Free-list (or cache stack) successor stored in the payload.
  #[inline]
  pub(crate) unsafe fn link_next(self) -> Option<Chunk> {
    unsafe { Self::from_raw((*self.free()).next) }
  }

  #[inline]
  pub(crate) unsafe fn set_link_next(self, next: Option<Chunk>) {
    unsafe { (*self.free()).next = next.map_or(null_mut(), Chunk::raw) };
  }

  #[inline]
  pub(crate) unsafe fn link_prev(self) -> Option<Chunk> {
    unsafe { Self::from_raw((*self.free()).prev) }
  }

  #[inline]
  pub(crate) unsafe fn set_link_prev(self, prev: Option<Chunk>) {
    unsafe { (*self.free()).prev = prev.map_or(null_mut(), Chunk::raw) };
  }
}

/// Handle to the header of a page-provider mapping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Span(NonNull<SpanHeader>);

impl Span {
  #[inline]
  unsafe fn at(addr: usize) -> Self {
    Self(unsafe { NonNull::new_unchecked(addr as *mut SpanHeader) })
  }

  #[inline]
  fn raw(self) -> *mut SpanHeader {
    self.0.as_ptr()
  }

  /// Writes a span header at the start of a fresh mapping.
  ///
  /// # Safety
  /// `base` must be a writable mapping of `size` bytes owned by the caller.
  pub(crate) unsafe fn init(base: NonNull<u8>, size: usize, kind: SpanKind) -> Self {
    let span = Self(base.cast());
    unsafe {
      span.raw().write(SpanHeader {
        magic: SPAN_MAGIC,
        size,
        next: null_mut(),
        prev: null_mut(),
        kind,
      });
    }
    span
  }

  #[inline]
  pub(crate) fn base(self) -> NonNull<u8> {
    self.0.cast()
  }

  #[inline]
  pub(crate) fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  #[inline]
  pub(crate) unsafe fn size(self) -> usize {
    unsafe { (*self.raw()).size }
  }

  #[inline]
  pub(crate) unsafe fn kind(self) -> SpanKind {
    unsafe { (*self.raw()).kind }
  }

  #[inline]
  pub(crate) unsafe fn is_valid(self) -> bool {
    unsafe { (*self.raw()).magic == SPAN_MAGIC }
  }

  #[inline]
  pub(crate) unsafe fn next(self) -> Option<Span> {
    unsafe { NonNull::new((*self.raw()).next).map(Span) }
  }

  #[inline]
  pub(crate) unsafe fn set_next(self, next: Option<Span>) {
    unsafe { (*self.raw()).next = next.map_or(null_mut(), Span::raw) };
  }

  #[inline]
  pub(crate) unsafe fn prev(self) -> Option<Span> {
    unsafe { NonNull::new((*self.raw()).prev).map(Span) }
  }

  #[inline]
  pub(crate) unsafe fn set_prev(self, prev: Option<Span>) {
    unsafe { (*self.raw()).prev = prev.map_or(null_mut(), Span::raw) };
  }

  /// Bytes available to chunks in a small span.
  #[inline]
  pub(crate) unsafe fn chunk_capacity(self) -> usize {
    unsafe { self.size() - SPAN_OVERHEAD }
  }

  #[inline]
  pub(crate) unsafe fn first_chunk(self) -> Chunk {
    unsafe { Chunk::at(self.addr() + SPAN_HEADER_SIZE) }
  }

  #[inline]
  pub(crate) unsafe fn fencepost(self) -> Chunk {
    unsafe { Chunk::at(self.addr() + self.size() - HEADER_SIZE) }
  }

  /// Lays out a small span as one FREE chunk followed by the fencepost.
  pub(crate) unsafe fn format_small(self) -> Chunk {
    unsafe {
      let capacity = self.chunk_capacity();
      let first = self.first_chunk();
      first.set_prev_size(0);
      first.set_size_flags(capacity, FIRST);

      let fence = self.fencepost();
      fence.set_prev_size(capacity);
      fence.set_size_flags(0, ALLOCATED);
      first
    }
  }

  /// Whether a single FREE chunk covers the whole span.
  #[inline]
  pub(crate) unsafe fn is_vacant(self) -> bool {
    unsafe {
      let first = self.first_chunk();
      !first.is_allocated() && first.size() == self.chunk_capacity()
    }
  }

  /// Writes the header of the single chunk of a large mapping.
  ///
  /// # Safety
  /// `user` must lie inside the mapping with room for a header before it.
  pub(crate) unsafe fn place_large(self, user: usize) -> Chunk {
    unsafe {
      let chunk = Chunk::at(user - HEADER_SIZE);
      chunk.set_prev_size(chunk.addr() - self.addr());
      chunk.set_size_flags(self.size(), ALLOCATED | LARGE);
      chunk
    }
  }
}
