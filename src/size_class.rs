use crate::{
  chunk::{ALIGNMENT, HEADER_SIZE, MIN_PAYLOAD},
  config::{Config, align_up},
};

/// Upper bound on the number of size classes, including the implicit top class.
pub const MAX_SIZE_CLASSES: usize = 64;

/// Chunk sizes up to this bound are classified with a table lookup.
const LOOKUP_LIMIT: usize = 1024;
const LOOKUP_LEN: usize = LOOKUP_LIMIT / ALIGNMENT + 1;

/// Size class table built from a validated [`Config`].
///
/// Class `k` holds chunks whose size lies in `(bound[k - 1], bound[k]]`. The last class ends at
/// the largest small chunk for allocation purposes, but free chunks larger than that (coalesced
/// span remainders) are filed under it too.
#[derive(Clone, Debug)]
pub(crate) struct SizeClasses {
  bounds: [usize; MAX_SIZE_CLASSES],
  len: usize,
  /// `lookup[ceil(size / 16)]` is the class of a chunk of `size` bytes, for sizes <= LOOKUP_LIMIT.
  lookup: [u8; LOOKUP_LEN],
}

impl SizeClasses {
  pub(crate) fn new(config: &Config) -> Self {
    let mut bounds = [0; MAX_SIZE_CLASSES];
    let mut len = 0;
    for &bound in config.size_class_boundaries {
      bounds[len] = bound;
      len += 1;
    }

    let max = config.max_small_chunk();
    if len == 0 || bounds[len - 1] < max {
      bounds[len] = max;
      len += 1;
    }

    let mut classes = Self {
      bounds,
      len,
      lookup: [0; LOOKUP_LEN],
    };
    for slot in 0..LOOKUP_LEN {
      classes.lookup[slot] = classes.search(slot * ALIGNMENT) as u8;
    }
    classes
  }

  #[inline]
  pub(crate) fn count(&self) -> usize {
    self.len
  }

  #[inline]
  pub(crate) fn bound(&self, class: usize) -> usize {
    self.bounds[class]
  }

  fn search(&self, size: usize) -> usize {
    self.bounds[..self.len]
      .partition_point(|&bound| bound < size)
      .min(self.len - 1)
  }

  /// Class whose range contains a chunk of `size` bytes. Monotonic in `size`.
  #[inline]
  pub(crate) fn class_of(&self, size: usize) -> usize {
    if size <= LOOKUP_LIMIT {
      self.lookup[size.div_ceil(ALIGNMENT)] as usize
    } else {
      self.search(size)
    }
  }

  /// Largest class whose bound does not exceed `size`: every chunk filed here can serve any
  /// request of that class.
  #[inline]
  pub(crate) fn floor_class(&self, size: usize) -> usize {
    let class = self.class_of(size);
    if self.bounds[class] <= size {
      class
    } else {
      debug_assert!(class > 0, "chunk of {size} bytes is below the smallest class");
      class.saturating_sub(1)
    }
  }

  /// Maps a request to `(class, chunk size)`, or `None` when it belongs to the large object path.
  #[inline]
  pub(crate) fn request(&self, size: usize, large_object_threshold: usize) -> Option<(usize, usize)> {
    if size > large_object_threshold {
      return None;
    }
    let raw = align_up(size.max(MIN_PAYLOAD) + HEADER_SIZE, ALIGNMENT);
    let class = self.class_of(raw);
    Some((class, self.bound(class)))
  }
}
