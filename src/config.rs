use crate::{
  chunk::{ALIGNMENT, HEADER_SIZE, MIN_CHUNK_SIZE},
  error::ConfigError,
  size_class::MAX_SIZE_CLASSES,
};

/// Smallest span requested from the page provider by the default growth policy.
pub const MIN_SPAN_SIZE: usize = 1 << 20; // 1MB
/// Largest span the default growth policy asks for (unless a single chunk needs more).
pub const MAX_SPAN_SIZE: usize = 1 << 26; // 64MB

pub const DEFAULT_LARGE_OBJECT_THRESHOLD: usize = 128 << 10;
pub const MIN_LARGE_OBJECT_THRESHOLD: usize = 256;
pub const MAX_LARGE_OBJECT_THRESHOLD: usize = 1 << 30;

/// 16 byte steps up to 256, then doubling up to the default large object threshold.
pub const DEFAULT_SIZE_CLASSES: &[usize] = &[
  32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, 512, 1 << 10, 2 << 10,
  4 << 10, 8 << 10, 16 << 10, 32 << 10, 64 << 10, 128 << 10,
];

/// Default span growth: next power of two of the needed bytes, clamped to
/// [`MIN_SPAN_SIZE`]..=[`MAX_SPAN_SIZE`].
pub fn default_span_growth(needed: usize) -> usize {
  needed
    .checked_next_power_of_two()
    .unwrap_or(MAX_SPAN_SIZE)
    .clamp(MIN_SPAN_SIZE, MAX_SPAN_SIZE)
}

/// Heap tuning knobs. Every field has a `const` setter so a configuration can
/// live in a `static` without allocating.
#[derive(Clone, Copy, Debug)]
pub struct Config {
  /// Upper chunk-size bound (header included) of each size class, ascending.
  /// A final class ending at the largest small chunk is added when missing.
  pub size_class_boundaries: &'static [usize],
  /// Requests strictly above this many bytes get a dedicated mapping.
  pub large_object_threshold: usize,
  /// Cached chunks per size class per thread. 0 disables thread caching.
  pub thread_cache_capacity: usize,
  /// Maps the bytes a new span must hold to the span size to reserve.
  /// Results smaller than the need are raised to it.
  pub span_growth_policy: fn(usize) -> usize,
  /// Smallest remainder split off a free chunk; smaller splinters stay attached.
  pub split_threshold: usize,
  /// Empty spans kept mapped for reuse instead of being released.
  pub retain_empty_spans: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self::DEFAULT
  }
}

impl Config {
  pub const DEFAULT: Self = Self {
    size_class_boundaries: DEFAULT_SIZE_CLASSES,
    large_object_threshold: DEFAULT_LARGE_OBJECT_THRESHOLD,
    thread_cache_capacity: 32,
    span_growth_policy: default_span_growth,
    split_threshold: MIN_CHUNK_SIZE,
    retain_empty_spans: 1,
  };

  pub const fn new() -> Self {
    Self::DEFAULT
  }

  pub const fn with_size_class_boundaries(mut self, boundaries: &'static [usize]) -> Self {
    self.size_class_boundaries = boundaries;
    self
  }

  pub const fn with_large_object_threshold(mut self, threshold: usize) -> Self {
    self.large_object_threshold = threshold;
    self
  }

  pub const fn with_thread_cache_capacity(mut self, capacity: usize) -> Self {
    self.thread_cache_capacity = capacity;
    self
  }

  pub const fn with_span_growth_policy(mut self, policy: fn(usize) -> usize) -> Self {
    self.span_growth_policy = policy;
    self
  }

  pub const fn with_split_threshold(mut self, threshold: usize) -> Self {
    self.split_threshold = threshold;
    self
  }

  pub const fn with_retain_empty_spans(mut self, spans: usize) -> Self {
    self.retain_empty_spans = spans;
    self
  }

  /// Size of the largest chunk served from size classes (header included).
  pub const fn max_small_chunk(&self) -> usize {
    align_up(self.large_object_threshold + HEADER_SIZE, ALIGNMENT)
  }

  pub const fn validate(&self) -> Result<(), ConfigError> {
    let threshold = self.large_object_threshold;
    if threshold < MIN_LARGE_OBJECT_THRESHOLD || threshold > MAX_LARGE_OBJECT_THRESHOLD {
      return Err(ConfigError::ThresholdOutOfRange {
        value: threshold,
        min: MIN_LARGE_OBJECT_THRESHOLD,
        max: MAX_LARGE_OBJECT_THRESHOLD,
      });
    }

    let split = self.split_threshold;
    if split < MIN_CHUNK_SIZE || split % ALIGNMENT != 0 {
      return Err(ConfigError::InvalidSplitThreshold {
        value: split,
        min: MIN_CHUNK_SIZE,
      });
    }

    let bounds = self.size_class_boundaries;
    // One slot stays reserved for the implicit top class.
    if bounds.len() >= MAX_SIZE_CLASSES {
      return Err(ConfigError::TooManyClasses {
        count: bounds.len(),
        max: MAX_SIZE_CLASSES - 1,
      });
    }

    let max = self.max_small_chunk();
    let mut i = 0;
    while i < bounds.len() {
      let value = bounds[i];
      if value % ALIGNMENT != 0 {
        return Err(ConfigError::MisalignedBoundary { index: i, value });
      }
      if i == 0 && value < MIN_CHUNK_SIZE {
        return Err(ConfigError::BoundaryTooSmall {
          value,
          min: MIN_CHUNK_SIZE,
        });
      }
      if i > 0 && value <= bounds[i - 1] {
        return Err(ConfigError::UnsortedBoundaries { index: i, value });
      }
      if value > max {
        return Err(ConfigError::BoundaryAboveThreshold { value, max });
      }
      i += 1;
    }

    Ok(())
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

const _: () = assert!(Config::DEFAULT.validate().is_ok());

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_is_valid() {
    assert_eq!(Config::default().validate(), Ok(()));
    assert_eq!(Config::DEFAULT.max_small_chunk(), (128 << 10) + 16);
  }

  #[test]
  fn rejects_unsorted_boundaries() {
    static BOUNDS: [usize; 3] = [32, 64, 48];
    let config = Config::new().with_size_class_boundaries(&BOUNDS);
    assert_eq!(
      config.validate(),
      Err(ConfigError::UnsortedBoundaries { index: 2, value: 48 })
    );
  }

  #[test]
  fn rejects_misaligned_and_tiny_boundaries() {
    static MISALIGNED: [usize; 2] = [32, 40];
    static TINY: [usize; 1] = [16];
    assert!(matches!(
      Config::new().with_size_class_boundaries(&MISALIGNED).validate(),
      Err(ConfigError::MisalignedBoundary { index: 1, value: 40 })
    ));
    assert!(matches!(
      Config::new().with_size_class_boundaries(&TINY).validate(),
      Err(ConfigError::BoundaryTooSmall { value: 16, .. })
    ));
  }

  #[test]
  fn boundaries_must_fit_under_threshold() {
    let config = Config::new().with_large_object_threshold(1024);
    assert!(matches!(
      config.validate(),
      Err(ConfigError::BoundaryAboveThreshold { value: 2048, max: 1040 })
    ));
  }

  #[test]
  fn rejects_bad_threshold_and_split() {
    assert!(matches!(
      Config::new().with_large_object_threshold(64).validate(),
      Err(ConfigError::ThresholdOutOfRange { value: 64, .. })
    ));
    assert!(matches!(
      Config::new().with_split_threshold(40).validate(),
      Err(ConfigError::InvalidSplitThreshold { value: 40, .. })
    ));
  }

  #[test]
  fn span_growth_is_clamped() {
    assert_eq!(default_span_growth(100), MIN_SPAN_SIZE);
    assert_eq!(default_span_growth((1 << 21) + 1), 1 << 22);
    assert_eq!(default_span_growth(usize::MAX), MAX_SPAN_SIZE);
  }
}
