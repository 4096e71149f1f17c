use thiserror::Error;

/// Errors surfaced by allocation and heap construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
  /// The page provider could not map the memory needed for the request.
  #[error("out of memory: could not satisfy a request for {requested} bytes")]
  OutOfMemory { requested: usize },
  #[error("alignment {align} is not a power of two")]
  InvalidAlignment { align: usize },
  #[error("invalid heap configuration: {0}")]
  Config(#[from] ConfigError),
}

/// A [`Config`](crate::Config) rule that was not respected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("size class boundary #{index} ({value}) is not a multiple of 16")]
  MisalignedBoundary { index: usize, value: usize },
  #[error("size class boundary #{index} ({value}) is not larger than the previous one")]
  UnsortedBoundaries { index: usize, value: usize },
  #[error("smallest size class boundary {value} is below the minimum chunk size {min}")]
  BoundaryTooSmall { value: usize, min: usize },
  #[error("size class boundary {value} exceeds the largest small chunk {max}")]
  BoundaryAboveThreshold { value: usize, max: usize },
  #[error("{count} size class boundaries given, at most {max} are supported")]
  TooManyClasses { count: usize, max: usize },
  #[error("large object threshold {value} is outside {min}..={max}")]
  ThresholdOutOfRange { value: usize, min: usize, max: usize },
  #[error("split threshold {value} must be a multiple of 16 and at least {min}")]
  InvalidSplitThreshold { value: usize, min: usize },
}

/// A heap invariant found broken by [`Heap::audit`](crate::Heap::audit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuditError {
  #[error("span at {span:#x} has a corrupted header")]
  BadSpanMagic { span: usize },
  #[error("chunk at {addr:#x} has an invalid size {size}")]
  MisalignedChunk { addr: usize, size: usize },
  #[error("chunk at {addr:#x} records prev_size {recorded}, predecessor is {actual} bytes")]
  BrokenPrevSize { addr: usize, recorded: usize, actual: usize },
  #[error("free chunks at {addr:#x} and its predecessor were not coalesced")]
  UncoalescedNeighbors { addr: usize },
  #[error("chunks of span at {span:#x} cover {covered} bytes, expected {expected}")]
  TilingMismatch { span: usize, covered: usize, expected: usize },
  #[error("free chunk at {addr:#x} ({size} bytes) is filed under size class {class}")]
  MisfiledFreeChunk { addr: usize, size: usize, class: usize },
  #[error("free lists hold {listed} chunks but spans contain {walked} free chunks")]
  FreeListMismatch { listed: usize, walked: usize },
}
