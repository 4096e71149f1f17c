use segheap::{BudgetedPages, Config, ConfigError, Error, Heap, OsPages, config::MIN_SPAN_SIZE};

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

#[test]
fn zero_size_requests_are_distinct_and_freeable() {
  let heap = Heap::new(Config::DEFAULT).unwrap();
  let a = heap.allocate(0).unwrap();
  let b = heap.allocate(0).unwrap();
  assert_ne!(a, b);
  unsafe {
    assert!(heap.usable_size(a.as_ptr()) >= 16);
    heap.deallocate(a.as_ptr());
    heap.deallocate(b.as_ptr());
  }
  assert_eq!(heap.audit().unwrap().allocated_chunks, 0);
}

#[test]
fn threshold_is_the_last_small_size() {
  let heap = Heap::new(Config::DEFAULT).unwrap();
  let threshold = heap.config().large_object_threshold;

  let small = heap.allocate(threshold).unwrap();
  assert_eq!(heap.stats().large_objects, 0);
  assert_eq!(heap.stats().spans, 1);

  let large = heap.allocate(threshold + 1).unwrap();
  let stats = heap.stats();
  assert_eq!(stats.large_objects, 1);
  assert_eq!(stats.spans, 1);

  unsafe {
    small.as_ptr().write_bytes(1, threshold);
    large.as_ptr().write_bytes(2, threshold + 1);
    heap.deallocate(small.as_ptr());
    heap.deallocate(large.as_ptr());
  }
  assert_eq!(heap.stats().large_objects, 0);
}

#[test]
fn every_size_is_aligned_and_fully_writable() {
  let heap = Heap::new(Config::DEFAULT).unwrap();
  let mut cache = heap.thread_cache();
  let ptrs: Vec<_> = (0..=2048)
    .map(|size| {
      let ptr = cache.allocate(size).unwrap();
      assert_eq!(ptr.as_ptr() as usize % 16, 0, "size {size}");
      let usable = unsafe { heap.usable_size(ptr.as_ptr()) };
      assert!(usable >= size.max(1));
      unsafe { ptr.as_ptr().write_bytes(0xC3, usable) };
      ptr
    })
    .collect();

  heap.audit().unwrap();
  for ptr in ptrs {
    unsafe { cache.deallocate(ptr.as_ptr()) };
  }
}

#[test]
fn splinters_below_the_split_threshold_stay_attached() {
  let heap = Heap::new(Config::new().with_split_threshold(256)).unwrap();
  let a = heap.allocate(200).unwrap();
  let guard = heap.allocate(16).unwrap();
  unsafe { heap.deallocate(a.as_ptr()) };

  // The 224-byte hole is the first fit above the smallest class; 192 spare bytes are too few
  // to split off.
  let b = heap.allocate(16).unwrap();
  assert_eq!(a, b);
  assert_eq!(unsafe { heap.usable_size(b.as_ptr()) }, 208);

  unsafe {
    heap.deallocate(b.as_ptr());
    heap.deallocate(guard.as_ptr());
  }
  assert_eq!(heap.audit().unwrap().free_chunks, 1);
}

#[test]
fn custom_size_classes() {
  static BOUNDS: [usize; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];
  let config = Config::new()
    .with_size_class_boundaries(&BOUNDS)
    .with_large_object_threshold(4096);
  let heap = Heap::new(config).unwrap();

  let small = heap.allocate(4096).unwrap();
  assert_eq!(unsafe { heap.usable_size(small.as_ptr()) }, 4096);
  assert_eq!(heap.stats().large_objects, 0);

  let large = heap.allocate(4097).unwrap();
  assert_eq!(heap.stats().large_objects, 1);

  let mid = heap.allocate(100).unwrap();
  assert_eq!(unsafe { heap.usable_size(mid.as_ptr()) }, 112);

  unsafe {
    heap.deallocate(small.as_ptr());
    heap.deallocate(large.as_ptr());
    heap.deallocate(mid.as_ptr());
  }
}

#[test]
fn invalid_configurations_are_rejected() {
  static DESCENDING: [usize; 2] = [64, 32];
  assert_eq!(
    Heap::new(Config::new().with_size_class_boundaries(&DESCENDING)).err(),
    Some(Error::Config(ConfigError::UnsortedBoundaries { index: 1, value: 32 }))
  );
  assert!(matches!(
    Heap::new(Config::new().with_large_object_threshold(usize::MAX)),
    Err(Error::Config(ConfigError::ThresholdOutOfRange { .. }))
  ));
}

#[test]
fn out_of_memory_is_recoverable() {
  init_tracing();
  let pages = BudgetedPages::new(OsPages::new(), 2 * MIN_SPAN_SIZE);
  let heap = Heap::with_provider(Config::DEFAULT, pages).unwrap();

  let mut ptrs = Vec::new();
  let err = loop {
    match heap.allocate(100_000) {
      Ok(ptr) => ptrs.push(ptr),
      Err(err) => break err,
    }
  };
  assert!(matches!(err, Error::OutOfMemory { .. }));
  assert!(!ptrs.is_empty());
  assert!(heap.provider().used() <= heap.provider().budget());
  heap.audit().unwrap();

  for ptr in ptrs.drain(..) {
    unsafe { heap.deallocate(ptr.as_ptr()) };
  }
  heap.trim();
  assert_eq!(heap.provider().used(), 0);

  let again = heap.allocate(100_000).unwrap();
  unsafe { heap.deallocate(again.as_ptr()) };
}

#[test]
fn absurd_sizes_fail_cleanly() {
  let heap = Heap::new(Config::DEFAULT).unwrap();
  for size in [usize::MAX, usize::MAX - 4095, isize::MAX as usize] {
    assert!(matches!(heap.allocate(size), Err(Error::OutOfMemory { .. })));
  }
  assert!(matches!(
    heap.allocate_aligned(usize::MAX - 64, 4096),
    Err(Error::OutOfMemory { .. })
  ));
  assert_eq!(heap.stats().reserved_bytes, 0);
}

fn fixed_64k(_: usize) -> usize {
  64 << 10
}

#[test]
fn fitting_chunk_deep_in_its_class_is_found() {
  init_tracing();
  let pages = BudgetedPages::new(OsPages::new(), 64 << 10);
  let heap = Heap::with_provider(Config::new().with_span_growth_policy(fixed_64k), pages).unwrap();

  // A 512-byte chunk, then the rest of the only span filled with 144-byte chunks.
  let a = heap.allocate(496).unwrap();
  let guard = heap.allocate(16).unwrap();
  let mut fill = Vec::new();
  let err = loop {
    match heap.allocate(128) {
      Ok(ptr) => fill.push(ptr),
      Err(err) => break err,
    }
  };
  assert_eq!(err, Error::OutOfMemory { requested: 128 });
  assert!(fill.len() >= 27);

  // Nine 288-byte holes land in front of `a` in the (256, 512] class.
  unsafe { heap.deallocate(a.as_ptr()) };
  let mut kept = Vec::new();
  for (i, ptr) in fill.into_iter().enumerate() {
    if i < 27 && i % 3 != 2 {
      unsafe { heap.deallocate(ptr.as_ptr()) };
    } else {
      kept.push(ptr);
    }
  }
  let report = heap.audit().unwrap();
  assert_eq!(report.largest_free_chunk, 512);

  let again = heap.allocate(496).unwrap();
  assert_eq!(again, a);
  assert_eq!(heap.stats().spans, 1);

  unsafe {
    heap.deallocate(again.as_ptr());
    heap.deallocate(guard.as_ptr());
    for ptr in kept {
      heap.deallocate(ptr.as_ptr());
    }
  }
  assert_eq!(heap.audit().unwrap().allocated_chunks, 0);
}

#[test]
fn out_of_memory_reports_the_callers_size() {
  let pages = BudgetedPages::new(OsPages::new(), 0);
  let heap = Heap::with_provider(Config::DEFAULT, pages).unwrap();
  assert_eq!(heap.allocate(496), Err(Error::OutOfMemory { requested: 496 }));
  assert_eq!(
    heap.thread_cache().allocate(100),
    Err(Error::OutOfMemory { requested: 100 })
  );
  assert_eq!(heap.allocate(1 << 20), Err(Error::OutOfMemory { requested: 1 << 20 }));
}
