#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use walden::options::{DurabilityOptions, ThrottleOptions, ThrottlingPolicy};
use walden::throttle::{
    throttle_policy, AtomicCheckpointProgress, CheckpointProgressProvider, CounterMetrics, PageMemoryMetrics,
    PagesWriteSpeedBasedThrottle, PagesWriteThrottlePolicy, ParkTime, ThrottledPageMemory,
};

/// Page memory whose counters the test drives directly.
#[derive(Default)]
struct ScriptedPageMemory {
    total_pages: AtomicU64,
    dirty_pages: AtomicU64,
    cp_buffer_used: AtomicU64,
    cp_buffer_capacity: AtomicU64,
    metrics: CounterMetrics,
}

impl ScriptedPageMemory {
    fn new(total_pages: u64, cp_buffer_capacity: u64) -> Arc<Self> {
        let memory = Self::default();
        memory.total_pages.store(total_pages, Ordering::Relaxed);
        memory.cp_buffer_capacity.store(cp_buffer_capacity, Ordering::Relaxed);
        Arc::new(memory)
    }

    fn set_dirty(&self, pages: u64) {
        self.dirty_pages.store(pages, Ordering::Relaxed);
    }

    fn set_cp_buffer_used(&self, pages: u64) {
        self.cp_buffer_used.store(pages, Ordering::Relaxed);
    }
}

impl ThrottledPageMemory for ScriptedPageMemory {
    fn checkpoint_buffer_pages_count(&self) -> u64 {
        self.cp_buffer_used.load(Ordering::Relaxed)
    }

    fn checkpoint_buffer_pages_size(&self) -> u64 {
        self.cp_buffer_capacity.load(Ordering::Relaxed)
    }

    fn dirty_pages_ratio(&self) -> f64 {
        let total = self.total_pages.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.dirty_pages.load(Ordering::Relaxed) as f64 / total as f64
    }

    fn total_pages(&self) -> u64 {
        self.total_pages.load(Ordering::Relaxed)
    }

    fn metrics(&self) -> &dyn PageMemoryMetrics {
        &self.metrics
    }
}

fn policy(
    options: &ThrottleOptions,
    memory: &Arc<ScriptedPageMemory>,
    progress: &Arc<AtomicCheckpointProgress>,
) -> Arc<dyn PagesWriteThrottlePolicy> {
    throttle_policy(
        options,
        Arc::clone(memory) as Arc<dyn ThrottledPageMemory>,
        Arc::clone(progress) as Arc<dyn CheckpointProgressProvider>,
    )
    .expect("throttling enabled")
}

#[test]
fn idle_writers_are_never_parked() {
    let memory = ScriptedPageMemory::new(10_000, 900);
    let progress = Arc::new(AtomicCheckpointProgress::new());
    let throttle = policy(&ThrottleOptions::default(), &memory, &progress);

    memory.set_cp_buffer_used(100);
    for in_checkpoint in [true, false] {
        assert_eq!(throttle.on_mark_dirty(in_checkpoint), ParkTime::NoThrottling);
    }
    assert!(!throttle.should_throttle());
    assert_eq!(memory.metrics.events(), 0);
}

#[test]
fn checkpoint_cycle_with_buffer_pressure() {
    let memory = ScriptedPageMemory::new(10_000, 900);
    let progress = Arc::new(AtomicCheckpointProgress::new());
    let throttle = policy(&ThrottleOptions::default(), &memory, &progress);

    throttle.on_begin_checkpoint();
    progress.begin(1_000);
    progress.start_pages_write();

    memory.set_cp_buffer_used(700);
    assert!(throttle.should_throttle());
    let mut previous = 0;
    for _ in 0..5 {
        let ParkTime::Nanos(nanos) = throttle.on_mark_dirty(true) else {
            panic!("buffer pressure must produce a park time");
        };
        assert!(nanos > previous);
        previous = nanos;
    }

    memory.set_cp_buffer_used(100);
    throttle.try_wakeup_throttled_threads();
    assert!(matches!(throttle.on_mark_dirty(true), ParkTime::Nanos(0)));

    progress.on_pages_written(1_000);
    progress.on_pages_synced(1_000);
    progress.finish();
    throttle.on_finish_checkpoint();
    assert_eq!(throttle.on_mark_dirty(false), ParkTime::NoThrottling);
    assert_eq!(memory.metrics.events(), 6);
}

#[test]
fn finishing_checkpoint_releases_parked_writers() {
    let options = ThrottleOptions {
        starting_park_nanos: Duration::from_secs(20).as_nanos() as u64,
        ..ThrottleOptions::default()
    };
    let memory = ScriptedPageMemory::new(10_000, 900);
    let progress = Arc::new(AtomicCheckpointProgress::new());
    let throttle = Arc::new(PagesWriteSpeedBasedThrottle::with_options(
        Arc::clone(&memory) as Arc<dyn ThrottledPageMemory>,
        Arc::clone(&progress) as Arc<dyn CheckpointProgressProvider>,
        &options,
    ));
    memory.set_cp_buffer_used(800);

    let writers: Vec<_> = (0..3)
        .map(|_| {
            let throttle = Arc::clone(&throttle);
            thread::spawn(move || {
                let start = Instant::now();
                throttle.on_mark_dirty(true);
                start.elapsed()
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(5);
    while throttle.parked_threads_count() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(throttle.parked_threads_count(), 3);
    throttle.on_finish_checkpoint();

    for writer in writers {
        assert!(writer.join().unwrap() < Duration::from_secs(20));
    }
    assert_eq!(throttle.parked_threads_count(), 0);
}

#[test]
fn target_ratio_policy_from_config() -> Result<(), walden::ConfigError> {
    let options = DurabilityOptions::from_toml_str(
        r#"
        [throttle]
        policy = "target_ratio"
        "#,
    )?;
    assert_eq!(options.throttle.policy, ThrottlingPolicy::TargetRatio);

    let memory = ScriptedPageMemory::new(1_000, 900);
    let progress = Arc::new(AtomicCheckpointProgress::new());
    let throttle = policy(&options.throttle, &memory, &progress);

    progress.begin(100);
    progress.start_pages_write();
    memory.set_dirty(10);
    assert_eq!(throttle.on_mark_dirty(false), ParkTime::Nanos(0));
    memory.set_dirty(500);
    assert!(throttle.on_mark_dirty(false).is_parked());
    Ok(())
}

#[test]
fn disabled_policy_builds_nothing() {
    let options = ThrottleOptions {
        policy: ThrottlingPolicy::Disabled,
        ..ThrottleOptions::default()
    };
    let memory: Arc<dyn ThrottledPageMemory> = ScriptedPageMemory::new(1, 1);
    let progress: Arc<dyn CheckpointProgressProvider> = Arc::new(AtomicCheckpointProgress::new());
    assert!(throttle_policy(&options, memory, progress).is_none());
}
