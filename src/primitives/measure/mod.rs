#![forbid(unsafe_code)]
//! Rolling interval measurements of operation speed and average sample values.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Nanoseconds elapsed on a process-wide monotonic clock.
pub fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[derive(Clone, Debug)]
struct Interval {
    start_nanos: u64,
    end_nanos: Option<u64>,
    counter_start: u64,
    counter: u64,
    sum: u64,
    samples: u64,
}

impl Interval {
    fn starting(start_nanos: u64, counter: u64) -> Self {
        Self {
            start_nanos,
            end_nanos: None,
            counter_start: counter,
            counter,
            sum: 0,
            samples: 0,
        }
    }

    fn ops(&self) -> u64 {
        self.counter.saturating_sub(self.counter_start)
    }

    /// Time covered by the interval; an open interval runs until `now_nanos`.
    fn duration_nanos(&self, now_nanos: u64) -> u64 {
        self.end_nanos.unwrap_or(now_nanos).saturating_sub(self.start_nanos)
    }
}

struct MeasurementState {
    current: Interval,
    closed: VecDeque<Interval>,
}

/// Measures ops/sec and a running average over the last few fixed-length intervals.
///
/// With a 250 ms interval and 3 retained intervals, readings cover the past
/// 750-1000 ms. Speed divides by the time the retained intervals actually
/// covered, so gaps between a finished interval and the next restart are not
/// counted. Callers pass the current time from [`monotonic_nanos`] so that a
/// single clock read can be shared by several measurements.
pub struct IntervalBasedMeasurement {
    interval_nanos: u64,
    max_intervals: usize,
    state: Mutex<MeasurementState>,
}

impl IntervalBasedMeasurement {
    /// Creates a measurement with the given interval length and retained interval count.
    pub fn new(interval: Duration, max_intervals: usize) -> Self {
        let interval_nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX).max(1);
        Self {
            interval_nanos,
            max_intervals: max_intervals.max(1),
            state: Mutex::new(MeasurementState {
                current: Interval::starting(monotonic_nanos(), 0),
                closed: VecDeque::new(),
            }),
        }
    }

    /// Creates a measurement whose intervals only end on [`finish_interval`](Self::finish_interval).
    pub fn manual(max_intervals: usize) -> Self {
        Self::new(Duration::from_nanos(u64::MAX), max_intervals)
    }

    /// Counts one operation in the current interval.
    pub fn increment_counter(&self, now_nanos: u64) {
        let mut state = self.state.lock();
        self.rotate_if_needed(&mut state, now_nanos);
        state.current.counter += 1;
    }

    /// Sets the absolute counter value. A value below the current counter restarts the interval.
    pub fn set_counter(&self, value: u64, now_nanos: u64) {
        let mut state = self.state.lock();
        self.rotate_if_needed(&mut state, now_nanos);
        if value < state.current.counter {
            state.current = Interval::starting(now_nanos, value);
        } else {
            state.current.counter = value;
        }
    }

    /// Restarts the current interval at `now_nanos` from the absolute counter `value`.
    pub fn reset_counter(&self, value: u64, now_nanos: u64) {
        let mut state = self.state.lock();
        state.current = Interval::starting(now_nanos, value);
    }

    /// Adds a sample for [`average`](Self::average).
    pub fn add_measurement_for_average(&self, value: u64, now_nanos: u64) {
        let mut state = self.state.lock();
        self.rotate_if_needed(&mut state, now_nanos);
        state.current.sum = state.current.sum.saturating_add(value);
        state.current.samples += 1;
    }

    /// Operations per second over the retained intervals.
    pub fn speed_ops_per_sec(&self, now_nanos: u64) -> u64 {
        let mut state = self.state.lock();
        self.rotate_if_needed(&mut state, now_nanos);
        let horizon = now_nanos.saturating_sub(self.window_nanos());
        let (ops, elapsed) = state
            .closed
            .iter()
            .filter(|interval| interval.end_nanos.is_some_and(|end| end >= horizon))
            .chain(std::iter::once(&state.current))
            .fold((0u64, 0u64), |(ops, elapsed), interval| {
                (
                    ops.saturating_add(interval.ops()),
                    elapsed.saturating_add(interval.duration_nanos(now_nanos)),
                )
            });
        if elapsed == 0 {
            return 0;
        }
        let speed = u128::from(ops) * NANOS_PER_SEC / u128::from(elapsed);
        u64::try_from(speed).unwrap_or(u64::MAX)
    }

    /// Average of the samples recorded in the retained intervals, or 0 without samples.
    pub fn average(&self) -> u64 {
        let state = self.state.lock();
        let (sum, samples) = state
            .closed
            .iter()
            .chain(std::iter::once(&state.current))
            .fold((0u128, 0u64), |(sum, samples), interval| {
                (sum + u128::from(interval.sum), samples + interval.samples)
            });
        if samples == 0 {
            return 0;
        }
        u64::try_from(sum / u128::from(samples)).unwrap_or(u64::MAX)
    }

    /// Closes the current interval at `now_nanos` and starts a new one.
    pub fn finish_interval(&self, now_nanos: u64) {
        let mut state = self.state.lock();
        self.close_current(&mut state, now_nanos);
    }

    fn window_nanos(&self) -> u64 {
        let intervals = u64::try_from(self.max_intervals).unwrap_or(u64::MAX);
        self.interval_nanos.saturating_mul(intervals)
    }

    fn rotate_if_needed(&self, state: &mut MeasurementState, now_nanos: u64) {
        if now_nanos.saturating_sub(state.current.start_nanos) >= self.interval_nanos {
            self.close_current(state, now_nanos);
        }
    }

    fn close_current(&self, state: &mut MeasurementState, now_nanos: u64) {
        let counter = state.current.counter;
        let mut finished = std::mem::replace(&mut state.current, Interval::starting(now_nanos, counter));
        finished.end_nanos = Some(now_nanos.max(finished.start_nanos));
        state.closed.push_back(finished);
        while state.closed.len() > self.max_intervals {
            state.closed.pop_front();
        }
    }
}

impl std::fmt::Debug for IntervalBasedMeasurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("IntervalBasedMeasurement")
            .field("interval_nanos", &self.interval_nanos)
            .field("closed_intervals", &state.closed.len())
            .field("current", &state.current)
            .finish()
    }
}
