//! Throttled progress reporting.
//!
//! Callers supply a sink callback; the pipeline reports per stage, but a
//! million-image run must not drown the sink. A report is emitted once
//! both thresholds are met: at least 1% of the total has elapsed since the
//! last report, and at least 250 ms have passed. The first and final
//! reports always go through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::types::{Progress, ProgressStage};

/// Callback receiving progress records. No return value.
pub type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

/// Minimum pause between emitted reports.
const MIN_INTERVAL: Duration = Duration::from_millis(250);

pub struct ProgressReporter {
    sink: ProgressSink,
    stage: ProgressStage,
    total: u64,
    current: AtomicU64,
    emit_state: Mutex<EmitState>,
}

struct EmitState {
    last_instant: Instant,
    last_current: u64,
}

impl ProgressReporter {
    /// Start a stage, emitting the initial `0 / total` report.
    pub fn new(sink: ProgressSink, stage: ProgressStage, total: u64) -> Self {
        let reporter = Self {
            sink,
            stage,
            total,
            current: AtomicU64::new(0),
            emit_state: Mutex::new(EmitState {
                last_instant: Instant::now(),
                last_current: 0,
            }),
        };
        reporter.emit(0, None);
        reporter
    }

    /// Record `n` completed units and emit if both thresholds passed.
    pub fn advance(&self, n: u64) {
        let current = self.current.fetch_add(n, Ordering::Relaxed) + n;
        let step = (self.total / 100).max(1);

        let mut state = self.emit_state.lock().expect("progress state poisoned");
        if current.saturating_sub(state.last_current) >= step
            && state.last_instant.elapsed() >= MIN_INTERVAL
        {
            state.last_current = current;
            state.last_instant = Instant::now();
            drop(state);
            self.emit(current, None);
        }
    }

    /// Emit the terminal report for this stage unconditionally.
    pub fn finish(&self, message: Option<String>) {
        let current = self.current.load(Ordering::Relaxed);
        self.emit(current, message);
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    fn emit(&self, current: u64, message: Option<String>) {
        (self.sink)(Progress {
            stage: self.stage,
            current,
            total: self.total,
            message,
        });
    }
}

/// Emit a one-shot report for a stage without per-unit accounting.
pub fn report_stage(sink: &ProgressSink, stage: ProgressStage, current: u64, total: u64) {
    sink(Progress {
        stage,
        current,
        total,
        message: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_sink() -> (ProgressSink, Arc<Mutex<Vec<Progress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |p| captured.lock().unwrap().push(p));
        (sink, seen)
    }

    #[test]
    fn test_initial_and_final_reports_always_emit() {
        let (sink, seen) = collecting_sink();
        let reporter = ProgressReporter::new(sink, ProgressStage::Encoding, 10);
        reporter.advance(10);
        reporter.finish(Some("done".to_string()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().unwrap().current, 0);
        let last = seen.last().unwrap();
        assert_eq!(last.current, 10);
        assert_eq!(last.total, 10);
        assert_eq!(last.message.as_deref(), Some("done"));
    }

    #[test]
    fn test_time_throttle_suppresses_rapid_updates() {
        let (sink, seen) = collecting_sink();
        let reporter = ProgressReporter::new(sink, ProgressStage::Encoding, 1000);
        // 1% steps are crossed constantly, but 250 ms rarely elapses.
        for _ in 0..1000 {
            reporter.advance(1);
        }
        // Nearly every update is suppressed by the time threshold.
        assert!(seen.lock().unwrap().len() <= 2);
        assert_eq!(reporter.current(), 1000);
    }

    #[test]
    fn test_emits_after_both_thresholds() {
        let (sink, seen) = collecting_sink();
        let reporter = ProgressReporter::new(sink, ProgressStage::Hashing, 100);
        std::thread::sleep(Duration::from_millis(260));
        reporter.advance(2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].current, 2);
        assert_eq!(seen[1].stage, ProgressStage::Hashing);
    }

    #[test]
    fn test_zero_total_does_not_panic() {
        let (sink, _seen) = collecting_sink();
        let reporter = ProgressReporter::new(sink, ProgressStage::Done, 0);
        reporter.advance(1);
        reporter.finish(None);
    }
}
