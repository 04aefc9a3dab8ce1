//! Progress reporting and rolling-window ETA.
//!
//! Purely observational: nothing here feeds back into scheduling.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use plancrawl_shared::Phase;

use crate::scheduler::PhaseReport;

/// Durations kept per phase.
pub const ETA_WINDOW: usize = 20;
/// Samples needed before an ETA is shown.
pub const ETA_MIN_SAMPLES: usize = 3;

/// Estimated time left in a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    Calculating,
    Remaining(Duration),
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Calculating => f.write_str("calculating"),
            Self::Remaining(d) => {
                let secs = d.as_secs();
                let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
                if h > 0 {
                    write!(f, "{h}h {m:02}m {s:02}s")
                } else if m > 0 {
                    write!(f, "{m}m {s:02}s")
                } else {
                    write!(f, "{s}s")
                }
            }
        }
    }
}

/// Rolling window over the most recent task durations.
#[derive(Debug, Clone)]
pub struct EtaTracker {
    window: VecDeque<Duration>,
    capacity: usize,
}

impl Default for EtaTracker {
    fn default() -> Self {
        Self::new(ETA_WINDOW)
    }
}

impl EtaTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(elapsed);
    }

    pub fn samples(&self) -> usize {
        self.window.len()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let total: Duration = self.window.iter().sum();
        Some(total / self.window.len() as u32)
    }

    /// `remaining × mean`, or `Calculating` below the sample threshold.
    pub fn eta(&self, remaining: usize) -> Eta {
        match self.mean() {
            Some(mean) if self.samples() >= ETA_MIN_SAMPLES => {
                Eta::Remaining(mean.saturating_mul(u32::try_from(remaining).unwrap_or(u32::MAX)))
            }
            _ => Eta::Calculating,
        }
    }
}

/// Point-in-time view of a running phase.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub key: String,
    pub ok: bool,
    pub done: usize,
    pub failed: usize,
    pub total: usize,
    pub eta: Eta,
}

impl ProgressUpdate {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.done)
    }
}

/// Per-phase counters plus the ETA window, owned by the scheduler loop.
#[derive(Debug)]
pub(crate) struct PhaseProgress {
    phase: Phase,
    total: usize,
    done: usize,
    failed: usize,
    eta: EtaTracker,
}

impl PhaseProgress {
    pub(crate) fn new(phase: Phase, total: usize) -> Self {
        Self {
            phase,
            total,
            done: 0,
            failed: 0,
            eta: EtaTracker::default(),
        }
    }

    pub(crate) fn record(&mut self, key: &str, ok: bool, elapsed: Duration) -> ProgressUpdate {
        self.done += 1;
        if !ok {
            self.failed += 1;
        }
        self.eta.record(elapsed);
        ProgressUpdate {
            phase: self.phase,
            key: key.to_string(),
            ok,
            done: self.done,
            failed: self.failed,
            total: self.total,
            eta: self.eta.eta(self.total.saturating_sub(self.done)),
        }
    }
}

/// Receives progress events from the scheduler.
pub trait ProgressReporter: Send + Sync {
    /// A phase is starting with `total` tasks.
    fn phase_started(&self, phase: Phase, total: usize);
    /// One task finished.
    fn task_finished(&self, update: &ProgressUpdate);
    /// A phase ended (drained, skipped or cancelled).
    fn phase_finished(&self, report: &PhaseReport);
}

/// No-op reporter for headless and test runs.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase_started(&self, _phase: Phase, _total: usize) {}
    fn task_finished(&self, _update: &ProgressUpdate) {}
    fn phase_finished(&self, _report: &PhaseReport) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculating_until_three_samples() {
        let mut tracker = EtaTracker::default();
        assert_eq!(tracker.eta(10), Eta::Calculating);
        tracker.record(Duration::from_secs(2));
        tracker.record(Duration::from_secs(4));
        assert_eq!(tracker.eta(10), Eta::Calculating);
        tracker.record(Duration::from_secs(6));
        assert_eq!(tracker.eta(10), Eta::Remaining(Duration::from_secs(40)));
    }

    #[test]
    fn window_drops_oldest() {
        let mut tracker = EtaTracker::new(3);
        for secs in [100, 1, 1, 1] {
            tracker.record(Duration::from_secs(secs));
        }
        assert_eq!(tracker.samples(), 3);
        assert_eq!(tracker.mean(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn eta_display() {
        assert_eq!(Eta::Calculating.to_string(), "calculating");
        assert_eq!(Eta::Remaining(Duration::from_secs(42)).to_string(), "42s");
        assert_eq!(Eta::Remaining(Duration::from_secs(125)).to_string(), "2m 05s");
        assert_eq!(Eta::Remaining(Duration::from_secs(3725)).to_string(), "1h 02m 05s");
    }

    #[test]
    fn phase_progress_counts_failures() {
        let mut progress = PhaseProgress::new(Phase::Discovery, 4);
        progress.record("a", true, Duration::from_millis(10));
        let update = progress.record("b", false, Duration::from_millis(10));
        assert_eq!(update.done, 2);
        assert_eq!(update.failed, 1);
        assert_eq!(update.remaining(), 2);
        assert_eq!(update.eta, Eta::Calculating);
    }
}
