// Shared state of one in-flight bandwidth measurement
//
// The network side (often an async task) is the single writer; the ingest
// probe polls it from the control loop. Every field is a lock-free cell, so a
// reader never sees a half-written value.

use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementPhase {
    Connecting,
    Measuring,
    Complete,
    Failed,
}

impl MeasurementPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, MeasurementPhase::Complete | MeasurementPhase::Failed)
    }
}

#[derive(Debug)]
struct MeasurementShared {
    phase: AtomicCell<MeasurementPhase>,
    progress: AtomicCell<f32>,
    bitrate_kbps: AtomicCell<f32>,
    aborted: AtomicBool,
}

/// Cloneable handle to one server's measurement
#[derive(Debug, Clone)]
pub struct MeasurementHandle {
    shared: Arc<MeasurementShared>,
}

impl Default for MeasurementHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MeasurementShared {
                phase: AtomicCell::new(MeasurementPhase::Connecting),
                progress: AtomicCell::new(0.0),
                bitrate_kbps: AtomicCell::new(0.0),
                aborted: AtomicBool::new(false),
            }),
        }
    }

    // Writer side

    /// Connection established; measurement starts
    pub fn mark_measuring(&self) {
        self.shared.phase.store(MeasurementPhase::Measuring);
    }

    /// Publish progress in `[0, 1]` and the bitrate measured so far
    pub fn report(&self, progress: f32, bitrate_kbps: f32) {
        self.shared.progress.store(clamp_fraction(progress));
        self.shared.bitrate_kbps.store(bitrate_kbps.max(0.0));
    }

    pub fn complete(&self, bitrate_kbps: f32) {
        self.shared.progress.store(1.0);
        self.shared.bitrate_kbps.store(bitrate_kbps.max(0.0));
        self.shared.phase.store(MeasurementPhase::Complete);
    }

    pub fn fail(&self) {
        self.shared.phase.store(MeasurementPhase::Failed);
    }

    /// True once the reader gave up on this measurement (skip or cancel)
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
    }

    // Reader side

    pub fn phase(&self) -> MeasurementPhase {
        self.shared.phase.load()
    }

    pub fn progress(&self) -> f32 {
        self.shared.progress.load()
    }

    pub fn bitrate_kbps(&self) -> f32 {
        self.shared.bitrate_kbps.load()
    }

    /// Tell the writer to stop measuring
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
    }
}

fn clamp_fraction(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_lifecycle() {
        let handle = MeasurementHandle::new();
        let reader = handle.clone();
        assert_eq!(reader.phase(), MeasurementPhase::Connecting);

        handle.mark_measuring();
        handle.report(0.4, 1200.0);
        assert_eq!(reader.phase(), MeasurementPhase::Measuring);
        assert_eq!(reader.progress(), 0.4);
        assert_eq!(reader.bitrate_kbps(), 1200.0);

        handle.complete(1500.0);
        assert!(reader.phase().is_finished());
        assert_eq!(reader.progress(), 1.0);
    }

    #[test]
    fn test_progress_is_clamped() {
        let handle = MeasurementHandle::new();
        handle.report(3.0, -5.0);
        assert_eq!(handle.progress(), 1.0);
        assert_eq!(handle.bitrate_kbps(), 0.0);
        handle.report(f32::NAN, 10.0);
        assert_eq!(handle.progress(), 0.0);
    }

    #[test]
    fn test_abort_is_visible_to_writer() {
        let reader = MeasurementHandle::new();
        let writer = reader.clone();
        assert!(!writer.is_aborted());
        reader.abort();
        assert!(writer.is_aborted());
    }
}
