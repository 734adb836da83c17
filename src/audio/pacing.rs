// Audio pacing loop
//
// Runs on its own thread and, while the broadcast is in passthrough mode,
// generates one chunk per cadence interval and hands it to the audio sink at
// the chunk's deadline. Deadlines advance additively, so over N chunks the
// elapsed wall time converges to N × chunk duration regardless of jitter.
//
// Shutdown is cooperative: a shared flag is checked every iteration and while
// waiting for a deadline, which bounds shutdown latency to one interval.

use anyhow::{anyhow, Context, Result};
use colored::*;
use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::clock::{MonotonicClock, PacingClock, PacingSchedule};
use super::generator::{AudioChunkGenerator, ToneSettings};
use super::sink::AudioSink;
use super::types::AudioFormat;
use crate::pacing_debug;

/// What the pacing loop does on each iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacingMode {
    /// Sleep without generating or submitting
    Idle,
    /// Generate and submit synthetic audio
    Passthrough,
}

/// Current pacing mode, written by the orchestrator and read by the pacing thread.
///
/// A single lock-free cell; reads can never observe a torn value.
#[derive(Debug, Clone)]
pub struct PacingModeFlag {
    cell: Arc<AtomicCell<PacingMode>>,
}

impl PacingModeFlag {
    pub fn new(initial: PacingMode) -> Self {
        Self {
            cell: Arc::new(AtomicCell::new(initial)),
        }
    }

    pub fn get(&self) -> PacingMode {
        self.cell.load()
    }

    /// Returns the previous mode
    pub fn set(&self, mode: PacingMode) -> PacingMode {
        self.cell.swap(mode)
    }
}

impl Default for PacingModeFlag {
    fn default() -> Self {
        Self::new(PacingMode::Idle)
    }
}

/// How the loop waits for a deadline.
///
/// `Spin` yields the thread until the deadline, trading CPU for precision.
/// `SleepThenSpin` blocks in `thread::sleep` until `spin_threshold_us` before the
/// deadline and yields for the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitStrategy {
    Spin,
    SleepThenSpin { spin_threshold_us: u64 },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::SleepThenSpin {
            spin_threshold_us: 1000,
        }
    }
}

/// Wait until `deadline` on `clock`. Returns false if shutdown was requested first.
fn wait_until(
    clock: &dyn PacingClock,
    deadline: Duration,
    strategy: WaitStrategy,
    shutdown: &AtomicBool,
) -> bool {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        let now = clock.now();
        if now >= deadline {
            return true;
        }
        let remaining = deadline - now;
        match strategy {
            WaitStrategy::SleepThenSpin { spin_threshold_us } => {
                let threshold = Duration::from_micros(spin_threshold_us);
                if remaining > threshold {
                    thread::sleep(remaining - threshold);
                } else {
                    thread::yield_now();
                }
            }
            WaitStrategy::Spin => thread::yield_now(),
        }
    }
}

/// Counters shared between the pacing thread and observers
#[derive(Debug, Default)]
pub struct PacingStats {
    chunks_submitted: AtomicU64,
    chunks_dropped: AtomicU64,
    idle_ticks: AtomicU64,
    late_submissions: AtomicU64,
    max_lateness_us: AtomicU64,
}

impl PacingStats {
    fn record_lateness(&self, lateness: Duration, interval: Duration) {
        let micros = lateness.as_micros() as u64;
        self.max_lateness_us.fetch_max(micros, Ordering::Relaxed);
        if lateness > interval {
            self.late_submissions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> PacingStatsSnapshot {
        PacingStatsSnapshot {
            chunks_submitted: self.chunks_submitted.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
            late_submissions: self.late_submissions.load(Ordering::Relaxed),
            max_lateness_us: self.max_lateness_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PacingStatsSnapshot {
    pub chunks_submitted: u64,
    pub chunks_dropped: u64,
    pub idle_ticks: u64,
    /// Submissions that went out more than one interval after their deadline
    pub late_submissions: u64,
    pub max_lateness_us: u64,
}

/// Result of one loop iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Submitted { sequence: u64, lateness: Duration },
    Dropped { sequence: u64, reason: String },
    Idle,
    Shutdown,
}

pub struct AudioPacingLoop {
    format: AudioFormat,
    generator: AudioChunkGenerator,
    mode: PacingModeFlag,
    sink: Arc<dyn AudioSink>,
    clock: Arc<dyn PacingClock>,
    wait_strategy: WaitStrategy,
    shutdown: Arc<AtomicBool>,
    schedule: Option<PacingSchedule>,
    stats: Arc<PacingStats>,
    drop_log_counter: u64,
}

impl AudioPacingLoop {
    pub fn new(
        format: AudioFormat,
        tone: ToneSettings,
        wait_strategy: WaitStrategy,
        mode: PacingModeFlag,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            format,
            generator: AudioChunkGenerator::new(format, tone),
            mode,
            sink,
            clock: Arc::new(MonotonicClock::new()),
            wait_strategy,
            shutdown: Arc::new(AtomicBool::new(false)),
            schedule: None,
            stats: Arc::new(PacingStats::default()),
            drop_log_counter: 0,
        }
    }

    /// Replace the default monotonic clock
    pub fn with_clock(mut self, clock: Arc<dyn PacingClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<PacingStats> {
        self.stats.clone()
    }

    pub fn schedule(&self) -> Option<&PacingSchedule> {
        self.schedule.as_ref()
    }

    /// Run one iteration: submit one chunk (passthrough) or sleep one interval (idle).
    pub fn tick(&mut self) -> TickOutcome {
        if self.shutdown.load(Ordering::Acquire) {
            return TickOutcome::Shutdown;
        }

        let interval = self.format.chunk_interval();
        match self.mode.get() {
            PacingMode::Idle => {
                if self.schedule.take().is_some() {
                    info!("⏸️ {}: passthrough inactive, pacing idle", "PACING_IDLE".yellow());
                }
                thread::sleep(interval);
                self.stats.idle_ticks.fetch_add(1, Ordering::Relaxed);
                TickOutcome::Idle
            }
            PacingMode::Passthrough => {
                let clock = self.clock.clone();
                let schedule = self
                    .schedule
                    .get_or_insert_with(|| PacingSchedule::starting_at(clock.now(), interval));

                let chunk = self.generator.next_chunk();
                let sequence = chunk.sequence();

                if !wait_until(
                    clock.as_ref(),
                    schedule.next_deadline(),
                    self.wait_strategy,
                    &self.shutdown,
                ) {
                    pacing_debug!("🛑 chunk #{} abandoned on shutdown", sequence);
                    return TickOutcome::Shutdown;
                }

                let lateness = schedule.lateness(clock.now());
                schedule.advance();
                self.stats.record_lateness(lateness, interval);

                match self.sink.submit_audio(chunk) {
                    Ok(()) => {
                        self.stats.chunks_submitted.fetch_add(1, Ordering::Relaxed);
                        pacing_debug!(
                            "🎵 chunk #{} submitted ({}µs late)",
                            sequence,
                            lateness.as_micros()
                        );
                        TickOutcome::Submitted { sequence, lateness }
                    }
                    Err(e) => {
                        self.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                        self.drop_log_counter += 1;
                        // Log only every 100th drop to avoid spam when the sink stays full
                        if self.drop_log_counter % 100 == 1 {
                            warn!(
                                "⚠️ {}: chunk #{} dropped ({} drops so far): {}",
                                "PACING_DROP".yellow(),
                                sequence,
                                self.drop_log_counter,
                                e
                            );
                        }
                        TickOutcome::Dropped {
                            sequence,
                            reason: e.to_string(),
                        }
                    }
                }
            }
        }
    }

    /// Loop until the shutdown flag is observed
    pub fn run(&mut self) {
        info!(
            "🎵 {}: {} Hz, {} ch, {} ms chunks ({} samples), {:?}",
            "PACING_START".green(),
            self.format.sample_rate,
            self.format.channels,
            self.format.chunk_duration_ms,
            self.format.samples_per_chunk(),
            self.wait_strategy
        );

        while self.tick() != TickOutcome::Shutdown {}

        let stats = self.stats.snapshot();
        info!(
            "🛑 {}: {} submitted, {} dropped, {} late, max lateness {}µs",
            "PACING_STOP".red(),
            stats.chunks_submitted,
            stats.chunks_dropped,
            stats.late_submissions,
            stats.max_lateness_us
        );
    }

    /// Move the loop onto a dedicated thread
    pub fn spawn(self) -> Result<PacingHandle> {
        let shutdown = self.shutdown.clone();
        let stats = self.stats.clone();
        let mut pacing_loop = self;

        let thread = thread::Builder::new()
            .name("audio-pacing".to_string())
            .spawn(move || pacing_loop.run())
            .context("Failed to spawn audio pacing thread")?;

        Ok(PacingHandle {
            shutdown,
            thread: Some(thread),
            stats,
        })
    }
}

/// Owner of a running pacing thread
pub struct PacingHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<PacingStats>,
}

impl PacingHandle {
    pub fn stats(&self) -> PacingStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Ask the loop to stop without waiting for it
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stop the loop and join the thread, giving up after `timeout`.
    pub fn shutdown(mut self, timeout: Duration) -> Result<PacingStatsSnapshot> {
        self.request_shutdown();
        let Some(thread) = self.thread.take() else {
            return Ok(self.stats.snapshot());
        };

        let started = Instant::now();
        while !thread.is_finished() {
            if started.elapsed() >= timeout {
                return Err(anyhow!(
                    "Audio pacing thread did not stop within {:?}",
                    timeout
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }

        thread
            .join()
            .map_err(|_| anyhow!("Audio pacing thread panicked"))?;
        Ok(self.stats.snapshot())
    }
}

impl Drop for PacingHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::SinkError;
    use crate::audio::AudioChunk;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        chunks: Mutex<Vec<(u64, Duration)>>,
        origin: Mutex<Option<Instant>>,
    }

    impl AudioSink for CollectingSink {
        fn submit_audio(&self, chunk: AudioChunk) -> Result<(), SinkError> {
            let mut origin = self.origin.lock().unwrap();
            let start = *origin.get_or_insert_with(Instant::now);
            self.chunks
                .lock()
                .unwrap()
                .push((chunk.sequence(), start.elapsed()));
            Ok(())
        }
    }

    struct RejectingSink;

    impl AudioSink for RejectingSink {
        fn submit_audio(&self, _chunk: AudioChunk) -> Result<(), SinkError> {
            Err(SinkError::QueueFull)
        }
    }

    fn fast_format() -> AudioFormat {
        AudioFormat::new(8000, 1, 5)
    }

    #[test]
    fn test_mode_flag_swap() {
        let flag = PacingModeFlag::default();
        assert_eq!(flag.get(), PacingMode::Idle);
        assert_eq!(flag.set(PacingMode::Passthrough), PacingMode::Idle);
        assert_eq!(flag.clone().get(), PacingMode::Passthrough);
    }

    #[test]
    fn test_idle_mode_submits_nothing() {
        let sink = Arc::new(CollectingSink::default());
        let mut pacing = AudioPacingLoop::new(
            fast_format(),
            ToneSettings::default(),
            WaitStrategy::default(),
            PacingModeFlag::new(PacingMode::Idle),
            sink.clone(),
        );
        assert_eq!(pacing.tick(), TickOutcome::Idle);
        assert_eq!(pacing.tick(), TickOutcome::Idle);
        assert!(sink.chunks.lock().unwrap().is_empty());
        assert!(pacing.schedule().is_none());
        assert_eq!(pacing.stats().snapshot().idle_ticks, 2);
    }

    #[test]
    fn test_passthrough_submits_in_sequence() {
        let sink = Arc::new(CollectingSink::default());
        let mut pacing = AudioPacingLoop::new(
            fast_format(),
            ToneSettings::default(),
            WaitStrategy::Spin,
            PacingModeFlag::new(PacingMode::Passthrough),
            sink.clone(),
        );
        for expected in 0..4u64 {
            match pacing.tick() {
                TickOutcome::Submitted { sequence, .. } => assert_eq!(sequence, expected),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(pacing.schedule().map(|s| s.ticks()), Some(4));
    }

    #[test]
    fn test_sink_rejection_does_not_stall_pacing() {
        let mut pacing = AudioPacingLoop::new(
            fast_format(),
            ToneSettings::default(),
            WaitStrategy::default(),
            PacingModeFlag::new(PacingMode::Passthrough),
            Arc::new(RejectingSink),
        );
        for _ in 0..3 {
            assert!(matches!(pacing.tick(), TickOutcome::Dropped { .. }));
        }
        let stats = pacing.stats().snapshot();
        assert_eq!(stats.chunks_dropped, 3);
        assert_eq!(stats.chunks_submitted, 0);
        // Deadlines keep advancing even though nothing was delivered
        assert_eq!(pacing.schedule().map(|s| s.ticks()), Some(3));
    }

    #[test]
    fn test_shutdown_flag_stops_before_submission() {
        let sink = Arc::new(CollectingSink::default());
        let mut pacing = AudioPacingLoop::new(
            fast_format(),
            ToneSettings::default(),
            WaitStrategy::default(),
            PacingModeFlag::new(PacingMode::Passthrough),
            sink.clone(),
        );
        pacing.shutdown_flag().store(true, Ordering::Release);
        assert_eq!(pacing.tick(), TickOutcome::Shutdown);
        assert!(sink.chunks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reentering_passthrough_restarts_schedule() {
        let sink = Arc::new(CollectingSink::default());
        let mode = PacingModeFlag::new(PacingMode::Passthrough);
        let mut pacing = AudioPacingLoop::new(
            fast_format(),
            ToneSettings::default(),
            WaitStrategy::default(),
            mode.clone(),
            sink.clone(),
        );
        pacing.tick();
        pacing.tick();
        mode.set(PacingMode::Idle);
        pacing.tick();
        assert!(pacing.schedule().is_none());
        mode.set(PacingMode::Passthrough);
        pacing.tick();
        assert_eq!(pacing.schedule().map(|s| s.ticks()), Some(1));
    }

    #[test]
    fn test_spawned_loop_shuts_down_within_timeout() {
        let sink = Arc::new(CollectingSink::default());
        let handle = AudioPacingLoop::new(
            fast_format(),
            ToneSettings::default(),
            WaitStrategy::default(),
            PacingModeFlag::new(PacingMode::Passthrough),
            sink.clone(),
        )
        .spawn()
        .expect("spawn pacing thread");

        thread::sleep(Duration::from_millis(30));
        assert!(handle.is_running());
        let stats = handle
            .shutdown(Duration::from_millis(500))
            .expect("pacing thread stops");
        assert!(stats.chunks_submitted > 0);
    }
}
