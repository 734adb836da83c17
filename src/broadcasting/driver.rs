// Control loop driving the orchestrator
//
// One periodic poll advances the lifecycle and any running ingest probe.
// Polls never overlap: a poll that starts while another is in progress
// returns `PollOutcome::Busy` without touching the orchestrator.

use anyhow::Result;
use colored::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace};

use super::orchestrator::BroadcastOrchestrator;
use super::types::BroadcastState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Poll ran; state afterwards
    Polled(BroadcastState),
    /// Another poll was already running
    Busy,
    Stopped,
}

/// Clears the in-progress flag however the poll exits
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct ControlLoop {
    orchestrator: Arc<Mutex<BroadcastOrchestrator>>,
    polling: AtomicBool,
    stopped: AtomicBool,
    polls: AtomicU64,
}

impl ControlLoop {
    pub fn new(orchestrator: Arc<Mutex<BroadcastOrchestrator>>) -> Self {
        Self {
            orchestrator,
            polling: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            polls: AtomicU64::new(0),
        }
    }

    pub fn orchestrator(&self) -> Arc<Mutex<BroadcastOrchestrator>> {
        self.orchestrator.clone()
    }

    /// Lock the orchestrator, recovering from a poisoned lock
    pub fn lock(&self) -> MutexGuard<'_, BroadcastOrchestrator> {
        self.orchestrator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` with the orchestrator locked.
    ///
    /// Observer callbacks fired by `f` run after the lock is released, so they may
    /// lock the orchestrator themselves.
    pub fn with_orchestrator<R>(&self, f: impl FnOnce(&mut BroadcastOrchestrator) -> R) -> R {
        let mut orchestrator = self.lock();
        let deferred = orchestrator.defer_events();
        let result = f(&mut orchestrator);
        drop(orchestrator);
        drop(deferred);
        result
    }

    /// Completed polls
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("🛑 {}: after {} polls", "CONTROL_LOOP_STOP".red(), self.polls());
        }
    }

    pub fn poll_once(&self) -> PollOutcome {
        if self.is_stopped() {
            return PollOutcome::Stopped;
        }
        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Poll skipped: previous poll still running");
            return PollOutcome::Busy;
        }
        let _guard = PollGuard(&self.polling);

        let state = self.with_orchestrator(|o| o.poll());
        self.polls.fetch_add(1, Ordering::Relaxed);
        PollOutcome::Polled(state)
    }

    /// Poll every `period` on the tokio runtime until `stop` is called.
    ///
    /// Late ticks are skipped rather than bunched.
    pub fn spawn(self: Arc<Self>, period: Duration) -> Result<JoinHandle<()>> {
        if period.is_zero() {
            anyhow::bail!("Control loop period must be non-zero");
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("Control loop needs a tokio runtime: {}", e))?;

        Ok(handle.spawn(async move {
            info!(
                "🔁 {}: polling every {:?}",
                "CONTROL_LOOP_START".green(),
                period
            );
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if self.poll_once() == PollOutcome::Stopped {
                    break;
                }
            }
        }))
    }
}
