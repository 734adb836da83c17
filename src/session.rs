// Broadcast session wiring
//
// Ties the two concurrency domains together: the audio pacing thread and the
// control loop task. They share nothing but the pacing mode flag, which the
// orchestrator writes and the pacing loop reads.

use anyhow::{Context, Result};
use colored::*;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audio::{AudioPacingLoop, AudioSink, PacingHandle, PacingModeFlag, PacingStatsSnapshot};
use crate::broadcasting::{BroadcastEngine, BroadcastOrchestrator, ControlLoop};
use crate::config::CoreConfig;

pub struct BroadcastSession {
    config: CoreConfig,
    control: Arc<ControlLoop>,
    control_task: Option<JoinHandle<()>>,
    pacing: Option<PacingHandle>,
}

impl BroadcastSession {
    /// Start the pacing thread and the control loop. Must be called within a tokio runtime.
    pub fn start(
        config: CoreConfig,
        engine: Box<dyn BroadcastEngine>,
        sink: Arc<dyn AudioSink>,
    ) -> Result<Self> {
        config.validate().context("Invalid broadcast configuration")?;

        let mode = PacingModeFlag::default();
        let orchestrator = BroadcastOrchestrator::new(engine, mode.clone());

        let pacing = AudioPacingLoop::new(
            config.pacing.format(),
            config.pacing.tone(),
            config.pacing.wait_strategy,
            mode,
            sink,
        )
        .spawn()
        .context("Failed to start audio pacing")?;

        let control = Arc::new(ControlLoop::new(Arc::new(Mutex::new(orchestrator))));
        let control_task = match control.clone().spawn(config.control.poll_interval()) {
            Ok(task) => task,
            Err(e) => {
                // Don't leave the pacing thread running without a control loop
                if let Err(stop_err) = pacing.shutdown(config.control.shutdown_timeout()) {
                    warn!("⚠️ Pacing shutdown after failed start: {}", stop_err);
                }
                return Err(e.context("Failed to start control loop"));
            }
        };

        info!(
            "🚀 {}: pacing {} Hz / {} ms, polling every {} ms",
            "SESSION_START".green(),
            config.pacing.sample_rate,
            config.pacing.chunk_duration_ms,
            config.control.poll_interval_ms
        );

        Ok(Self {
            config,
            control,
            control_task: Some(control_task),
            pacing: Some(pacing),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn control(&self) -> &Arc<ControlLoop> {
        &self.control
    }

    pub fn orchestrator(&self) -> Arc<Mutex<BroadcastOrchestrator>> {
        self.control.orchestrator()
    }

    /// Run `f` with the orchestrator locked; observers fire once the lock is released
    pub fn with_orchestrator<R>(&self, f: impl FnOnce(&mut BroadcastOrchestrator) -> R) -> R {
        self.control.with_orchestrator(f)
    }

    pub fn pacing_stats(&self) -> Option<PacingStatsSnapshot> {
        self.pacing.as_ref().map(|p| p.stats())
    }

    /// Stop polling, shut the orchestrator down, then stop and join the pacing thread.
    pub async fn shutdown(mut self) -> Result<PacingStatsSnapshot> {
        let timeout = self.config.control.shutdown_timeout();
        info!("🛑 {}", "SESSION_SHUTDOWN".red());

        self.control.stop();
        if let Some(task) = self.control_task.take() {
            let abort = task.abort_handle();
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("⚠️ Control loop task ended abnormally: {}", e),
                Err(_) => {
                    warn!("⚠️ Control loop did not stop within {:?}; aborting", timeout);
                    abort.abort();
                }
            }
        }

        self.control.with_orchestrator(|o| o.shutdown());

        let Some(pacing) = self.pacing.take() else {
            anyhow::bail!("Pacing thread already released");
        };
        let stats = tokio::task::spawn_blocking(move || pacing.shutdown(timeout))
            .await
            .context("Pacing shutdown task failed")??;

        info!(
            "✅ {}: {} chunks submitted, {} dropped",
            "SESSION_STOPPED".green(),
            stats.chunks_submitted,
            stats.chunks_dropped
        );
        Ok(stats)
    }
}

impl Drop for BroadcastSession {
    fn drop(&mut self) {
        self.control.stop();
        if let Some(task) = self.control_task.take() {
            task.abort();
        }
        if let Some(pacing) = self.pacing.as_ref() {
            pacing.request_shutdown();
        }
    }
}
