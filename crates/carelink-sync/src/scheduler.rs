//! Periodic driver for scheduled syncs.

use std::{sync::Arc, time::Duration};

use carelink_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::orchestrator::{ScheduleSummary, SyncOrchestrator};

/// Calls [`SyncOrchestrator::scheduled_sync`] once per tick until cancelled.
#[derive(Debug)]
pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    cancellation_token: CancellationToken,
}

impl SyncScheduler {
    /// Creates a scheduler ticking every `tick`.
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        clock: Arc<dyn Clock>,
        tick: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { orchestrator, clock, tick, cancellation_token }
    }

    /// Runs one scheduling pass.
    pub async fn tick(&self) -> ScheduleSummary {
        self.orchestrator.scheduled_sync().await
    }

    /// Ticks until the cancellation token fires.
    ///
    /// A pass that is already running finishes before the loop exits.
    pub async fn run(self) {
        info!(tick_seconds = self.tick.as_secs(), "sync scheduler started");
        loop {
            tokio::select! {
                () = self.clock.sleep(self.tick) => {
                    self.tick().await;
                }
                () = self.cancellation_token.cancelled() => break,
            }
        }
        info!("sync scheduler stopped");
    }

    /// Spawns [`SyncScheduler::run`] onto the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
