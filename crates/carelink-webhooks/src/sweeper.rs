//! Periodic driver for the webhook retry sweep.

use std::{sync::Arc, time::Duration};

use carelink_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatcher::{SweepSummary, WebhookDispatcher};

/// Calls [`WebhookDispatcher::retry_failed_webhooks`] once per interval until
/// cancelled.
#[derive(Debug)]
pub struct WebhookSweeper {
    dispatcher: Arc<WebhookDispatcher>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl WebhookSweeper {
    /// Creates a sweeper running every `interval`.
    pub fn new(
        dispatcher: Arc<WebhookDispatcher>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { dispatcher, clock, interval, cancellation_token }
    }

    /// Runs one sweep.
    pub async fn sweep(&self) -> SweepSummary {
        self.dispatcher.retry_failed_webhooks().await
    }

    /// Sweeps until the cancellation token fires.
    pub async fn run(self) {
        info!(interval_seconds = self.interval.as_secs(), "webhook sweeper started");
        loop {
            tokio::select! {
                () = self.clock.sleep(self.interval) => {
                    self.sweep().await;
                }
                () = self.cancellation_token.cancelled() => break,
            }
        }
        info!("webhook sweeper stopped");
    }

    /// Spawns [`WebhookSweeper::run`] onto the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
