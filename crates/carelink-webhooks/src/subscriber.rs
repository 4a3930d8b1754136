//! Sync event subscriber that turns `integration.sync.*` events into
//! webhook deliveries.

use std::sync::Arc;

use carelink_core::{EventHandler, SyncEvent};
use tracing::{debug, warn};

use crate::{dispatcher::WebhookDispatcher, error::WebhookError};

/// Queues a webhook event for every sync event of a config with a webhook
/// URL, then delivers it in a background task.
///
/// Configs without a URL are skipped silently. The sync that produced the
/// event never waits for delivery.
#[derive(Debug, Clone)]
pub struct SyncEventSubscriber {
    dispatcher: Arc<WebhookDispatcher>,
}

impl SyncEventSubscriber {
    /// Creates a subscriber delivering through `dispatcher`.
    pub fn new(dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait::async_trait]
impl EventHandler for SyncEventSubscriber {
    async fn handle_event(&self, event: SyncEvent) {
        let config_id = event.config_id();
        let event_type = event.event_type();

        let queued = match self
            .dispatcher
            .create_webhook_event(config_id, event_type, event.payload())
            .await
        {
            Ok(queued) => queued,
            Err(WebhookError::NoWebhookConfigured { .. }) => {
                debug!(config_id = %config_id, event_type, "no webhook configured, skipping");
                return;
            },
            Err(e) => {
                warn!(config_id = %config_id, event_type, error = %e, "failed to queue webhook event");
                return;
            },
        };

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.process_webhook_event(queued.id).await;
        });
    }
}
