//! Queueing and at-least-once delivery of webhook events.
//!
//! Each event moves through:
//!
//! ```text
//!            claim (attempts + 1)          2xx
//! pending ─────────────────────▶ processing ─────▶ delivered
//!    ▲                               │
//!    │ attempts < max_attempts       │ failure after the inner retry loop
//!    └──── next_retry_at = now + ────┤
//!          min(base * 2^(n-1), cap)  │ attempts == max_attempts
//!                                    └──────────────────────────▶ failed
//! ```
//!
//! Two backoff layers apply. Inside one attempt, the config's retry settings
//! drive repeated HTTP posts. Between attempts, the event waits for
//! `next_retry_at` and is picked up by [`WebhookDispatcher::retry_failed_webhooks`].
//!
//! A queued event is due at `created_at + retry_base` even before its first
//! attempt, so the sweep delivers it if the immediate attempt never runs.
//! Events left in `processing` longer than
//! [`DispatcherConfig::stale_processing_after`] are handed back to the sweep.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use carelink_core::{
    models::DEFAULT_WEBHOOK_MAX_ATTEMPTS, Clock, ErrorSnapshot, IntegrationConfigId,
    IntegrationStore, WebhookEvent, WebhookEventId, WebhookEventStatus,
};
use carelink_sync::RetryPolicy;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryRequest, WebhookClient},
    error::{Result, WebhookError},
    signature,
};

/// Default number of events returned by
/// [`WebhookDispatcher::list_webhook_events`].
pub const DEFAULT_EVENT_LIST_LIMIT: usize = 50;

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Whole-delivery attempts per event.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub retry_base: Duration,
    /// Upper bound on the delay between attempts.
    pub retry_cap: Duration,
    /// Age after which a `processing` event is presumed abandoned.
    pub stale_processing_after: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_WEBHOOK_MAX_ATTEMPTS,
            retry_base: Duration::from_millis(1000),
            retry_cap: Duration::from_millis(30_000),
            stale_processing_after: Duration::from_secs(600),
        }
    }
}

impl DispatcherConfig {
    /// Delay before the next attempt after `attempts` failed ones.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.retry_base.saturating_mul(1_u32 << exponent).min(self.retry_cap)
    }
}

fn add_delay(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    at + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// What a processing call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The receiver accepted the event.
    Delivered,
    /// The attempt failed; the event waits for `next_retry_at`.
    Rescheduled {
        /// Earliest time of the next attempt.
        next_retry_at: DateTime<Utc>,
    },
    /// The event is now terminally failed.
    Failed,
    /// Nothing was attempted: the event is missing, terminal or claimed
    /// elsewhere.
    Skipped,
}

/// Result of one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Abandoned `processing` events handed back before the sweep.
    pub reclaimed: usize,
    /// Events found due.
    pub due: usize,
    /// Events delivered.
    pub delivered: usize,
    /// Events that failed again and were rescheduled.
    pub rescheduled: usize,
    /// Events that became terminally failed.
    pub failed: usize,
}

/// Verdict on an inbound webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundVerdict {
    /// Whether the payload is trusted.
    pub accepted: bool,
    /// Reason.
    pub message: String,
}

impl InboundVerdict {
    fn accepted(message: &str) -> Self {
        Self { accepted: true, message: message.to_string() }
    }

    fn rejected(message: &str) -> Self {
        Self { accepted: false, message: message.to_string() }
    }
}

/// Queues webhook events and delivers them.
#[derive(Debug)]
pub struct WebhookDispatcher {
    store: Arc<dyn IntegrationStore>,
    client: WebhookClient,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl WebhookDispatcher {
    /// Creates a dispatcher.
    pub fn new(
        store: Arc<dyn IntegrationStore>,
        client: WebhookClient,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self { store, client, clock, config }
    }

    /// Queues an event for the config's webhook URL.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown config and `NoWebhookConfigured`
    /// when the config has no URL.
    pub async fn create_webhook_event(
        &self,
        config_id: IntegrationConfigId,
        event_type: &str,
        payload: Value,
    ) -> Result<WebhookEvent> {
        let config = self
            .store
            .find_config(config_id)
            .await?
            .ok_or_else(|| WebhookError::not_found("IntegrationConfig", config_id))?;
        if config.webhook_url.is_none() {
            return Err(WebhookError::NoWebhookConfigured { config_id });
        }

        let mut event = WebhookEvent::new(
            config_id,
            event_type,
            payload,
            self.config.max_attempts,
            self.clock.now_utc(),
        );
        event.next_retry_at = Some(add_delay(event.created_at, self.config.retry_base));
        self.store.insert_webhook_event(event.clone()).await?;
        debug!(event_id = %event.id, config_id = %config_id, event_type, "webhook event queued");
        Ok(event)
    }

    /// Loads one event.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown event.
    pub async fn get_webhook_event(&self, id: WebhookEventId) -> Result<WebhookEvent> {
        self.store
            .find_webhook_event(id)
            .await?
            .ok_or_else(|| WebhookError::not_found("WebhookEvent", id))
    }

    /// Newest-first events of one config, [`DEFAULT_EVENT_LIST_LIMIT`] by
    /// default.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown config.
    pub async fn list_webhook_events(
        &self,
        config_id: IntegrationConfigId,
        limit: Option<usize>,
    ) -> Result<Vec<WebhookEvent>> {
        if self.store.find_config(config_id).await?.is_none() {
            return Err(WebhookError::not_found("IntegrationConfig", config_id));
        }
        Ok(self
            .store
            .list_webhook_events(config_id, limit.unwrap_or(DEFAULT_EVENT_LIST_LIMIT))
            .await?)
    }

    /// Makes one whole delivery attempt for the event.
    ///
    /// Never fails: every problem ends up in the event's status and error
    /// snapshot, or in the logs when the store itself is unavailable.
    pub async fn process_webhook_event(&self, id: WebhookEventId) -> ProcessOutcome {
        let event = match self.store.find_webhook_event(id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!(event_id = %id, "webhook event not found");
                return ProcessOutcome::Skipped;
            },
            Err(e) => {
                error!(event_id = %id, error = %e, "failed to load webhook event");
                return ProcessOutcome::Skipped;
            },
        };

        if event.is_terminal() {
            debug!(event_id = %id, status = %event.status, "webhook event already terminal");
            return ProcessOutcome::Skipped;
        }
        if event.status == WebhookEventStatus::Pending && !event.has_attempts_remaining() {
            return self.exhaust(event).await;
        }

        let now = self.clock.now_utc();
        let event = match self.store.claim_webhook_event(id, now).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(event_id = %id, "webhook event claimed elsewhere");
                return ProcessOutcome::Skipped;
            },
            Err(e) => {
                error!(event_id = %id, error = %e, "failed to claim webhook event");
                return ProcessOutcome::Skipped;
            },
        };

        let outcome = self.deliver(&event).await;
        self.record(event, outcome).await
    }

    /// Reprocesses every pending event whose `next_retry_at` has passed.
    ///
    /// Abandoned `processing` events are reclaimed first. Due events are
    /// processed concurrently. Never fails.
    pub async fn retry_failed_webhooks(&self) -> SweepSummary {
        let now = self.clock.now_utc();
        let stale_before = now
            - chrono::Duration::from_std(self.config.stale_processing_after)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        let reclaimed = match self
            .store
            .reclaim_stale_webhook_events(
                stale_before,
                ErrorSnapshot::new("delivery attempt abandoned", now),
            )
            .await
        {
            Ok(reclaimed) => {
                if reclaimed > 0 {
                    warn!(reclaimed, "reclaimed abandoned webhook deliveries");
                }
                usize::try_from(reclaimed).unwrap_or(usize::MAX)
            },
            Err(e) => {
                error!(error = %e, "failed to reclaim abandoned webhook deliveries");
                0
            },
        };

        let due = match self.store.due_webhook_events(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to load due webhook events");
                return SweepSummary { reclaimed, ..SweepSummary::default() };
            },
        };

        let mut summary = SweepSummary { reclaimed, due: due.len(), ..SweepSummary::default() };
        let outcomes = join_all(due.iter().map(|event| self.process_webhook_event(event.id))).await;
        for outcome in outcomes {
            match outcome {
                ProcessOutcome::Delivered => summary.delivered += 1,
                ProcessOutcome::Rescheduled { .. } => summary.rescheduled += 1,
                ProcessOutcome::Failed => summary.failed += 1,
                ProcessOutcome::Skipped => {},
            }
        }

        if summary.due > 0 {
            info!(
                reclaimed = summary.reclaimed,
                due = summary.due,
                delivered = summary.delivered,
                rescheduled = summary.rescheduled,
                failed = summary.failed,
                "webhook retry sweep finished"
            );
        }
        summary
    }

    /// Checks an inbound payload against the config's signing secret.
    ///
    /// A config without a secret accepts unsigned payloads.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown config.
    pub async fn receive_webhook(
        &self,
        config_id: IntegrationConfigId,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<InboundVerdict> {
        let config = self
            .store
            .find_config(config_id)
            .await?
            .ok_or_else(|| WebhookError::not_found("IntegrationConfig", config_id))?;

        let verdict = match (config.webhook_secret(), signature) {
            (None, _) => InboundVerdict::accepted("no signing secret configured"),
            (Some(_), None) => InboundVerdict::rejected("missing signature"),
            (Some(secret), Some(signature)) if signature::verify(secret, raw_body, signature) => {
                InboundVerdict::accepted("signature verified")
            },
            (Some(_), Some(_)) => InboundVerdict::rejected("invalid signature"),
        };
        if !verdict.accepted {
            warn!(config_id = %config_id, reason = %verdict.message, "inbound webhook rejected");
        }
        Ok(verdict)
    }

    /// Posts the event under the config's retry settings.
    async fn deliver(&self, event: &WebhookEvent) -> Result<()> {
        let config = self
            .store
            .find_config(event.integration_config_id)
            .await?
            .ok_or_else(|| WebhookError::not_found("IntegrationConfig", event.integration_config_id))?;
        let url = config
            .webhook_url
            .clone()
            .ok_or(WebhookError::NoWebhookConfigured { config_id: config.id })?;

        let body = serde_json::to_vec(&event.payload)
            .map(Bytes::from)
            .map_err(|e| WebhookError::configuration(format!("unserializable payload: {e}")))?;
        let request = DeliveryRequest {
            event_id: event.id,
            event_type: event.event_type.clone(),
            url,
            signature: config.webhook_secret().map(|secret| signature::sign(secret, &body)),
            body,
            headers: config.webhook_headers(),
            attempt: event.attempts,
        };

        let policy = RetryPolicy::from(config.effective_retry_config());
        policy
            .retry_if(
                self.clock.as_ref(),
                |_| self.client.deliver(&request),
                WebhookError::is_retryable,
            )
            .await
            .map(|_| ())
    }

    async fn record(&self, mut event: WebhookEvent, outcome: Result<()>) -> ProcessOutcome {
        let now = self.clock.now_utc();
        event.updated_at = now;
        let result = match outcome {
            Ok(()) => {
                event.status = WebhookEventStatus::Delivered;
                event.delivered_at = Some(now);
                event.next_retry_at = None;
                event.error = None;
                info!(event_id = %event.id, attempts = event.attempts, "webhook event delivered");
                ProcessOutcome::Delivered
            },
            Err(e) if event.has_attempts_remaining() => {
                let next_retry_at = add_delay(now, self.config.retry_delay(event.attempts));
                event.status = WebhookEventStatus::Pending;
                event.next_retry_at = Some(next_retry_at);
                event.error = Some(ErrorSnapshot::new(e.to_string(), now));
                warn!(
                    event_id = %event.id,
                    attempt = event.attempts,
                    max_attempts = event.max_attempts,
                    next_retry_at = %next_retry_at,
                    error = %e,
                    "webhook delivery failed, rescheduled"
                );
                ProcessOutcome::Rescheduled { next_retry_at }
            },
            Err(e) => {
                event.status = WebhookEventStatus::Failed;
                event.next_retry_at = None;
                event.error = Some(ErrorSnapshot::new(e.to_string(), now));
                error!(
                    event_id = %event.id,
                    attempts = event.attempts,
                    error = %e,
                    "webhook delivery failed permanently"
                );
                ProcessOutcome::Failed
            },
        };

        if let Err(e) = self.store.update_webhook_event(event).await {
            error!(error = %e, "failed to record webhook delivery outcome");
        }
        result
    }

    /// Marks a pending event with no attempts left as failed.
    async fn exhaust(&self, mut event: WebhookEvent) -> ProcessOutcome {
        let now = self.clock.now_utc();
        event.status = WebhookEventStatus::Failed;
        event.next_retry_at = None;
        event.updated_at = now;
        if event.error.is_none() {
            event.error = Some(ErrorSnapshot::new("delivery attempts exhausted", now));
        }
        warn!(event_id = %event.id, attempts = event.attempts, "webhook event out of attempts");
        if let Err(e) = self.store.update_webhook_event(event).await {
            error!(error = %e, "failed to mark webhook event failed");
        }
        ProcessOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outer_backoff_doubles_to_cap() {
        let config = DispatcherConfig::default();
        let delays: Vec<u128> = (1..=7).map(|n| config.retry_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn outer_backoff_survives_large_attempt_counts() {
        let config = DispatcherConfig::default();
        assert_eq!(config.retry_delay(u32::MAX), Duration::from_millis(30_000));
        assert_eq!(config.retry_delay(0), Duration::from_millis(1000));
    }
}
