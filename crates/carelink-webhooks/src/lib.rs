//! Outbound webhook notifications with signed, retried delivery.
//!
//! Sync events become [`carelink_core::WebhookEvent`] rows through the
//! [`SyncEventSubscriber`]. The [`WebhookDispatcher`] posts each event to its
//! config's webhook URL, signing the raw body with the config's secret, and
//! reschedules failures with capped exponential backoff until the attempt
//! budget is spent. The [`WebhookSweeper`] picks rescheduled events up again.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod signature;
pub mod subscriber;
pub mod sweeper;

pub use client::{ClientConfig, DeliveryRequest, DeliveryResponse, WebhookClient};
pub use dispatcher::{
    DispatcherConfig, InboundVerdict, ProcessOutcome, SweepSummary, WebhookDispatcher,
};
pub use error::{Result, WebhookError};
pub use subscriber::SyncEventSubscriber;
pub use sweeper::WebhookSweeper;
