//! Carelink integration service.
//!
//! The binary wires the library crates together: integration configs are
//! synced through [`carelink_sync::SyncOrchestrator`], sync events fan out to
//! [`carelink_webhooks::SyncEventSubscriber`], and two periodic drivers run
//! scheduled syncs and webhook retries until shutdown. This library target
//! only exposes the service [`config::Config`] so it can be tested.

#![forbid(unsafe_code)]

pub mod config;

pub use config::{Config, StorageBackend};
