//! Test infrastructure for deterministic integration testing.
//!
//! Provides an in-memory environment with a controllable clock, an HTTP mock
//! server, fixture builders, a scripted adapter, an event recorder and a
//! fault-injecting store. No database or real external system is needed.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod adapters;
pub mod env;
pub mod events;
pub mod fixtures;
pub mod store;

pub use adapters::{ScriptedAdapter, ScriptedOutcome};
pub use carelink_core::{Clock, MemoryStore, TestClock};
pub use env::TestEnv;
pub use events::RecordingEventHandler;
pub use fixtures::IntegrationConfigBuilder;
pub use store::{FaultyStore, StoreFault};
