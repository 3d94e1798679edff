//! rrdpipe-core: telemetry pipeline over collectd round-robin archives.
//!
//! Provides:
//! - `registry`: metric plugin table and identifier discovery
//! - `expression`: reference resolution for archive transform expressions
//! - `query`: windowed exports through the external archive tool
//! - `router`: fan-out of sample arrivals to live subscribers
//! - `ingest`: graphite line-protocol listener
//! - `events`: live export subscriptions driven by the router
//! - `realtime`: `/proc` based CPU and memory sampler
//! - `service`: query and discovery API over the pieces above
//! - `fs` / `mock`: filesystem abstraction and in-memory test doubles

pub mod config;
pub mod error;
pub mod events;
pub mod expression;
pub mod fs;
pub mod ingest;
pub mod mock;
pub mod query;
pub mod realtime;
pub mod registry;
pub mod router;
pub mod service;

pub use config::ReportingConfig;
pub use error::{ReportingError, Result};

/// Crate version with the git SHA it was built from.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_SHA"));
