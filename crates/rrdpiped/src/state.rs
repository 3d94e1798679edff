//! Shared application state and global statics.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use axum::extract::State;
use tokio::sync::{Semaphore, watch};

use rrdpipe_core::router::SubscriptionRouter;
use rrdpipe_core::service::ReportingService;

pub(crate) struct AppInner {
    pub(crate) service: Arc<ReportingService>,
    pub(crate) router: Arc<SubscriptionRouter>,
    /// Bounds archive tool invocations issued by live subscriptions.
    pub(crate) limiter: Arc<Semaphore>,
    /// Root of the procfs read by the realtime sampler.
    pub(crate) proc_root: PathBuf,
    /// Root of the sysfs holding hwmon temperature sensors.
    pub(crate) sys_root: PathBuf,
    /// Flips to `true` once the daemon starts shutting down; open SSE streams end on it.
    pub(crate) shutdown: watch::Receiver<bool>,
}

pub(crate) type SharedState = Arc<AppInner>;

pub(crate) type AppState = State<SharedState>;

/// Number of active SSE connections (live subscriptions and realtime).
pub(crate) static SSE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
