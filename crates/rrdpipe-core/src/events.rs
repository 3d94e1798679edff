//! Live export subscriptions.
//!
//! An [`EventSource`] subscribes to the router for every key behind its
//! graphs. Each arrival triggers a lagged export of the affected graphs,
//! emitted as an `ADDED` event. Cancellation is signalled through a watch
//! channel; the router entries are removed by a drop guard, so they go away
//! however the run loop ends.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::query::{ExportRecord, TimeWindow};
use crate::router::{Arrival, Channel, SubscriptionKey, SubscriptionRouter};
use crate::service::{GraphRequest, ReportingService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Created,
    Running,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Added(ExportRecord),
}

impl SourceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SourceEvent::Added(_) => "ADDED",
        }
    }
}

pub struct EventSource {
    service: Arc<ReportingService>,
    router: Arc<SubscriptionRouter>,
    limiter: Arc<Semaphore>,
    graphs: Vec<GraphRequest>,
    /// Key to indices into `graphs`.
    routes: HashMap<SubscriptionKey, Vec<usize>>,
}

impl EventSource {
    /// Resolves the subscription keys of `graphs`; fails for unknown graphs.
    pub fn new(
        service: Arc<ReportingService>,
        router: Arc<SubscriptionRouter>,
        limiter: Arc<Semaphore>,
        graphs: Vec<GraphRequest>,
    ) -> Result<Self> {
        let mut routes: HashMap<SubscriptionKey, Vec<usize>> = HashMap::new();
        for (index, types) in service.plugin_and_types(&graphs)?.into_iter().enumerate() {
            for key in types.subscription_keys() {
                let indices = routes.entry(key).or_default();
                if !indices.contains(&index) {
                    indices.push(index);
                }
            }
        }
        Ok(Self {
            service,
            router,
            limiter,
            graphs,
            routes,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &SubscriptionKey> {
        self.routes.keys()
    }

    /// Subscribes and spawns the run loop.
    ///
    /// Router entries exist by the time this returns. Events arrive on the
    /// returned receiver; dropping it or the handle stops the source.
    pub fn start(self) -> (EventSourceHandle, mpsc::UnboundedReceiver<SourceEvent>) {
        let (state_tx, state_rx) = watch::channel(SourceState::Created);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (channel, arrivals) = Channel::new();

        let registration = Registration::new(
            Arc::clone(&self.router),
            channel,
            self.routes.keys().cloned().collect(),
        );
        state_tx.send_replace(SourceState::Running);

        let running = Running {
            registration,
            source: self,
            arrivals,
            state: state_rx,
            events: events_tx,
        };
        let task = tokio::spawn(running.run());

        (
            EventSourceHandle {
                state: state_tx,
                task: Some(task),
            },
            events_rx,
        )
    }
}

/// Router entries of one running source, removed on drop.
struct Registration {
    router: Arc<SubscriptionRouter>,
    channel: Channel,
    keys: Vec<SubscriptionKey>,
}

impl Registration {
    fn new(router: Arc<SubscriptionRouter>, channel: Channel, keys: Vec<SubscriptionKey>) -> Self {
        for key in &keys {
            router.subscribe(key.clone(), &channel);
        }
        Self {
            router,
            channel,
            keys,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        for key in &self.keys {
            self.router.unsubscribe(key, &self.channel);
        }
        debug!(channel = self.channel.id(), keys = self.keys.len(), "event source unsubscribed");
    }
}

// Field order matters: the registration is dropped before the event sender,
// so a closed event stream implies the router entries are gone.
struct Running {
    registration: Registration,
    source: EventSource,
    arrivals: mpsc::UnboundedReceiver<Arrival>,
    state: watch::Receiver<SourceState>,
    events: mpsc::UnboundedSender<SourceEvent>,
}

impl Running {
    async fn run(mut self) {
        let step = self.source.service.config().step_secs();
        loop {
            let arrival = tokio::select! {
                biased;
                _ = cancelled(&mut self.state) => break,
                arrival = self.arrivals.recv() => match arrival {
                    Some(arrival) => arrival,
                    None => break,
                },
            };
            if self.is_cancelled() {
                break;
            }
            let Some(indices) = self.source.routes.get(&arrival.key).cloned() else {
                continue;
            };

            let window =
                match TimeWindow::lagged(&arrival.timestamps, step, Utc::now().timestamp()) {
                    Ok(window) => window,
                    Err(e) => {
                        debug!(key = %arrival.key, error = %e, "skipping arrival");
                        continue;
                    }
                };
            for index in indices {
                let graph = self.source.graphs[index].clone();
                let record = self.export(graph, window).await;
                if self.is_cancelled() {
                    return;
                }
                let Some(record) = record else {
                    continue;
                };
                if self.events.send(SourceEvent::Added(record)).is_err() {
                    debug!(channel = self.registration.channel.id(), "event receiver closed");
                    return;
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.state.borrow() == SourceState::Cancelled
    }

    /// One bounded, blocking export. Failures are logged and skipped.
    async fn export(&mut self, graph: GraphRequest, window: TimeWindow) -> Option<ExportRecord> {
        let limiter = Arc::clone(&self.source.limiter);
        let permit = tokio::select! {
            biased;
            _ = cancelled(&mut self.state) => return None,
            permit = limiter.acquire_owned() => permit.ok()?,
        };
        let service = Arc::clone(&self.source.service);
        let name = graph.name.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            service.export(&graph, window, false)
        })
        .await;

        match result {
            Ok(Ok(record)) => Some(record),
            Ok(Err(e)) => {
                debug!(graph = %name, error = %e, "live export failed");
                None
            }
            Err(e) => {
                debug!(graph = %name, error = %e, "live export task failed");
                None
            }
        }
    }
}

async fn cancelled(state: &mut watch::Receiver<SourceState>) {
    loop {
        if *state.borrow_and_update() == SourceState::Cancelled {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Owner side of a running source. Dropping it cancels the source.
pub struct EventSourceHandle {
    state: watch::Sender<SourceState>,
    task: Option<JoinHandle<()>>,
}

impl EventSourceHandle {
    pub fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    pub fn cancel(&self) {
        self.state.send_replace(SourceState::Cancelled);
    }

    /// Cancels and waits for the run loop to exit and unsubscribe.
    pub async fn close(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "event source task ended abnormally");
            }
        }
    }
}

impl Drop for EventSourceHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::config::ReportingConfig;
    use crate::mock::{MockArchiveTool, MockFs};
    use crate::registry::{ArchiveType, Plugin, PluginRegistry, StaticInterfaces};

    struct Fixture {
        service: Arc<ReportingService>,
        router: Arc<SubscriptionRouter>,
        tool: Arc<MockArchiveTool>,
        limiter: Arc<Semaphore>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut fs = MockFs::new();
            fs.add_archive("/rrd", "cpu-0", "value");
            fs.add_archive("/rrd", "load", "load");
            let tool = Arc::new(MockArchiveTool::new(10));
            tool.record("/rrd/cpu-0/value.rrd", "value", 1000, 42.0);

            let registry = PluginRegistry::with_plugins(vec![
                Plugin::new("cpu", "cpu").archive_types(vec![ArchiveType::new("value", "value")]),
                Plugin::new("load", "load").archive_types(vec![
                    ArchiveType::new("load", "shortterm"),
                    ArchiveType::new("load", "midterm"),
                ]),
            ])
            .unwrap();
            let config = ReportingConfig {
                archive_root: PathBuf::from("/rrd"),
                ..ReportingConfig::default()
            };
            let service = ReportingService::new(
                config,
                registry,
                Arc::new(fs),
                tool.clone(),
                Arc::new(StaticInterfaces::default()),
            );
            Self {
                service: Arc::new(service),
                router: Arc::new(SubscriptionRouter::new()),
                tool,
                limiter: Arc::new(Semaphore::new(2)),
            }
        }

        fn source(&self, graphs: Vec<GraphRequest>) -> EventSource {
            EventSource::new(
                self.service.clone(),
                self.router.clone(),
                self.limiter.clone(),
                graphs,
            )
            .unwrap()
        }
    }

    fn cpu_key() -> SubscriptionKey {
        SubscriptionKey::new("cpu.value.value", Some("0".into()))
    }

    async fn no_event(rx: &mut mpsc::UnboundedReceiver<SourceEvent>) -> bool {
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_arrival_emits_lagged_export() {
        let fx = Fixture::new();
        let (handle, mut events) = fx.source(vec![GraphRequest::new("cpu", Some("0"))]).start();
        assert_eq!(handle.state(), SourceState::Running);

        fx.router.publish(&cpu_key(), vec![1003]);
        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "ADDED");
        let SourceEvent::Added(record) = event;
        assert_eq!(record.name, "cpu");
        assert_eq!(record.meta.start, 990);
        assert!(record.aggregations.is_empty());
        assert!(
            record
                .data
                .iter()
                .any(|row| row.timestamp == 1000 && row.values[0] == Some(42.0))
        );

        handle.close().await;
    }

    #[tokio::test]
    async fn test_fan_out_isolation() {
        let fx = Fixture::new();
        let (h1, mut e1) = fx.source(vec![GraphRequest::new("cpu", Some("0"))]).start();
        let (h2, mut e2) = fx.source(vec![GraphRequest::new("cpu", Some("0"))]).start();
        let (h3, mut e3) = fx.source(vec![GraphRequest::new("load", None)]).start();
        assert_eq!(fx.router.subscriber_count(&cpu_key()), 2);

        fx.router.publish(&cpu_key(), vec![1003]);
        for events in [&mut e1, &mut e2] {
            let SourceEvent::Added(record) = events.recv().await.unwrap();
            assert_eq!(record.identifier.as_deref(), Some("0"));
            assert!(no_event(events).await);
        }
        assert!(no_event(&mut e3).await);
        assert_eq!(fx.tool.calls(), 2);

        h1.close().await;
        h2.close().await;
        h3.close().await;
    }

    #[tokio::test]
    async fn test_close_unsubscribes_every_key() {
        let fx = Fixture::new();
        let source = fx.source(vec![
            GraphRequest::new("cpu", Some("0")),
            GraphRequest::new("load", None),
        ]);
        let keys: Vec<SubscriptionKey> = source.keys().cloned().collect();
        assert_eq!(keys.len(), 3);

        let (handle, _events) = source.start();
        for key in &keys {
            assert_eq!(fx.router.subscriber_count(key), 1);
        }

        handle.close().await;
        for key in &keys {
            assert_eq!(fx.router.subscriber_count(key), 0);
        }
        assert_eq!(fx.router.key_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels() {
        let fx = Fixture::new();
        let (handle, mut events) = fx.source(vec![GraphRequest::new("load", None)]).start();
        drop(handle);

        assert!(events.recv().await.is_none());
        assert_eq!(fx.router.key_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_stream_alive() {
        let fx = Fixture::new();
        let (handle, mut events) = fx.source(vec![GraphRequest::new("cpu", Some("0"))]).start();

        fx.tool.fail_next("ERROR: rrdcached busy");
        fx.router.publish(&cpu_key(), vec![1003]);
        assert!(no_event(&mut events).await);

        fx.router.publish(&cpu_key(), vec![1013]);
        let SourceEvent::Added(record) = events.recv().await.unwrap();
        assert_eq!(record.meta.start, 1000);
        assert_eq!(fx.tool.calls(), 2);

        handle.close().await;
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_keeps_stream_alive() {
        let fx = Fixture::new();
        let (handle, mut events) = fx.source(vec![GraphRequest::new("cpu", Some("0"))]).start();

        fx.router.publish(&cpu_key(), vec![i64::MAX]);
        assert!(no_event(&mut events).await);
        assert_eq!(fx.router.subscriber_count(&cpu_key()), 1);

        fx.router.publish(&cpu_key(), vec![1003]);
        let SourceEvent::Added(record) = events.recv().await.unwrap();
        assert_eq!(record.meta.start, 990);
        assert_eq!(fx.tool.calls(), 1);

        handle.close().await;
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_permit() {
        let mut fx = Fixture::new();
        fx.limiter = Arc::new(Semaphore::new(0));
        let (handle, _events) = fx.source(vec![GraphRequest::new("cpu", Some("0"))]).start();

        fx.router.publish(&cpu_key(), vec![1003]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), handle.close())
            .await
            .expect("close should not wait for a permit");
        assert_eq!(fx.tool.calls(), 0);
        assert_eq!(fx.router.key_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_key_exports_each_graph() {
        let fx = Fixture::new();
        let (handle, mut events) = fx
            .source(vec![
                GraphRequest::new("load", None),
                GraphRequest::new("load", None),
            ])
            .start();

        fx.router
            .publish(&SubscriptionKey::new("load.load.midterm", None), vec![1003]);
        assert!(events.recv().await.is_some());
        assert!(events.recv().await.is_some());
        assert!(no_event(&mut events).await);

        handle.close().await;
    }

    #[test]
    fn test_unknown_graph_rejected() {
        let fx = Fixture::new();
        let result = EventSource::new(
            fx.service.clone(),
            fx.router.clone(),
            fx.limiter.clone(),
            vec![GraphRequest::new("nope", None)],
        );
        assert_eq!(result.err().map(|e| e.kind()), Some("not_found"));
    }
}
