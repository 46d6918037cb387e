//! The kernel facade: emission, request capture, ingestion and subscription
//! wired around one [`SyncManager`].

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ksync_events::{Bus, EmitOptions, EventDraft, KernelEvent, Lane, LaneReceiver, LogicalClock};
use ksync_kernel::{CacheStore, SqliteCache};

use crate::capture;
use crate::config::{self, Config};
use crate::error::KernelError;
use crate::store::{PersistOptions, StoreFactory};
use crate::sync::{SyncManager, SyncResult, SyncedState};
use crate::tasks::TaskHandle;

const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Tunables for [`EventKernel`]; [`KernelOptions::from_config`] reads them
/// from a loaded [`Config`].
#[derive(Debug, Clone)]
pub struct KernelOptions {
    pub bus_capacity: usize,
    pub ingest_capacity: usize,
    pub batch_max: usize,
    pub state_store: String,
    pub persist_stores: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            bus_capacity: config::DEFAULT_BUS_CAPACITY,
            ingest_capacity: config::DEFAULT_INGEST_CAPACITY,
            batch_max: config::DEFAULT_BATCH_MAX,
            state_store: config::DEFAULT_STATE_STORE.to_string(),
            persist_stores: true,
        }
    }
}

impl KernelOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bus_capacity: config.bus_capacity(),
            ingest_capacity: config.ingest_capacity(),
            batch_max: config.batch_max(),
            state_store: config.state_store().to_string(),
            persist_stores: config.persist_stores(),
        }
    }
}

/// Where an emitted event went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Appended to the active request's queue.
    Captured,
    /// Handed to the ingestion queue.
    Queued,
    /// Neither a request nor the ingestion queue could take it.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct Emitted {
    pub event: KernelEvent,
    pub delivery: Delivery,
}

#[derive(Clone)]
pub struct EventKernel {
    inner: Arc<KernelInner>,
}

struct KernelInner {
    clock: LogicalClock,
    sync: Arc<SyncManager>,
    stores: StoreFactory,
    // None once shut down.
    ingest_tx: Mutex<Option<mpsc::Sender<KernelEvent>>>,
    drain: Mutex<Option<TaskHandle>>,
}

impl Drop for KernelInner {
    fn drop(&mut self) {
        if let Some(task) = self.drain.lock().take() {
            debug!(task = task.name(), "kernel dropped; discarding queued events");
            task.abort();
        }
    }
}

impl EventKernel {
    /// Open the SQLite cache named by `config` and start the kernel over it.
    pub async fn open(config: &Config) -> Result<Self, KernelError> {
        let cache = SqliteCache::open_path(&config.cache_path())?;
        Self::with_cache(Arc::new(cache), KernelOptions::from_config(config)).await
    }

    pub async fn with_cache(
        cache: Arc<dyn CacheStore>,
        options: KernelOptions,
    ) -> Result<Self, KernelError> {
        let stores = Self::store_factory_for(cache.clone(), &options);
        let state = stores
            .create_store(&options.state_store, SyncedState::new, PersistOptions::default())
            .await;
        let sync = SyncManager::new(cache, state, Bus::new(options.bus_capacity));
        Self::with_sync(sync, stores, options).await
    }

    /// Start the kernel around a caller-configured manager, e.g. one with a
    /// custom key extractor or projection.
    pub async fn with_sync(
        sync: SyncManager,
        stores: StoreFactory,
        options: KernelOptions,
    ) -> Result<Self, KernelError> {
        let restored = sync.restore().await?;
        let sync = Arc::new(sync);
        let (tx, rx) = mpsc::channel(options.ingest_capacity.max(1));
        let drain = TaskHandle::new(
            "ksync.ingest",
            tokio::spawn(drain_loop(sync.clone(), rx, options.batch_max.max(1))),
        );
        debug!(
            restored,
            ingest_capacity = options.ingest_capacity,
            batch_max = options.batch_max,
            "event kernel started"
        );
        Ok(Self {
            inner: Arc::new(KernelInner {
                clock: LogicalClock::new(),
                sync,
                stores,
                ingest_tx: Mutex::new(Some(tx)),
                drain: Mutex::new(Some(drain)),
            }),
        })
    }

    /// Store factory matching `options`, for callers assembling [`Self::with_sync`].
    pub fn store_factory_for(cache: Arc<dyn CacheStore>, options: &KernelOptions) -> StoreFactory {
        let stores = StoreFactory::new(cache);
        if options.persist_stores {
            stores
        } else {
            stores.without_persistence()
        }
    }

    /// Seal `draft` and deliver it: into the active request queue when one
    /// exists, otherwise onto the ingestion queue. Never blocks.
    pub fn emit(&self, draft: EventDraft, options: EmitOptions) -> Emitted {
        let event = draft.seal(options, self.inner.clock.tick());
        match capture::add_event(event.clone()) {
            Ok(()) => Emitted {
                event,
                delivery: Delivery::Captured,
            },
            Err(event) => {
                let delivery = self.enqueue(event.clone());
                Emitted { event, delivery }
            }
        }
    }

    fn enqueue(&self, event: KernelEvent) -> Delivery {
        let guard = self.inner.ingest_tx.lock();
        let Some(tx) = guard.as_ref() else {
            warn!(event_id = %event.id, event_type = %event.event_type, "no request context and kernel shut down; event dropped");
            metrics::counter!("ksync_emit_dropped_total").increment(1);
            return Delivery::Dropped;
        };
        match tx.try_send(event) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(event)) => {
                warn!(event_id = %event.id, event_type = %event.event_type, "ingest queue full; event dropped");
                metrics::counter!("ksync_emit_dropped_total").increment(1);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event_id = %event.id, event_type = %event.event_type, "ingest queue closed; event dropped");
                metrics::counter!("ksync_emit_dropped_total").increment(1);
                Delivery::Dropped
            }
        }
    }

    /// Run one request with its own event queue, then reconcile what it emitted.
    pub async fn run_request<F>(&self, fut: F) -> (F::Output, SyncResult)
    where
        F: Future,
    {
        let (output, events) = capture::scope(fut).await;
        let result = self.inner.sync.sync(events).await;
        (output, result)
    }

    /// Queue fully formed events for the drain task, waiting for capacity.
    pub async fn ingest(&self, events: Vec<KernelEvent>) -> Result<usize, KernelError> {
        let tx = self
            .inner
            .ingest_tx
            .lock()
            .clone()
            .ok_or(KernelError::ShutDown)?;
        let count = events.len();
        for event in events {
            tx.send(event).await.map_err(|_| KernelError::ShutDown)?;
        }
        Ok(count)
    }

    /// Reconcile `events` immediately, bypassing the ingestion queue.
    pub async fn sync(&self, events: Vec<KernelEvent>) -> SyncResult {
        self.inner.sync.sync(events).await
    }

    pub fn subscribe(&self, lane: Lane) -> LaneReceiver {
        self.inner.sync.bus().subscribe(lane)
    }

    pub fn listen<F>(&self, lane: Lane, listener: F) -> JoinHandle<()>
    where
        F: FnMut(KernelEvent) + Send + 'static,
    {
        self.inner.sync.bus().listen(lane, listener)
    }

    pub fn bus(&self) -> &Bus {
        self.inner.sync.bus()
    }

    pub fn sync_manager(&self) -> &SyncManager {
        &self.inner.sync
    }

    pub fn store_factory(&self) -> &StoreFactory {
        &self.inner.stores
    }

    pub fn value(&self, lane: Lane, key: &str) -> Option<Value> {
        self.inner.sync.value(lane, key)
    }

    /// Close the ingestion queue, apply what it already holds and flush the
    /// synced-state store. Later emissions outside a request are dropped.
    pub async fn shutdown(&self) -> Result<(), KernelError> {
        let tx = self.inner.ingest_tx.lock().take();
        drop(tx);
        let drain = self.inner.drain.lock().take();
        if let Some(task) = drain {
            if !task.shutdown_with_grace(DRAIN_GRACE).await {
                warn!("ingest drain did not finish cleanly");
            }
        }
        self.inner.sync.state().flush().await?;
        Ok(())
    }
}

async fn drain_loop(sync: Arc<SyncManager>, mut rx: mpsc::Receiver<KernelEvent>, batch_max: usize) {
    let mut batch = Vec::with_capacity(batch_max);
    while rx.recv_many(&mut batch, batch_max).await > 0 {
        let result = sync.sync(std::mem::take(&mut batch)).await;
        for conflict in &result.conflicts {
            debug!(
                key = %conflict.key,
                event_id = %conflict.rejected_event.id,
                reason = conflict.reason.as_str(),
                "queued event rejected"
            );
        }
    }
    debug!("ingest queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ConflictReason;
    use ksync_events::{AuthoritySource, Lane};
    use ksync_kernel::MemoryCache;
    use serde_json::json;
    use serial_test::serial;

    async fn kernel() -> EventKernel {
        EventKernel::with_cache(Arc::new(MemoryCache::new()), KernelOptions::default())
            .await
            .expect("kernel")
    }

    async fn next(rx: &mut LaneReceiver) -> KernelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("bus open")
    }

    #[tokio::test]
    async fn emit_inside_request_is_captured_then_applied() {
        let kernel = kernel().await;
        let mut rx = kernel.subscribe(Lane::State);
        let k = kernel.clone();
        let (emitted, result) = kernel
            .run_request(async move {
                k.emit(
                    EventDraft::new("tp:cart:add", json!({"item": 7})).key("cart"),
                    EmitOptions::default(),
                )
            })
            .await;
        assert_eq!(emitted.delivery, Delivery::Captured);
        assert_eq!(emitted.event.authority_source, AuthoritySource::ClientOptimistic);
        assert_eq!(result.applied_count, 1);
        assert_eq!(next(&mut rx).await.id, emitted.event.id);
        assert_eq!(kernel.value(Lane::State, "cart"), Some(json!({"item": 7})));
    }

    #[tokio::test]
    async fn emit_outside_request_goes_through_ingest_queue() {
        let kernel = kernel().await;
        let mut rx = kernel.subscribe(Lane::Realtime);
        let emitted = kernel.emit(
            EventDraft::new("tp:music:song_loaded", json!({"song": "a"})).lane(Lane::Realtime),
            EmitOptions::authoritative(),
        );
        assert_eq!(emitted.delivery, Delivery::Queued);
        let seen = next(&mut rx).await;
        assert_eq!(seen.id, emitted.event.id);
        assert_eq!(seen.authority_source, AuthoritySource::ServerAuthoritative);
    }

    #[tokio::test]
    async fn interleaved_requests_flush_only_their_own_events() {
        let kernel = kernel().await;
        let (ka, kb) = (kernel.clone(), kernel.clone());
        let a = kernel.run_request(async move {
            let mut ids = Vec::new();
            for i in 0..3 {
                ids.push(ka.emit(EventDraft::new("a", json!(i)).key("a"), EmitOptions::default()).event.id);
                tokio::task::yield_now().await;
            }
            ids
        });
        let b = kernel.run_request(async move {
            let mut ids = Vec::new();
            for i in 0..3 {
                tokio::task::yield_now().await;
                ids.push(kb.emit(EventDraft::new("b", json!(i)).key("b"), EmitOptions::default()).event.id);
            }
            ids
        });
        let ((_, ra), (_, rb)) = tokio::join!(a, b);
        assert_eq!(ra.applied_count, 3);
        assert_eq!(rb.applied_count, 3);
        assert_eq!(kernel.value(Lane::State, "a"), Some(json!(2)));
        assert_eq!(kernel.value(Lane::State, "b"), Some(json!(2)));
    }

    #[tokio::test]
    async fn shutdown_drains_queue_then_drops_new_emissions() {
        let kernel = kernel().await;
        let queued = kernel
            .ingest(vec![KernelEvent::new(
                "tp:cart:set",
                json!(1),
                Lane::State,
                AuthoritySource::ServerAuthoritative,
                10,
            )
            .with_key("cart")])
            .await
            .expect("ingest");
        assert_eq!(queued, 1);
        kernel.shutdown().await.expect("shutdown");
        assert_eq!(kernel.value(Lane::State, "cart"), Some(json!(1)));

        let late = kernel.emit(EventDraft::new("tp:cart:set", json!(2)), EmitOptions::default());
        assert_eq!(late.delivery, Delivery::Dropped);
        assert!(matches!(kernel.ingest(vec![]).await, Err(KernelError::ShutDown)));
    }

    #[tokio::test]
    async fn direct_sync_reports_conflicts() {
        let server = |id: &str| {
            KernelEvent::new("k", json!("s"), Lane::State, AuthoritySource::ServerAuthoritative, 5)
                .with_id(id)
        };
        let client = |id: &str| {
            KernelEvent::new("k", json!("c"), Lane::State, AuthoritySource::ClientOptimistic, 5)
                .with_id(id)
        };

        // server sorts first: the tied optimistic event loses
        let server_first = kernel().await;
        let result = server_first.sync(vec![client("b"), server("a")]).await;
        assert_eq!(result.applied_count, 1);
        assert_eq!(result.conflicts[0].reason, ConflictReason::SupersededByAuthoritative);
        assert_eq!(server_first.value(Lane::State, "k"), Some(json!("s")));

        // client sorts first: both apply and the server value wins the tie
        let client_first = kernel().await;
        let result = client_first.sync(vec![server("b"), client("a")]).await;
        assert_eq!(result.applied_count, 2);
        assert!(result.conflicts.is_empty());
        assert_eq!(client_first.value(Lane::State, "k"), Some(json!("s")));
    }

    #[tokio::test]
    async fn full_ingest_queue_drops_with_warning() {
        let options = KernelOptions {
            ingest_capacity: 1,
            ..KernelOptions::default()
        };
        let kernel = EventKernel::with_cache(Arc::new(MemoryCache::new()), options)
            .await
            .expect("kernel");
        // no await between emits: the drain task cannot take the first one yet
        let first = kernel.emit(EventDraft::new("tp:a:set", json!(1)).key("a"), EmitOptions::default());
        let second = kernel.emit(EventDraft::new("tp:b:set", json!(2)).key("b"), EmitOptions::default());
        assert_eq!(first.delivery, Delivery::Queued);
        assert_eq!(second.delivery, Delivery::Dropped);

        kernel.shutdown().await.expect("shutdown");
        assert_eq!(kernel.value(Lane::State, "a"), Some(json!(1)));
        assert_eq!(kernel.value(Lane::State, "b"), None);
    }

    #[tokio::test]
    #[serial]
    async fn reopened_kernel_restores_synced_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::remove_var("KSYNC_STATE_DIR");
        let cfg = crate::config::Config {
            runtime: crate::config::RuntimeConfig {
                state_dir: Some(dir.path().display().to_string()),
                cache_file: None,
            },
            ..Default::default()
        };
        let first = EventKernel::open(&cfg).await.expect("open");
        first
            .sync(vec![KernelEvent::new(
                "tp:cart:set",
                json!({"count": 1}),
                Lane::State,
                AuthoritySource::ServerAuthoritative,
                100,
            )
            .with_key("cart")])
            .await;
        first.shutdown().await.expect("shutdown");
        drop(first);

        let second = EventKernel::open(&cfg).await.expect("reopen");
        assert_eq!(second.value(Lane::State, "cart"), Some(json!({"count": 1})));
        let stale = second
            .sync(vec![KernelEvent::new(
                "tp:cart:set",
                json!({"count": 0}),
                Lane::State,
                AuthoritySource::ClientOptimistic,
                100,
            )
            .with_key("cart")])
            .await;
        assert_eq!(stale.rejected_count, 1);
    }
}
