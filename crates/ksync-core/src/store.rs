//! Reactive stores mirrored to the durable cache.
//!
//! A store owns its value in memory. Mutations notify selector-filtered
//! subscribers synchronously and queue a best-effort write of the new value to
//! the cache entry named after the store. Failed writes are logged and never
//! roll back the in-memory value.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use ksync_kernel::{CacheStore, StorageError};

/// How a store mirrors itself to durable storage.
#[derive(Debug, Clone)]
pub struct PersistOptions {
    pub enabled: bool,
    /// Cache id to use instead of the store name.
    pub key: Option<String>,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            key: None,
        }
    }
}

impl PersistOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Builds stores that hydrate from, and persist to, one cache.
#[derive(Clone)]
pub struct StoreFactory {
    cache: Arc<dyn CacheStore>,
    persist: bool,
}

impl StoreFactory {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            persist: true,
        }
    }

    /// Globally disable persistence regardless of per-store options.
    pub fn without_persistence(mut self) -> Self {
        self.persist = false;
        self
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Create the store `name`, restoring its last persisted value when one
    /// exists and falling back to `initializer` otherwise.
    pub async fn create_store<T, I>(
        &self,
        name: &str,
        initializer: I,
        options: PersistOptions,
    ) -> ReactiveStore<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        I: FnOnce() -> T,
    {
        let persist = self.persist && options.enabled;
        let key = options.key.unwrap_or_else(|| name.to_string());
        let initial = if persist {
            self.hydrate(name, &key).await
        } else {
            None
        };
        let initial = initial.unwrap_or_else(initializer);

        let persist_tx = persist.then(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(persist_loop(
                name.to_string(),
                key.clone(),
                self.cache.clone(),
                rx,
            ));
            tx
        });

        let (tx, _rx) = watch::channel(initial);
        ReactiveStore {
            inner: Arc::new(StoreInner {
                name: name.to_string(),
                tx,
                notifying: Mutex::new(()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                persist_tx,
            }),
        }
    }

    async fn hydrate<T: DeserializeOwned>(&self, name: &str, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(entry)) => match serde_json::from_value(entry.data) {
                Ok(value) => {
                    debug!(store = name, key, "store hydrated from cache");
                    Some(value)
                }
                Err(err) => {
                    warn!(store = name, key, error = %err, "cached store value does not decode; using initializer");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(store = name, key, error = %err, "store hydrate failed; using initializer");
                None
            }
        }
    }
}

enum PersistCmd {
    Write(Value),
    Flush(oneshot::Sender<Option<String>>),
}

async fn persist_loop(
    name: String,
    key: String,
    cache: Arc<dyn CacheStore>,
    mut rx: mpsc::UnboundedReceiver<PersistCmd>,
) {
    let mut last_error: Option<String> = None;
    while let Some(cmd) = rx.recv().await {
        let (mut value, mut acks) = match cmd {
            PersistCmd::Write(value) => (value, Vec::new()),
            PersistCmd::Flush(ack) => {
                let _ = ack.send(last_error.clone());
                continue;
            }
        };
        // Only the newest queued value matters; stop at a flush so it observes
        // this write.
        while let Ok(next) = rx.try_recv() {
            match next {
                PersistCmd::Write(newer) => value = newer,
                PersistCmd::Flush(ack) => {
                    acks.push(ack);
                    break;
                }
            }
        }
        last_error = match cache.put(&key, value, None).await {
            Ok(_) => None,
            Err(err) => {
                warn!(store = %name, key = %key, error = %err, "store persist failed");
                metrics::counter!("ksync_store_persist_failed_total").increment(1);
                Some(err.to_string())
            }
        };
        for ack in acks {
            let _ = ack.send(last_error.clone());
        }
    }
}

type Notify<T> = Arc<Mutex<Box<dyn FnMut(&T) + Send>>>;

struct Subscriber<T> {
    id: u64,
    notify: Notify<T>,
}

struct StoreInner<T> {
    name: String,
    tx: watch::Sender<T>,
    // Serialises mutation plus notification so subscribers see values in order.
    notifying: Mutex<()>,
    subscribers: Mutex<Vec<Subscriber<T>>>,
    next_subscriber: AtomicU64,
    persist_tx: Option<mpsc::UnboundedSender<PersistCmd>>,
}

/// A named, subscribable state container. Clones share the same state.
pub struct ReactiveStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for ReactiveStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ReactiveStore<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn get(&self) -> T {
        self.inner.tx.borrow().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.tx.borrow())
    }

    pub fn set(&self, value: T) {
        self.update(|current| *current = value);
    }

    /// Mutate in place, notify subscribers and schedule persistence.
    ///
    /// Subscriber callbacks run on the calling thread. They may subscribe or
    /// drop subscriptions but must not mutate this store.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let _order = self.inner.notifying.lock();
        self.inner.tx.send_modify(f);
        let snapshot = self.get();
        let callbacks: Vec<Notify<T>> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|sub| sub.notify.clone())
            .collect();
        for notify in callbacks {
            let mut notify = notify.lock();
            (*notify)(&snapshot);
        }
        self.schedule_persist(&snapshot);
    }

    /// Invoke `callback` with the selected slice whenever a mutation changes it.
    pub fn subscribe<S, Sel, Cb>(&self, selector: Sel, mut callback: Cb) -> Subscription
    where
        S: PartialEq + Send + 'static,
        Sel: Fn(&T) -> S + Send + 'static,
        Cb: FnMut(&S) + Send + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut last = self.read(&selector);
        let notify: Notify<T> = Arc::new(Mutex::new(Box::new(move |value: &T| {
            let next = selector(value);
            if next != last {
                callback(&next);
                last = next;
            }
        })));
        self.inner.subscribers.lock().push(Subscriber { id, notify });

        let weak: Weak<StoreInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers.lock().retain(|s| s.id != id);
                }
            })),
        }
    }

    /// Watch channel that observes every mutation.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.inner.tx.subscribe()
    }

    /// Wait until every mutation made so far has been written (or failed).
    pub async fn flush(&self) -> Result<(), StorageError> {
        let Some(tx) = &self.inner.persist_tx else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(PersistCmd::Flush(ack_tx)).is_err() {
            return Err(StorageError::Unavailable(format!(
                "persistence for store {} stopped",
                self.inner.name
            )));
        }
        match ack_rx.await {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(StorageError::Unavailable(err)),
            Err(_) => Err(StorageError::Unavailable(format!(
                "persistence for store {} stopped",
                self.inner.name
            ))),
        }
    }

    fn schedule_persist(&self, value: &T) {
        let Some(tx) = &self.inner.persist_tx else {
            return;
        };
        match serde_json::to_value(value) {
            Ok(json) => {
                let _ = tx.send(PersistCmd::Write(json));
            }
            Err(err) => {
                warn!(store = %self.inner.name, error = %err, "store value does not serialize; skipping persist");
            }
        }
    }
}

/// Keeps a store subscription alive; dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the subscription for the lifetime of the store.
    pub fn forget(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
