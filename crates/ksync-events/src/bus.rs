use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::{KernelEvent, Lane};

/// Broadcast bus for events that have already been reconciled and persisted.
///
/// `subscribe` hands out bounded broadcast receivers filtered by lane; a slow
/// receiver can lag and skip events. Callbacks registered with `listen` are
/// fed through their own unbounded queue and never miss an event.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<KernelEvent>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    published: Arc<AtomicU64>,
}

struct Listener {
    lane: Lane,
    tx: mpsc::UnboundedSender<KernelEvent>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub receivers: usize,
    pub listeners: usize,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            listeners: Arc::new(Mutex::new(Vec::new())),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an accepted event; returns how many receivers and listeners
    /// it was handed to.
    pub fn publish(&self, event: &KernelEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        {
            let mut listeners = self.listeners.lock();
            // closed queues belong to listeners whose task has ended
            listeners.retain(|l| {
                if l.lane != event.lane {
                    return !l.tx.is_closed();
                }
                let sent = l.tx.send(event.clone()).is_ok();
                if sent {
                    delivered += 1;
                }
                sent
            });
        }
        match self.tx.send(event.clone()) {
            Ok(n) => delivered + n,
            Err(_) => {
                if delivered == 0 {
                    trace!(lane = %event.lane, id = %event.id, "no bus receivers");
                }
                delivered
            }
        }
    }

    pub fn subscribe(&self, lane: Lane) -> LaneReceiver {
        LaneReceiver {
            lane,
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<KernelEvent> {
        self.tx.subscribe()
    }

    /// Run `listener` for every event accepted into `lane` until the bus is
    /// dropped or the returned task is aborted.
    ///
    /// The listener is registered before this returns, so events published
    /// afterwards are never missed. Requires a tokio runtime.
    pub fn listen<F>(&self, lane: Lane, mut listener: F) -> JoinHandle<()>
    where
        F: FnMut(KernelEvent) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(Listener { lane, tx });
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                listener(event);
            }
        })
    }

    pub fn stats(&self) -> BusStats {
        let listeners = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| !l.tx.is_closed());
            listeners.len()
        };
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            receivers: self.tx.receiver_count(),
            listeners,
        }
    }
}

/// A bus receiver bound to one lane.
pub struct LaneReceiver {
    lane: Lane,
    rx: broadcast::Receiver<KernelEvent>,
}

impl LaneReceiver {
    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Next event for this lane; `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<KernelEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.lane == self.lane => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(lane = %self.lane, skipped, "bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<KernelEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.lane == self.lane => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(lane = %self.lane, skipped, "bus receiver lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
