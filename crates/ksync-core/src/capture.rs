//! Request-scoped event capture.
//!
//! Each request runs inside [`scope`], which installs a fresh queue in
//! task-local storage. Events emitted while the request future is polled land
//! in that queue only; interleaved requests on the same thread each see their
//! own. When the request future completes the queue is read and closed exactly
//! once. If the future is dropped first, the queue is discarded.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task_local;
use tracing::debug;
use uuid::Uuid;

use ksync_events::KernelEvent;

task_local! {
    static ACTIVE_QUEUE: RequestQueue;
}

/// Handle to one request's pending events.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    request_id: String,
    // None once the owning request has flushed or been abandoned.
    events: Mutex<Option<Vec<KernelEvent>>>,
}

impl RequestQueue {
    fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                request_id: Uuid::new_v4().to_string(),
                events: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    fn push(&self, event: KernelEvent) -> Result<(), KernelEvent> {
        match self.inner.events.lock().as_mut() {
            Some(events) => {
                events.push(event);
                Ok(())
            }
            None => Err(event),
        }
    }

    fn snapshot(&self) -> Vec<KernelEvent> {
        self.inner.events.lock().clone().unwrap_or_default()
    }

    fn close(&self) -> Vec<KernelEvent> {
        self.inner.events.lock().take().unwrap_or_default()
    }
}

struct AbandonGuard {
    queue: Option<RequestQueue>,
}

impl AbandonGuard {
    fn flush(mut self) -> Vec<KernelEvent> {
        self.queue.take().map(|q| q.close()).unwrap_or_default()
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            let dropped = queue.close();
            if !dropped.is_empty() {
                debug!(
                    request_id = queue.request_id(),
                    dropped = dropped.len(),
                    "request abandoned; discarding captured events"
                );
            }
        }
    }
}

/// Run `fut` with a fresh, isolated event queue and return its output together
/// with the events captured while it ran.
pub async fn scope<F>(fut: F) -> (F::Output, Vec<KernelEvent>)
where
    F: Future,
{
    let queue = RequestQueue::new();
    let guard = AbandonGuard {
        queue: Some(queue.clone()),
    };
    let output = ACTIVE_QUEUE.scope(queue, fut).await;
    (output, guard.flush())
}

/// Append to the active request queue. Outside any request, or after the
/// owning request has flushed, the event is handed back to the caller.
pub fn add_event(event: KernelEvent) -> Result<(), KernelEvent> {
    match ACTIVE_QUEUE.try_with(|queue| queue.clone()) {
        Ok(queue) => queue.push(event),
        Err(_) => Err(event),
    }
}

/// Snapshot of the active queue without clearing it.
pub fn pending_events() -> Option<Vec<KernelEvent>> {
    ACTIVE_QUEUE.try_with(|queue| queue.snapshot()).ok()
}

pub fn is_active() -> bool {
    ACTIVE_QUEUE.try_with(|_| ()).is_ok()
}

pub fn current_request_id() -> Option<String> {
    ACTIVE_QUEUE
        .try_with(|queue| queue.request_id().to_string())
        .ok()
}

/// Carry the caller's request queue into `fut`, typically before handing it
/// to `tokio::spawn`. Events the child emits after the owning request has
/// flushed are not captured.
pub fn inherit<F>(fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let queue = ACTIVE_QUEUE.try_with(|queue| queue.clone()).ok();
    async move {
        match queue {
            Some(queue) => ACTIVE_QUEUE.scope(queue, fut).await,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksync_events::{AuthoritySource, Lane};
    use serde_json::json;
    use std::time::Duration;

    fn ev(id: &str) -> KernelEvent {
        KernelEvent::new(
            "tp:test:captured",
            json!({}),
            Lane::State,
            AuthoritySource::ClientOptimistic,
            1,
        )
        .with_id(id)
    }

    fn ids(events: &[KernelEvent]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[tokio::test]
    async fn outside_scope_hands_event_back() {
        assert!(!is_active());
        let back = add_event(ev("loose")).unwrap_err();
        assert_eq!(back.id, "loose");
        assert!(pending_events().is_none());
    }

    #[tokio::test]
    async fn interleaved_scopes_stay_isolated() {
        let first = scope(async {
            for i in 0..5 {
                add_event(ev(&format!("a{i}"))).unwrap();
                tokio::task::yield_now().await;
            }
        });
        let second = scope(async {
            for i in 0..5 {
                tokio::task::yield_now().await;
                add_event(ev(&format!("b{i}"))).unwrap();
            }
        });
        let ((_, a), (_, b)) = tokio::join!(first, second);
        assert_eq!(ids(&a), vec!["a0", "a1", "a2", "a3", "a4"]);
        assert_eq!(ids(&b), vec!["b0", "b1", "b2", "b3", "b4"]);
    }

    #[tokio::test]
    async fn pending_events_does_not_clear() {
        let ((first, second), flushed) = scope(async {
            add_event(ev("p1")).unwrap();
            let first = pending_events().unwrap();
            let second = pending_events().unwrap();
            (first, second)
        })
        .await;
        assert_eq!(ids(&first), vec!["p1"]);
        assert_eq!(ids(&second), vec!["p1"]);
        assert_eq!(ids(&flushed), vec!["p1"]);
    }

    #[tokio::test]
    async fn inherited_child_shares_queue_until_flush() {
        let (late_tx, late_rx) = tokio::sync::oneshot::channel::<()>();
        let (handle, events) = scope(async {
            add_event(ev("parent")).unwrap();
            let (pushed_tx, pushed_rx) = tokio::sync::oneshot::channel::<()>();
            let handle = tokio::spawn(inherit(async move {
                add_event(ev("child")).unwrap();
                let _ = pushed_tx.send(());
                let _ = late_rx.await;
                add_event(ev("late"))
            }));
            pushed_rx.await.expect("child pushed");
            handle
        })
        .await;
        let _ = late_tx.send(());
        let late = handle.await.expect("child task");
        assert_eq!(late.unwrap_err().id, "late");
        assert_eq!(ids(&events), vec!["parent", "child"]);
    }

    #[tokio::test]
    async fn spawned_task_without_inherit_is_outside_scope() {
        let (outside, events) = scope(async {
            tokio::spawn(async { add_event(ev("detached")).is_err() })
                .await
                .expect("task")
        })
        .await;
        assert!(outside);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn abandoned_scope_discards_events() {
        let (tx, rx) = tokio::sync::oneshot::channel::<RequestQueue>();
        let fut = scope(async move {
            add_event(ev("lost")).unwrap();
            let queue = ACTIVE_QUEUE.with(|q| q.clone());
            let _ = tx.send(queue);
            std::future::pending::<()>().await;
        });
        let res = tokio::time::timeout(Duration::from_millis(20), fut).await;
        assert!(res.is_err(), "request should have been cut off");
        let queue = rx.await.unwrap();
        assert!(queue.snapshot().is_empty());
        assert_eq!(queue.push(ev("after")).unwrap_err().id, "after");
    }
}
