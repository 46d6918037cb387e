use std::sync::Arc;
use std::time::Duration;

use ksync_core::{
    capture, Delivery, EmitOptions, EventDraft, EventKernel, KernelOptions, Lane, PersistOptions,
};
use ksync_kernel::SqliteCache;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Cart {
    count: u32,
}

async fn open(dir: &std::path::Path) -> EventKernel {
    let cache = SqliteCache::open(dir).expect("cache");
    EventKernel::with_cache(Arc::new(cache), KernelOptions::default())
        .await
        .expect("kernel")
}

#[tokio::test]
async fn store_state_survives_restart_on_sqlite() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let kernel = open(dir.path()).await;
        let cart = kernel
            .store_factory()
            .create_store("cart", Cart::default, PersistOptions::default())
            .await;
        cart.update(|c| c.count = 1);
        cart.flush().await.expect("flush");
        kernel.shutdown().await.expect("shutdown");
    }
    let kernel = open(dir.path()).await;
    let cart = kernel
        .store_factory()
        .create_store("cart", Cart::default, PersistOptions::default())
        .await;
    assert_eq!(cart.get(), Cart { count: 1 });
}

#[tokio::test]
async fn late_child_events_reach_the_ingest_queue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = open(dir.path()).await;
    let mut rx = kernel.subscribe(Lane::State);

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let k = kernel.clone();
    let (child, result) = kernel
        .run_request(async move {
            k.emit(EventDraft::new("tp:cart:add", json!({"n": 1})).key("cart"), EmitOptions::default());
            let child_kernel = k.clone();
            tokio::spawn(capture::inherit(async move {
                let _ = release_rx.await;
                child_kernel.emit(
                    EventDraft::new("tp:audit:note", json!("late")).key("audit"),
                    EmitOptions::default(),
                )
            }))
        })
        .await;
    assert_eq!(result.applied_count, 1);
    assert_eq!(rx.recv().await.map(|e| e.event_type), Some("tp:cart:add".to_string()));

    let _ = release_tx.send(());
    let late = child.await.expect("child");
    assert_eq!(late.delivery, Delivery::Queued);
    let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("late event applied")
        .expect("bus open");
    assert_eq!(seen.id, late.event.id);
    assert_eq!(kernel.value(Lane::State, "audit"), Some(json!("late")));
}

#[tokio::test]
async fn listeners_only_see_accepted_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = open(dir.path()).await;
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener = kernel.listen(Lane::State, move |event| sink.lock().push(event.id));

    let k = kernel.clone();
    let (clear, first) = kernel
        .run_request(async move {
            k.emit(
                EventDraft::new("tp:cart:clear", json!({})).key("cart"),
                EmitOptions::authoritative(),
            )
        })
        .await;
    assert_eq!(first.applied_count, 1);

    // an optimistic event stamped before the authoritative one loses
    let stale = ksync_core::KernelEvent::new(
        "tp:cart:add",
        json!({"n": 1}),
        Lane::State,
        ksync_core::AuthoritySource::ClientOptimistic,
        1,
    )
    .with_key("cart");
    let second = kernel.sync(vec![stale]).await;
    assert_eq!(second.rejected_count, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    listener.abort();
    assert_eq!(*seen.lock(), vec![clear.event.id]);
}

#[tokio::test]
async fn listener_sees_every_event_of_a_large_batch() {
    let options = KernelOptions {
        bus_capacity: 16,
        ..KernelOptions::default()
    };
    let kernel = EventKernel::with_cache(Arc::new(ksync_kernel::MemoryCache::new()), options)
        .await
        .expect("kernel");
    let seen = Arc::new(parking_lot::Mutex::new(0usize));
    let sink = seen.clone();
    let _listener = kernel.listen(Lane::State, move |_| *sink.lock() += 1);

    let events = (0..100)
        .map(|i| {
            ksync_core::KernelEvent::new(
                "tp:counter:set",
                json!(i),
                Lane::State,
                ksync_core::AuthoritySource::ServerAuthoritative,
                1,
            )
            .with_key(format!("counter-{i}"))
        })
        .collect();
    let result = kernel.sync(events).await;
    assert_eq!(result.applied_count, 100);

    tokio::time::timeout(Duration::from_secs(2), async {
        while *seen.lock() < 100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener caught up");
    assert_eq!(*seen.lock(), 100);
}
