use std::sync::Arc;

use ksync_core::{PersistOptions, StoreFactory, SyncManager, SyncedState};
use ksync_events::{AuthoritySource, Bus, KernelEvent, Lane};
use ksync_kernel::MemoryCache;
use proptest::prelude::*;
use serde_json::json;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

async fn manager() -> SyncManager {
    let cache = Arc::new(MemoryCache::new());
    let state = StoreFactory::new(cache.clone())
        .create_store("ksync.synced", SyncedState::new, PersistOptions::disabled())
        .await;
    SyncManager::new(cache, state, Bus::new(16))
}

fn authoritative(index: usize, ts: u64) -> KernelEvent {
    KernelEvent::new(
        "tp:score:set",
        json!(index),
        Lane::Realtime,
        AuthoritySource::ServerAuthoritative,
        ts,
    )
    .with_id(format!("e{index:02}"))
    .with_key("score")
}

proptest! {
    #[test]
    fn authoritative_events_converge_for_any_arrival(
        entries in prop::collection::vec((0u64..5, any::<u32>()), 1..12),
        chunk in 1usize..5,
    ) {
        let events: Vec<KernelEvent> = entries
            .iter()
            .enumerate()
            .map(|(i, (ts, _))| authoritative(i, *ts))
            .collect();
        let winner = events
            .iter()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
            .map(|e| e.payload.clone());

        let mut arrival: Vec<(u32, KernelEvent)> = entries
            .iter()
            .zip(events.iter().cloned())
            .map(|((_, order), e)| (*order, e))
            .collect();
        arrival.sort_by_key(|(order, _)| *order);
        let arrival: Vec<KernelEvent> = arrival.into_iter().map(|(_, e)| e).collect();

        let rt = runtime();
        let (shuffled, in_order, applied) = rt.block_on(async {
            let shuffled = manager().await;
            let mut applied = 0;
            for batch in arrival.chunks(chunk) {
                applied += shuffled.sync(batch.to_vec()).await.applied_count;
            }
            let in_order = manager().await;
            in_order.sync(events.clone()).await;
            (
                shuffled.value(Lane::Realtime, "score"),
                in_order.value(Lane::Realtime, "score"),
                applied,
            )
        });

        prop_assert_eq!(&shuffled, &winner);
        prop_assert_eq!(&in_order, &winner);
        prop_assert!(applied >= 1);
    }

    #[test]
    fn accepted_plus_rejected_accounts_for_every_event(
        stamps in prop::collection::vec((0u64..6, any::<bool>()), 0..16),
    ) {
        let events: Vec<KernelEvent> = stamps
            .iter()
            .enumerate()
            .map(|(i, (ts, server))| {
                let authority = if *server {
                    AuthoritySource::ServerAuthoritative
                } else {
                    AuthoritySource::ClientOptimistic
                };
                KernelEvent::new("tp:cart:set", json!(i), Lane::State, authority, *ts)
                    .with_key(if i % 2 == 0 { "even" } else { "odd" })
            })
            .collect();
        let total = events.len();
        let result = runtime().block_on(async { manager().await.sync(events).await });
        prop_assert_eq!(result.applied_count + result.rejected_count, total);
        prop_assert_eq!(result.conflicts.len(), result.rejected_count);
    }
}
