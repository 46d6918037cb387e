//! Reconciliation of event batches into durable, observable state.
//!
//! A batch is grouped by lane and target key, ordered by `(timestamp, id)`
//! inside each group, and judged against the key's stamp: the timestamp and
//! authority of the last applied event plus the newest authoritative timestamp
//! seen. Accepted events are persisted first, then folded into the state store,
//! then published on the bus. A failure touches one event only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use ksync_events::{AuthoritySource, Bus, KernelEvent, Lane};
use ksync_kernel::{CacheStore, StorageError};

use crate::store::ReactiveStore;

/// Synced values keyed by [`slot_id`].
pub type SyncedState = BTreeMap<String, Value>;

/// Cache id (and state-store key) for a lane/key pair.
pub fn slot_id(lane: Lane, key: &str) -> String {
    format!("{}/{}", lane.as_str(), key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictReason {
    /// An authoritative event with an equal or later timestamp already owns the key.
    SupersededByAuthoritative,
    /// The key already moved past this event's timestamp.
    Stale,
    /// Same event id as the last one applied to the key.
    Duplicate,
    /// The cache rejected the read or write for this key.
    PersistFailed,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::SupersededByAuthoritative => "superseded-by-authoritative",
            ConflictReason::Stale => "stale",
            ConflictReason::Duplicate => "duplicate",
            ConflictReason::PersistFailed => "persist-failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub key: String,
    pub rejected_event: KernelEvent,
    pub reason: ConflictReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    pub applied_count: usize,
    pub rejected_count: usize,
    pub conflicts: Vec<Conflict>,
}

impl SyncResult {
    fn reject(&mut self, key: &str, event: KernelEvent, reason: ConflictReason) {
        metrics::counter!("ksync_sync_rejected_total", "reason" => reason.as_str()).increment(1);
        self.rejected_count += 1;
        self.conflicts.push(Conflict {
            key: key.to_string(),
            rejected_event: event,
            reason,
        });
    }

    pub fn merge(&mut self, other: SyncResult) {
        self.applied_count += other.applied_count;
        self.rejected_count += other.rejected_count;
        self.conflicts.extend(other.conflicts);
    }
}

/// Derives the grouping key for an event.
pub trait KeyExtractor: Send + Sync {
    fn key_for(&self, event: &KernelEvent) -> String;
}

impl<F> KeyExtractor for F
where
    F: Fn(&KernelEvent) -> String + Send + Sync,
{
    fn key_for(&self, event: &KernelEvent) -> String {
        self(event)
    }
}

/// `event.key`, else the payload's string `"key"` field, else the event type.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKey;

impl KeyExtractor for DefaultKey {
    fn key_for(&self, event: &KernelEvent) -> String {
        if let Some(key) = &event.key {
            return key.clone();
        }
        event
            .payload
            .get("key")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| event.event_type.clone())
    }
}

/// Folds an accepted event into the key's current value.
pub trait Projection: Send + Sync {
    fn project(&self, current: Option<&Value>, event: &KernelEvent) -> Value;
}

/// The payload becomes the new value.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplacePayload;

impl Projection for ReplacePayload {
    fn project(&self, _current: Option<&Value>, event: &KernelEvent) -> Value {
        event.payload.clone()
    }
}

/// Shallow-merges object payloads into object values; replaces otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergePayload;

impl Projection for MergePayload {
    fn project(&self, current: Option<&Value>, event: &KernelEvent) -> Value {
        match (current, &event.payload) {
            (Some(Value::Object(base)), Value::Object(patch)) => {
                let mut merged = base.clone();
                for (k, v) in patch {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            _ => event.payload.clone(),
        }
    }
}

/// What the cache holds for each synced key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppliedRecord {
    value: Value,
    authority: AuthoritySource,
    event_id: String,
    #[serde(default)]
    authoritative_ts: Option<u64>,
}

#[derive(Debug, Clone)]
struct Slot {
    last_ts: u64,
    last_authority: AuthoritySource,
    last_event_id: String,
    authoritative_ts: Option<u64>,
    value: Value,
}

impl Slot {
    fn from_entry(entry: ksync_kernel::CacheEntry) -> Result<Self, serde_json::Error> {
        let record: AppliedRecord = serde_json::from_value(entry.data)?;
        Ok(Self {
            last_ts: entry.timestamp,
            last_authority: record.authority,
            last_event_id: record.event_id,
            authoritative_ts: record.authoritative_ts,
            value: record.value,
        })
    }

    /// Whether `event` orders after the last applied event. Timestamps
    /// decide first; at equal timestamps authority beats optimism and ids
    /// break ties between events of the same authority.
    fn is_superseded_by(&self, event: &KernelEvent) -> bool {
        match event.timestamp.cmp(&self.last_ts) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (
                event.authority_source.is_authoritative(),
                self.last_authority.is_authoritative(),
            ) {
                (true, false) => true,
                (false, true) => false,
                _ => event.id > self.last_event_id,
            },
        }
    }

    fn judge(&self, event: &KernelEvent) -> Option<ConflictReason> {
        if event.id == self.last_event_id {
            return Some(ConflictReason::Duplicate);
        }
        match event.authority_source {
            AuthoritySource::ClientOptimistic => {
                if self.authoritative_ts.is_some_and(|ts| ts >= event.timestamp) {
                    Some(ConflictReason::SupersededByAuthoritative)
                } else if !self.is_superseded_by(event) {
                    Some(ConflictReason::Stale)
                } else {
                    None
                }
            }
            AuthoritySource::ServerAuthoritative => {
                if self.is_superseded_by(event) {
                    None
                } else if self.last_authority.is_authoritative() {
                    Some(ConflictReason::SupersededByAuthoritative)
                } else {
                    Some(ConflictReason::Stale)
                }
            }
        }
    }
}

/// Reconciles event batches and applies the winners.
pub struct SyncManager {
    cache: Arc<dyn CacheStore>,
    state: ReactiveStore<SyncedState>,
    bus: Bus,
    keys: Arc<dyn KeyExtractor>,
    projection: Arc<dyn Projection>,
    // Held for a whole batch so concurrent syncs never interleave decisions.
    ledger: Mutex<HashMap<String, Slot>>,
}

impl SyncManager {
    pub fn new(cache: Arc<dyn CacheStore>, state: ReactiveStore<SyncedState>, bus: Bus) -> Self {
        Self {
            cache,
            state,
            bus,
            keys: Arc::new(DefaultKey),
            projection: Arc::new(ReplacePayload),
            ledger: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_key_extractor(mut self, keys: impl KeyExtractor + 'static) -> Self {
        self.keys = Arc::new(keys);
        self
    }

    pub fn with_projection(mut self, projection: impl Projection + 'static) -> Self {
        self.projection = Arc::new(projection);
        self
    }

    pub fn state(&self) -> &ReactiveStore<SyncedState> {
        &self.state
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn key_for(&self, event: &KernelEvent) -> String {
        self.keys.key_for(event)
    }

    /// Current synced value for `key` in `lane`.
    pub fn value(&self, lane: Lane, key: &str) -> Option<Value> {
        self.state.read(|state| state.get(&slot_id(lane, key)).cloned())
    }

    /// Rebuild stamps and state from the per-key cache records.
    ///
    /// Returns how many keys were restored.
    pub async fn restore(&self) -> Result<usize, StorageError> {
        let mut ledger = self.ledger.lock().await;
        let mut restored = SyncedState::new();
        for lane in Lane::ALL {
            let prefix = format!("{}/", lane.as_str());
            for entry in self.cache.list(Some(&prefix), usize::MAX).await? {
                let id = entry.id.clone();
                match Slot::from_entry(entry) {
                    Ok(slot) => {
                        restored.insert(id.clone(), slot.value.clone());
                        ledger.insert(id, slot);
                    }
                    Err(err) => {
                        warn!(id = %id, error = %err, "skipping undecodable sync record");
                    }
                }
            }
        }
        let count = restored.len();
        if count > 0 {
            self.state.update(|state| state.extend(restored));
        }
        debug!(keys = count, "sync ledger restored");
        Ok(count)
    }

    /// Reconcile and apply one batch.
    pub async fn sync(&self, events: Vec<KernelEvent>) -> SyncResult {
        let mut result = SyncResult::default();
        if events.is_empty() {
            return result;
        }
        let total = events.len();

        let mut groups: BTreeMap<(Lane, String), Vec<KernelEvent>> = BTreeMap::new();
        for event in events {
            let key = self.keys.key_for(&event);
            groups.entry((event.lane, key)).or_default().push(event);
        }

        let mut ledger = self.ledger.lock().await;
        for ((lane, key), mut group) in groups {
            group.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            let id = slot_id(lane, &key);

            let mut slot = match ledger.remove(&id) {
                Some(slot) => Some(slot),
                None => match self.load_slot(&id).await {
                    Ok(slot) => slot,
                    Err(err) => {
                        warn!(key = %id, error = %err, "cannot read key stamp; rejecting group");
                        for event in group {
                            result.reject(&key, event, ConflictReason::PersistFailed);
                        }
                        continue;
                    }
                },
            };

            for event in group {
                self.apply_one(&id, &key, &mut slot, event, &mut result)
                    .await;
            }
            if let Some(slot) = slot {
                ledger.insert(id, slot);
            }
        }
        drop(ledger);

        metrics::counter!("ksync_sync_applied_total").increment(result.applied_count as u64);
        debug!(
            events = total,
            applied = result.applied_count,
            rejected = result.rejected_count,
            "sync batch reconciled"
        );
        result
    }

    async fn load_slot(&self, id: &str) -> Result<Option<Slot>, StorageError> {
        let Some(entry) = self.cache.get(id).await? else {
            return Ok(None);
        };
        match Slot::from_entry(entry) {
            Ok(slot) => Ok(Some(slot)),
            Err(err) => {
                warn!(key = %id, error = %err, "ignoring undecodable sync record");
                Ok(None)
            }
        }
    }

    async fn apply_one(
        &self,
        id: &str,
        key: &str,
        slot: &mut Option<Slot>,
        event: KernelEvent,
        result: &mut SyncResult,
    ) {
        if let Some(reason) = slot.as_ref().and_then(|s| s.judge(&event)) {
            debug!(
                key = %id,
                event_id = %event.id,
                timestamp = event.timestamp,
                reason = reason.as_str(),
                "event rejected"
            );
            result.reject(key, event, reason);
            return;
        }

        let next_value = self
            .projection
            .project(slot.as_ref().map(|s| &s.value), &event);
        let authoritative_ts = if event.authority_source.is_authoritative() {
            Some(event.timestamp)
        } else {
            slot.as_ref().and_then(|s| s.authoritative_ts)
        };
        let record = AppliedRecord {
            value: next_value.clone(),
            authority: event.authority_source,
            event_id: event.id.clone(),
            authoritative_ts,
        };
        let persisted = match serde_json::to_value(&record) {
            Ok(data) => self
                .cache
                .put(id, data, Some(event.timestamp))
                .await
                .map(|_| ()),
            Err(err) => Err(StorageError::from(err)),
        };
        if let Err(err) = persisted {
            warn!(key = %id, event_id = %event.id, error = %err, "persist failed; event not applied");
            result.reject(key, event, ConflictReason::PersistFailed);
            return;
        }

        *slot = Some(Slot {
            last_ts: event.timestamp,
            last_authority: event.authority_source,
            last_event_id: event.id.clone(),
            authoritative_ts,
            value: next_value.clone(),
        });
        self.state.update(|state| {
            state.insert(id.to_string(), next_value);
        });
        self.bus.publish(&event);
        result.applied_count += 1;
    }
}
