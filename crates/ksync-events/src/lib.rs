//! Kernel event envelope and the lane-routed broadcast bus.
//!
//! Every state change that flows through the sync kernel is carried as a
//! [`KernelEvent`]. Producers usually start from an [`EventDraft`] and let the
//! kernel seal it (assign id and timestamp); realtime drivers that already hold
//! fully formed events hand them over as-is.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

mod bus;

pub use bus::{Bus, BusStats, LaneReceiver};

/// Routing channel for an event. Lanes are independent ordering domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Durable application state.
    State,
    /// Live pushes from a connected peer.
    Realtime,
    /// Administrative and bookkeeping traffic.
    Admin,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::State, Lane::Realtime, Lane::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::State => "state",
            Lane::Realtime => "realtime",
            Lane::Admin => "admin",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLane(pub String);

impl fmt::Display for UnknownLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown lane '{}'", self.0)
    }
}

impl std::error::Error for UnknownLane {}

impl FromStr for Lane {
    type Err = UnknownLane;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "state" => Ok(Lane::State),
            "realtime" => Ok(Lane::Realtime),
            "admin" => Ok(Lane::Admin),
            other => Err(UnknownLane(other.to_string())),
        }
    }
}

/// Trust level of the event's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthoritySource {
    /// Always wins conflicts.
    ServerAuthoritative,
    /// May be superseded by an authoritative event.
    #[default]
    ClientOptimistic,
}

impl AuthoritySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthoritySource::ServerAuthoritative => "server-authoritative",
            AuthoritySource::ClientOptimistic => "client-optimistic",
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self, AuthoritySource::ServerAuthoritative)
    }
}

impl fmt::Display for AuthoritySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEvent {
    #[serde(default = "fresh_id")]
    pub id: String,
    /// Namespaced tag, conventionally `"<domain>:<module>:<verb>"`.
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub lane: Lane,
    #[serde(default)]
    pub authority_source: AuthoritySource,
    pub timestamp: u64,
    /// Caller-supplied grouping key; see the sync manager's key resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

impl KernelEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        lane: Lane,
        authority_source: AuthoritySource,
        timestamp: u64,
    ) -> Self {
        Self {
            id: fresh_id(),
            event_type: event_type.into(),
            payload,
            lane,
            authority_source,
            timestamp,
            key: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Overrides accepted by `emit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    pub authority_source: Option<AuthoritySource>,
    pub lane: Option<Lane>,
}

impl EmitOptions {
    pub fn authoritative() -> Self {
        Self {
            authority_source: Some(AuthoritySource::ServerAuthoritative),
            lane: None,
        }
    }

    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }
}

/// A partially built event: everything except identity and time.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: String,
    pub payload: Value,
    pub lane: Lane,
    pub key: Option<String>,
}

impl EventDraft {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            lane: Lane::State,
            key: None,
        }
    }

    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Assign id and timestamp, applying `options` over the draft's defaults.
    pub fn seal(self, options: EmitOptions, timestamp: u64) -> KernelEvent {
        KernelEvent {
            id: fresh_id(),
            event_type: self.event_type,
            payload: self.payload,
            lane: options.lane.unwrap_or(self.lane),
            authority_source: options.authority_source.unwrap_or_default(),
            timestamp,
            key: self.key,
        }
    }
}

/// Monotonic logical clock seeded from wall-clock milliseconds.
///
/// Successive ticks are strictly increasing even when the wall clock stalls or
/// steps backwards.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}
