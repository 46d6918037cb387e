//! Kernel event synchronization.
//!
//! Units of work emit [`ksync_events::KernelEvent`]s through an [`EventKernel`].
//! Events emitted while a request runs are captured in that request's own queue
//! and reconciled when it completes; events emitted elsewhere go through a
//! bounded ingestion queue. The [`SyncManager`] orders each batch per key,
//! resolves authority conflicts, persists winners to the durable cache and
//! publishes them on the bus. [`ReactiveStore`]s hold observable state that
//! survives restarts.

pub mod capture;
mod config;
mod error;
pub mod kernel;
pub mod store;
pub mod sync;
pub mod tasks;

pub use config::{
    config_schema_json, load_config, parse_config, write_schema_file, BusConfig, Config,
    RuntimeConfig, StoreConfig, SyncConfig, DEFAULT_BATCH_MAX, DEFAULT_BUS_CAPACITY,
    DEFAULT_INGEST_CAPACITY, DEFAULT_STATE_STORE,
};
pub use error::KernelError;
pub use kernel::{Delivery, Emitted, EventKernel, KernelOptions};
pub use store::{PersistOptions, ReactiveStore, StoreFactory, Subscription};
pub use sync::{
    slot_id, Conflict, ConflictReason, DefaultKey, KeyExtractor, MergePayload, Projection,
    ReplacePayload, SyncManager, SyncResult, SyncedState,
};

pub use ksync_events::{AuthoritySource, EmitOptions, EventDraft, KernelEvent, Lane};
