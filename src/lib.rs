//! fieldsync: a local-first, multi-collection synchronization engine with
//! an embedded binary attachment store.
//!
//! Every write commits to the local cache synchronously, so the caller sees
//! its own change immediately, then replicates to the remote mirror
//! best-effort in the background:
//!
//! ```text
//!   caller ──▶ WriteCoordinator ──▶ LocalCache (sync, authoritative read)
//!                     │
//!                     └──▶ RemoteMirror (async, fire-and-forget)
//!                               │
//!                               ▼ change notifications
//!                        SyncCoordinator ──▶ LocalCache + ObserverRegistry
//!                        (other clients' writes flow in here)
//! ```
//!
//! The engine keeps working without a remote: when no mirror is configured
//! or the connection fails at startup, reads and writes stay local and every
//! remote call is a logged no-op.
//!
//! # Components
//!
//! - [`engine::SyncEngine`]: owning facade and lifecycle.
//! - [`cache::LocalCache`]: in-process key → JSON store with optional
//!   snapshot persistence.
//! - [`writer::WriteCoordinator`]: two-phase writes, a local commit plus a
//!   [`writer::Replication`] handle for the background push.
//! - [`sync::SyncCoordinator`]: subscribes to remote changes, applies
//!   non-null snapshots, and fans them out to observers.
//! - [`remote::RemoteMirror`]: the mirror trait, with Redis and in-memory
//!   implementations.
//! - [`blob::BlobStore`]: SQLite-backed attachments addressed by id,
//!   category, and related record.
//! - [`presence::PresenceCoordinator`]: online markers with disconnect
//!   hooks and a last-seen staleness heuristic.
//! - [`assist::TextAssist`]: optional text-assistance seam with graceful
//!   degradation.

pub mod assist;
pub mod blob;
pub mod cache;
pub mod config;
pub mod engine;
pub mod presence;
pub mod record;
pub mod remote;
pub mod sync;
pub mod writer;

pub use assist::{
    assess_or_default, improve_or_original, AssistError, NoAssist, RiskAssessment, RiskLevel,
    TextAssist,
};
pub use blob::{BlobError, BlobRecord, BlobStore};
pub use cache::{CacheError, LocalCache};
pub use config::SyncConfig;
pub use engine::{EngineError, EngineState, SyncEngine};
pub use presence::{PresenceCoordinator, PresenceMarker};
pub use record::{generate_id, now_timestamp, stamp_new_record, UserIdentity};
pub use remote::{InMemoryMirror, RedisMirror, RemoteError, RemoteMirror, Snapshots};
pub use sync::{ObserverRegistry, SyncCoordinator, SyncUpdate};
pub use writer::{Replication, WriteCoordinator};
