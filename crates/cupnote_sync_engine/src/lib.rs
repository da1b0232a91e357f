//! # CupNote Sync Engine
//!
//! Local-first sync engine for the CupNote tasting journal.
//!
//! This crate provides:
//! - Sync orchestrator (idle → uploading → downloading → secondary → done)
//! - Local store and remote client abstractions, with in-memory versions
//! - A REST client for PostgREST-style backends
//! - Connectivity monitoring with reconnect-triggered sync
//! - Retry with exponential backoff
//! - Observable sync status
//!
//! ## Architecture
//!
//! Every write lands in the local store first and is visible immediately.
//! The engine later reconciles the store with the backend in passes:
//! 1. Upload unsynced tastings
//! 2. Download remote tastings, resolving conflicts last-write-wins
//! 3. Do the same for each secondary record type, then push cafe and
//!    roaster visit counters (best effort)
//!
//! ## Key Invariants
//!
//! - At most one pass runs at a time
//! - Uploads are idempotent (records are keyed by ID remotely)
//! - A record is marked synced only if it was not edited during its upload
//! - One failing record never stops the others
//! - Downloads follow the backend's write stamp, so late uploads are seen

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod http;
mod network;
mod remote;
mod retry;
mod state;
mod status;
mod store;

pub use config::{RetryCallback, RetryConfig, SyncConfig, DEFAULT_SYNC_INTERVAL};
pub use error::{StoreError, StoreResult, SyncError, SyncResult};
pub use http::{HttpClient, HttpRequest, HttpResponse, Method, RestRemote, TransportFailure};
pub use network::{
    CellularGeneration, ConnectionKind, NetworkMonitor, NetworkQuality, NetworkState,
    Subscription,
};
pub use remote::{Fault, MemoryRemote, RemoteClient};
pub use retry::RetryExecutor;
pub use state::{
    AutoSyncHandle, PassOutcome, PassReport, SyncEngine, SyncState, SyncStats, TypeReport,
};
pub use status::{StatusPublisher, StatusReceiver, SyncStatus};
pub use store::{LocalStore, MemoryStore, WriteTxn};
