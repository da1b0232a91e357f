//! # CupNote Sync Protocol
//!
//! Record types and conflict resolution for CupNote sync.
//!
//! This crate provides:
//! - `SyncRecord<T>`, the envelope every synchronizable entity travels in
//! - `RemoteRecord<T>`, the backend's row shape
//! - Domain payloads (tastings, achievement and learning progress, venue visits)
//! - Last-write-wins `ConflictResolver`
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod payload;
mod record;

pub use conflict::{Conflict, ConflictResolver, Resolution};
pub use payload::{
    AchievementProgress, FlavorNote, JournalPayload, LearningProgress, SensoryAttributes,
    TastingPayload, Temperature, VenueKind, VenueVisits,
};
pub use record::{
    storage_precision, RecordId, RecordType, RecordVersion, RemoteRecord, SyncRecord, Timestamp,
};
