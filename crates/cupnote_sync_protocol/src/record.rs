//! Record envelope shared by every synchronizable entity.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Wall-clock timestamp used for every record clock.
pub type Timestamp = DateTime<Utc>;

/// Truncates a timestamp to microseconds, the finest precision the
/// backend stores. Versions must survive a round trip unchanged.
pub fn storage_precision(ts: Timestamp) -> Timestamp {
    ts.trunc_subsecs(6)
}

/// Unique identifier for a record.
///
/// Record IDs are v4 UUIDs that are:
/// - Generated on the device that creates the record
/// - Used as the idempotency key by the backend
/// - Never reused
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Creates a new random record ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a record ID from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of synchronizable record.
///
/// Tastings are the primary records; the others are secondary rows that
/// ride along in the last phase of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// A coffee tasting note.
    Tasting,
    /// Progress towards an achievement.
    AchievementProgress,
    /// Flavor-identification learning progress.
    LearningProgress,
}

impl RecordType {
    /// Every record type, primary first.
    pub const ALL: [RecordType; 3] = [
        RecordType::Tasting,
        RecordType::AchievementProgress,
        RecordType::LearningProgress,
    ];

    /// Secondary record types, in sync order.
    pub const SECONDARY: [RecordType; 2] =
        [RecordType::AchievementProgress, RecordType::LearningProgress];

    /// Returns the backend table holding rows of this type.
    pub fn table_name(&self) -> &'static str {
        match self {
            RecordType::Tasting => "tasting_records",
            RecordType::AchievementProgress => "user_achievements",
            RecordType::LearningProgress => "flavor_learning_progress",
        }
    }

    /// Returns true for the primary record type.
    pub fn is_primary(&self) -> bool {
        matches!(self, RecordType::Tasting)
    }

    /// Returns a short stable name, used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Tasting => "tasting",
            RecordType::AchievementProgress => "achievement_progress",
            RecordType::LearningProgress => "learning_progress",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The version of a record that was uploaded: its ID plus the
/// `updated_at` it carried at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordVersion {
    /// Record ID.
    pub id: RecordId,
    /// Modification timestamp of the uploaded copy.
    pub updated_at: Timestamp,
}

/// A synchronizable record: a fixed sync header around an opaque payload.
///
/// The sync engine reads only the header. `updated_at` is the sole
/// signal used for conflict resolution and never moves backwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord<T> {
    /// Stable identifier.
    pub id: RecordId,
    /// Domain fields.
    pub payload: T,
    /// Creation timestamp (immutable).
    pub created_at: Timestamp,
    /// Last modification timestamp.
    pub updated_at: Timestamp,
    /// True once this version has been mirrored to the backend.
    pub is_synced: bool,
    /// Soft-delete marker.
    pub is_deleted: bool,
    /// Time of the last successful synchronization.
    pub synced_at: Option<Timestamp>,
}

impl<T> SyncRecord<T> {
    /// Creates a fresh, unsynced record with a new ID.
    pub fn new(payload: T) -> Self {
        Self::new_at(payload, Utc::now())
    }

    /// Creates a fresh, unsynced record with a new ID at the given time.
    pub fn new_at(payload: T, now: Timestamp) -> Self {
        Self::with_id(RecordId::new(), payload, now)
    }

    /// Creates an unsynced record with an explicit ID.
    pub fn with_id(id: RecordId, payload: T, now: Timestamp) -> Self {
        let now = storage_precision(now);
        Self {
            id,
            payload,
            created_at: now,
            updated_at: now,
            is_synced: false,
            is_deleted: false,
            synced_at: None,
        }
    }

    /// Records a local mutation.
    ///
    /// `updated_at` strictly advances even if the wall clock did not, so an
    /// acknowledgement for the previous version can never match this one.
    pub fn touch(&mut self, now: Timestamp) {
        let now = storage_precision(now);
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::milliseconds(1)
        };
        self.is_synced = false;
    }

    /// Replaces the payload as a local mutation.
    pub fn set_payload(&mut self, payload: T, now: Timestamp) {
        self.payload = payload;
        self.touch(now);
    }

    /// Soft-deletes the record as a local mutation.
    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.is_deleted = true;
        self.touch(now);
    }

    /// Marks the current version as mirrored remotely.
    pub fn mark_synced(&mut self, at: Timestamp) {
        self.is_synced = true;
        self.synced_at = Some(at);
    }

    /// Returns the version pair used to acknowledge an upload.
    pub fn version(&self) -> RecordVersion {
        RecordVersion {
            id: self.id,
            updated_at: self.updated_at,
        }
    }

    /// Returns true unless the record is soft-deleted.
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }
}

/// A record as stored by the backend.
///
/// The local ID doubles as the remote primary key; there is no separate
/// server-side identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord<T> {
    /// Record ID (remote primary key).
    pub id: RecordId,
    /// Owner of the row.
    pub user_id: String,
    /// Domain fields.
    pub payload: T,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Last modification timestamp.
    pub updated_at: Timestamp,
    /// Soft-delete marker.
    #[serde(default)]
    pub is_deleted: bool,
    /// Stamped by the backend each time it writes the row, from its own
    /// clock. Devices never set it; download cursors follow it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<Timestamp>,
}

impl<T: Clone> RemoteRecord<T> {
    /// Builds the remote row for a local record.
    pub fn from_local(user_id: impl Into<String>, record: &SyncRecord<T>) -> Self {
        Self {
            id: record.id,
            user_id: user_id.into(),
            payload: record.payload.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            is_deleted: record.is_deleted,
            modified_at: None,
        }
    }
}

impl<T> RemoteRecord<T> {
    /// Converts the row into a local record that is already in sync.
    pub fn into_local(self, synced_at: Timestamp) -> SyncRecord<T> {
        SyncRecord {
            id: self.id,
            payload: self.payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
            is_synced: true,
            is_deleted: self.is_deleted,
            synced_at: Some(synced_at),
        }
    }

    /// Returns the version pair of this row.
    pub fn version(&self) -> RecordVersion {
        RecordVersion {
            id: self.id,
            updated_at: self.updated_at,
        }
    }
}
