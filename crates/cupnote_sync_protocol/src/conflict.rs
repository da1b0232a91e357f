//! Conflict detection and resolution.
//!
//! Resolution is last-write-wins on `updated_at` with ties going to the
//! remote copy, since that is the copy other devices observe first. There
//! is no field-level merge. A soft delete is an ordinary write: it wins
//! exactly when its timestamp wins.

use crate::record::{RecordId, RecordType, RemoteRecord, SyncRecord, Timestamp};

/// Decision for a record present both locally and remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the local copy with the remote one.
    AcceptRemote,
    /// Keep the local copy and (re-)upload it.
    KeepLocal,
}

/// A resolved conflict between a local and a remote copy of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Record type.
    pub record_type: RecordType,
    /// Record ID.
    pub id: RecordId,
    /// Local modification timestamp.
    pub local_updated_at: Timestamp,
    /// Remote modification timestamp.
    pub remote_updated_at: Timestamp,
    /// Whether the local copy is soft-deleted.
    pub local_deleted: bool,
    /// Whether the remote copy is soft-deleted.
    pub remote_deleted: bool,
    /// The decision.
    pub resolution: Resolution,
}

impl Conflict {
    /// Returns true if exactly one side is deleted.
    pub fn is_update_delete_conflict(&self) -> bool {
        self.local_deleted != self.remote_deleted
    }

    /// Returns true if both copies carry the same timestamp.
    pub fn is_tie(&self) -> bool {
        self.local_updated_at == self.remote_updated_at
    }

    /// Returns true if the resolution ends with the record deleted.
    pub fn deletion_wins(&self) -> bool {
        match self.resolution {
            Resolution::AcceptRemote => self.remote_deleted,
            Resolution::KeepLocal => self.local_deleted,
        }
    }
}

/// Last-write-wins resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Decides between two modification timestamps.
    pub fn resolve_timestamps(local: Timestamp, remote: Timestamp) -> Resolution {
        if local > remote {
            Resolution::KeepLocal
        } else {
            Resolution::AcceptRemote
        }
    }

    /// Decides between a local record and its remote row.
    pub fn resolve<T>(local: &SyncRecord<T>, remote: &RemoteRecord<T>) -> Resolution {
        Self::resolve_timestamps(local.updated_at, remote.updated_at)
    }

    /// Decides and returns the full conflict description.
    pub fn resolve_records<T>(
        record_type: RecordType,
        local: &SyncRecord<T>,
        remote: &RemoteRecord<T>,
    ) -> Conflict {
        Conflict {
            record_type,
            id: local.id,
            local_updated_at: local.updated_at,
            remote_updated_at: remote.updated_at,
            local_deleted: local.is_deleted,
            remote_deleted: remote.is_deleted,
            resolution: Self::resolve(local, remote),
        }
    }

    /// Applies a winning remote row onto the local record.
    ///
    /// `created_at` stays local; everything the remote row carries
    /// overwrites the local copy, which ends up synced.
    pub fn apply_remote<T>(local: &mut SyncRecord<T>, remote: RemoteRecord<T>, now: Timestamp) {
        local.payload = remote.payload;
        local.updated_at = remote.updated_at;
        local.is_deleted = remote.is_deleted;
        local.mark_synced(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn pair(local_secs: i64, remote_secs: i64) -> (SyncRecord<&'static str>, RemoteRecord<&'static str>) {
        let mut local = SyncRecord::new_at("local", at(0));
        local.updated_at = at(local_secs);
        let mut remote = RemoteRecord::from_local("u", &local);
        remote.payload = "remote";
        remote.updated_at = at(remote_secs);
        (local, remote)
    }

    #[test]
    fn newer_remote_wins() {
        let (local, remote) = pair(10, 20);
        assert_eq!(ConflictResolver::resolve(&local, &remote), Resolution::AcceptRemote);
    }

    #[test]
    fn newer_local_wins() {
        let (local, remote) = pair(30, 20);
        assert_eq!(ConflictResolver::resolve(&local, &remote), Resolution::KeepLocal);
    }

    #[test]
    fn tie_goes_to_remote() {
        let (local, remote) = pair(20, 20);
        let conflict = ConflictResolver::resolve_records(RecordType::Tasting, &local, &remote);
        assert!(conflict.is_tie());
        assert_eq!(conflict.resolution, Resolution::AcceptRemote);
    }

    #[test]
    fn newer_local_delete_wins() {
        let (mut local, remote) = pair(10, 20);
        local.mark_deleted(at(40));

        let conflict = ConflictResolver::resolve_records(RecordType::Tasting, &local, &remote);
        assert!(conflict.is_update_delete_conflict());
        assert_eq!(conflict.resolution, Resolution::KeepLocal);
        assert!(conflict.deletion_wins());
    }

    #[test]
    fn older_remote_delete_loses() {
        let (local, mut remote) = pair(50, 20);
        remote.is_deleted = true;

        let conflict = ConflictResolver::resolve_records(RecordType::Tasting, &local, &remote);
        assert_eq!(conflict.resolution, Resolution::KeepLocal);
        assert!(!conflict.deletion_wins());
    }

    #[test]
    fn apply_remote_overwrites_and_syncs() {
        let (mut local, mut remote) = pair(10, 20);
        remote.is_deleted = true;
        let created = local.created_at;

        ConflictResolver::apply_remote(&mut local, remote, at(99));

        assert_eq!(local.payload, "remote");
        assert_eq!(local.updated_at, at(20));
        assert!(local.is_deleted);
        assert!(local.is_synced);
        assert_eq!(local.synced_at, Some(at(99)));
        assert_eq!(local.created_at, created);
    }

    proptest! {
        #[test]
        fn larger_timestamp_always_wins(a in 0i64..4_000_000_000, b in 0i64..4_000_000_000) {
            prop_assume!(a != b);
            let winner = a.max(b);

            let pick = |local: i64, remote: i64| match ConflictResolver::resolve_timestamps(at(local), at(remote)) {
                Resolution::KeepLocal => local,
                Resolution::AcceptRemote => remote,
            };

            prop_assert_eq!(pick(a, b), winner);
            prop_assert_eq!(pick(b, a), winner);
        }

        #[test]
        fn ties_always_go_remote(t in 0i64..4_000_000_000) {
            prop_assert_eq!(
                ConflictResolver::resolve_timestamps(at(t), at(t)),
                Resolution::AcceptRemote
            );
        }
    }
}
