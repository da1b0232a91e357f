//! Local datastore adapter.

use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use cupnote_sync_protocol::{
    RecordId, RecordType, RecordVersion, SyncRecord, Timestamp, VenueKind, VenueVisits,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// The sync engine's view of the on-device datastore.
///
/// Calls are synchronous: the datastore is embedded, so none of them
/// suspend. Every mutating call must run inside one write transaction of
/// the datastore so a crash never leaves a record half-updated.
pub trait LocalStore<T>: Send + Sync {
    /// Returns every record of this type whose latest version has not been
    /// mirrored remotely, soft-deleted ones included.
    fn get_unsynced(&self, record_type: RecordType) -> StoreResult<Vec<SyncRecord<T>>>;

    /// Marks uploaded versions as synced.
    ///
    /// A record is only marked if its stored `updated_at` still equals the
    /// acknowledged version; a newer local write keeps it unsynced.
    /// Returns the number of records marked.
    fn mark_synced(
        &self,
        record_type: RecordType,
        versions: &[RecordVersion],
        synced_at: Timestamp,
    ) -> StoreResult<usize>;

    /// Creates or replaces a record with a copy that won conflict
    /// resolution.
    ///
    /// Returns false, leaving the store untouched, if the stored copy has
    /// become newer than `record` in the meantime.
    fn upsert_from_remote(&self, record_type: RecordType, record: SyncRecord<T>)
        -> StoreResult<bool>;

    /// Looks a record up by ID, soft-deleted ones included.
    fn get_by_id(&self, record_type: RecordType, id: RecordId)
        -> StoreResult<Option<SyncRecord<T>>>;

    /// Counts unsynced records of this type.
    fn count_unsynced(&self, record_type: RecordType) -> StoreResult<usize> {
        Ok(self.get_unsynced(record_type)?.len())
    }

    /// Venue visits the backend has not counted yet.
    ///
    /// Stores that do not track venues keep the default.
    fn pending_venue_visits(&self) -> StoreResult<Vec<VenueVisits>> {
        Ok(Vec::new())
    }

    /// Records that the backend counted `count` visits of a venue.
    fn ack_venue_visits(&self, _kind: VenueKind, _name: &str, _count: u32) -> StoreResult<()> {
        Ok(())
    }
}

type Table<T> = BTreeMap<RecordId, SyncRecord<T>>;

#[derive(Debug, Clone)]
struct Tables<T> {
    by_type: HashMap<RecordType, Table<T>>,
    venues: BTreeMap<(VenueKind, String), u32>,
}

impl<T> Default for Tables<T> {
    fn default() -> Self {
        Self {
            by_type: HashMap::new(),
            venues: BTreeMap::new(),
        }
    }
}

/// A write transaction on a [`MemoryStore`].
///
/// Changes are staged and become visible only if the closure passed to
/// [`MemoryStore::write`] returns `Ok`.
pub struct WriteTxn<'a, T> {
    tables: &'a mut Tables<T>,
    failing: &'a HashSet<RecordId>,
}

impl<T> WriteTxn<'_, T> {
    /// Reads a record, soft-deleted ones included.
    pub fn get(&self, record_type: RecordType, id: RecordId) -> Option<&SyncRecord<T>> {
        self.tables.by_type.get(&record_type)?.get(&id)
    }

    /// Writes a record.
    pub fn put(&mut self, record_type: RecordType, record: SyncRecord<T>) -> StoreResult<()> {
        if self.failing.contains(&record.id) {
            return Err(StoreError::Backend(format!(
                "injected write failure for {}",
                record.id
            )));
        }
        self.tables
            .by_type
            .entry(record_type)
            .or_default()
            .insert(record.id, record);
        Ok(())
    }

    /// Adds `count` to a venue's pending visits. Negative counts
    /// acknowledge visits, never going below zero.
    pub fn add_venue_visits(&mut self, kind: VenueKind, name: &str, count: i64) {
        let pending = self.tables.venues.entry((kind, name.to_string())).or_insert(0);
        *pending = (i64::from(*pending) + count).clamp(0, i64::from(u32::MAX)) as u32;
        if *pending == 0 {
            self.tables.venues.remove(&(kind, name.to_string()));
        }
    }

    /// Removes a record permanently.
    pub fn remove(&mut self, record_type: RecordType, id: RecordId) -> Option<SyncRecord<T>> {
        self.tables.by_type.get_mut(&record_type)?.remove(&id)
    }
}

/// An in-memory datastore.
///
/// Suitable for tests and for hosts without persistent storage. All
/// mutations, from the UI surface and from the sync engine alike, go
/// through [`MemoryStore::write`].
#[derive(Debug)]
pub struct MemoryStore<T> {
    tables: RwLock<Tables<T>>,
    failing: RwLock<HashSet<RecordId>>,
}

impl<T: Clone> MemoryStore<T> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Runs `f` inside a write transaction.
    ///
    /// Either every change made by `f` is applied or, if it returns an
    /// error, none is.
    pub fn write<R>(&self, f: impl FnOnce(&mut WriteTxn<'_, T>) -> StoreResult<R>) -> StoreResult<R> {
        let mut tables = self.tables.write();
        let failing = self.failing.read();
        let mut staged = tables.clone();

        let out = f(&mut WriteTxn {
            tables: &mut staged,
            failing: &failing,
        })?;

        *tables = staged;
        Ok(out)
    }

    /// Creates a new record from a payload.
    pub fn create(&self, record_type: RecordType, payload: T) -> StoreResult<SyncRecord<T>> {
        let record = SyncRecord::new_at(payload, Utc::now());
        self.insert(record_type, record.clone())?;
        Ok(record)
    }

    /// Inserts a fully formed record.
    pub fn insert(&self, record_type: RecordType, record: SyncRecord<T>) -> StoreResult<()> {
        self.write(|txn| {
            if txn.get(record_type, record.id).is_some() {
                return Err(StoreError::Conflict {
                    record_type,
                    id: record.id,
                });
            }
            txn.put(record_type, record)
        })
    }

    /// Replaces a record's payload as a user edit.
    pub fn update(&self, record_type: RecordType, id: RecordId, payload: T) -> StoreResult<SyncRecord<T>> {
        self.mutate(record_type, id, |record, now| record.set_payload(payload, now))
    }

    /// Soft-deletes a record. It disappears from [`list`](Self::list) but
    /// keeps syncing until the backend has the deletion.
    pub fn soft_delete(&self, record_type: RecordType, id: RecordId) -> StoreResult<SyncRecord<T>> {
        self.mutate(record_type, id, |record, now| record.mark_deleted(now))
    }

    /// Removes a record permanently. Nothing is synced for it afterwards.
    pub fn hard_delete(&self, record_type: RecordType, id: RecordId) -> StoreResult<SyncRecord<T>> {
        self.write(|txn| {
            txn.remove(record_type, id)
                .ok_or(StoreError::NotFound { record_type, id })
        })
    }

    /// Reads a live record.
    pub fn get(&self, record_type: RecordType, id: RecordId) -> Option<SyncRecord<T>> {
        self.tables
            .read()
            .by_type
            .get(&record_type)?
            .get(&id)
            .filter(|r| r.is_live())
            .cloned()
    }

    /// Lists live records, oldest first.
    pub fn list(&self, record_type: RecordType) -> Vec<SyncRecord<T>> {
        let mut records: Vec<_> = self
            .all(record_type)
            .into_iter()
            .filter(|r| r.is_live())
            .collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }

    /// Number of stored records, soft-deleted ones included.
    pub fn len(&self, record_type: RecordType) -> usize {
        self.tables
            .read()
            .by_type
            .get(&record_type)
            .map_or(0, |t| t.len())
    }

    /// Returns true if no record of this type is stored.
    pub fn is_empty(&self, record_type: RecordType) -> bool {
        self.len(record_type) == 0
    }

    /// Records a visit to a cafe or roaster, to be counted by the backend
    /// on the next pass.
    pub fn record_venue_visit(&self, kind: VenueKind, name: &str) -> StoreResult<()> {
        self.write(|txn| {
            txn.add_venue_visits(kind, name, 1);
            Ok(())
        })
    }

    /// Visits of a venue not yet counted by the backend.
    pub fn pending_visits(&self, kind: VenueKind, name: &str) -> u32 {
        self.tables
            .read()
            .venues
            .get(&(kind, name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Makes every write touching `id` fail until cleared.
    pub fn fail_writes_for(&self, id: RecordId) {
        self.failing.write().insert(id);
    }

    /// Clears injected write failures.
    pub fn clear_failures(&self) {
        self.failing.write().clear();
    }

    fn all(&self, record_type: RecordType) -> Vec<SyncRecord<T>> {
        self.tables
            .read()
            .by_type
            .get(&record_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    fn mutate(
        &self,
        record_type: RecordType,
        id: RecordId,
        f: impl FnOnce(&mut SyncRecord<T>, Timestamp),
    ) -> StoreResult<SyncRecord<T>> {
        self.write(|txn| {
            let mut record = txn
                .get(record_type, id)
                .filter(|r| r.is_live())
                .cloned()
                .ok_or(StoreError::NotFound { record_type, id })?;
            f(&mut record, Utc::now());
            txn.put(record_type, record.clone())?;
            Ok(record)
        })
    }
}

impl<T: Clone> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> LocalStore<T> for MemoryStore<T> {
    fn get_unsynced(&self, record_type: RecordType) -> StoreResult<Vec<SyncRecord<T>>> {
        let mut records: Vec<_> = self
            .all(record_type)
            .into_iter()
            .filter(|r| !r.is_synced)
            .collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    fn mark_synced(
        &self,
        record_type: RecordType,
        versions: &[RecordVersion],
        synced_at: Timestamp,
    ) -> StoreResult<usize> {
        self.write(|txn| {
            let mut marked = 0;
            for version in versions {
                let Some(current) = txn.get(record_type, version.id) else {
                    continue;
                };
                if current.is_synced || current.updated_at != version.updated_at {
                    continue;
                }
                let mut record = current.clone();
                record.mark_synced(synced_at);
                txn.put(record_type, record)?;
                marked += 1;
            }
            Ok(marked)
        })
    }

    fn upsert_from_remote(
        &self,
        record_type: RecordType,
        record: SyncRecord<T>,
    ) -> StoreResult<bool> {
        self.write(|txn| {
            if let Some(current) = txn.get(record_type, record.id) {
                if current.updated_at > record.updated_at {
                    return Ok(false);
                }
            }
            txn.put(record_type, record)?;
            Ok(true)
        })
    }

    fn get_by_id(
        &self,
        record_type: RecordType,
        id: RecordId,
    ) -> StoreResult<Option<SyncRecord<T>>> {
        Ok(self
            .tables
            .read()
            .by_type
            .get(&record_type)
            .and_then(|t| t.get(&id))
            .cloned())
    }

    fn pending_venue_visits(&self) -> StoreResult<Vec<VenueVisits>> {
        Ok(self
            .tables
            .read()
            .venues
            .iter()
            .map(|((kind, name), pending)| VenueVisits {
                kind: *kind,
                name: name.clone(),
                pending: *pending,
            })
            .collect())
    }

    fn ack_venue_visits(&self, kind: VenueKind, name: &str, count: u32) -> StoreResult<()> {
        self.write(|txn| {
            txn.add_venue_visits(kind, name, -i64::from(count));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const TASTING: RecordType = RecordType::Tasting;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn create_list_and_get() {
        let store = MemoryStore::new();
        let a = store.create(TASTING, "kenya").unwrap();
        let b = store.create(TASTING, "ethiopia").unwrap();

        assert_eq!(store.list(TASTING).len(), 2);
        assert_eq!(store.get(TASTING, a.id).unwrap().payload, "kenya");
        assert_eq!(store.get_unsynced(TASTING).unwrap().len(), 2);
        assert!(store.list(RecordType::LearningProgress).is_empty());
        assert!(store.get(TASTING, b.id).is_some());
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let kept = store.create(TASTING, 1u32).unwrap();

        let result: StoreResult<()> = store.write(|txn| {
            txn.put(TASTING, SyncRecord::new_at(2, at(10)))?;
            txn.remove(TASTING, kept.id);
            Err(StoreError::Backend("crash".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.len(TASTING), 1);
        assert!(store.get(TASTING, kept.id).is_some());
    }

    #[test]
    fn update_touches_and_unsyncs() {
        let store = MemoryStore::new();
        let record = store.create(TASTING, "v1").unwrap();
        store
            .mark_synced(TASTING, &[record.version()], Utc::now())
            .unwrap();
        assert_eq!(store.count_unsynced(TASTING).unwrap(), 0);

        let updated = store.update(TASTING, record.id, "v2").unwrap();
        assert!(updated.updated_at > record.updated_at);
        assert!(!updated.is_synced);
        assert_eq!(store.count_unsynced(TASTING).unwrap(), 1);
    }

    #[test]
    fn soft_deleted_records_still_sync() {
        let store = MemoryStore::new();
        let record = store.create(TASTING, "gone").unwrap();
        store.soft_delete(TASTING, record.id).unwrap();

        assert!(store.list(TASTING).is_empty());
        assert!(store.get(TASTING, record.id).is_none());

        let unsynced = store.get_unsynced(TASTING).unwrap();
        assert_eq!(unsynced.len(), 1);
        assert!(unsynced[0].is_deleted);
        assert!(store.get_by_id(TASTING, record.id).unwrap().is_some());

        assert!(matches!(
            store.update(TASTING, record.id, "back"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn hard_delete_removes() {
        let store = MemoryStore::new();
        let record = store.create(TASTING, 1u8).unwrap();
        store.hard_delete(TASTING, record.id).unwrap();

        assert!(store.is_empty(TASTING));
        assert!(store.get_unsynced(TASTING).unwrap().is_empty());
        assert!(store.hard_delete(TASTING, record.id).is_err());
    }

    #[test]
    fn mark_synced_ignores_superseded_versions() {
        let store = MemoryStore::new();
        let record = SyncRecord::new_at("v1", at(100));
        store.insert(TASTING, record.clone()).unwrap();
        let uploaded = record.version();

        store.update(TASTING, record.id, "v2").unwrap();

        let marked = store.mark_synced(TASTING, &[uploaded], at(200)).unwrap();
        assert_eq!(marked, 0);
        assert!(!store.get_by_id(TASTING, record.id).unwrap().unwrap().is_synced);
    }

    #[test]
    fn upsert_from_remote_never_goes_backwards() {
        let store = MemoryStore::new();
        let local = SyncRecord::new_at("local", at(100));
        store.insert(TASTING, local.clone()).unwrap();

        let mut stale = local.clone();
        stale.payload = "stale";
        stale.updated_at = at(50);
        assert!(!store.upsert_from_remote(TASTING, stale).unwrap());

        let mut fresh = local.clone();
        fresh.payload = "fresh";
        fresh.updated_at = at(100) + Duration::seconds(1);
        fresh.mark_synced(at(150));
        assert!(store.upsert_from_remote(TASTING, fresh).unwrap());

        let stored = store.get_by_id(TASTING, local.id).unwrap().unwrap();
        assert_eq!(stored.payload, "fresh");
        assert!(stored.is_synced);
    }

    #[test]
    fn injected_failures_abort_writes() {
        let store = MemoryStore::new();
        let record = store.create(TASTING, "x").unwrap();
        store.fail_writes_for(record.id);

        let err = store
            .mark_synced(TASTING, &[record.version()], at(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.count_unsynced(TASTING).unwrap(), 1);

        store.clear_failures();
        assert_eq!(store.mark_synced(TASTING, &[record.version()], at(1)).unwrap(), 1);
    }

    #[test]
    fn duplicate_insert_conflicts() {
        let store = MemoryStore::new();
        let record = SyncRecord::new_at(1u8, at(1));
        store.insert(TASTING, record.clone()).unwrap();
        assert!(matches!(
            store.insert(TASTING, record),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn venue_visits_accumulate_until_acknowledged() {
        let store: MemoryStore<u8> = MemoryStore::new();
        store.record_venue_visit(VenueKind::Cafe, "Fritz").unwrap();
        store.record_venue_visit(VenueKind::Cafe, "Fritz").unwrap();
        store.record_venue_visit(VenueKind::Roaster, "Momos").unwrap();

        let pending = store.pending_venue_visits().unwrap();
        assert_eq!(
            pending,
            vec![
                VenueVisits {
                    kind: VenueKind::Cafe,
                    name: "Fritz".into(),
                    pending: 2,
                },
                VenueVisits {
                    kind: VenueKind::Roaster,
                    name: "Momos".into(),
                    pending: 1,
                },
            ]
        );

        store.ack_venue_visits(VenueKind::Cafe, "Fritz", 1).unwrap();
        assert_eq!(store.pending_visits(VenueKind::Cafe, "Fritz"), 1);

        store.ack_venue_visits(VenueKind::Roaster, "Momos", 5).unwrap();
        assert_eq!(store.pending_visits(VenueKind::Roaster, "Momos"), 0);
        assert_eq!(store.pending_venue_visits().unwrap().len(), 1);
    }
}
