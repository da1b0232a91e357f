//! Remote backend abstraction.
//!
//! The remote client is responsible for moving records between the device
//! and the backend. It doesn't know anything about local storage or
//! conflict resolution; it just performs row operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::Utc;
use cupnote_sync_protocol::{
    storage_precision, RecordId, RecordType, RemoteRecord, Timestamp, VenueKind,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Row operations against the backend.
#[async_trait]
pub trait RemoteClient<T: Send + 'static>: Send + Sync {
    /// Creates or replaces the row with the record's ID.
    ///
    /// Idempotent: uploading the same row twice leaves one row.
    async fn upsert(
        &self,
        record_type: RecordType,
        record: RemoteRecord<T>,
    ) -> SyncResult<RemoteRecord<T>>;

    /// Returns the rows of `user_id` whose backend stamp
    /// ([`RemoteRecord::modified_at`]) is at or after `since`, oldest
    /// stamp first, or all of that user's rows when `since` is `None`.
    async fn fetch_since(
        &self,
        record_type: RecordType,
        user_id: &str,
        since: Option<Timestamp>,
    ) -> SyncResult<Vec<RemoteRecord<T>>>;

    /// Adds one visit to the user's counter for a cafe or roaster.
    async fn increment_venue_visit(
        &self,
        user_id: &str,
        kind: VenueKind,
        name: &str,
    ) -> SyncResult<()>;
}

/// A scripted remote failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Connection-level failure.
    Network,
    /// The call exceeded its deadline.
    Timeout,
    /// The backend answered with this HTTP status.
    Status(u16),
}

impl Fault {
    fn to_error(&self) -> SyncError {
        match self {
            Fault::Network => SyncError::Network("connection reset by peer".into()),
            Fault::Timeout => SyncError::Timeout(Duration::from_secs(60)),
            Fault::Status(status) => SyncError::from_status(*status, "injected failure"),
        }
    }
}

type Table<T> = BTreeMap<RecordId, RemoteRecord<T>>;

type VenueKey = (String, VenueKind, String);

/// An in-memory backend for testing.
///
/// Rows are kept per record type and keyed by ID, so upserts are
/// idempotent the same way the real backend's are. Every write stamps
/// `modified_at` from a strictly increasing clock. Failures can be
/// scripted per record or for the next N calls, and a gate can hold
/// calls in flight.
pub struct MemoryRemote<T> {
    tables: RwLock<HashMap<RecordType, Table<T>>>,
    last_stamp: Mutex<Option<Timestamp>>,
    venues: Mutex<HashMap<VenueKey, u32>>,
    upserts_by_id: Mutex<HashMap<RecordId, u32>>,
    upsert_calls: AtomicU64,
    fetch_calls: AtomicU64,
    failing_ids: Mutex<HashMap<RecordId, Fault>>,
    venue_fault: Mutex<Option<Fault>>,
    next_faults: Mutex<VecDeque<Fault>>,
    latency: RwLock<Duration>,
    closed: watch::Sender<bool>,
    in_flight: AtomicUsize,
}

impl<T: Clone> MemoryRemote<T> {
    /// Creates an empty backend.
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            tables: RwLock::new(HashMap::new()),
            last_stamp: Mutex::new(None),
            venues: Mutex::new(HashMap::new()),
            upserts_by_id: Mutex::new(HashMap::new()),
            upsert_calls: AtomicU64::new(0),
            fetch_calls: AtomicU64::new(0),
            failing_ids: Mutex::new(HashMap::new()),
            venue_fault: Mutex::new(None),
            next_faults: Mutex::new(VecDeque::new()),
            latency: RwLock::new(Duration::ZERO),
            closed,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Writes a row directly, as another device would, and returns it
    /// as stored.
    pub fn put_row(&self, record_type: RecordType, mut row: RemoteRecord<T>) -> RemoteRecord<T> {
        let mut tables = self.tables.write();
        row.modified_at = Some(self.stamp());
        tables.entry(record_type).or_default().insert(row.id, row.clone());
        row
    }

    /// Visits the backend has counted for one venue of a user.
    pub fn venue_visits(&self, user_id: &str, kind: VenueKind, name: &str) -> u32 {
        self.venues
            .lock()
            .get(&(user_id.to_string(), kind, name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn stamp(&self) -> Timestamp {
        let mut last = self.last_stamp.lock();
        let now = storage_precision(Utc::now());
        let next = match *last {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }

    /// Reads a row.
    pub fn row(&self, record_type: RecordType, id: RecordId) -> Option<RemoteRecord<T>> {
        self.tables.read().get(&record_type)?.get(&id).cloned()
    }

    /// Returns every row of a type.
    pub fn rows(&self, record_type: RecordType) -> Vec<RemoteRecord<T>> {
        self.tables
            .read()
            .get(&record_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of successful upserts of one record.
    pub fn upsert_count(&self, id: RecordId) -> u32 {
        self.upserts_by_id.lock().get(&id).copied().unwrap_or(0)
    }

    /// Total upsert calls, failed ones included.
    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Total fetch calls, failed ones included.
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Makes every upsert of `id` fail until cleared.
    pub fn fail_upserts_for(&self, id: RecordId, fault: Fault) {
        self.failing_ids.lock().insert(id, fault);
    }

    /// Makes every venue visit call fail until cleared.
    pub fn fail_venue_visits(&self, fault: Fault) {
        *self.venue_fault.lock() = Some(fault);
    }

    /// Makes the next `count` calls fail, whatever they are.
    pub fn fail_next(&self, count: usize, fault: Fault) {
        self.next_faults
            .lock()
            .extend(std::iter::repeat(fault).take(count));
    }

    /// Clears every scripted failure.
    pub fn clear_faults(&self) {
        self.failing_ids.lock().clear();
        *self.venue_fault.lock() = None;
        self.next_faults.lock().clear();
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Holds every call until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.closed.send_replace(true);
    }

    /// Releases held calls.
    pub fn open_gate(&self) {
        self.closed.send_replace(false);
    }

    /// Calls currently in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> SyncResult<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut closed = self.closed.subscribe();
        // The sender lives as long as self.
        let _ = closed.wait_for(|closed| !*closed).await;

        match self.next_faults.lock().pop_front() {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }
}

impl<T: Clone> Default for MemoryRemote<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for MemoryRemote<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("upsert_calls", &self.upsert_calls.load(Ordering::SeqCst))
            .field("fetch_calls", &self.fetch_calls.load(Ordering::SeqCst))
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Decrements the in-flight counter when a call ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> RemoteClient<T> for MemoryRemote<T> {
    async fn upsert(
        &self,
        record_type: RecordType,
        record: RemoteRecord<T>,
    ) -> SyncResult<RemoteRecord<T>> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.in_flight);
        self.enter().await?;

        if let Some(fault) = self.failing_ids.lock().get(&record.id) {
            return Err(fault.to_error());
        }

        *self.upserts_by_id.lock().entry(record.id).or_insert(0) += 1;
        Ok(self.put_row(record_type, record))
    }

    async fn fetch_since(
        &self,
        record_type: RecordType,
        user_id: &str,
        since: Option<Timestamp>,
    ) -> SyncResult<Vec<RemoteRecord<T>>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.in_flight);
        self.enter().await?;

        let mut rows: Vec<_> = self
            .rows(record_type)
            .into_iter()
            .filter(|row| row.user_id == user_id)
            .filter(|row| since.map_or(true, |since| row.modified_at >= Some(since)))
            .collect();
        rows.sort_by_key(|row| (row.modified_at, row.id));
        Ok(rows)
    }

    async fn increment_venue_visit(
        &self,
        user_id: &str,
        kind: VenueKind,
        name: &str,
    ) -> SyncResult<()> {
        let _in_flight = InFlight::enter(&self.in_flight);
        self.enter().await?;

        if let Some(fault) = &*self.venue_fault.lock() {
            return Err(fault.to_error());
        }

        *self
            .venues
            .lock()
            .entry((user_id.to_string(), kind, name.to_string()))
            .or_insert(0) += 1;
        Ok(())
    }
}
