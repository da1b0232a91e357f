//! Sync engine state machine.

use crate::config::SyncConfig;
use crate::error::{StoreResult, SyncError, SyncResult};
use crate::network::{NetworkMonitor, Subscription};
use crate::remote::RemoteClient;
use crate::retry::RetryExecutor;
use crate::status::{StatusPublisher, StatusReceiver, SyncStatus};
use crate::store::LocalStore;
use chrono::Utc;
use cupnote_sync_protocol::{
    Conflict, ConflictResolver, RecordId, RecordType, RemoteRecord, Resolution, SyncRecord,
    Timestamp,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How a finished pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every phase ran to completion.
    Success,
    /// The pass was aborted.
    Failed,
}

/// The current phase of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No pass has run yet.
    #[default]
    Idle,
    /// Pushing unsynced tastings.
    Uploading,
    /// Pulling remote tastings.
    Downloading,
    /// Uploading and downloading the secondary record types.
    SyncingSecondary,
    /// The last pass has finished.
    Done(PassOutcome),
}

impl SyncState {
    /// Returns true if a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Uploading | SyncState::Downloading | SyncState::SyncingSecondary
        )
    }

    /// Returns true if the engine can start a new pass.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Done(_))
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes that got past the concurrency guard.
    pub passes_started: u64,
    /// Passes that finished successfully.
    pub passes_completed: u64,
    /// Passes that were aborted.
    pub passes_failed: u64,
    /// Records uploaded, forced uploads and re-uploads included.
    pub records_uploaded: u64,
    /// Records created or updated from the backend.
    pub records_downloaded: u64,
    /// Uploads that failed and were left pending.
    pub upload_failures: u64,
    /// Conflicts resolved.
    pub conflicts: u64,
    /// Venue visits counted by the backend.
    pub venue_visits: u64,
    /// Retries performed by the retry executor.
    pub retries: u64,
    /// End of the last successful pass.
    pub last_sync_time: Option<Timestamp>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Per-type counters of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeReport {
    /// Record type.
    pub record_type: RecordType,
    /// Unsynced records uploaded.
    pub uploaded: usize,
    /// Unsynced records whose upload failed.
    pub upload_failures: usize,
    /// Records created or updated from remote rows.
    pub downloaded: usize,
    /// Records re-uploaded because the local copy won a conflict.
    pub re_uploaded: usize,
}

impl TypeReport {
    fn new(record_type: RecordType) -> Self {
        Self {
            record_type,
            uploaded: 0,
            upload_failures: 0,
            downloaded: 0,
            re_uploaded: 0,
        }
    }
}

/// Result of a sync pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    /// How the pass ended.
    pub outcome: PassOutcome,
    /// Why the pass failed.
    pub error: Option<String>,
    /// Counters for every record type the pass reached.
    pub types: Vec<TypeReport>,
    /// Conflicts that were resolved.
    pub conflicts: Vec<Conflict>,
    /// Venue visits counted by the backend.
    pub venue_visits: usize,
    /// Duration of the pass.
    pub duration: Duration,
}

impl PassReport {
    fn new() -> Self {
        Self {
            outcome: PassOutcome::Failed,
            error: None,
            types: Vec::new(),
            conflicts: Vec::new(),
            venue_visits: 0,
            duration: Duration::ZERO,
        }
    }

    /// Returns true if the pass completed.
    pub fn is_success(&self) -> bool {
        self.outcome == PassOutcome::Success
    }

    /// Counters for one record type.
    pub fn for_type(&self, record_type: RecordType) -> Option<&TypeReport> {
        self.types.iter().find(|t| t.record_type == record_type)
    }

    /// Unsynced records uploaded, across types.
    pub fn uploaded(&self) -> usize {
        self.types.iter().map(|t| t.uploaded).sum()
    }

    /// Failed uploads, across types.
    pub fn upload_failures(&self) -> usize {
        self.types.iter().map(|t| t.upload_failures).sum()
    }

    /// Records created or updated locally, across types.
    pub fn downloaded(&self) -> usize {
        self.types.iter().map(|t| t.downloaded).sum()
    }

    /// Conflict re-uploads, across types.
    pub fn re_uploaded(&self) -> usize {
        self.types.iter().map(|t| t.re_uploaded).sum()
    }

    fn type_mut(&mut self, record_type: RecordType) -> &mut TypeReport {
        let index = match self.types.iter().position(|t| t.record_type == record_type) {
            Some(index) => index,
            None => {
                self.types.push(TypeReport::new(record_type));
                self.types.len() - 1
            }
        };
        &mut self.types[index]
    }
}

/// Releases the single-pass guard when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl PassGuard<'_> {
    fn release(self) {
        drop(self);
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The sync engine reconciles the local store with the backend.
///
/// A pass uploads unsynced tastings, downloads remote tastings, then does
/// both for each secondary record type. At most one pass runs at a time;
/// triggers that arrive while one is running are dropped.
pub struct SyncEngine<S, R, T> {
    config: SyncConfig,
    store: Arc<S>,
    remote: Arc<R>,
    network: NetworkMonitor,
    retry: RetryExecutor,
    status: StatusPublisher,
    stats: RwLock<SyncStats>,
    syncing: AtomicBool,
    cursors: Mutex<HashMap<RecordType, Timestamp>>,
    _payload: PhantomData<fn() -> T>,
}

impl<S, R, T> SyncEngine<S, R, T>
where
    S: LocalStore<T> + 'static,
    R: RemoteClient<T> + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new sync engine.
    pub fn new(config: SyncConfig, store: Arc<S>, remote: Arc<R>, network: NetworkMonitor) -> Self {
        let retry = RetryExecutor::new(config.retry.clone(), network.clone())
            .with_quality_adaptation(config.adapt_to_quality);
        let status = StatusPublisher::new();
        let online = network.is_connected();
        status.update(|s| s.is_online = online);

        Self {
            config,
            store,
            remote,
            network,
            retry,
            status,
            stats: RwLock::new(SyncStats::default()),
            syncing: AtomicBool::new(false),
            cursors: Mutex::new(HashMap::new()),
            _payload: PhantomData,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the network monitor.
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Gets the current phase.
    pub fn state(&self) -> SyncState {
        self.status.status().phase
    }

    /// Gets a snapshot of the sync status.
    pub fn status(&self) -> SyncStatus {
        self.status.status()
    }

    /// Subscribes to status changes.
    pub fn subscribe_status(&self) -> StatusReceiver {
        self.status.subscribe()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        let mut stats = self.stats.read().clone();
        stats.retries = self.retry.retry_count();
        stats
    }

    /// Returns true while a pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Runs a full sync pass.
    ///
    /// Returns `None` without doing anything if sync is disabled or a pass
    /// is already running. Otherwise returns the report of the pass, which
    /// is also reflected in [`status`](Self::status).
    pub async fn sync_all(&self) -> Option<PassReport> {
        if !self.config.enabled {
            debug!("sync disabled, skipping pass");
            return None;
        }
        let Some(guard) = self.try_begin() else {
            debug!("pass already running, skipping");
            return None;
        };

        let start = Instant::now();
        self.stats.write().passes_started += 1;
        info!(user_id = %self.config.user_id, "sync pass started");

        let mut report = PassReport::new();
        let result = self.run_pass(&mut report).await;
        report.duration = start.elapsed();

        match result {
            Ok(()) => self.finish_success(&mut report, guard),
            Err(e) => self.finish_failure(&mut report, &e, guard),
        }

        Some(report)
    }

    /// Uploads one record right away, outside of any pass.
    ///
    /// Errors are returned to the caller; the record stays unsynced.
    pub async fn force_upload(&self, record_type: RecordType, id: RecordId) -> SyncResult<()> {
        if !self.config.enabled {
            return Err(SyncError::SyncDisabled);
        }

        let record = self
            .store
            .get_by_id(record_type, id)?
            .ok_or(SyncError::RecordNotFound { record_type, id })?;

        if !self.network.is_connected() {
            return Err(SyncError::NotConnected);
        }

        self.upload_record(record_type, &record).await?;
        self.stats.write().records_uploaded += 1;
        info!(record_type = %record_type, id = %id, "record force-uploaded");
        Ok(())
    }

    /// Starts syncing automatically on reconnect and, if configured, on a
    /// fixed interval.
    ///
    /// Automatic sync runs until the returned handle is stopped or dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start_auto_sync(self: &Arc<Self>) -> AutoSyncHandle {
        let runtime = tokio::runtime::Handle::current();

        let engine = Arc::downgrade(self);
        let spawner = runtime.clone();
        let subscription = self.network.subscribe(move |online| {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            engine.status.update(|s| s.is_online = online);

            if !online || !engine.config.auto_sync_on_reconnect {
                return;
            }
            if engine.is_syncing() {
                debug!("reconnected during a pass, not starting another");
                return;
            }

            info!("connectivity restored, starting sync");
            spawner.spawn(async move {
                engine.sync_all().await;
            });
        });

        let periodic = self.config.sync_interval.map(|interval| {
            let engine = Arc::downgrade(self);
            runtime.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick completes immediately.
                ticker.tick().await;

                loop {
                    ticker.tick().await;
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    if engine.network.is_connected() && !engine.is_syncing() {
                        debug!("periodic sync");
                        engine.sync_all().await;
                    }
                }
            })
        });

        AutoSyncHandle {
            subscription: Some(subscription),
            periodic,
        }
    }

    fn try_begin(&self) -> Option<PassGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard(&self.syncing))
    }

    fn set_phase(&self, phase: SyncState) {
        self.status.update(|s| s.phase = phase);
    }

    async fn run_pass(&self, report: &mut PassReport) -> SyncResult<()> {
        let online = self.network.is_connected();
        self.status.update(|s| {
            s.is_online = online;
            s.is_syncing = true;
        });
        if !online {
            return Err(SyncError::NotConnected);
        }

        let types = self.config.record_types();
        let pending = types
            .iter()
            .map(|t| self.store.count_unsynced(*t))
            .sum::<StoreResult<usize>>()?;
        self.status.update(|s| s.pending_uploads = pending);

        self.set_phase(SyncState::Uploading);
        self.upload_type(RecordType::Tasting, report).await?;

        self.set_phase(SyncState::Downloading);
        self.download_type(RecordType::Tasting, report).await?;

        let secondary: Vec<_> = types.into_iter().filter(|t| !t.is_primary()).collect();
        if !secondary.is_empty() || self.config.sync_venue_visits {
            self.set_phase(SyncState::SyncingSecondary);
            for record_type in secondary {
                self.upload_type(record_type, report).await?;
                self.download_type(record_type, report).await?;
            }
            if self.config.sync_venue_visits {
                self.push_venue_visits(report).await;
            }
        }

        Ok(())
    }

    /// Decides whether a per-record error ends the pass.
    ///
    /// Returns the error back when the pass can move on to the next record.
    fn check_abort(&self, error: SyncError) -> SyncResult<SyncError> {
        if error.is_phase_fatal() {
            return Err(error);
        }
        if !self.network.is_connected() {
            return Err(SyncError::NotConnected);
        }
        Ok(error)
    }

    async fn upload_type(&self, record_type: RecordType, report: &mut PassReport) -> SyncResult<()> {
        let records = self.store.get_unsynced(record_type)?;
        debug!(record_type = %record_type, count = records.len(), "uploading unsynced records");
        report.type_mut(record_type);

        for record in records {
            match self.upload_record(record_type, &record).await {
                Ok(()) => {
                    report.type_mut(record_type).uploaded += 1;
                    self.status
                        .update(|s| s.pending_uploads = s.pending_uploads.saturating_sub(1));
                }
                Err(e) => {
                    let e = self.check_abort(e)?;
                    warn!(
                        record_type = %record_type,
                        id = %record.id,
                        error = %e,
                        "upload failed, record stays pending"
                    );
                    report.type_mut(record_type).upload_failures += 1;
                }
            }
        }

        Ok(())
    }

    async fn upload_record(&self, record_type: RecordType, record: &SyncRecord<T>) -> SyncResult<()> {
        let row = RemoteRecord::from_local(self.config.user_id.clone(), record);
        self.retry
            .run(|| self.remote.upsert(record_type, row.clone()))
            .await?;

        let marked = self
            .store
            .mark_synced(record_type, &[record.version()], Utc::now())?;
        if marked == 0 {
            debug!(record_type = %record_type, id = %record.id, "record changed during upload, left pending");
        } else {
            debug!(record_type = %record_type, id = %record.id, "record uploaded");
        }
        Ok(())
    }

    /// Pulls rows changed on the backend since the type's cursor.
    ///
    /// The cursor follows the backend's own write stamps. It advances to
    /// the newest stamp applied here and stops at the first row that
    /// failed to apply, so that row is fetched again on the next pass.
    async fn download_type(&self, record_type: RecordType, report: &mut PassReport) -> SyncResult<()> {
        let since = self.cursors.lock().get(&record_type).copied();

        let rows = self
            .retry
            .run(|| self.remote.fetch_since(record_type, &self.config.user_id, since))
            .await?;
        debug!(record_type = %record_type, count = rows.len(), since = ?since, "fetched remote rows");

        let mut cursor = since;
        let mut held = false;
        for row in rows {
            let id = row.id;
            let stamp = row.modified_at;
            let applied = self.apply_remote_row(record_type, row, report).await;
            if !held {
                cursor = cursor.max(stamp);
            }
            if let Err(e) = applied {
                let e = self.check_abort(e)?;
                warn!(
                    record_type = %record_type,
                    id = %id,
                    error = %e,
                    "failed to apply remote row, will fetch it again"
                );
                held = true;
            }
        }

        if let Some(cursor) = cursor {
            self.cursors.lock().insert(record_type, cursor);
        }
        Ok(())
    }

    /// Pushes locally recorded cafe and roaster visits to the backend's
    /// counters. Best effort: failures are logged and never fail the pass.
    async fn push_venue_visits(&self, report: &mut PassReport) {
        let venues = match self.store.pending_venue_visits() {
            Ok(venues) => venues,
            Err(e) => {
                warn!(error = %e, "failed to read venue visits");
                return;
            }
        };

        for venue in venues {
            for _ in 0..venue.pending {
                let pushed = self
                    .retry
                    .run(|| {
                        self.remote
                            .increment_venue_visit(&self.config.user_id, venue.kind, &venue.name)
                    })
                    .await;

                if let Err(e) = pushed {
                    warn!(kind = ?venue.kind, venue = %venue.name, error = %e, "failed to push venue visit");
                    if e.is_phase_fatal() || !self.network.is_connected() {
                        return;
                    }
                    break;
                }
                report.venue_visits += 1;

                if let Err(e) = self.store.ack_venue_visits(venue.kind, &venue.name, 1) {
                    warn!(kind = ?venue.kind, venue = %venue.name, error = %e, "failed to acknowledge venue visit");
                    break;
                }
            }
        }

        if report.venue_visits > 0 {
            debug!(count = report.venue_visits, "venue visits pushed");
        }
    }

    async fn apply_remote_row(
        &self,
        record_type: RecordType,
        row: RemoteRecord<T>,
        report: &mut PassReport,
    ) -> SyncResult<()> {
        let now = Utc::now();
        let Some(mut local) = self.store.get_by_id(record_type, row.id)? else {
            let id = row.id;
            if self.store.upsert_from_remote(record_type, row.into_local(now))? {
                report.type_mut(record_type).downloaded += 1;
                debug!(record_type = %record_type, id = %id, "created record from remote");
            }
            return Ok(());
        };

        // Our own upload coming back.
        if local.is_synced && local.version() == row.version() {
            return Ok(());
        }

        let conflict = ConflictResolver::resolve_records(record_type, &local, &row);
        let contested = !local.is_synced || conflict.resolution == Resolution::KeepLocal;

        match conflict.resolution {
            Resolution::AcceptRemote => {
                ConflictResolver::apply_remote(&mut local, row, now);
                if self.store.upsert_from_remote(record_type, local)? {
                    report.type_mut(record_type).downloaded += 1;
                    debug!(record_type = %record_type, id = %conflict.id, "applied remote version");
                } else {
                    debug!(record_type = %record_type, id = %conflict.id, "local copy changed meanwhile, keeping it");
                }
            }
            Resolution::KeepLocal => {
                debug!(record_type = %record_type, id = %conflict.id, "local copy is newer, re-uploading");
                self.upload_record(record_type, &local).await?;
                report.type_mut(record_type).re_uploaded += 1;
            }
        }

        if contested {
            report.conflicts.push(conflict);
        }
        Ok(())
    }

    fn record_counts(&self, stats: &mut SyncStats, report: &PassReport) {
        stats.records_uploaded += (report.uploaded() + report.re_uploaded()) as u64;
        stats.records_downloaded += report.downloaded() as u64;
        stats.upload_failures += report.upload_failures() as u64;
        stats.conflicts += report.conflicts.len() as u64;
        stats.venue_visits += report.venue_visits as u64;
    }

    // The guard is released in the same status update that publishes
    // `Done`, so an observer of `Done` can start the next pass.
    fn finish_success(&self, report: &mut PassReport, guard: PassGuard<'_>) {
        let now = Utc::now();
        report.outcome = PassOutcome::Success;

        {
            let mut stats = self.stats.write();
            self.record_counts(&mut stats, report);
            stats.passes_completed += 1;
            stats.last_sync_time = Some(now);
            stats.last_error = None;
        }

        self.status.update(|s| {
            s.is_syncing = false;
            s.last_sync_time = Some(now);
            s.error = None;
            s.phase = SyncState::Done(PassOutcome::Success);
            guard.release();
        });

        info!(
            uploaded = report.uploaded(),
            upload_failures = report.upload_failures(),
            downloaded = report.downloaded(),
            re_uploaded = report.re_uploaded(),
            conflicts = report.conflicts.len(),
            venue_visits = report.venue_visits,
            duration_ms = report.duration.as_millis() as u64,
            "sync pass completed"
        );
    }

    fn finish_failure(&self, report: &mut PassReport, error: &SyncError, guard: PassGuard<'_>) {
        let message = error.to_string();
        report.outcome = PassOutcome::Failed;
        report.error = Some(message.clone());

        {
            let mut stats = self.stats.write();
            self.record_counts(&mut stats, report);
            stats.passes_failed += 1;
            stats.last_error = Some(message.clone());
        }

        self.status.update(|s| {
            s.is_syncing = false;
            s.error = Some(message);
            s.phase = SyncState::Done(PassOutcome::Failed);
            guard.release();
        });

        error!(error = %error, "sync pass failed");
    }
}

impl<S, R, T> std::fmt::Debug for SyncEngine<S, R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("network", &self.network)
            .field("status", &self.status.status())
            .field("syncing", &self.syncing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Keeps automatic sync running.
///
/// Stopping or dropping the handle unsubscribes from the network monitor
/// and aborts the periodic task. A pass already running is not cancelled.
#[derive(Debug)]
pub struct AutoSyncHandle {
    subscription: Option<Subscription>,
    periodic: Option<JoinHandle<()>>,
}

impl AutoSyncHandle {
    /// Stops automatic sync.
    pub fn stop(self) {
        drop(self);
    }

    /// Returns true if a periodic task was started.
    pub fn is_periodic(&self) -> bool {
        self.periodic.is_some()
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(periodic) = self.periodic.take() {
            periodic.abort();
        }
    }
}
