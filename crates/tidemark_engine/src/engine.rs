//! Sync engine: one cycle of download, apply, collect, upload, commit.

use crate::clock::{Clock, SystemClock};
use crate::codec::EntityCodec;
use crate::config::{ConflictPolicy, SyncConfig, UploadPolicy};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::state::{
    DownloadConflict, SyncCycleResult, SyncState, SyncStats, UploadFailure, UploadStage,
};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tidemark_protocol::{Clause, PageCursor, QueryParams, ID_FIELD, MODIFIED_FIELD};
use tidemark_store::{LocalStore, LocalTransaction, RowKey, StoreError, WatermarkStore};
use tracing::{debug, info, warn};

/// The two values fixed for the whole cycle once downloads are in hand.
#[derive(Debug, Clone, Copy)]
struct CycleSnapshot {
    /// Watermark read at cycle start.
    last_sync: i64,
    /// Wall-clock time stamped on uploaded rows and committed as the new
    /// watermark.
    cycle_time: i64,
}

/// A decoded object together with the remote bookkeeping the engine needs.
struct Downloaded<E> {
    remote_id: String,
    remote_modified_at: i64,
    entity: E,
}

/// Marks the engine failed if a cycle or a retry wait ends without reaching
/// a resting state, including when the owning future is dropped.
struct ActiveCycle<'a> {
    state: &'a RwLock<SyncState>,
}

impl Drop for ActiveCycle<'_> {
    fn drop(&mut self) {
        let mut state = self.state.write();
        if state.is_active() || *state == SyncState::RetryWait {
            *state = SyncState::Failed;
        }
    }
}

/// Synchronizes one entity type between a local store and a remote
/// collection.
///
/// The engine is generic over its four collaborators and never inspects
/// entity contents; it only moves entities through the [`EntityCodec`].
/// At most one cycle runs at a time; triggering a cycle while another is
/// active returns [`SyncError::InvalidStateTransition`].
pub struct SyncEngine<C, L, R, W>
where
    C: EntityCodec,
    L: LocalStore,
    R: RemoteStore,
    W: WatermarkStore,
{
    config: SyncConfig,
    codec: C,
    local: Arc<L>,
    remote: Arc<R>,
    watermark: Arc<W>,
    clock: Arc<dyn Clock>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl<C, L, R, W> SyncEngine<C, L, R, W>
where
    C: EntityCodec,
    L: LocalStore,
    R: RemoteStore,
    W: WatermarkStore,
{
    /// Creates a new sync engine using the system clock.
    pub fn new(
        config: SyncConfig,
        codec: C,
        local: Arc<L>,
        remote: Arc<R>,
        watermark: Arc<W>,
    ) -> Self {
        Self {
            config,
            codec,
            local,
            remote,
            watermark,
            clock: Arc::new(SystemClock),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Replaces the clock that supplies each cycle's timestamp.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the entity codec.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Requests cancellation of the running cycle.
    ///
    /// Takes effect at the next phase boundary. Before applying downloads or
    /// before uploading, the cycle returns [`SyncError::Cancelled`]. Once
    /// every started upload has completed, the cycle returns its result with
    /// `cancelled` set and the watermark uncommitted. A request made while
    /// no cycle runs is discarded by the next trigger.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn transition(&self, from: SyncState, to: SyncState) -> SyncResult<()> {
        let mut state = self.state.write();
        if *state != from {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: format!("{to:?}"),
            });
        }
        *state = to;
        Ok(())
    }

    /// Runs one full sync cycle.
    ///
    /// Returns `Err` if a phase failed; the watermark is then unchanged.
    /// Returns `Ok` once the Upload phase ran. Per-entity upload failures
    /// and a late cancellation are reported in the result, and the watermark
    /// is committed only when neither happened (`result.success`).
    pub async fn sync(&self) -> SyncResult<SyncCycleResult<C::Entity>> {
        self.run_cycle(false).await
    }

    /// Runs sync cycles until one completes or fails with a non-retryable
    /// error, backing off between attempts.
    ///
    /// The engine stays in [`SyncState::RetryWait`] between attempts, and
    /// other triggers are rejected until the loop finishes.
    pub async fn sync_with_retry(&self) -> SyncResult<SyncCycleResult<C::Entity>> {
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            // Held until the resumed cycle has left `RetryWait`
            let _waiting = if attempt > 0 {
                self.transition(SyncState::Failed, SyncState::RetryWait)?;
                let guard = ActiveCycle { state: &self.state };
                let delay = retry.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "waiting before retrying sync cycle");
                tokio::time::sleep(delay).await;
                self.stats.write().retries += 1;

                if let Err(e) = self.check_cancelled() {
                    self.set_state(SyncState::Failed);
                    return Err(e);
                }
                Some(guard)
            } else {
                None
            };

            match self.run_cycle(attempt > 0).await {
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    warn!(attempt, error = %e, "sync cycle failed, will retry");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Starts a cycle from `Idle` or `Failed`, or from `RetryWait` when
    /// `resume` is set. A fresh start discards stale cancel requests; a
    /// rejected trigger leaves the running cycle's request in place.
    async fn run_cycle(&self, resume: bool) -> SyncResult<SyncCycleResult<C::Entity>> {
        {
            let mut state = self.state.write();
            let startable =
                state.can_start_sync() || (resume && *state == SyncState::RetryWait);
            if !startable {
                return Err(SyncError::InvalidStateTransition {
                    from: format!("{:?}", *state),
                    to: format!("{:?}", SyncState::Downloading),
                });
            }
            *state = SyncState::Downloading;
            if !resume {
                self.cancelled.store(false, Ordering::SeqCst);
            }
        }
        let _active = ActiveCycle { state: &self.state };

        match self.execute(Instant::now()).await {
            Ok(result) => {
                self.record(&result);
                self.set_state(if result.success {
                    SyncState::Idle
                } else {
                    SyncState::Failed
                });
                Ok(result)
            }
            Err(e) => {
                warn!(scope = %self.config.scope, error = %e, "sync cycle failed");
                {
                    let mut stats = self.stats.write();
                    stats.cycles_failed += 1;
                    stats.last_error = Some(e.to_string());
                }
                self.set_state(SyncState::Failed);
                Err(e)
            }
        }
    }

    async fn execute(&self, start: Instant) -> SyncResult<SyncCycleResult<C::Entity>> {
        let mut result = SyncCycleResult::new();
        info!(
            scope = %self.config.scope,
            collection = %self.config.collection,
            "sync cycle starting"
        );

        let downloaded = self.download().await?;
        result.downloaded = downloaded.len();
        self.check_cancelled()?;

        self.set_state(SyncState::Applying);
        let snapshot = CycleSnapshot {
            last_sync: self.watermark.get(&self.config.scope)?,
            cycle_time: self.clock.now_millis(),
        };
        let (applied, conflicts) = self.apply_downloads(&snapshot, downloaded)?;
        result.applied = applied;
        result.conflicts = conflicts;

        self.set_state(SyncState::Collecting);
        let changed = self.collect_local_changes(&snapshot)?;
        self.check_cancelled()?;

        self.set_state(SyncState::Uploading);
        self.upload(changed, &snapshot, &mut result).await;
        result.duration = start.elapsed();

        if !result.failures.is_empty() {
            warn!(
                scope = %self.config.scope,
                failed = result.failures.len(),
                skipped = result.skipped.len(),
                "uploads failed, watermark not committed"
            );
            return Ok(result);
        }
        if self.is_cancelled() {
            warn!(
                scope = %self.config.scope,
                uploaded = result.uploaded.len(),
                "sync cancelled after upload, watermark not committed"
            );
            result.cancelled = true;
            return Ok(result);
        }

        self.set_state(SyncState::Committing);
        self.watermark.set(&self.config.scope, snapshot.cycle_time)?;
        result.watermark = Some(snapshot.cycle_time);
        result.success = true;
        result.duration = start.elapsed();

        info!(
            scope = %self.config.scope,
            downloaded = result.downloaded,
            applied = result.applied,
            uploaded = result.uploaded.len(),
            watermark = snapshot.cycle_time,
            "sync cycle complete"
        );
        Ok(result)
    }

    /// Bounds a remote call by the configured timeout.
    async fn remote_call<T>(&self, call: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::time::timeout(self.config.timeout, call)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    /// Fetches every page of objects modified after the biggest remote time
    /// already stored locally.
    async fn download(&self) -> SyncResult<Vec<Downloaded<C::Entity>>> {
        let since = self.local.biggest_remote_time()?;
        let newer = Clause::greater_than(MODIFIED_FIELD, since);
        let clause = match &self.config.base_clause {
            Some(base) => Clause::and(base.clone(), newer),
            None => newer,
        };
        let mut params = QueryParams::new(clause).sort_by_asc(MODIFIED_FIELD);
        if let Some(size) = self.config.page_size {
            params = params.with_page_size(size);
        }

        let mut batch = Vec::new();
        let mut cursor: Option<PageCursor> = None;
        let mut latest = i64::MIN;
        let mut pages = 0usize;

        loop {
            let page = self
                .remote_call(
                    self.remote
                        .query(&self.config.collection, &params, cursor.as_ref()),
                )
                .await?;
            pages += 1;
            debug!(page = pages, objects = page.objects.len(), "received page");

            for object in &page.objects {
                let (Some(remote_id), Some(modified_at)) = (object.id.clone(), object.modified_at)
                else {
                    return Err(SyncError::Protocol(format!(
                        "downloaded object is missing {ID_FIELD} or {MODIFIED_FIELD}"
                    )));
                };
                if modified_at < latest {
                    return Err(SyncError::Protocol(format!(
                        "object {remote_id} modified at {modified_at} arrived after {latest}"
                    )));
                }
                latest = modified_at;

                batch.push(Downloaded {
                    remote_id,
                    remote_modified_at: modified_at,
                    entity: self.codec.from_remote(object)?,
                });
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(since, pages, objects = batch.len(), "download complete");
        Ok(batch)
    }

    /// Writes the downloaded batch in one transaction. Any entity that can be
    /// neither updated nor inserted rolls back the whole batch.
    fn apply_downloads(
        &self,
        snapshot: &CycleSnapshot,
        batch: Vec<Downloaded<C::Entity>>,
    ) -> SyncResult<(usize, Vec<DownloadConflict>)> {
        if batch.is_empty() {
            return Ok((0, Vec::new()));
        }

        let policy = self.config.conflict_policy;
        let (applied, conflicts) = self.local.transaction(|txn| {
            let mut applied = 0usize;
            let mut conflicts = Vec::new();

            for item in &batch {
                let key = RowKey::Remote(&item.remote_id);

                if policy != ConflictPolicy::ServerWins {
                    if let Some(local_modified_at) = txn.modified_at(key)? {
                        let unsynced = local_modified_at > snapshot.last_sync;
                        let keep_local = match policy {
                            ConflictPolicy::ClientWins => unsynced,
                            ConflictPolicy::LastWriteWins => {
                                unsynced && local_modified_at > item.remote_modified_at
                            }
                            ConflictPolicy::ServerWins => false,
                        };
                        if keep_local {
                            warn!(
                                remote_id = %item.remote_id,
                                local_modified_at,
                                remote_modified_at = item.remote_modified_at,
                                "keeping local edit over downloaded object"
                            );
                            conflicts.push(DownloadConflict {
                                remote_id: item.remote_id.clone(),
                                local_modified_at,
                                remote_modified_at: item.remote_modified_at,
                            });
                            continue;
                        }
                    }
                }

                // Stamped with the watermark, not the cycle time, so the row
                // is not collected as a local change in this cycle.
                let record = self.codec.to_record(&item.entity, snapshot.last_sync);

                let matched = txn.update(key, &record).map_err(|e| {
                    if e.is_constraint() {
                        SyncError::StorageConflict {
                            remote_id: Some(item.remote_id.clone()),
                            reason: e.to_string(),
                        }
                    } else {
                        SyncError::Store(e)
                    }
                })?;

                if matched == 0 && txn.insert(&record)?.is_none() {
                    return Err(SyncError::StorageConflict {
                        remote_id: Some(item.remote_id.clone()),
                        reason: "row matched neither update nor insert".into(),
                    });
                }
                applied += 1;
            }

            Ok::<_, SyncError>((applied, conflicts))
        })?;

        debug!(applied, conflicts = conflicts.len(), "downloads applied");
        Ok((applied, conflicts))
    }

    fn collect_local_changes(&self, snapshot: &CycleSnapshot) -> SyncResult<Vec<C::Entity>> {
        let rows = self
            .local
            .modified_since(snapshot.last_sync)
            .map_err(SyncError::StorageQuery)?;
        debug!(since = snapshot.last_sync, changed = rows.len(), "collected local changes");

        rows.iter().map(|row| self.codec.from_record(row)).collect()
    }

    /// Uploads every collected entity with at most `upload_concurrency`
    /// requests in flight, recording each outcome in `result`.
    async fn upload(
        &self,
        entities: Vec<C::Entity>,
        snapshot: &CycleSnapshot,
        result: &mut SyncCycleResult<C::Entity>,
    ) {
        let limit = self.config.upload_concurrency.max(1);
        let mut pending = entities.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut aborted = false;

        loop {
            while !aborted && in_flight.len() < limit {
                match pending.next() {
                    Some(entity) => in_flight.push(self.upload_one(entity, snapshot.cycle_time)),
                    None => break,
                }
            }

            match in_flight.next().await {
                Some(Ok(entity)) => result.uploaded.push(entity),
                Some(Err(failure)) => {
                    warn!(
                        stage = ?failure.stage,
                        local_id = ?self.codec.local_id(&failure.entity),
                        error = %failure.error,
                        "upload failed"
                    );
                    if self.config.upload_policy == UploadPolicy::AbortOnFirstError {
                        aborted = true;
                    }
                    result.failures.push(failure);
                }
                None => break,
            }
        }

        result.skipped.extend(pending);
    }

    /// Creates or updates one entity remotely, then writes the assigned
    /// remote state back to its local row.
    async fn upload_one(
        &self,
        mut entity: C::Entity,
        cycle_time: i64,
    ) -> Result<C::Entity, UploadFailure<C::Entity>> {
        let object = self.codec.to_remote(&entity);
        let creating = !self.codec.has_remote_id(&entity);

        let outcome = if creating {
            self.remote_call(self.remote.create(&self.config.collection, &object))
                .await
        } else {
            self.remote_call(self.remote.update(&object)).await
        };
        let ack = match outcome {
            Ok(ack) => ack,
            Err(error) => {
                return Err(UploadFailure {
                    entity,
                    stage: UploadStage::Remote,
                    assigned_remote_id: None,
                    error,
                })
            }
        };

        self.codec.set_remote_state(&mut entity, &ack.id, ack.modified_at);
        let assigned_remote_id = creating.then(|| ack.id.clone());

        let Some(local_id) = self.codec.local_id(&entity) else {
            return Err(UploadFailure {
                entity,
                stage: UploadStage::WriteBack,
                assigned_remote_id,
                error: SyncError::Codec("collected entity has no local id".into()),
            });
        };

        let record = self.codec.to_record(&entity, cycle_time);
        let source = match self.local.update(RowKey::Local(local_id), &record) {
            Ok(0) => StoreError::RowNotFound {
                table: self.local.table().to_string(),
                local_id,
            },
            Ok(_) => {
                debug!(local_id, remote_id = %ack.id, created = creating, "uploaded");
                return Ok(entity);
            }
            Err(e) => e,
        };

        if let Some(remote_id) = &assigned_remote_id {
            warn!(
                local_id,
                remote_id = %remote_id,
                "remote object created but not recorded locally; the next cycle creates it again"
            );
        }
        Err(UploadFailure {
            entity,
            stage: UploadStage::WriteBack,
            assigned_remote_id,
            error: SyncError::StorageWrite { local_id, source },
        })
    }

    fn record(&self, result: &SyncCycleResult<C::Entity>) {
        let mut stats = self.stats.write();
        stats.entities_downloaded += result.downloaded as u64;
        stats.entities_uploaded += result.uploaded.len() as u64;
        stats.upload_failures += result.failures.len() as u64;
        stats.conflicts += result.conflicts.len() as u64;

        if result.success {
            stats.cycles_completed += 1;
            stats.last_sync_time = Some(Instant::now());
            stats.last_watermark = result.watermark;
            stats.last_error = None;
        } else {
            stats.cycles_failed += 1;
            stats.last_error = match result.failures.first() {
                Some(failure) => Some(failure.error.to_string()),
                None if result.cancelled => Some(SyncError::Cancelled.to_string()),
                None => None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::remote::MemoryRemoteStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tidemark_protocol::{QueryPage, Record, RemoteAck, RemoteObject};
    use tidemark_store::{
        LocalId, MemoryLocalStore, MemoryTransaction, MemoryWatermarkStore, StoreResult,
        TableSchema,
    };

    const SCOPE: &str = "items";
    const BUCKET: &str = "items_bucket";
    const NOW: i64 = 1_000;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        local_id: Option<LocalId>,
        remote_id: Option<String>,
        remote_modified: Option<i64>,
        name: String,
    }

    struct ItemCodec;

    impl EntityCodec for ItemCodec {
        type Entity = Item;

        fn from_remote(&self, object: &RemoteObject) -> SyncResult<Item> {
            let name = object
                .fields
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| SyncError::Codec("missing name".into()))?;
            Ok(Item {
                local_id: None,
                remote_id: object.id.clone(),
                remote_modified: object.modified_at,
                name: name.to_string(),
            })
        }

        fn to_remote(&self, item: &Item) -> RemoteObject {
            let object = RemoteObject::new(Record::new()).with_field("name", item.name.clone());
            match &item.remote_id {
                Some(id) => object.with_id(id.clone()),
                None => object,
            }
        }

        fn to_record(&self, item: &Item, modified_at: i64) -> Record {
            let mut record = Record::new();
            if let Some(id) = item.local_id {
                record.insert("_id".into(), json!(id));
            }
            record.insert("name".into(), json!(item.name));
            record.insert("server_id".into(), json!(item.remote_id));
            record.insert("server_modified".into(), json!(item.remote_modified));
            record.insert("modified".into(), json!(modified_at));
            record
        }

        fn from_record(&self, record: &Record) -> SyncResult<Item> {
            Ok(Item {
                local_id: record.get("_id").and_then(Value::as_i64),
                remote_id: record
                    .get("server_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                remote_modified: record.get("server_modified").and_then(Value::as_i64),
                name: record
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        }

        fn remote_id<'a>(&self, item: &'a Item) -> Option<&'a str> {
            item.remote_id.as_deref()
        }

        fn local_id(&self, item: &Item) -> Option<LocalId> {
            item.local_id
        }

        fn set_remote_state(&self, item: &mut Item, remote_id: &str, modified_at: i64) {
            item.remote_id = Some(remote_id.to_string());
            item.remote_modified = Some(modified_at);
        }
    }

    type Engine<L = MemoryLocalStore, R = MemoryRemoteStore> =
        SyncEngine<ItemCodec, L, R, MemoryWatermarkStore>;

    struct Fixture<L: LocalStore = MemoryLocalStore, R: RemoteStore = MemoryRemoteStore> {
        local: Arc<L>,
        remote: Arc<R>,
        watermark: Arc<MemoryWatermarkStore>,
        engine: Engine<L, R>,
    }

    fn fixture_with<L: LocalStore, R: RemoteStore>(
        config: SyncConfig,
        local: L,
        remote: R,
    ) -> Fixture<L, R> {
        let local = Arc::new(local);
        let remote = Arc::new(remote);
        let watermark = Arc::new(MemoryWatermarkStore::new());
        let engine = SyncEngine::new(
            config,
            ItemCodec,
            Arc::clone(&local),
            Arc::clone(&remote),
            Arc::clone(&watermark),
        )
        .with_clock(Arc::new(ManualClock::new(NOW)));
        Fixture {
            local,
            remote,
            watermark,
            engine,
        }
    }

    fn fixture(config: SyncConfig) -> Fixture {
        fixture_with(
            config,
            MemoryLocalStore::new(TableSchema::new("items")),
            MemoryRemoteStore::new(),
        )
    }

    fn config() -> SyncConfig {
        SyncConfig::new(SCOPE, BUCKET).with_retry(RetryConfig::no_retry())
    }

    fn named(name: &str) -> Record {
        let mut record = Record::new();
        record.insert("name".into(), json!(name));
        record
    }

    fn local_row(name: &str, remote_id: Option<&str>, modified: i64) -> Record {
        let mut record = named(name);
        record.insert("server_id".into(), json!(remote_id));
        record.insert("modified".into(), json!(modified));
        record
    }

    #[tokio::test]
    async fn downloads_are_applied_without_echo_upload() {
        let f = fixture(config().with_page_size(2));
        for (name, time) in [("a", 10), ("b", 20), ("c", 30)] {
            f.remote.seed(BUCKET, named(name), time);
        }

        let result = f.engine.sync().await.unwrap();

        assert!(result.success);
        assert_eq!(result.downloaded, 3);
        assert_eq!(result.applied, 3);
        assert!(result.uploaded.is_empty());
        assert_eq!(f.remote.create_count() + f.remote.update_count(), 0);
        assert_eq!(f.local.len(), 3);
        for row in f.local.rows() {
            assert_eq!(row["modified"], json!(0));
        }
        assert_eq!(f.watermark.get(SCOPE).unwrap(), NOW);
        assert_eq!(f.engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn second_cycle_only_fetches_newer_objects() {
        let f = fixture(config());
        f.remote.seed(BUCKET, named("a"), 10);
        f.engine.sync().await.unwrap();

        f.remote.seed(BUCKET, named("b"), 20);
        let result = f.engine.sync().await.unwrap();

        assert_eq!(result.downloaded, 1);
        assert_eq!(f.local.len(), 2);
    }

    #[tokio::test]
    async fn created_entity_is_written_back() {
        let f = fixture(config());
        let local_id = f.local.insert(&local_row("new", None, 5)).unwrap().unwrap();

        let result = f.engine.sync().await.unwrap();

        assert!(result.success);
        assert_eq!(result.uploaded.len(), 1);
        assert_eq!(f.remote.create_count(), 1);
        assert_eq!(f.remote.update_count(), 0);

        let row = f.local.get(RowKey::Local(local_id)).unwrap();
        let remote_id = row["server_id"].as_str().unwrap();
        let object = f.remote.get(remote_id).unwrap();
        assert_eq!(row["server_modified"], json!(object.modified_at.unwrap()));
        assert_eq!(row["modified"], json!(NOW));
    }

    #[tokio::test]
    async fn entity_with_remote_id_is_updated() {
        let f = fixture(config());
        let remote_id = f.remote.seed("elsewhere", named("old"), 1);
        f.local
            .insert(&local_row("edited", Some(&remote_id), 5))
            .unwrap()
            .unwrap();

        f.engine.sync().await.unwrap();

        assert_eq!(f.remote.create_count(), 0);
        assert_eq!(f.remote.update_count(), 1);
        assert_eq!(f.remote.get(&remote_id).unwrap().fields["name"], json!("edited"));
    }

    #[tokio::test]
    async fn storage_conflict_rolls_back_batch() {
        let schema = TableSchema::new("items").with_unique_column("name");
        let f = fixture_with(config(), MemoryLocalStore::new(schema), MemoryRemoteStore::new());

        let first = f.remote.seed(BUCKET, named("first-v2"), 10);
        f.remote.seed(BUCKET, named("taken"), 20);

        let mut existing = local_row("first-v1", Some(&first), 0);
        existing.insert("server_modified".into(), json!(1));
        f.local.insert(&existing).unwrap().unwrap();
        f.local.insert(&local_row("taken", None, 0)).unwrap().unwrap();
        f.watermark.set(SCOPE, 500).unwrap();

        let err = f.engine.sync().await.unwrap_err();

        assert!(matches!(err, SyncError::StorageConflict { .. }));
        let row = f.local.get(RowKey::Remote(&first)).unwrap();
        assert_eq!(row["name"], json!("first-v1"));
        assert_eq!(f.local.len(), 2);
        assert_eq!(f.watermark.get(SCOPE).unwrap(), 500);
        assert_eq!(f.engine.state(), SyncState::Failed);
        assert_eq!(f.engine.stats().cycles_failed, 1);
    }

    struct FailingQueries(MemoryLocalStore);

    impl LocalStore for FailingQueries {
        type Transaction = MemoryTransaction;

        fn table(&self) -> &str {
            self.0.table()
        }

        fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
        where
            F: FnOnce(&mut MemoryTransaction) -> Result<T, E>,
            E: From<StoreError>,
        {
            self.0.transaction(f)
        }

        fn update(&self, key: RowKey<'_>, fields: &Record) -> StoreResult<usize> {
            self.0.update(key, fields)
        }

        fn modified_since(&self, _threshold: i64) -> StoreResult<Vec<Record>> {
            Err(StoreError::QueryFailed {
                table: "items".into(),
                reason: "disk I/O error".into(),
            })
        }

        fn biggest_remote_time(&self) -> StoreResult<i64> {
            self.0.biggest_remote_time()
        }
    }

    #[tokio::test]
    async fn failed_change_query_keeps_watermark() {
        let f = fixture_with(
            config(),
            FailingQueries(MemoryLocalStore::new(TableSchema::new("items"))),
            MemoryRemoteStore::new(),
        );
        f.remote.seed(BUCKET, named("a"), 10);
        f.watermark.set(SCOPE, 42).unwrap();

        let err = f.engine.sync().await.unwrap_err();

        assert!(matches!(err, SyncError::StorageQuery(_)));
        assert_eq!(f.watermark.get(SCOPE).unwrap(), 42);
        // Apply-Downloads committed before the query failed
        assert_eq!(f.local.0.len(), 1);
    }

    #[tokio::test]
    async fn download_failure_aborts_cycle() {
        let f = fixture(config().with_page_size(1));
        f.remote.seed(BUCKET, named("a"), 10);
        f.remote.seed(BUCKET, named("b"), 20);
        f.remote.fail_query_after(1);

        let err = f.engine.sync().await.unwrap_err();

        assert!(err.is_transport());
        assert!(f.local.is_empty());
        assert_eq!(f.watermark.get(SCOPE).unwrap(), 0);
    }

    struct Scripted(Vec<RemoteObject>);

    #[async_trait]
    impl RemoteStore for Scripted {
        async fn query(
            &self,
            _collection: &str,
            _params: &QueryParams,
            _cursor: Option<&PageCursor>,
        ) -> SyncResult<QueryPage> {
            Ok(QueryPage::last(self.0.clone()))
        }

        async fn create(&self, _collection: &str, _object: &RemoteObject) -> SyncResult<RemoteAck> {
            Err(SyncError::transport_fatal("read only"))
        }

        async fn update(&self, _object: &RemoteObject) -> SyncResult<RemoteAck> {
            Err(SyncError::transport_fatal("read only"))
        }
    }

    #[tokio::test]
    async fn out_of_order_page_is_rejected() {
        let objects = vec![
            RemoteObject::new(named("late")).with_id("r2").with_modified_at(20),
            RemoteObject::new(named("early")).with_id("r1").with_modified_at(10),
        ];
        let f = fixture_with(
            config(),
            MemoryLocalStore::new(TableSchema::new("items")),
            Scripted(objects),
        );

        let err = f.engine.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(f.local.is_empty());
    }

    #[tokio::test]
    async fn client_wins_keeps_unsynced_edit() {
        let f = fixture(config().with_conflict_policy(ConflictPolicy::ClientWins));
        let remote_id = f.remote.seed(BUCKET, named("v1"), 10);
        f.engine.sync().await.unwrap();

        f.remote.touch(&remote_id, named("server-edit"));
        f.local
            .update(RowKey::Remote(&remote_id), &local_row("local-edit", Some(&remote_id), NOW + 5))
            .unwrap();

        let result = f.engine.sync().await.unwrap();

        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.uploaded.len(), 1);
        assert_eq!(f.remote.get(&remote_id).unwrap().fields["name"], json!("local-edit"));
    }

    #[tokio::test]
    async fn abort_on_first_error_skips_the_rest() {
        let f = fixture(
            config()
                .with_upload_concurrency(1)
                .with_upload_policy(UploadPolicy::AbortOnFirstError),
        );
        for (name, modified) in [("a", 1), ("bad", 2), ("c", 3)] {
            f.local.insert(&local_row(name, None, modified)).unwrap().unwrap();
        }
        f.remote.reject_writes_matching(Clause::eq("name", "bad"));

        let result = f.engine.sync().await.unwrap();

        assert!(!result.success);
        assert_eq!(result.uploaded.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].stage, UploadStage::Remote);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(f.watermark.get(SCOPE).unwrap(), 0);
        assert_eq!(f.engine.state(), SyncState::Failed);
    }

    #[tokio::test]
    async fn continue_on_error_uploads_siblings() {
        let f = fixture(config());
        for (name, modified) in [("a", 1), ("bad", 2), ("c", 3)] {
            f.local.insert(&local_row(name, None, modified)).unwrap().unwrap();
        }
        f.remote.reject_writes_matching(Clause::eq("name", "bad"));

        let result = f.engine.sync().await.unwrap();

        assert_eq!(result.uploaded.len(), 2);
        assert_eq!(result.failures.len(), 1);
        assert!(result.skipped.is_empty());
        assert_eq!(f.engine.stats().upload_failures, 1);
    }

    #[tokio::test]
    async fn slow_remote_times_out() {
        let f = fixture(config().with_timeout(Duration::from_millis(20)));
        f.remote.set_latency(Some(Duration::from_millis(500)));

        let err = f.engine.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected() {
        let f = fixture(config());
        f.remote.set_latency(Some(Duration::from_millis(50)));

        let (first, second) = tokio::join!(f.engine.sync(), f.engine.sync());

        assert!(first.is_ok());
        assert!(matches!(
            second.unwrap_err(),
            SyncError::InvalidStateTransition { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_stops_before_apply() {
        let f = fixture(config());
        f.remote.seed(BUCKET, named("a"), 10);
        f.remote.set_latency(Some(Duration::from_millis(50)));

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.engine.cancel();
        };
        let (result, ()) = tokio::join!(f.engine.sync(), cancel);

        assert!(matches!(result.unwrap_err(), SyncError::Cancelled));
        assert!(f.local.is_empty());
        assert_eq!(f.watermark.get(SCOPE).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_trigger_keeps_pending_cancel() {
        let f = fixture(config());
        f.remote.seed(BUCKET, named("a"), 10);
        f.remote.set_latency(Some(Duration::from_millis(50)));

        let interfere = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.engine.cancel();
            tokio::time::sleep(Duration::from_millis(5)).await;
            f.engine.sync().await
        };
        let (first, second) = tokio::join!(f.engine.sync(), interfere);

        assert!(matches!(
            second.unwrap_err(),
            SyncError::InvalidStateTransition { .. }
        ));
        assert!(matches!(first.unwrap_err(), SyncError::Cancelled));
        assert!(f.local.is_empty());
        assert_eq!(f.watermark.get(SCOPE).unwrap(), 0);
        assert_eq!(f.engine.state(), SyncState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_upload_returns_the_report() {
        let f = fixture(config());
        let local_id = f.local.insert(&local_row("new", None, 5)).unwrap().unwrap();
        f.remote.set_latency(Some(Duration::from_millis(50)));

        // Lands while the create is in flight
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(75)).await;
            f.engine.cancel();
        };
        let (result, ()) = tokio::join!(f.engine.sync(), cancel);
        let result = result.unwrap();

        assert!(result.cancelled);
        assert!(!result.success);
        assert!(result.watermark.is_none());
        assert_eq!(result.uploaded.len(), 1);
        assert_eq!(f.watermark.get(SCOPE).unwrap(), 0);
        let row = f.local.get(RowKey::Local(local_id)).unwrap();
        assert!(row["server_id"].is_string());
        assert_eq!(f.engine.state(), SyncState::Failed);
        assert_eq!(
            f.engine.stats().last_error.as_deref(),
            Some(SyncError::Cancelled.to_string().as_str())
        );

        let next = f.engine.sync().await.unwrap();
        assert!(next.success);
        assert!(!next.cancelled);
        assert_eq!(f.watermark.get(SCOPE).unwrap(), NOW);
    }

    /// Rejects `bad` at once and delays every other create.
    struct Staggered(MemoryRemoteStore);

    #[async_trait]
    impl RemoteStore for Staggered {
        async fn query(
            &self,
            collection: &str,
            params: &QueryParams,
            cursor: Option<&PageCursor>,
        ) -> SyncResult<QueryPage> {
            self.0.query(collection, params, cursor).await
        }

        async fn create(&self, collection: &str, object: &RemoteObject) -> SyncResult<RemoteAck> {
            if object.fields.get("name") == Some(&json!("bad")) {
                return Err(SyncError::ServerError("rejected".into()));
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.0.create(collection, object).await
        }

        async fn update(&self, object: &RemoteObject) -> SyncResult<RemoteAck> {
            self.0.update(object).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_on_first_error_settles_in_flight_uploads() {
        let f = fixture_with(
            config()
                .with_upload_concurrency(3)
                .with_upload_policy(UploadPolicy::AbortOnFirstError),
            MemoryLocalStore::new(TableSchema::new("items")),
            Staggered(MemoryRemoteStore::new()),
        );
        for (name, modified) in [("a", 1), ("bad", 2), ("c", 3), ("d", 4), ("e", 5)] {
            f.local.insert(&local_row(name, None, modified)).unwrap().unwrap();
        }

        let result = f.engine.sync().await.unwrap();

        let mut uploaded: Vec<_> = result.uploaded.iter().map(|i| i.name.as_str()).collect();
        uploaded.sort_unstable();
        assert_eq!(uploaded, vec!["a", "c"]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].entity.name, "bad");
        let skipped: Vec<_> = result.skipped.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(skipped, vec!["d", "e"]);
        assert_eq!(f.remote.0.create_count(), 2);

        for row in f.local.rows() {
            let written_back = row["server_id"].is_string();
            let name = row["name"].as_str().unwrap();
            assert_eq!(written_back, name == "a" || name == "c", "row {name}");
        }
        assert_eq!(f.watermark.get(SCOPE).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_during_retry_wait_is_rejected() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(50))
            .with_jitter(false);
        let f = fixture(config().with_retry(retry));
        f.remote.seed(BUCKET, named("a"), 10);
        f.remote.fail_query_after(0);

        let foreign = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let state = f.engine.state();
            (state, f.engine.sync().await)
        };
        let (retried, (state, foreign)) = tokio::join!(f.engine.sync_with_retry(), foreign);

        assert_eq!(state, SyncState::RetryWait);
        assert!(matches!(
            foreign.unwrap_err(),
            SyncError::InvalidStateTransition { ref from, .. } if from == "RetryWait"
        ));
        assert!(retried.unwrap().success);
        assert_eq!(f.engine.stats().retries, 1);
        assert_eq!(f.watermark.get(SCOPE).unwrap(), NOW);
        assert_eq!(f.engine.state(), SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_retry_wait_stops_the_loop() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(50))
            .with_jitter(false);
        let f = fixture(config().with_retry(retry));
        f.remote.fail_query_after(0);

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.engine.cancel();
        };
        let (result, ()) = tokio::join!(f.engine.sync_with_retry(), cancel);

        assert!(matches!(result.unwrap_err(), SyncError::Cancelled));
        assert_eq!(f.remote.query_count(), 1);
        assert_eq!(f.engine.state(), SyncState::Failed);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let f = fixture(config().with_retry(retry));
        f.remote.seed(BUCKET, named("a"), 10);
        f.remote.fail_query_after(0);

        let result = f.engine.sync_with_retry().await.unwrap();

        assert!(result.success);
        let stats = f.engine.stats();
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.cycles_failed, 1);
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.last_watermark, Some(NOW));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let retry = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1));
        let f = fixture_with(
            config().with_retry(retry),
            MemoryLocalStore::new(TableSchema::new("items")),
            Scripted(vec![RemoteObject::new(named("no id")).with_modified_at(1)]),
        );

        let err = f.engine.sync_with_retry().await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(f.engine.stats().retries, 0);
    }
}
