//! Reconciler — merges parsed candidates into the parcel store.
//!
//! Exactly one stored record per pickup code. Re-parsing a known code never
//! touches the stored record; a concurrent insert of the same code is
//! resolved by merging message fields while keeping identity and pickup
//! state. Per-record failures are logged and counted, never fatal to the
//! batch.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::MAX_EVENT_CAPACITY;
use crate::error::{DatabaseError, SourceError};
use crate::parcels::{ParcelRecord, ParcelStatus};
use crate::pipeline::classifier::Classifier;
use crate::pipeline::reader::scan_source;
use crate::pipeline::types::MessageSource;
use crate::store::ParcelStore;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Change notifications published after each committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParcelEvent {
    Inserted { id: i64, pickup_code: String },
    Merged { id: i64, pickup_code: String },
    StatusChanged { id: i64, status: ParcelStatus },
    SyncCompleted { report: SyncReport },
}

/// Result of committing one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored as a new record with this id.
    Inserted(i64),
    /// Merged over a concurrently created record with this id.
    Merged(i64),
    /// Could not be stored; the rest of the batch continues.
    Failed,
}

/// Per-batch tallies returned by [`Reconciler::sync_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Candidates handed in.
    pub received: usize,
    /// Candidates left after in-batch dedup.
    pub unique: usize,
    pub inserted: usize,
    pub merged: usize,
    /// Codes already in the store, left untouched.
    pub skipped_existing: usize,
    pub failed: usize,
}

/// Applies parsed candidates and user status changes to a [`ParcelStore`].
pub struct Reconciler {
    store: Arc<dyn ParcelStore>,
    tx: broadcast::Sender<ParcelEvent>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ParcelStore>) -> Self {
        Self::with_capacity(store, DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create a reconciler with a custom event channel capacity, clamped to
    /// `1..=MAX_EVENT_CAPACITY`.
    pub fn with_capacity(store: Arc<dyn ParcelStore>, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.clamp(1, MAX_EVENT_CAPACITY));
        Self { store, tx }
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ParcelEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: ParcelEvent) {
        // Ok if nobody is listening
        let _ = self.tx.send(event);
    }

    /// Scan `source` and sync everything it yields.
    ///
    /// A denied source leaves the store untouched and returns the error.
    pub async fn refresh(
        &self,
        source: &dyn MessageSource,
        classifier: &Classifier,
    ) -> Result<SyncReport, SourceError> {
        let candidates = scan_source(source, classifier).await?;
        Ok(self.sync_batch(candidates).await)
    }

    /// Commit a batch of candidates.
    ///
    /// Duplicates within the batch are dropped, first occurrence wins (the
    /// batch is expected newest first). Survivors are processed in input
    /// order. Known codes are skipped without any write.
    pub async fn sync_batch(&self, candidates: Vec<ParcelRecord>) -> SyncReport {
        let mut report = SyncReport {
            received: candidates.len(),
            ..SyncReport::default()
        };

        let mut seen = HashSet::new();
        let unique: Vec<ParcelRecord> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.pickup_code.clone()))
            .collect();
        report.unique = unique.len();

        for candidate in &unique {
            match self.store.exists_by_code(&candidate.pickup_code).await {
                Ok(true) => {
                    debug!(pickup_code = %candidate.pickup_code, "Parcel already stored, skipping");
                    report.skipped_existing += 1;
                }
                Ok(false) => match self.insert_or_merge(candidate).await {
                    InsertOutcome::Inserted(_) => report.inserted += 1,
                    InsertOutcome::Merged(_) => report.merged += 1,
                    InsertOutcome::Failed => report.failed += 1,
                },
                Err(e) => {
                    warn!(pickup_code = %candidate.pickup_code, "Existence check failed: {e}");
                    report.failed += 1;
                }
            }
        }

        info!(
            received = report.received,
            unique = report.unique,
            inserted = report.inserted,
            merged = report.merged,
            skipped = report.skipped_existing,
            failed = report.failed,
            "Parcel sync complete"
        );
        self.publish(ParcelEvent::SyncCompleted { report });
        report
    }

    /// Insert a candidate, merging over a record that appeared concurrently
    /// with the same pickup code.
    ///
    /// The merge takes locker, location, message and receive time from the
    /// candidate and keeps the stored id and pickup state.
    pub async fn insert_or_merge(&self, candidate: &ParcelRecord) -> InsertOutcome {
        match self.store.insert(candidate).await {
            Ok(id) => {
                self.publish(ParcelEvent::Inserted {
                    id,
                    pickup_code: candidate.pickup_code.clone(),
                });
                InsertOutcome::Inserted(id)
            }
            Err(DatabaseError::DuplicateKey { .. }) => self.merge_existing(candidate).await,
            Err(e) => {
                warn!(pickup_code = %candidate.pickup_code, "Parcel insert failed: {e}");
                InsertOutcome::Failed
            }
        }
    }

    async fn merge_existing(&self, candidate: &ParcelRecord) -> InsertOutcome {
        let existing = match self.store.get_by_code(&candidate.pickup_code).await {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                warn!(
                    pickup_code = %candidate.pickup_code,
                    "Duplicate key reported but no stored parcel found"
                );
                return InsertOutcome::Failed;
            }
            Err(e) => {
                warn!(pickup_code = %candidate.pickup_code, "Conflict lookup failed: {e}");
                return InsertOutcome::Failed;
            }
        };

        let merged = existing.merged_with(candidate);
        let Some(id) = merged.id else {
            return InsertOutcome::Failed;
        };

        match self.store.update(&merged).await {
            Ok(()) => {
                debug!(id, pickup_code = %merged.pickup_code, "Merged concurrent parcel insert");
                self.publish(ParcelEvent::Merged {
                    id,
                    pickup_code: merged.pickup_code.clone(),
                });
                InsertOutcome::Merged(id)
            }
            Err(e) => {
                warn!(id, pickup_code = %merged.pickup_code, "Parcel merge failed: {e}");
                InsertOutcome::Failed
            }
        }
    }

    /// Mark a stored parcel as picked up now.
    pub async fn mark_picked_up(
        &self,
        record: &ParcelRecord,
    ) -> Result<ParcelRecord, DatabaseError> {
        self.mark_picked_up_at(record, Utc::now()).await
    }

    /// Mark a stored parcel as picked up at `at`.
    pub async fn mark_picked_up_at(
        &self,
        record: &ParcelRecord,
        at: DateTime<Utc>,
    ) -> Result<ParcelRecord, DatabaseError> {
        let updated = record.picked_up_at(at);
        self.store.update(&updated).await?;
        if let Some(id) = updated.id {
            info!(id, pickup_code = %updated.pickup_code, "Parcel picked up");
            self.publish(ParcelEvent::StatusChanged {
                id,
                status: ParcelStatus::PickedUp,
            });
        }
        Ok(updated)
    }

    /// Put a parcel back to pending. Returns `None` when it no longer exists.
    pub async fn reset_to_pending(&self, id: i64) -> Result<Option<ParcelRecord>, DatabaseError> {
        let Some(current) = self.store.get_by_id(id).await? else {
            debug!(id, "Parcel gone, nothing to reset");
            return Ok(None);
        };

        let reset = current.reset();
        self.store.update(&reset).await?;
        info!(id, pickup_code = %reset.pickup_code, "Parcel reset to pending");
        self.publish(ParcelEvent::StatusChanged {
            id,
            status: ParcelStatus::Pending,
        });
        Ok(Some(reset))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::pipeline::types::RawMessage;
    use crate::store::LibSqlBackend;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn candidate(code: &str, locker: &str, received_ms: i64) -> ParcelRecord {
        ParcelRecord::candidate(code, locker, "驿站", format!("取件码 {code}"), ts(received_ms))
    }

    async fn reconciler() -> (Reconciler, Arc<LibSqlBackend>) {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store: Arc<dyn ParcelStore> = backend.clone();
        (Reconciler::new(store), backend)
    }

    /// Wraps the real backend to simulate races and storage faults.
    struct StubStore {
        inner: LibSqlBackend,
        /// Existence check always answers "no", as if another writer raced us.
        hide_existing: bool,
        /// Inserts report a duplicate that the lookup then cannot find.
        phantom_duplicates: bool,
        /// Inserts for this code fail with a query error.
        fail_insert_for: Option<String>,
        /// Existence checks for this code fail with a query error.
        fail_exists_for: Option<String>,
    }

    impl StubStore {
        async fn new() -> Self {
            Self {
                inner: LibSqlBackend::new_memory().await.unwrap(),
                hide_existing: false,
                phantom_duplicates: false,
                fail_insert_for: None,
                fail_exists_for: None,
            }
        }
    }

    #[async_trait]
    impl ParcelStore for StubStore {
        async fn init_schema(&self) -> Result<(), DatabaseError> {
            self.inner.init_schema().await
        }

        async fn list_all(&self) -> Result<Vec<ParcelRecord>, DatabaseError> {
            self.inner.list_all().await
        }

        async fn list_pending(&self) -> Result<Vec<ParcelRecord>, DatabaseError> {
            self.inner.list_pending().await
        }

        async fn exists_by_code(&self, pickup_code: &str) -> Result<bool, DatabaseError> {
            if self.fail_exists_for.as_deref() == Some(pickup_code) {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            if self.hide_existing {
                return Ok(false);
            }
            self.inner.exists_by_code(pickup_code).await
        }

        async fn get_by_code(
            &self,
            pickup_code: &str,
        ) -> Result<Option<ParcelRecord>, DatabaseError> {
            if self.phantom_duplicates {
                return Ok(None);
            }
            self.inner.get_by_code(pickup_code).await
        }

        async fn get_by_id(&self, id: i64) -> Result<Option<ParcelRecord>, DatabaseError> {
            self.inner.get_by_id(id).await
        }

        async fn insert(&self, record: &ParcelRecord) -> Result<i64, DatabaseError> {
            if self.phantom_duplicates {
                return Err(DatabaseError::DuplicateKey {
                    key: record.pickup_code.clone(),
                });
            }
            if self.fail_insert_for.as_deref() == Some(record.pickup_code.as_str()) {
                return Err(DatabaseError::Query("disk I/O error".into()));
            }
            self.inner.insert(record).await
        }

        async fn update(&self, record: &ParcelRecord) -> Result<(), DatabaseError> {
            self.inner.update(record).await
        }
    }

    #[tokio::test]
    async fn sync_inserts_new_records() {
        let (reconciler, store) = reconciler().await;
        let report = reconciler
            .sync_batch(vec![candidate("22222", "5", 200), candidate("11111", "7", 100)])
            .await;

        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 0);
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.status() == ParcelStatus::Pending));
        assert!(all.iter().all(|r| r.id.is_some()));
    }

    #[tokio::test]
    async fn duplicate_within_batch_keeps_first() {
        let (reconciler, store) = reconciler().await;
        let report = reconciler
            .sync_batch(vec![candidate("1", "newest", 200), candidate("1", "older", 100)])
            .await;

        assert_eq!(report.received, 2);
        assert_eq!(report.unique, 1);
        assert_eq!(report.inserted, 1);

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].pickup_code, "1");
        assert_eq!(all[0].locker_number, "newest");
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let (reconciler, store) = reconciler().await;
        let batch = vec![candidate("11111", "1", 100), candidate("22222", "2", 200)];

        reconciler.sync_batch(batch.clone()).await;
        let before = store.list_all().await.unwrap();

        let report = reconciler.sync_batch(batch).await;
        assert_eq!(report.inserted, 0);
        assert_eq!(report.skipped_existing, 2);
        assert_eq!(store.list_all().await.unwrap(), before);
    }

    #[tokio::test]
    async fn resync_preserves_picked_up_state() {
        let (reconciler, store) = reconciler().await;
        reconciler.sync_batch(vec![candidate("48213", "3", 100)]).await;
        let stored = store.get_by_code("48213").await.unwrap().unwrap();
        reconciler.mark_picked_up_at(&stored, ts(5_000)).await.unwrap();

        reconciler
            .sync_batch(vec![candidate("48213", "9", 9_000)])
            .await;

        let after = store.get_by_code("48213").await.unwrap().unwrap();
        assert_eq!(after.status(), ParcelStatus::PickedUp);
        assert_eq!(after.pickup_time(), Some(ts(5_000)));
        assert_eq!(after.locker_number, "3");
    }

    #[tokio::test]
    async fn oversized_event_capacity_is_clamped() {
        let store: Arc<dyn ParcelStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let reconciler = Reconciler::with_capacity(store, usize::MAX);
        let mut events = reconciler.subscribe();

        reconciler.sync_batch(vec![candidate("48213", "3", 1)]).await;
        assert!(matches!(events.try_recv(), Ok(ParcelEvent::Inserted { .. })));
    }

    #[tokio::test]
    async fn existence_check_failure_is_contained() {
        let stub = Arc::new(StubStore {
            fail_exists_for: Some("22222".into()),
            ..StubStore::new().await
        });
        let reconciler = Reconciler::new(stub.clone());

        let report = reconciler
            .sync_batch(vec![
                candidate("11111", "1", 300),
                candidate("22222", "2", 200),
                candidate("33333", "3", 100),
            ])
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.inserted, 2);
        let codes: Vec<String> = stub
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.pickup_code)
            .collect();
        assert_eq!(codes, vec!["11111", "33333"]);
    }

    #[tokio::test]
    async fn concurrent_insert_is_merged_keeping_state() {
        let stub = Arc::new(StubStore {
            hide_existing: true,
            ..StubStore::new().await
        });
        let reconciler = Reconciler::new(stub.clone());

        let id = stub.inner.insert(&candidate("48213", "3", 100)).await.unwrap();
        let stored = stub.inner.get_by_id(id).await.unwrap().unwrap();
        stub.inner.update(&stored.picked_up_at(ts(1_000))).await.unwrap();

        let report = reconciler
            .sync_batch(vec![candidate("48213", "9", 2_000)])
            .await;
        assert_eq!(report.merged, 1);
        assert_eq!(report.inserted, 0);

        let all = stub.inner.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        let merged = &all[0];
        assert_eq!(merged.id, Some(id));
        assert_eq!(merged.locker_number, "9");
        assert_eq!(merged.receive_time, ts(2_000));
        assert_eq!(merged.status(), ParcelStatus::PickedUp);
        assert_eq!(merged.pickup_time(), Some(ts(1_000)));
    }

    #[tokio::test]
    async fn phantom_duplicate_fails_single_record() {
        let stub = Arc::new(StubStore {
            phantom_duplicates: true,
            ..StubStore::new().await
        });
        let reconciler = Reconciler::new(stub.clone());

        let outcome = reconciler.insert_or_merge(&candidate("48213", "3", 1)).await;
        assert_eq!(outcome, InsertOutcome::Failed);

        let report = reconciler
            .sync_batch(vec![candidate("11111", "1", 1), candidate("22222", "2", 2)])
            .await;
        assert_eq!(report.failed, 2);
        assert!(stub.inner.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_does_not_abort_batch() {
        let stub = Arc::new(StubStore {
            fail_insert_for: Some("22222".into()),
            ..StubStore::new().await
        });
        let reconciler = Reconciler::new(stub.clone());

        let report = reconciler
            .sync_batch(vec![
                candidate("11111", "1", 300),
                candidate("22222", "2", 200),
                candidate("33333", "3", 100),
            ])
            .await;
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 1);

        assert!(stub.inner.exists_by_code("33333").await.unwrap());
        assert!(!stub.inner.exists_by_code("22222").await.unwrap());
    }

    #[tokio::test]
    async fn pickup_then_reset_round_trip() {
        let (reconciler, store) = reconciler().await;
        reconciler.sync_batch(vec![candidate("48213", "3", 100)]).await;
        let stored = store.get_by_code("48213").await.unwrap().unwrap();
        let id = stored.id.unwrap();

        let picked = reconciler.mark_picked_up(&stored).await.unwrap();
        assert_eq!(picked.status(), ParcelStatus::PickedUp);
        assert!(picked.pickup_time().is_some());

        let reset = reconciler.reset_to_pending(id).await.unwrap().unwrap();
        assert_eq!(reset.status(), ParcelStatus::Pending);
        assert_eq!(reset.pickup_time(), None);

        let fetched = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn reset_unknown_id_is_noop() {
        let (reconciler, _store) = reconciler().await;
        assert!(reconciler.reset_to_pending(404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_unsaved_record_is_not_found() {
        let (reconciler, _store) = reconciler().await;
        let err = reconciler
            .mark_picked_up(&candidate("48213", "3", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let (reconciler, store) = reconciler().await;
        let mut rx = reconciler.subscribe();

        reconciler.sync_batch(vec![candidate("48213", "3", 1)]).await;
        let stored = store.get_by_code("48213").await.unwrap().unwrap();
        let id = stored.id.unwrap();
        reconciler.mark_picked_up(&stored).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ParcelEvent::Inserted {
                id,
                pickup_code: "48213".into()
            }
        );
        match rx.recv().await.unwrap() {
            ParcelEvent::SyncCompleted { report } => assert_eq!(report.inserted, 1),
            other => panic!("Expected SyncCompleted, got {other:?}"),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            ParcelEvent::StatusChanged {
                id,
                status: ParcelStatus::PickedUp
            }
        );
    }

    struct StubSource(Result<Vec<RawMessage>, ()>);

    #[async_trait]
    impl MessageSource for StubSource {
        fn name(&self) -> &str {
            "stub"
        }

        async fn fetch_raw(&self) -> Result<Vec<RawMessage>, SourceError> {
            self.0
                .clone()
                .map_err(|_| SourceError::PermissionDenied("READ_SMS".into()))
        }
    }

    #[tokio::test]
    async fn refresh_scans_and_syncs() {
        let (reconciler, store) = reconciler().await;
        let source = StubSource(Ok(vec![
            RawMessage::from_millis("您的快递已到丰台南路营业部，请携带取件码 48213 到 3号快递柜取件", 2_000),
            RawMessage::from_millis("您的快递已到丰台南路营业部，请携带取件码 48213 到 3号快递柜取件", 1_000),
            RawMessage::from_millis("hello", 500),
        ]));

        let report = reconciler
            .refresh(&source, &Classifier::default())
            .await
            .unwrap();
        assert_eq!(report.received, 2);
        assert_eq!(report.inserted, 1);

        let stored = store.get_by_code("48213").await.unwrap().unwrap();
        assert_eq!(stored.receive_time, ts(2_000));
        assert_eq!(stored.location, "丰台南路营业部");
    }

    #[tokio::test]
    async fn refresh_denied_leaves_store_untouched() {
        let (reconciler, store) = reconciler().await;
        let err = reconciler
            .refresh(&StubSource(Err(())), &Classifier::default())
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert!(store.list_all().await.unwrap().is_empty());
    }
}
