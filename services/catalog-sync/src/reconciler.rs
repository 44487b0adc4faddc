//!
//! src/reconciler.rs
//!
//! Merges one batch of freshly mapped records into storage. New external
//! ids are inserted, known ones are refreshed in place, and anything an
//! operator has touched is left alone.
//!

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::config::VanishedPolicy;
use crate::errors::SyncError;
use crate::persistent::RecordStore;
use crate::types::CatalogRecord;

/// What happened to a single record of the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Inserted,
    Refreshed,
    Skipped
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub inserted: usize,
    pub refreshed: usize,
    pub skipped: usize,
    /// external ids that disappeared mid-refresh
    pub vanished: Vec<String>
}

impl Outcome {
    pub fn total(&self) -> usize {
        self.inserted + self.refreshed + self.skipped + self.vanished.len()
    }

    fn record(&mut self, action: Action) {
        match action {
            Action::Inserted  => self.inserted += 1,
            Action::Refreshed => self.refreshed += 1,
            Action::Skipped   => self.skipped += 1
        }
    }
}

pub struct Reconciler<R: CatalogRecord> {
    store: Arc<dyn RecordStore<R>>,
    policy: VanishedPolicy
}

impl<R: CatalogRecord> Reconciler<R> {
    pub fn new(store: Arc<dyn RecordStore<R>>, policy: VanishedPolicy) -> Self {
        Self { store, policy }
    }

    ///
    /// Processes the batch in order. Storage failures other than a vanished
    /// record abort the batch; a vanished record follows the policy.
    ///
    pub async fn reconcile(&self, records: Vec<R>, sync_time: DateTime<Utc>) ->
        Result<Outcome, SyncError> {
        let mut outcome = Outcome::default();
        let batch = records.len();

        for incoming in records {
            let external_id = incoming.external_id().to_string();
            match self.reconcile_one(incoming, sync_time).await {
                Ok(action) => outcome.record(action),
                Err(SyncError::RecordVanished { external_id: gone })
                    if self.policy == VanishedPolicy::Continue => {
                    error!(kind = %R::KIND, external_id = %gone, "reconcile.vanished");
                    outcome.vanished.push(gone);
                }
                Err(e) => {
                    error!(kind = %R::KIND, external_id = %external_id, error = %e,
                        "reconcile.abort");
                    return Err(e);
                }
            }
        }

        info!(
            kind = %R::KIND,
            batch,
            inserted = outcome.inserted,
            refreshed = outcome.refreshed,
            skipped = outcome.skipped,
            vanished = outcome.vanished.len(),
            "reconcile.done"
        );
        Ok(outcome)
    }

    async fn reconcile_one(&self, incoming: R, sync_time: DateTime<Utc>) ->
        Result<Action, SyncError> {
        let external_id = incoming.external_id().to_string();

        if !self.store.exists_by_external_id(&external_id).await? {
            let saved = self.store.save(incoming.for_insert(sync_time)).await?;
            debug!(kind = %R::KIND, external_id = %external_id, id = ?saved.id(),
                "reconcile.insert");
            return Ok(Action::Inserted);
        }

        if self.store.was_manually_modified(&external_id).await? {
            debug!(kind = %R::KIND, external_id = %external_id, "reconcile.skip");
            return Ok(Action::Skipped);
        }

        let Some(existing) = self.store.find_by_external_id(&external_id).await? else {
            return Err(SyncError::RecordVanished { external_id });
        };
        // an operator edit landed between the existence check and the load
        if existing.last_manual_edit().is_some() {
            debug!(kind = %R::KIND, external_id = %external_id, "reconcile.skip.raced");
            return Ok(Action::Skipped);
        }

        // the write itself re-checks the marker; an edit landing after the
        // load above leaves the row untouched
        if !self.store.refresh_unedited(existing.refreshed(incoming, sync_time)).await? {
            if self.store.was_manually_modified(&external_id).await? {
                debug!(kind = %R::KIND, external_id = %external_id, "reconcile.skip.raced");
                return Ok(Action::Skipped);
            }
            return Err(SyncError::RecordVanished { external_id });
        }
        debug!(kind = %R::KIND, external_id = %external_id, id = ?existing.id(),
            "reconcile.refresh");
        Ok(Action::Refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use crate::persistent::Persistent;
    use crate::types::{AlbumRecord, ArtistRecord};

    fn artist(external_id: &str, name: &str) -> ArtistRecord {
        ArtistRecord {
            external_id: external_id.into(),
            name: name.into(),
            ..ArtistRecord::default()
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, hour, 0, 0).unwrap()
    }

    async fn sqlite() -> Arc<Persistent> {
        Arc::new(Persistent::init("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn new_record_is_inserted_with_sync_time() {
        let db = sqlite().await;
        let reconciler: Reconciler<ArtistRecord> =
            Reconciler::new(db.clone(), VanishedPolicy::Continue);

        let outcome = reconciler.reconcile(vec![artist("X", "Artist A")], at(1)).await.unwrap();
        assert_eq!(outcome, Outcome { inserted: 1, ..Outcome::default() });

        let stored: ArtistRecord = db.find_by_external_id("X").await.unwrap().unwrap();
        assert!(stored.id.is_some());
        assert_eq!(stored.name, "Artist A");
        assert_eq!(stored.last_synchronized, Some(at(1)));
        assert_eq!(stored.last_manual_edit, None);
    }

    #[tokio::test]
    async fn known_record_is_refreshed_keeping_its_id() {
        let db = sqlite().await;
        let reconciler: Reconciler<ArtistRecord> =
            Reconciler::new(db.clone(), VanishedPolicy::Continue);
        reconciler.reconcile(vec![artist("X", "Old")], at(1)).await.unwrap();
        let before: ArtistRecord = db.find_by_external_id("X").await.unwrap().unwrap();

        let incoming = ArtistRecord { followers: 5, ..artist("X", "Artist A") };
        let outcome = reconciler.reconcile(vec![incoming], at(2)).await.unwrap();
        assert_eq!(outcome, Outcome { refreshed: 1, ..Outcome::default() });

        let after: ArtistRecord = db.find_by_external_id("X").await.unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.name, "Artist A");
        assert_eq!(after.followers, 5);
        assert_eq!(after.last_synchronized, Some(at(2)));
    }

    #[tokio::test]
    async fn manually_edited_record_is_left_untouched() {
        let db = sqlite().await;
        let edited = db.save(artist("Y", "Curated").edited(None, at(0))).await.unwrap();

        let reconciler: Reconciler<ArtistRecord> =
            Reconciler::new(db.clone(), VanishedPolicy::Continue);
        let outcome = reconciler
            .reconcile(vec![artist("Y", "Catalog Name"), artist("X", "Artist A")], at(3))
            .await
            .unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.total(), 2);

        let after: ArtistRecord = db.find_by_external_id("Y").await.unwrap().unwrap();
        assert_eq!(after, edited);
    }

    #[tokio::test]
    async fn last_synchronized_never_moves_backwards() {
        let db = sqlite().await;
        let reconciler: Reconciler<AlbumRecord> =
            Reconciler::new(db.clone(), VanishedPolicy::Continue);
        let album = AlbumRecord { external_id: "AL".into(), name: "a".into(), ..AlbumRecord::default() };

        let mut seen = Vec::new();
        for hour in [1, 2, 3] {
            reconciler.reconcile(vec![album.clone()], at(hour)).await.unwrap();
            let stored: AlbumRecord = db.find_by_external_id("AL").await.unwrap().unwrap();
            seen.push(stored.last_synchronized.unwrap());
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    /// Store whose rows disappear right after the existence check
    #[derive(Default)]
    struct VanishingStore {
        calls: AtomicUsize
    }

    #[async_trait]
    impl RecordStore<ArtistRecord> for VanishingStore {
        async fn exists_by_external_id(&self, _: &str) -> Result<bool, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        async fn find_by_external_id(&self, _: &str) ->
            Result<Option<ArtistRecord>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
        async fn was_manually_modified(&self, _: &str) -> Result<bool, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
        async fn save(&self, record: ArtistRecord) -> Result<ArtistRecord, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(record)
        }
        async fn find_by_id(&self, _: i64) -> Result<Option<ArtistRecord>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
        async fn exists_by_id(&self, _: i64) -> Result<bool, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
        async fn delete_by_id(&self, _: i64) -> Result<bool, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
        async fn search_by_name(&self, _: &str) -> Result<Vec<ArtistRecord>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn refresh_unedited(&self, _: ArtistRecord) -> Result<bool, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
        async fn find_by_artist_reference(&self, _: &str) ->
            Result<Vec<ArtistRecord>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn empty_batch_touches_nothing() {
        let store = Arc::new(VanishingStore::default());
        let reconciler: Reconciler<ArtistRecord> =
            Reconciler::new(store.clone(), VanishedPolicy::Continue);

        let outcome = reconciler.reconcile(Vec::new(), at(1)).await.unwrap();
        assert_eq!(outcome, Outcome::default());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vanished_record_is_reported_under_continue() {
        let reconciler: Reconciler<ArtistRecord> = Reconciler::new(
            Arc::new(VanishingStore::default()), VanishedPolicy::Continue
        );
        let outcome = reconciler
            .reconcile(vec![artist("X", "a"), artist("Z", "b")], at(1))
            .await
            .unwrap();
        assert_eq!(outcome.vanished, vec!["X".to_string(), "Z".to_string()]);
        assert_eq!(outcome.total(), 2);
    }

    #[tokio::test]
    async fn vanished_record_fails_the_batch_under_abort() {
        let store = Arc::new(VanishingStore::default());
        let reconciler: Reconciler<ArtistRecord> =
            Reconciler::new(store.clone(), VanishedPolicy::Abort);
        let err = reconciler
            .reconcile(vec![artist("X", "a"), artist("Z", "b")], at(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RecordVanished { ref external_id } if external_id == "X"));
        // existence check, manual check and load for X only
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    /// What happens to the row between the reconciler's load and its write
    #[derive(Clone, Copy)]
    enum Interleave {
        OperatorEdit,
        Delete
    }

    /// Sqlite store that mutates the row right after handing it to the reconciler
    struct InterleavingStore {
        db: Arc<Persistent>,
        interleave: Interleave
    }

    #[async_trait]
    impl RecordStore<ArtistRecord> for InterleavingStore {
        async fn exists_by_external_id(&self, external_id: &str) -> Result<bool, SyncError> {
            RecordStore::<ArtistRecord>::exists_by_external_id(&*self.db, external_id).await
        }
        async fn find_by_external_id(&self, external_id: &str) ->
            Result<Option<ArtistRecord>, SyncError> {
            let loaded: Option<ArtistRecord> = self.db.find_by_external_id(external_id).await?;
            if let Some(record) = &loaded {
                let id = record.id.unwrap();
                match self.interleave {
                    Interleave::OperatorEdit => {
                        let curated = ArtistRecord { name: "Curated".into(), ..record.clone() };
                        self.db.save(curated.edited(Some(id), at(9))).await?;
                    }
                    Interleave::Delete => {
                        RecordStore::<ArtistRecord>::delete_by_id(&*self.db, id).await?;
                    }
                }
            }
            Ok(loaded)
        }
        async fn was_manually_modified(&self, external_id: &str) -> Result<bool, SyncError> {
            RecordStore::<ArtistRecord>::was_manually_modified(&*self.db, external_id).await
        }
        async fn save(&self, record: ArtistRecord) -> Result<ArtistRecord, SyncError> {
            self.db.save(record).await
        }
        async fn find_by_id(&self, id: i64) -> Result<Option<ArtistRecord>, SyncError> {
            self.db.find_by_id(id).await
        }
        async fn exists_by_id(&self, id: i64) -> Result<bool, SyncError> {
            RecordStore::<ArtistRecord>::exists_by_id(&*self.db, id).await
        }
        async fn delete_by_id(&self, id: i64) -> Result<bool, SyncError> {
            RecordStore::<ArtistRecord>::delete_by_id(&*self.db, id).await
        }
        async fn search_by_name(&self, term: &str) -> Result<Vec<ArtistRecord>, SyncError> {
            self.db.search_by_name(term).await
        }
        async fn refresh_unedited(&self, record: ArtistRecord) -> Result<bool, SyncError> {
            self.db.refresh_unedited(record).await
        }
        async fn find_by_artist_reference(&self, artist_external_id: &str) ->
            Result<Vec<ArtistRecord>, SyncError> {
            self.db.find_by_artist_reference(artist_external_id).await
        }
    }

    #[tokio::test]
    async fn edit_landing_after_the_load_is_not_overwritten() {
        let db = sqlite().await;
        db.save(artist("X", "Catalog").for_insert(at(1))).await.unwrap();

        let store = Arc::new(InterleavingStore { db: db.clone(), interleave: Interleave::OperatorEdit });
        let reconciler: Reconciler<ArtistRecord> =
            Reconciler::new(store, VanishedPolicy::Continue);
        let outcome = reconciler.reconcile(vec![artist("X", "Catalog Again")], at(2)).await.unwrap();
        assert_eq!(outcome, Outcome { skipped: 1, ..Outcome::default() });

        let stored: ArtistRecord = db.find_by_external_id("X").await.unwrap().unwrap();
        assert_eq!(stored.name, "Curated");
        assert_eq!(stored.last_manual_edit, Some(at(9)));
        assert_eq!(stored.last_synchronized, Some(at(1)));
    }

    #[tokio::test]
    async fn row_deleted_after_the_load_is_vanished() {
        let db = sqlite().await;
        db.save(artist("X", "Catalog").for_insert(at(1))).await.unwrap();

        let store = Arc::new(InterleavingStore { db: db.clone(), interleave: Interleave::Delete });
        let reconciler: Reconciler<ArtistRecord> =
            Reconciler::new(store, VanishedPolicy::Continue);
        let outcome = reconciler.reconcile(vec![artist("X", "Catalog Again")], at(2)).await.unwrap();
        assert_eq!(outcome.vanished, vec!["X".to_string()]);
        assert!(!RecordStore::<ArtistRecord>::exists_by_external_id(&*db, "X").await.unwrap());
    }

    #[tokio::test]
    async fn outcome_counts_cover_the_whole_batch() {
        let db = sqlite().await;
        db.save(artist("M", "manual").edited(None, at(0))).await.unwrap();
        let reconciler: Reconciler<ArtistRecord> =
            Reconciler::new(db.clone(), VanishedPolicy::Continue);
        reconciler.reconcile(vec![artist("R", "r")], at(1)).await.unwrap();

        let batch = vec![artist("M", "m"), artist("R", "r2"), artist("N", "n")];
        let outcome = reconciler.reconcile(batch, at(2)).await.unwrap();
        assert_eq!((outcome.inserted, outcome.refreshed, outcome.skipped), (1, 1, 1));
        assert_eq!(outcome.total(), 3);
    }
}
