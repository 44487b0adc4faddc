//!
//! src/scheduler.rs
//!
//! Defines the sync pipeline (fetch, map, reconcile) and the periodic
//! trigger that drives it until shutdown
//!

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{SyncConfig, VanishedPolicy};
use crate::errors::SyncError;
use crate::fetch::CatalogSource;
use crate::mapper::{album_from_wire, artist_from_wire};
use crate::persistent::RecordStore;
use crate::reconciler::{Outcome, Reconciler};
use crate::types::{AlbumRecord, ArtistRecord};

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub sync_time: DateTime<Utc>,
    pub artists: Outcome,
    pub albums: Outcome
}

pub struct Pipeline {
    catalog: Arc<dyn CatalogSource>,
    artists: Reconciler<ArtistRecord>,
    albums: Reconciler<AlbumRecord>,
    // held for the duration of a run
    running: Mutex<()>
}

impl Pipeline {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        artist_store: Arc<dyn RecordStore<ArtistRecord>>,
        album_store: Arc<dyn RecordStore<AlbumRecord>>,
        on_vanished: VanishedPolicy
    ) -> Self {
        Self {
            catalog,
            artists: Reconciler::new(artist_store, on_vanished),
            albums: Reconciler::new(album_store, on_vanished),
            running: Mutex::new(())
        }
    }

    ///
    /// One reconciliation run. Returns Ok(None) without doing anything when
    /// another run still holds the guard. Everything is fetched before
    /// storage is touched, so a fetch failure leaves storage as it was.
    ///
    pub async fn run_once(&self) -> Result<Option<RunSummary>, SyncError> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("sync.run.busy");
            return Ok(None);
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("sync.run", run_id = %run_id);
        self.run_inner(run_id).instrument(span).await.map(Some)
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary, SyncError> {
        let sync_time = Utc::now();
        info!(sync_time = %sync_time, "sync.run.start");

        let artists = self.catalog.fetch_artists().await?;
        let albums = self.catalog.fetch_albums().await?;
        info!(artists = artists.len(), albums = albums.len(), "sync.run.fetched");

        let artists: Vec<ArtistRecord> = artists.into_iter().map(artist_from_wire).collect();
        let albums: Vec<AlbumRecord> = albums.into_iter().map(album_from_wire).collect();

        let artists = self.artists.reconcile(artists, sync_time).await?;
        let albums = self.albums.reconcile(albums, sync_time).await?;

        Ok( RunSummary { run_id, sync_time, artists, albums })
    }
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    interval: Duration,
    run_on_start: bool,

    // handles daemon exit
    shutdown: CancellationToken
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, cfg: &SyncConfig) -> Self {
        Self {
            pipeline,
            interval: cfg.interval,
            run_on_start: cfg.run_on_start,
            shutdown: CancellationToken::new()
        }
    }

    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    ///
    /// Ticks until the shutdown token is cancelled. Runs are awaited inline
    /// so they never overlap; a failed run is logged and the next tick
    /// starts over.
    ///
    pub async fn run(self) -> Result<(), SyncError> {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            run_on_start = self.run_on_start,
            "scheduler.start"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if !self.run_on_start {
            // first tick of an interval completes immediately
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    info!(reason = "shutdown token", "scheduler.stop");
                    break;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("scheduler.exit");
        Ok(())
    }

    async fn tick(&self) {
        match self.pipeline.run_once().await {
            Ok(Some(summary)) => info!(
                run_id = %summary.run_id,
                artists_inserted = summary.artists.inserted,
                artists_refreshed = summary.artists.refreshed,
                artists_skipped = summary.artists.skipped,
                artists_vanished = summary.artists.vanished.len(),
                albums_inserted = summary.albums.inserted,
                albums_refreshed = summary.albums.refreshed,
                albums_skipped = summary.albums.skipped,
                albums_vanished = summary.albums.vanished.len(),
                "sync.run.done"
            ),
            Ok(None) => {}
            Err(e) if e.is_fetch_failure() => {
                error!(error = %e, "sync.run.fetch_failed");
            }
            Err(e) => error!(error = %e, "sync.run.failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use crate::persistent::Persistent;
    use crate::wire::{AlbumWire, ArtistWire};

    /// Canned catalog; albums fail with an auth error when `fail_albums` is set
    #[derive(Default)]
    struct StubCatalog {
        fail_artists: bool,
        fail_albums: bool,
        calls: AtomicUsize
    }

    #[async_trait]
    impl CatalogSource for StubCatalog {
        async fn fetch_artists(&self) -> Result<Vec<ArtistWire>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_artists {
                return Err(SyncError::api(503, "Service unavailable"));
            }
            Ok(vec![ArtistWire { id: "X".into(), name: "Artist A".into(), ..ArtistWire::default() }])
        }

        async fn fetch_albums(&self) -> Result<Vec<AlbumWire>, SyncError> {
            if self.fail_albums {
                return Err(SyncError::auth("server_error", "down"));
            }
            Ok(vec![
                AlbumWire { id: "AL1".into(), name: "One".into(), ..AlbumWire::default() },
                AlbumWire { id: "AL2".into(), name: "Two".into(), ..AlbumWire::default() }
            ])
        }
    }

    async fn pipeline(catalog: StubCatalog) -> (Arc<Pipeline>, Arc<Persistent>, Arc<StubCatalog>) {
        let db = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        let catalog = Arc::new(catalog);
        let pipeline = Pipeline::new(
            catalog.clone(), db.clone(), db.clone(), VanishedPolicy::Continue
        );
        (Arc::new(pipeline), db, catalog)
    }

    #[tokio::test]
    async fn successful_run_stores_artists_and_albums_with_one_sync_time() {
        let (pipeline, db, _) = pipeline(StubCatalog::default()).await;
        let summary = pipeline.run_once().await.unwrap().unwrap();
        assert_eq!(summary.artists.inserted, 1);
        assert_eq!(summary.albums.inserted, 2);

        let artist: ArtistRecord = db.find_by_external_id("X").await.unwrap().unwrap();
        let album: AlbumRecord = db.find_by_external_id("AL2").await.unwrap().unwrap();
        assert_eq!(artist.last_synchronized, Some(summary.sync_time));
        assert_eq!(album.last_synchronized, Some(summary.sync_time));

        let again = pipeline.run_once().await.unwrap().unwrap();
        assert_eq!(again.artists.refreshed, 1);
        assert_eq!(again.albums.refreshed, 2);
        assert_ne!(again.run_id, summary.run_id);
    }

    #[tokio::test]
    async fn auth_failure_leaves_storage_untouched() {
        let (pipeline, db, _) = pipeline(StubCatalog {
            fail_albums: true, ..StubCatalog::default()
        }).await;

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Auth { .. }));
        // artists were fetched fine but never reached storage
        assert!(!RecordStore::<ArtistRecord>::exists_by_external_id(&*db, "X").await.unwrap());
    }

    #[tokio::test]
    async fn run_in_progress_is_not_started_twice() {
        let (pipeline, _, catalog) = pipeline(StubCatalog::default()).await;
        let held = pipeline.running.lock().await;
        assert!(pipeline.run_once().await.unwrap().is_none());
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 0);
        drop(held);
        assert!(pipeline.run_once().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scheduler_keeps_ticking_after_failed_runs() {
        let (pipeline, _, catalog) = pipeline(StubCatalog {
            fail_artists: true, ..StubCatalog::default()
        }).await;
        let cfg = SyncConfig {
            interval: Duration::from_millis(10),
            run_on_start: true,
            on_vanished: VanishedPolicy::Continue
        };
        let scheduler = Scheduler::new(pipeline, &cfg);
        let shutdown = scheduler.shutdown();
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(catalog.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn cancelled_scheduler_without_start_run_never_runs() {
        let (pipeline, _, catalog) = pipeline(StubCatalog::default()).await;
        let cfg = SyncConfig {
            interval: Duration::from_secs(3600),
            run_on_start: false,
            on_vanished: VanishedPolicy::Continue
        };
        let scheduler = Scheduler::new(pipeline, &cfg);
        let shutdown = scheduler.shutdown();
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 0);
    }
}
