//!
//! src/editor.rs
//!
//! Operator edits on stored records. Every write through here stamps the
//! manual edit marker, which from then on keeps the sync from overwriting
//! the record.
//!

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::errors::SyncError;
use crate::persistent::RecordStore;
use crate::types::{AlbumRecord, ArtistRecord, CatalogRecord};

/// Lowercased term with everything but ascii alphanumerics, '-' and
/// whitespace removed
pub fn sanitize_search_term(term: &str) -> String {
    term.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

// no operator surface in the daemon yet; reached from tests only
#[allow(dead_code)]
pub struct RecordEditor<R: CatalogRecord> {
    store: Arc<dyn RecordStore<R>>
}

#[allow(dead_code)]
impl<R: CatalogRecord> RecordEditor<R> {
    pub fn new(store: Arc<dyn RecordStore<R>>) -> Self {
        Self { store }
    }

    fn not_found(id: i64) -> SyncError {
        SyncError::NotFound { kind: R::KIND.as_str(), id: id.to_string() }
    }

    pub async fn create(&self, record: R) -> Result<R, SyncError> {
        if self.store.exists_by_external_id(record.external_id()).await? {
            return Err(SyncError::AlreadyExists {
                kind: R::KIND.as_str(),
                external_id: record.external_id().to_string()
            });
        }
        let saved = self.store.save(record.edited(None, Utc::now())).await?;
        info!(kind = %R::KIND, id = ?saved.id(), external_id = %saved.external_id(),
            "edit.create");
        Ok(saved)
    }

    /// Replaces the stored record `id`; the record must carry the same id
    pub async fn update(&self, id: i64, record: R) -> Result<R, SyncError> {
        if record.id() != Some(id) {
            return Err(SyncError::IdMismatch { path_id: id, record_id: record.id() });
        }
        if !self.store.exists_by_id(id).await? {
            return Err(Self::not_found(id));
        }
        let saved = self.store.save(record.edited(Some(id), Utc::now())).await?;
        info!(kind = %R::KIND, id, "edit.update");
        Ok(saved)
    }

    pub async fn delete(&self, id: i64) -> Result<(), SyncError> {
        if !self.store.delete_by_id(id).await? {
            return Err(Self::not_found(id));
        }
        info!(kind = %R::KIND, id, "edit.delete");
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<R, SyncError> {
        self.store.find_by_id(id).await?
            .ok_or_else(|| Self::not_found(id))
    }

    pub async fn search(&self, term: &str) -> Result<Vec<R>, SyncError> {
        let term = sanitize_search_term(term);
        if term.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.store.search_by_name(&term).await
    }
}

#[allow(dead_code)]
impl RecordEditor<AlbumRecord> {
    /// Albums crediting the stored artist `artist_id`, ordered by id
    pub async fn by_artist(&self, artists: &RecordEditor<ArtistRecord>, artist_id: i64) ->
        Result<Vec<AlbumRecord>, SyncError> {
        let artist = artists.get(artist_id).await?;
        self.store.find_by_artist_reference(&artist.external_id).await
    }
}
