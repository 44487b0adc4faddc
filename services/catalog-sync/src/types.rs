//!
//! src/types.rs
//!
//! Internal record shapes for artists and albums as they live in storage,
//! plus the trait the reconciler and editor are generic over
//!

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Artist,
    Album
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Artist => "artist",
            RecordKind::Album  => "album"
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    pub height: Option<u32>,
    pub width: Option<u32>
}

/// Where the catalog exposes the entity: api href, spotify: uri, web url
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Links {
    pub href: Option<String>,
    pub uri: Option<String>,
    pub external_url: Option<String>
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtistRecord {
    /// surrogate key, None until storage has assigned one
    pub id: Option<i64>,
    pub external_id: String,
    pub name: String,
    pub followers: u64,
    pub genres: Vec<String>,
    pub popularity: u32,
    pub images: Vec<Image>,
    pub links: Links,
    /// set only by operator edits
    pub last_manual_edit: Option<DateTime<Utc>>,
    /// set every time a sync run touches the record
    pub last_synchronized: Option<DateTime<Utc>>
}

/// Artist as referenced from an album, never a full artist record
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SimplifiedArtist {
    pub external_id: String,
    pub name: String,
    pub kind: String,
    pub links: Links
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlbumRecord {
    pub id: Option<i64>,
    pub external_id: String,
    pub name: String,
    pub album_type: String,
    pub total_tracks: u32,
    pub release_date: String,
    pub release_date_precision: String,
    pub album_group: Option<String>,
    pub artists: Vec<SimplifiedArtist>,
    pub restriction_reason: Option<String>,
    pub images: Vec<Image>,
    pub links: Links,
    pub last_manual_edit: Option<DateTime<Utc>>,
    pub last_synchronized: Option<DateTime<Utc>>
}

///
/// Common surface of stored catalog records. Every "update" hands back a
/// new value; records are never patched in place before being persisted.
///
pub trait CatalogRecord: Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    fn id(&self) -> Option<i64>;
    fn external_id(&self) -> &str;
    fn name(&self) -> &str;
    fn last_manual_edit(&self) -> Option<DateTime<Utc>>;
    fn last_synchronized(&self) -> Option<DateTime<Utc>>;

    /// First sighting: no surrogate id, no manual marker, synced now
    fn for_insert(self, sync_time: DateTime<Utc>) -> Self;

    /// Catalog fields from `incoming`; id and manual marker kept from `self`
    fn refreshed(&self, incoming: Self, sync_time: DateTime<Utc>) -> Self;

    /// Operator edit: stamps the manual marker and pins the surrogate id
    fn edited(self, id: Option<i64>, at: DateTime<Utc>) -> Self;
}

impl CatalogRecord for ArtistRecord {
    const KIND: RecordKind = RecordKind::Artist;

    fn id(&self) -> Option<i64> { self.id }
    fn external_id(&self) -> &str { &self.external_id }
    fn name(&self) -> &str { &self.name }
    fn last_manual_edit(&self) -> Option<DateTime<Utc>> { self.last_manual_edit }
    fn last_synchronized(&self) -> Option<DateTime<Utc>> { self.last_synchronized }

    fn for_insert(self, sync_time: DateTime<Utc>) -> Self {
        Self {
            id: None,
            last_manual_edit: None,
            last_synchronized: Some(sync_time),
            ..self
        }
    }

    fn refreshed(&self, incoming: Self, sync_time: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            last_manual_edit: self.last_manual_edit,
            last_synchronized: Some(sync_time),
            ..incoming
        }
    }

    fn edited(self, id: Option<i64>, at: DateTime<Utc>) -> Self {
        Self { id, last_manual_edit: Some(at), ..self }
    }
}

impl CatalogRecord for AlbumRecord {
    const KIND: RecordKind = RecordKind::Album;

    fn id(&self) -> Option<i64> { self.id }
    fn external_id(&self) -> &str { &self.external_id }
    fn name(&self) -> &str { &self.name }
    fn last_manual_edit(&self) -> Option<DateTime<Utc>> { self.last_manual_edit }
    fn last_synchronized(&self) -> Option<DateTime<Utc>> { self.last_synchronized }

    fn for_insert(self, sync_time: DateTime<Utc>) -> Self {
        Self {
            id: None,
            last_manual_edit: None,
            last_synchronized: Some(sync_time),
            ..self
        }
    }

    fn refreshed(&self, incoming: Self, sync_time: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            last_manual_edit: self.last_manual_edit,
            last_synchronized: Some(sync_time),
            ..incoming
        }
    }

    fn edited(self, id: Option<i64>, at: DateTime<Utc>) -> Self {
        Self { id, last_manual_edit: Some(at), ..self }
    }
}
