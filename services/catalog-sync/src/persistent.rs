//!
//! src/persistent.rs
//!
//! Storage for catalog records. One sqlite table per record kind, keyed
//! by an AUTOINCREMENT surrogate id with the external id held UNIQUE.
//! Nested collections are stored as json text.
//!

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous
};
use sqlx::{Pool, Row, Sqlite};
use tracing::info;

use crate::errors::SyncError;
use crate::types::{AlbumRecord, ArtistRecord, CatalogRecord, Links};

///
/// What the reconciler and the operator edit contract need from storage.
/// `save` inserts when the record has no surrogate id and updates the row
/// with that id otherwise; an update that touches no row is
/// `RecordVanished`. The returned record is what storage now holds.
/// `refresh_unedited` is the sync's write: it only lands while the row
/// carries no manual edit marker.
///
#[async_trait]
pub trait RecordStore<R: CatalogRecord>: Send + Sync {
    async fn exists_by_external_id(&self, external_id: &str) -> Result<bool, SyncError>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<R>, SyncError>;
    async fn was_manually_modified(&self, external_id: &str) -> Result<bool, SyncError>;
    async fn save(&self, record: R) -> Result<R, SyncError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<R>, SyncError>;
    async fn exists_by_id(&self, id: i64) -> Result<bool, SyncError>;
    async fn delete_by_id(&self, id: i64) -> Result<bool, SyncError>;
    async fn search_by_name(&self, term: &str) -> Result<Vec<R>, SyncError>;
    async fn refresh_unedited(&self, record: R) -> Result<bool, SyncError>;
    async fn find_by_artist_reference(&self, artist_external_id: &str) ->
        Result<Vec<R>, SyncError>;
}

///
/// Column layout of a record kind. Row decoding and the write statements
/// differ per kind; everything else in the store is shared.
///
#[async_trait]
pub trait SqlRecord: CatalogRecord {
    const TABLE: &'static str;
    /// WHERE predicate matching rows that credit the artist bound at ?1
    const ARTIST_REFERENCE: &'static str;

    fn from_row(row: &SqliteRow) -> Result<Self, SyncError>;
    async fn insert_row(&self, pool: &Pool<Sqlite>) -> Result<i64, SyncError>;
    async fn update_row(&self, id: i64, unedited_only: bool, pool: &Pool<Sqlite>) ->
        Result<u64, SyncError>;
}

fn edit_guard(unedited_only: bool) -> &'static str {
    if unedited_only { " AND last_manual_edit IS NULL" } else { "" }
}

fn followers_column(followers: u64) -> Result<i64, SyncError> {
    i64::try_from(followers)
        .map_err(|_| SyncError::Db(format!("followers out of range: {followers}")))
}

fn int_column<T: TryFrom<i64>>(row: &SqliteRow, column: &str) -> Result<T, SyncError> {
    let raw = row.try_get::<i64, _>(column)?;
    T::try_from(raw).map_err(|_| SyncError::Db(format!("{column} out of range: {raw}")))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) ->
    Result<T, SyncError> {
    let raw = row.try_get::<String, _>(column)?;
    serde_json::from_str(&raw)
        .map_err(|e| SyncError::Db(format!("{column} holds bad json: {e}")))
}

fn links(row: &SqliteRow) -> Result<Links, SyncError> {
    Ok( Links {
        href: row.try_get("href")?,
        uri: row.try_get("uri")?,
        external_url: row.try_get("external_url")?
    })
}

#[async_trait]
impl SqlRecord for ArtistRecord {
    const TABLE: &'static str = "artists";
    const ARTIST_REFERENCE: &'static str = "external_id = ?1";

    fn from_row(r: &SqliteRow) -> Result<Self, SyncError> {
        Ok( Self {
            id: Some(r.try_get("id")?),
            external_id: r.try_get("external_id")?,
            name: r.try_get("name")?,
            followers: int_column(r, "followers")?,
            genres: json_column(r, "genres")?,
            popularity: int_column(r, "popularity")?,
            images: json_column(r, "images")?,
            links: links(r)?,
            last_manual_edit: r.try_get::<Option<DateTime<Utc>>, _>("last_manual_edit")?,
            last_synchronized: r.try_get::<Option<DateTime<Utc>>, _>("last_synchronized")?
        })
    }

    async fn insert_row(&self, pool: &Pool<Sqlite>) -> Result<i64, SyncError> {
        let result = sqlx::query(
            r"
            INSERT INTO artists (
                external_id, name, followers, genres, popularity, images,
                href, uri, external_url, last_manual_edit, last_synchronized
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);
            "
        )
        .bind(&self.external_id)
        .bind(&self.name)
        .bind(followers_column(self.followers)?)
        .bind(serde_json::to_string(&self.genres)?)
        .bind(i64::from(self.popularity))
        .bind(serde_json::to_string(&self.images)?)
        .bind(self.links.href.as_ref())
        .bind(self.links.uri.as_ref())
        .bind(self.links.external_url.as_ref())
        .bind(self.last_manual_edit)
        .bind(self.last_synchronized)
        .execute(pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_row(&self, id: i64, unedited_only: bool, pool: &Pool<Sqlite>) ->
        Result<u64, SyncError> {
        let sql = format!(
            r"
            UPDATE artists
               SET external_id = ?1,
                   name = ?2,
                   followers = ?3,
                   genres = ?4,
                   popularity = ?5,
                   images = ?6,
                   href = ?7,
                   uri = ?8,
                   external_url = ?9,
                   last_manual_edit = ?10,
                   last_synchronized = ?11
             WHERE id = ?12{};
            ",
            edit_guard(unedited_only)
        );
        let result = sqlx::query(&sql)
        .bind(&self.external_id)
        .bind(&self.name)
        .bind(followers_column(self.followers)?)
        .bind(serde_json::to_string(&self.genres)?)
        .bind(i64::from(self.popularity))
        .bind(serde_json::to_string(&self.images)?)
        .bind(self.links.href.as_ref())
        .bind(self.links.uri.as_ref())
        .bind(self.links.external_url.as_ref())
        .bind(self.last_manual_edit)
        .bind(self.last_synchronized)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SqlRecord for AlbumRecord {
    const TABLE: &'static str = "albums";
    const ARTIST_REFERENCE: &'static str = "EXISTS (
        SELECT 1 FROM json_each(albums.artists)
         WHERE json_extract(json_each.value, '$.external_id') = ?1
    )";

    fn from_row(r: &SqliteRow) -> Result<Self, SyncError> {
        Ok( Self {
            id: Some(r.try_get("id")?),
            external_id: r.try_get("external_id")?,
            name: r.try_get("name")?,
            album_type: r.try_get("album_type")?,
            total_tracks: int_column(r, "total_tracks")?,
            release_date: r.try_get("release_date")?,
            release_date_precision: r.try_get("release_date_precision")?,
            album_group: r.try_get("album_group")?,
            artists: json_column(r, "artists")?,
            restriction_reason: r.try_get("restriction_reason")?,
            images: json_column(r, "images")?,
            links: links(r)?,
            last_manual_edit: r.try_get::<Option<DateTime<Utc>>, _>("last_manual_edit")?,
            last_synchronized: r.try_get::<Option<DateTime<Utc>>, _>("last_synchronized")?
        })
    }

    async fn insert_row(&self, pool: &Pool<Sqlite>) -> Result<i64, SyncError> {
        let result = sqlx::query(
            r"
            INSERT INTO albums (
                external_id, name, album_type, total_tracks, release_date,
                release_date_precision, album_group, artists, restriction_reason,
                images, href, uri, external_url, last_manual_edit, last_synchronized
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15);
            "
        )
        .bind(&self.external_id)
        .bind(&self.name)
        .bind(&self.album_type)
        .bind(i64::from(self.total_tracks))
        .bind(&self.release_date)
        .bind(&self.release_date_precision)
        .bind(self.album_group.as_ref())
        .bind(serde_json::to_string(&self.artists)?)
        .bind(self.restriction_reason.as_ref())
        .bind(serde_json::to_string(&self.images)?)
        .bind(self.links.href.as_ref())
        .bind(self.links.uri.as_ref())
        .bind(self.links.external_url.as_ref())
        .bind(self.last_manual_edit)
        .bind(self.last_synchronized)
        .execute(pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_row(&self, id: i64, unedited_only: bool, pool: &Pool<Sqlite>) ->
        Result<u64, SyncError> {
        let sql = format!(
            r"
            UPDATE albums
               SET external_id = ?1,
                   name = ?2,
                   album_type = ?3,
                   total_tracks = ?4,
                   release_date = ?5,
                   release_date_precision = ?6,
                   album_group = ?7,
                   artists = ?8,
                   restriction_reason = ?9,
                   images = ?10,
                   href = ?11,
                   uri = ?12,
                   external_url = ?13,
                   last_manual_edit = ?14,
                   last_synchronized = ?15
             WHERE id = ?16{};
            ",
            edit_guard(unedited_only)
        );
        let result = sqlx::query(&sql)
        .bind(&self.external_id)
        .bind(&self.name)
        .bind(&self.album_type)
        .bind(i64::from(self.total_tracks))
        .bind(&self.release_date)
        .bind(&self.release_date_precision)
        .bind(self.album_group.as_ref())
        .bind(serde_json::to_string(&self.artists)?)
        .bind(self.restriction_reason.as_ref())
        .bind(serde_json::to_string(&self.images)?)
        .bind(self.links.href.as_ref())
        .bind(self.links.uri.as_ref())
        .bind(self.links.external_url.as_ref())
        .bind(self.last_manual_edit)
        .bind(self.last_synchronized)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Clone, Debug)]
pub struct Persistent {
    pool: Pool<Sqlite>
}

impl Persistent {
    async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), SyncError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS artists (
              id                 INTEGER PRIMARY KEY AUTOINCREMENT,
              external_id        TEXT NOT NULL UNIQUE,
              name               TEXT NOT NULL,
              followers          INTEGER NOT NULL DEFAULT 0,
              genres             TEXT NOT NULL DEFAULT '[]',
              popularity         INTEGER NOT NULL DEFAULT 0,
              images             TEXT NOT NULL DEFAULT '[]',
              href               TEXT,
              uri                TEXT,
              external_url       TEXT,
              last_manual_edit   TEXT,
              last_synchronized  TEXT
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS albums (
              id                      INTEGER PRIMARY KEY AUTOINCREMENT,
              external_id             TEXT NOT NULL UNIQUE,
              name                    TEXT NOT NULL,
              album_type              TEXT NOT NULL,
              total_tracks            INTEGER NOT NULL DEFAULT 0,
              release_date            TEXT NOT NULL,
              release_date_precision  TEXT NOT NULL,
              album_group             TEXT,
              artists                 TEXT NOT NULL DEFAULT '[]',
              restriction_reason      TEXT,
              images                  TEXT NOT NULL DEFAULT '[]',
              href                    TEXT,
              uri                     TEXT,
              external_url            TEXT,
              last_manual_edit        TEXT,
              last_synchronized       TEXT
            );
            "
        ).execute(pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_artists_name ON artists(name);")
            .execute(pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_albums_name ON albums(name);")
            .execute(pool).await?;

        Ok(())
    }

    pub async fn init(database_url: &str) -> Result<Self, SyncError> {
        let is_memory = database_url == "sqlite::memory:";

        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // WAL is file-only
        if !is_memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal)
                       .synchronous(SqliteSynchronous::Normal);

            // get_filename consumes the options
            let filename = opts.clone().get_filename();
            if let Some(dir) = filename.parent() {
                if !dir.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(dir).await?;
                }
            }
        }

        // an in-memory database lives exactly as long as its one connection
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if is_memory {1} else {8})
            .idle_timeout(if is_memory { None } else { Some(std::time::Duration::from_secs(600)) })
            .max_lifetime(if is_memory { None } else { Some(std::time::Duration::from_secs(1800)) })
            .connect_with(opts)
            .await?;

        Self::ensure_schema(&pool).await?;
        info!(url = %database_url, memory = is_memory, "storage.ready");

        Ok( Self { pool })
    }
}

#[async_trait]
impl<R: SqlRecord> RecordStore<R> for Persistent {
    async fn exists_by_external_id(&self, external_id: &str) -> Result<bool, SyncError> {
        let sql = format!("SELECT 1 FROM {} WHERE external_id = ?1 LIMIT 1;", R::TABLE);
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<R>, SyncError> {
        let sql = format!("SELECT * FROM {} WHERE external_id = ?1 LIMIT 1;", R::TABLE);
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(R::from_row).transpose()
    }

    async fn was_manually_modified(&self, external_id: &str) -> Result<bool, SyncError> {
        let sql = format!(
            "SELECT last_manual_edit IS NOT NULL AS edited FROM {} WHERE external_id = ?1;",
            R::TABLE
        );
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok( match row {
            Some(r) => r.try_get::<i64, _>("edited")? != 0,
            None => false
        })
    }

    async fn save(&self, record: R) -> Result<R, SyncError> {
        let id = match record.id() {
            None => record.insert_row(&self.pool).await?,
            Some(id) => {
                if record.update_row(id, false, &self.pool).await? == 0 {
                    return Err(SyncError::RecordVanished {
                        external_id: record.external_id().to_string()
                    });
                }
                id
            }
        };

        let stored = <Self as RecordStore<R>>::find_by_id(self, id).await?;
        stored.ok_or_else(|| SyncError::RecordVanished {
            external_id: record.external_id().to_string()
        })
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<R>, SyncError> {
        let sql = format!("SELECT * FROM {} WHERE id = ?1;", R::TABLE);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(R::from_row).transpose()
    }

    async fn exists_by_id(&self, id: i64) -> Result<bool, SyncError> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?1;", R::TABLE);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete_by_id(&self, id: i64) -> Result<bool, SyncError> {
        let sql = format!("DELETE FROM {} WHERE id = ?1;", R::TABLE);
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Case-insensitive substring match on the name, ordered by id
    async fn search_by_name(&self, term: &str) -> Result<Vec<R>, SyncError> {
        let sql = format!(
            "SELECT * FROM {} WHERE instr(lower(name), lower(?1)) > 0 ORDER BY id ASC;",
            R::TABLE
        );
        let rows = sqlx::query(&sql)
            .bind(term)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(R::from_row).collect()
    }

    /// Guarded UPDATE; false when the row is gone or an operator edit got there first
    async fn refresh_unedited(&self, record: R) -> Result<bool, SyncError> {
        let Some(id) = record.id() else {
            return Err(SyncError::Db(format!(
                "refresh of {} without a stored id", record.external_id()
            )));
        };
        Ok(record.update_row(id, true, &self.pool).await? > 0)
    }

    async fn find_by_artist_reference(&self, artist_external_id: &str) ->
        Result<Vec<R>, SyncError> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY id ASC;",
            R::TABLE, R::ARTIST_REFERENCE
        );
        let rows = sqlx::query(&sql)
            .bind(artist_external_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(R::from_row).collect()
    }
}
