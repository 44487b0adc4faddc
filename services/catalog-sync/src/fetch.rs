//!
//! src/fetch.rs
//!
//! Defines the http clients and request builders for the Spotify
//! accounts and web api, and the catalog source that pulls the configured
//! artists and all of their albums for one sync run
//!

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, header, redirect, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::config::{CatalogConfig, HttpConfig, SpotifyConfig};
use crate::credentials::CredentialCache;
use crate::wire::{AlbumPage, AlbumWire, ApiErrorEnvelope, ArtistWire, ArtistsEnvelope};
use crate::errors::SyncError;

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder  {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

fn client_with_headers(http: &HttpConfig, headers: header::HeaderMap) ->
    Result<Client, SyncError> {
    client_helper(http)
        .default_headers(headers)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SyncError::Http(format!("build client: {e}")))
}

pub fn base_client(http: &HttpConfig) -> Result<Client, SyncError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_with_headers(http, h)
}

#[derive(Clone, Debug)]
pub struct SpotifyClient {
    pub http: Client,
    pub cfg: SpotifyConfig
}

impl SpotifyClient {
    pub fn new(http_config: &HttpConfig, cfg: &SpotifyConfig) ->
        Result<Self, SyncError> {

        let http = base_client(http_config)?;
        Ok( Self {
            http,
            cfg: cfg.clone()
        })
    }

    /// POST /api/token, form encoded client credentials grant
    pub fn token_request(&self) -> RequestBuilder {
        self.http
            .post(self.cfg.token_url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", self.cfg.client_secret.as_str())
            ])
    }

    /// GET /v1/artists?ids=...
    pub fn artists(&self, ids_csv: &str, bearer: &str) ->
        Result<RequestBuilder, SyncError> {
        let url = self.cfg.api_base.join("artists")?;
        Ok(self.http.get(url).bearer_auth(bearer).query(&[("ids", ids_csv)]))
    }

    /// GET /v1/artists/{id}/albums?limit=&offset=0[&include_groups=]
    pub fn artist_albums(
        &self,
        artist_id: &str,
        limit: u32,
        include_groups: Option<&str>,
        bearer: &str
    ) -> Result<RequestBuilder, SyncError> {
        let url = self.cfg.api_base.join(&format!("artists/{artist_id}/albums"))?;
        let mut query = vec![
            ("limit", limit.to_string()),
            ("offset", "0".to_string())
        ];
        if let Some(groups) = include_groups {
            query.push(("include_groups", groups.to_string()));
        }
        Ok(self.http.get(url).bearer_auth(bearer).query(&query))
    }

    /// GET on a `next` cursor handed back by a previous page
    pub fn page(&self, cursor: Url, bearer: &str) -> RequestBuilder {
        self.http.get(cursor).bearer_auth(bearer)
    }
}

///
/// Reads a web api response. Non-2xx turns into Api failure from the
/// error envelope; an empty or non-json 2xx is an Api failure carrying
/// the success status. Returns the status alongside so callers can flag
/// missing envelope fields the same way.
///
async fn decode_api<T: DeserializeOwned>(response: Response) ->
    Result<(u16, T), SyncError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(match serde_json::from_str::<ApiErrorEnvelope>(&body) {
            Ok(envelope) => SyncError::api(envelope.error.status, envelope.error.message),
            Err(_) if body.trim().is_empty() => SyncError::api(
                status.as_u16(),
                status.canonical_reason().unwrap_or("http error")
            ),
            Err(_) => SyncError::api(status.as_u16(), body),
        });
    }

    if body.trim().is_empty() {
        return Err(SyncError::api(status.as_u16(), "empty body"));
    }
    let value = serde_json::from_str::<T>(&body)
        .map_err(|e| SyncError::api(status.as_u16(), format!("malformed body: {e}")))?;
    Ok((status.as_u16(), value))
}

///
/// Where a sync run gets its raw catalog data from
///
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_artists(&self) -> Result<Vec<ArtistWire>, SyncError>;
    async fn fetch_albums(&self) -> Result<Vec<AlbumWire>, SyncError>;
}

pub struct CatalogFetcher {
    client: SpotifyClient,
    credentials: Arc<CredentialCache>,
    catalog: CatalogConfig
}

impl CatalogFetcher {
    pub fn new(
        client: SpotifyClient,
        credentials: Arc<CredentialCache>,
        catalog: &CatalogConfig
    ) -> Self {
        Self { client, credentials, catalog: catalog.clone() }
    }

    /// Every page of one artist's albums, in page order
    async fn fetch_artist_albums(&self, artist_id: &str) ->
        Result<Vec<AlbumWire>, SyncError> {
        let mut items: Vec<AlbumWire> = Vec::new();
        let mut cursor: Option<Url> = None;
        let mut pages = 0_u32;

        loop {
            // credential is checked per request, it may lapse mid-run
            let credential = self.credentials.acquire().await?;
            let request = match cursor.take() {
                None => self.client.artist_albums(
                    artist_id,
                    self.catalog.album_page_limit,
                    self.catalog.album_include_groups.as_deref(),
                    &credential.token
                )?,
                Some(url) => self.client.page(url, &credential.token),
            };

            let (status, page): (u16, AlbumPage) = decode_api(request.send().await?).await?;
            let batch = page.items
                .ok_or_else(|| SyncError::api(status, "empty body"))?;
            pages += 1;
            debug!(
                artist = %artist_id, page = pages, items = batch.len(),
                total = ?page.total, "fetch.albums.page"
            );
            items.extend(batch);

            let Some(next) = page.next else { break };
            if pages >= self.catalog.max_album_pages {
                warn!(
                    artist = %artist_id, pages, fetched = items.len(),
                    total = ?page.total, "fetch.albums.page_cap"
                );
                break;
            }

            let url = Url::parse(&next).map_err(|e| SyncError::api(
                status, format!("bad next cursor {next}: {e}")
            ))?;
            if url.origin() != self.client.cfg.api_base.origin() {
                return Err(SyncError::api(
                    status, format!("next cursor leaves api origin: {next}")
                ));
            }
            cursor = Some(url);
        }
        Ok(items)
    }
}

#[async_trait]
impl CatalogSource for CatalogFetcher {
    async fn fetch_artists(&self) -> Result<Vec<ArtistWire>, SyncError> {
        let credential = self.credentials.acquire().await?;
        let ids = self.catalog.artist_ids.join(",");
        let response = self.client.artists(&ids, &credential.token)?
            .send()
            .await?;

        let (status, envelope): (u16, ArtistsEnvelope) = decode_api(response).await?;
        let slots = envelope.artists
            .ok_or_else(|| SyncError::api(status, "empty body"))?;

        let requested = slots.len();
        let artists: Vec<ArtistWire> = slots.into_iter().flatten().collect();
        if artists.len() < requested {
            warn!(requested, found = artists.len(), "fetch.artists.unknown_ids");
        }
        debug!(count = artists.len(), "fetch.artists.done");
        Ok(artists)
    }

    async fn fetch_albums(&self) -> Result<Vec<AlbumWire>, SyncError> {
        let mut albums: Vec<AlbumWire> = Vec::new();
        for artist_id in &self.catalog.artist_ids {
            let fetched = self.fetch_artist_albums(artist_id).await?;
            debug!(artist = %artist_id, count = fetched.len(), "fetch.albums.artist");
            albums.extend(fetched);
        }
        debug!(count = albums.len(), "fetch.albums.done");
        Ok(albums)
    }
}
