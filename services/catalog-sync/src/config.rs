//!
//! src/config.rs
//!
//! Reads the environment (and .env) into typed configuration for the
//! identity and catalog endpoints, the http client, storage, the
//! scheduler and the logger
//!

use std::str::FromStr;
use std::time;
use url::Url;
use crate::errors::SyncError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 8000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

/// Upper bound Spotify places on GET /artists?ids=
pub const MAX_ARTIST_IDS: usize = 50;
/// Upper bound Spotify places on the albums page size
pub const MAX_ALBUM_PAGE_LIMIT: u32 = 50;

/// Wrapper over env::var to return an invalid enviroment var error
fn env_check(s: &str) -> Result<String, SyncError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SyncError::Config(format!("{s} was not set"))),
    }
}

/// Optional env var parsed into T; unset falls back to default, garbage is an error
fn env_or<T: FromStr>(s: &str, default: T) -> Result<T, SyncError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse::<T>()
            .map_err(|_| SyncError::Config(format!("{s} invalid: {v}"))),
        _ => Ok(default),
    }
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

/// Url::join drops the last segment unless the base ends in '/'
pub fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
    url
}

fn parse_endpoint(var: &str, default: &str, host: &str) -> Result<Url, SyncError> {
    let raw = std::env::var(var).unwrap_or_else(|_| default.to_string());
    let url = Url::parse(&raw)
        .map_err(|e| SyncError::Config(format!("{var} invalid {e}")))?;

    ensure_https(&url).map_err(SyncError::Config)?;
    ensure_host(&url, host).map_err(SyncError::Config)?;
    Ok(url)
}

/// Configuration that Spotify expects when hitting endpoints
#[derive(Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: Url,
    pub api_base: Url,
}

impl std::fmt::Debug for SpotifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url.as_str())
            .field("api_base", &self.api_base.as_str())
            .finish()
    }
}

fn build_spotify() -> Result<SpotifyConfig, SyncError> {
    let client_id     = env_check("SPOTIFY_CLIENT_ID")?;
    let client_secret = env_check("SPOTIFY_CLIENT_SECRET")?;

    let token_url = parse_endpoint(
        "SPOTIFY_TOKEN_URL",
        "https://accounts.spotify.com/api/token",
        "accounts.spotify.com"
    )?;
    let api_base = parse_endpoint(
        "SPOTIFY_API_BASE",
        "https://api.spotify.com/v1/",
        "api.spotify.com"
    )?;

    Ok( SpotifyConfig {
        client_id,
        client_secret,
        token_url,
        api_base: with_trailing_slash(api_base)
    })
}

///
/// Which slice of the catalog gets mirrored
///
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub artist_ids: Vec<String>,
    pub album_page_limit: u32,
    pub album_include_groups: Option<String>,
    pub max_album_pages: u32
}

/// Splits a comma separated id list, dropping blanks and repeats
pub fn parse_artist_ids(raw: &str) -> Result<Vec<String>, SyncError> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SyncError::Config(format!("artist id not base62: {id}")));
        }
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }

    if ids.is_empty() {
        return Err(SyncError::Config("CATALOG_ARTIST_IDS is empty".into()));
    }
    if ids.len() > MAX_ARTIST_IDS {
        return Err(SyncError::Config(format!(
            "CATALOG_ARTIST_IDS has {} ids, at most {MAX_ARTIST_IDS} fit one request",
            ids.len()
        )));
    }
    Ok(ids)
}

fn build_catalog() -> Result<CatalogConfig, SyncError> {
    let artist_ids = parse_artist_ids(&env_check("CATALOG_ARTIST_IDS")?)?;

    let album_page_limit = env_or("CATALOG_ALBUM_PAGE_LIMIT", MAX_ALBUM_PAGE_LIMIT)?;
    if album_page_limit == 0 || album_page_limit > MAX_ALBUM_PAGE_LIMIT {
        return Err(SyncError::Config(format!(
            "CATALOG_ALBUM_PAGE_LIMIT must be within 1..={MAX_ALBUM_PAGE_LIMIT}"
        )));
    }

    let album_include_groups = std::env::var("CATALOG_ALBUM_INCLUDE_GROUPS")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let max_album_pages = env_or("CATALOG_MAX_ALBUM_PAGES", 20_u32)?.max(1);

    Ok( CatalogConfig {
        artist_ids, album_page_limit, album_include_groups, max_album_pages
    })
}

///
/// Configuration for Http timeouts, pooling, etc.
///
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
        }
    }
}

fn build_http() -> Result<HttpConfig, SyncError> {
    let timeout = env_or("HTTP_TIMEOUT_MS", HTTP_TIMEOUT)?;
    let connect_timeout = env_or("HTTP_CONNECT_TIMEOUT_MS", HTTP_CONNECT_TIMEOUT)?;
    if timeout == 0 || connect_timeout == 0 {
        return Err(SyncError::Config("http timeouts must be non-zero".into()));
    }

    Ok( HttpConfig {
        timeout: time::Duration::from_millis(timeout),
        connect_timeout: time::Duration::from_millis(connect_timeout),
        ..HttpConfig::default()
    })
}

///
/// Configuration for persistent storage in sqlite db
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { db_url: "sqlite:./data/catalog.db".to_string() }
    }
}

///
/// What a reconciliation batch does when a record disappears mid-refresh
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VanishedPolicy {
    /// report the external id and keep going with the batch
    #[default]
    Continue,
    /// fail the batch with RecordVanished
    Abort
}

impl VanishedPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            VanishedPolicy::Continue => "continue",
            VanishedPolicy::Abort    => "abort"
        }
    }
    pub fn parse(s: &str) -> Option<VanishedPolicy> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Some(VanishedPolicy::Continue),
            "abort"    => Some(VanishedPolicy::Abort),
            _ => None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: time::Duration,
    pub run_on_start: bool,
    pub on_vanished: VanishedPolicy
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: time::Duration::from_secs(60),
            run_on_start: true,
            on_vanished: VanishedPolicy::Continue
        }
    }
}

fn build_sync() -> Result<SyncConfig, SyncError> {
    let secs = env_or("SYNC_INTERVAL_SECS", 60_u64)?;
    if secs == 0 {
        return Err(SyncError::Config("SYNC_INTERVAL_SECS must be non-zero".into()));
    }
    let run_on_start = env_or("SYNC_RUN_ON_START", true)?;
    let on_vanished = match std::env::var("SYNC_ON_VANISHED") {
        Ok(v) => VanishedPolicy::parse(&v).ok_or_else(|| SyncError::Config(
            format!("SYNC_ON_VANISHED must be continue|abort, got {v}")
        ))?,
        Err(_) => VanishedPolicy::default()
    };

    Ok( SyncConfig {
        interval: time::Duration::from_secs(secs),
        run_on_start,
        on_vanished
    })
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,catalog_sync=debug,sqlx=warn,reqwest=warn".to_string(),
            format: LogFormat::Json,
            with_ansi: true,
            include_file_line: true,
            include_target: true,
        }
    }
}

fn build_logging() -> Result<LoggingConfig, SyncError> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("pretty") => LogFormat::Pretty,
        Ok("json") | Err(_) => LogFormat::Json,
        Ok(other) => return Err(SyncError::Config(
            format!("LOG_FORMAT must be json|pretty, got {other}")
        )),
    };
    Ok( LoggingConfig { format, ..LoggingConfig::default() })
}

///
/// AppConfig which holds everything the service needs at start up
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spotify: SpotifyConfig,
    pub catalog: CatalogConfig,
    pub http: HttpConfig,
    pub persistence: PersistenceConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, SyncError> {
    dotenvy::dotenv().ok();

    let spotify     = build_spotify()?;
    let catalog     = build_catalog()?;
    let http        = build_http()?;
    let persistence = PersistenceConfig {
        db_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| PersistenceConfig::default().db_url)
    };
    let sync        = build_sync()?;
    let logging     = build_logging()?;

    Ok( AppConfig { spotify, catalog, http, persistence, sync, logging } )
}
