//!
//! src/errors.rs
//!
//! Defines the error enum shared by every stage of the sync service
//! and the conversions from the library errors it wraps
//!
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Identity endpoint rejected the client or answered with a malformed body
    #[error("auth failure: {reason}: {detail}")]
    Auth { reason: String, detail: String },
    /// Catalog endpoint answered with an error or a malformed success body
    #[error("api failure ({status}): {message}")]
    Api { status: u16, message: String },
    /// Record existed at the existence check but was gone when we went to refresh it
    #[error("record vanished during refresh: {external_id}")]
    RecordVanished { external_id: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} already exists: {external_id}")]
    AlreadyExists { kind: &'static str, external_id: String },
    #[error("provided id {path_id} does not match record id {record_id:?}")]
    IdMismatch { path_id: i64, record_id: Option<i64> }
}

impl SyncError {
    pub fn auth(reason: impl Into<String>, detail: impl Into<String>) -> Self {
        SyncError::Auth { reason: reason.into(), detail: detail.into() }
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        SyncError::Api { status, message: message.into() }
    }

    /// Errors raised while talking to upstream; a run that hits one of these
    /// never reaches storage
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self,
            SyncError::Auth { .. } | SyncError::Api { .. } | SyncError::Http(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self { SyncError::Http(e.to_string()) }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self { SyncError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self { SyncError::Db(e.to_string()) }
}

impl From<url::ParseError> for SyncError {
    fn from(e: url::ParseError) -> Self { SyncError::Config(format!("bad url: {e}")) }
}
