//!
//! src/wire.rs
//!
//! Serde shapes of what the Spotify accounts and web api send back.
//! Everything the catalog may leave out is optional or defaulted here so
//! that a sparse payload never fails to decode.
//!

use serde::Deserialize;

/// POST /api/token success
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64
}

/// POST /api/token failure
#[derive(Debug, Clone, Deserialize)]
pub struct AuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: String
}

/// Any web api failure: {"error": {"status": 401, "message": "..."}}
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorEnvelope {
    pub error: ApiErrorBody
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub status: u16,
    #[serde(default)]
    pub message: String
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExternalUrls {
    pub spotify: Option<String>
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ImageWire {
    pub url: String,
    pub height: Option<u32>,
    pub width: Option<u32>
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Followers {
    #[serde(default)]
    pub total: u64
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ArtistWire {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub href: Option<String>,
    pub uri: Option<String>,
    #[serde(default)]
    pub popularity: Option<u32>,
    #[serde(default)]
    pub followers: Option<Followers>,
    #[serde(default)]
    pub genres: Option<Vec<String>>,
    #[serde(default)]
    pub images: Option<Vec<ImageWire>>,
    #[serde(default)]
    pub external_urls: Option<ExternalUrls>
}

/// GET /artists?ids= ; unknown ids come back as null entries
#[derive(Debug, Clone, Deserialize)]
pub struct ArtistsEnvelope {
    pub artists: Option<Vec<Option<ArtistWire>>>
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SimplifiedArtistWire {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub href: Option<String>,
    pub uri: Option<String>,
    #[serde(default)]
    pub external_urls: Option<ExternalUrls>
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Restrictions {
    pub reason: Option<String>
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AlbumWire {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub album_type: String,
    #[serde(default)]
    pub total_tracks: u32,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub release_date_precision: String,
    pub album_group: Option<String>,
    #[serde(default)]
    pub artists: Option<Vec<SimplifiedArtistWire>>,
    #[serde(default)]
    pub restrictions: Option<Restrictions>,
    #[serde(default)]
    pub images: Option<Vec<ImageWire>>,
    pub href: Option<String>,
    pub uri: Option<String>,
    #[serde(default)]
    pub external_urls: Option<ExternalUrls>
}

/// GET /artists/{id}/albums paging object; only the fields the cursor
/// walk reads, serde skips the rest
#[derive(Debug, Clone, Deserialize)]
pub struct AlbumPage {
    pub items: Option<Vec<AlbumWire>>,
    pub next: Option<String>,
    pub total: Option<u32>
}
