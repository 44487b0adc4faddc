//!
//! src/mapper.rs
//!
//! Wire payloads into storage records. Pure, total: anything the catalog
//! left out becomes an empty collection, zero or None.
//!

use crate::types::{AlbumRecord, ArtistRecord, Image, Links, SimplifiedArtist};
use crate::wire::{AlbumWire, ArtistWire, ExternalUrls, ImageWire, SimplifiedArtistWire};

fn external_url(urls: Option<ExternalUrls>) -> Option<String> {
    urls.and_then(|u| u.spotify)
}

fn images(images: Option<Vec<ImageWire>>) -> Vec<Image> {
    images.unwrap_or_default()
        .into_iter()
        .map(|i| Image { url: i.url, height: i.height, width: i.width })
        .collect()
}

fn simplified_artist(artist: SimplifiedArtistWire) -> SimplifiedArtist {
    SimplifiedArtist {
        external_id: artist.id,
        name: artist.name,
        kind: artist.kind,
        links: Links {
            href: artist.href,
            uri: artist.uri,
            external_url: external_url(artist.external_urls)
        }
    }
}

pub fn artist_from_wire(artist: ArtistWire) -> ArtistRecord {
    ArtistRecord {
        id: None,
        external_id: artist.id,
        name: artist.name,
        followers: artist.followers.map(|f| f.total).unwrap_or(0),
        genres: artist.genres.unwrap_or_default(),
        popularity: artist.popularity.unwrap_or(0),
        images: images(artist.images),
        links: Links {
            href: artist.href,
            uri: artist.uri,
            external_url: external_url(artist.external_urls)
        },
        last_manual_edit: None,
        last_synchronized: None
    }
}

pub fn album_from_wire(album: AlbumWire) -> AlbumRecord {
    AlbumRecord {
        id: None,
        external_id: album.id,
        name: album.name,
        album_type: album.album_type,
        total_tracks: album.total_tracks,
        release_date: album.release_date,
        release_date_precision: album.release_date_precision,
        album_group: album.album_group,
        artists: album.artists.unwrap_or_default()
            .into_iter()
            .map(simplified_artist)
            .collect(),
        restriction_reason: album.restrictions.and_then(|r| r.reason),
        images: images(album.images),
        links: Links {
            href: album.href,
            uri: album.uri,
            external_url: external_url(album.external_urls)
        },
        last_manual_edit: None,
        last_synchronized: None
    }
}
