//! Normalization of upstream catalog metadata.
//!
//! Track, album and playlist documents arrive in several upstream shapes with
//! inconsistent field names (`id` vs `SNG_ID`, nested `album.id` vs flat
//! `ALB_ID`, numbers encoded as strings). They are normalized here, once, into
//! small internal records; the rest of the crate only sees those.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const TRACK_ID: &[&str] = &["id", "SNG_ID", "track_id", "trackId"];
const TRACK_TITLE: &[&str] = &["title", "SNG_TITLE", "name", "title_short"];
const ARTIST_NAME: &[&str] = &["artist.name", "ART_NAME", "artist_name", "artistName", "artist"];
const ARTIST_ID: &[&str] = &["artist.id", "ART_ID", "artist_id", "artistId"];
const ALBUM_ID: &[&str] = &["album.id", "ALB_ID", "album_id", "albumId"];
const ALBUM_TITLE: &[&str] = &["album.title", "ALB_TITLE", "album_title", "albumTitle"];
const DURATION: &[&str] = &["duration", "DURATION", "duration_secs"];
const TRACK_NUMBER: &[&str] = &["track_position", "TRACK_NUMBER", "track_number", "position"];
const TRACK_COVERS: &[&str] = &[
    "album.cover_xl",
    "album.cover_big",
    "album.cover_medium",
    "album.cover",
    "cover_xl",
    "cover_big",
    "cover",
    "cover_url",
];

const ALBUM_OWN_ID: &[&str] = &["id", "ALB_ID", "album_id", "albumId"];
const ALBUM_OWN_TITLE: &[&str] = &["title", "ALB_TITLE", "name"];
const COLLECTION_COVERS: &[&str] = &[
    "cover_xl",
    "cover_big",
    "cover_medium",
    "cover",
    "picture_xl",
    "picture_big",
    "picture",
    "cover_url",
];
const TRACK_LISTS: &[&str] = &["tracks.data", "tracks", "SONGS.data", "songs"];
const TRACK_ID_LISTS: &[&str] = &["track_ids", "trackIds"];

const PLAYLIST_ID: &[&str] = &["id", "PLAYLIST_ID", "playlist_id", "playlistId"];
const PLAYLIST_TITLE: &[&str] = &["title", "TITLE", "name"];

/// Normalized track metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrackMetadata {
    /// Track id.
    pub id: u64,
    /// Track title.
    #[serde(default)]
    pub title: Option<String>,
    /// Main artist name.
    #[serde(default)]
    pub artist_name: Option<String>,
    /// Main artist id.
    #[serde(default)]
    pub artist_id: Option<u64>,
    /// Album id, if the track's album is known.
    #[serde(default)]
    pub album_id: Option<u64>,
    /// Album title.
    #[serde(default)]
    pub album_title: Option<String>,
    /// Duration in seconds.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Position within the album.
    #[serde(default)]
    pub track_number: Option<u32>,
    /// Cover URL candidates, best first.
    #[serde(default)]
    pub cover_urls: Vec<String>,
}

/// Normalized album metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AlbumMetadata {
    /// Album id.
    pub id: u64,
    /// Album title.
    #[serde(default)]
    pub title: Option<String>,
    /// Album artist name.
    #[serde(default)]
    pub artist_name: Option<String>,
    /// Album artist id.
    #[serde(default)]
    pub artist_id: Option<u64>,
    /// Every track id known for the album, in album order.
    #[serde(default)]
    pub track_ids: Vec<u64>,
    /// Track metadata embedded in the album document, if any.
    #[serde(default)]
    pub tracks: Vec<TrackMetadata>,
    /// Cover URL candidates, best first.
    #[serde(default)]
    pub cover_urls: Vec<String>,
}

/// Normalized playlist metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlaylistMetadata {
    /// Playlist id.
    pub id: u64,
    /// Playlist title.
    #[serde(default)]
    pub title: Option<String>,
    /// Track ids in playlist order.
    #[serde(default)]
    pub track_ids: Vec<u64>,
    /// Track metadata embedded in the playlist document, if any.
    #[serde(default)]
    pub tracks: Vec<TrackMetadata>,
    /// Cover URL candidates, best first.
    #[serde(default)]
    pub cover_urls: Vec<String>,
}

impl TrackMetadata {
    /// Normalize an upstream track document. `None` without a positive id.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = first_id(value, TRACK_ID)?;
        Some(Self {
            id,
            title: first_string(value, TRACK_TITLE),
            artist_name: first_string(value, ARTIST_NAME),
            artist_id: first_id(value, ARTIST_ID),
            album_id: first_id(value, ALBUM_ID),
            album_title: first_string(value, ALBUM_TITLE),
            duration_secs: first_u64(value, DURATION),
            track_number: first_u64(value, TRACK_NUMBER).and_then(|n| u32::try_from(n).ok()),
            cover_urls: all_strings(value, TRACK_COVERS),
        })
    }

    /// Fill fields this record lacks from `other`.
    pub fn merge_missing(&mut self, other: &Self) {
        fill(&mut self.title, &other.title);
        fill(&mut self.artist_name, &other.artist_name);
        fill(&mut self.artist_id, &other.artist_id);
        fill(&mut self.album_id, &other.album_id);
        fill(&mut self.album_title, &other.album_title);
        fill(&mut self.duration_secs, &other.duration_secs);
        fill(&mut self.track_number, &other.track_number);
        if self.cover_urls.is_empty() {
            self.cover_urls.clone_from(&other.cover_urls);
        }
    }
}

impl AlbumMetadata {
    /// Normalize an upstream album document. `None` without a positive id.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = first_id(value, ALBUM_OWN_ID)?;
        let tracks = embedded_tracks(value);
        let mut track_ids: Vec<u64> = tracks.iter().map(|t| t.id).collect();
        if track_ids.is_empty() {
            track_ids = id_list(value, TRACK_ID_LISTS);
        }
        Some(Self {
            id,
            title: first_string(value, ALBUM_OWN_TITLE),
            artist_name: first_string(value, ARTIST_NAME),
            artist_id: first_id(value, ARTIST_ID),
            track_ids,
            tracks,
            cover_urls: all_strings(value, COLLECTION_COVERS),
        })
    }

    /// Minimal album record derived from a track's album fields.
    #[must_use]
    pub fn from_track(track: &TrackMetadata) -> Option<Self> {
        Some(Self {
            id: track.album_id?,
            title: track.album_title.clone(),
            artist_name: track.artist_name.clone(),
            artist_id: track.artist_id,
            track_ids: Vec::new(),
            tracks: Vec::new(),
            cover_urls: track.cover_urls.clone(),
        })
    }

    /// Embedded metadata for one of the album's tracks.
    #[must_use]
    pub fn track(&self, track_id: u64) -> Option<&TrackMetadata> {
        self.tracks.iter().find(|t| t.id == track_id)
    }
}

impl PlaylistMetadata {
    /// Normalize an upstream playlist document. `None` without a positive id.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = first_id(value, PLAYLIST_ID)?;
        let tracks = embedded_tracks(value);
        let mut track_ids: Vec<u64> = tracks.iter().map(|t| t.id).collect();
        if track_ids.is_empty() {
            track_ids = id_list(value, TRACK_ID_LISTS);
        }
        Some(Self {
            id,
            title: first_string(value, PLAYLIST_TITLE),
            track_ids,
            tracks,
            cover_urls: all_strings(value, COLLECTION_COVERS),
        })
    }

    /// Embedded metadata for one of the playlist's tracks.
    #[must_use]
    pub fn track(&self, track_id: u64) -> Option<&TrackMetadata> {
        self.tracks.iter().find(|t| t.id == track_id)
    }
}

fn fill<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

/// Look up a dotted path (`album.id`) in a JSON value.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, key| current.get(key))
        .filter(|v| !v.is_null())
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_u64(value: &Value, paths: &[&str]) -> Option<u64> {
    paths.iter().find_map(|p| lookup(value, p).and_then(as_u64))
}

fn first_id(value: &Value, paths: &[&str]) -> Option<u64> {
    paths
        .iter()
        .find_map(|p| lookup(value, p).and_then(as_u64).filter(|id| *id > 0))
}

fn first_string(value: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| {
        lookup(value, p)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    })
}

fn all_strings(value: &Value, paths: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for path in paths {
        if let Some(s) = lookup(value, path).and_then(Value::as_str)
            && !s.trim().is_empty()
            && !out.iter().any(|existing| existing == s)
        {
            out.push(s.to_string());
        }
    }
    out
}

fn embedded_tracks(value: &Value) -> Vec<TrackMetadata> {
    TRACK_LISTS
        .iter()
        .find_map(|p| lookup(value, p).and_then(Value::as_array))
        .map(|items| items.iter().filter_map(TrackMetadata::from_value).collect())
        .unwrap_or_default()
}

fn id_list(value: &Value, paths: &[&str]) -> Vec<u64> {
    paths
        .iter()
        .find_map(|p| lookup(value, p).and_then(Value::as_array))
        .map(|items| items.iter().filter_map(as_u64).filter(|id| *id > 0).collect())
        .unwrap_or_default()
}
