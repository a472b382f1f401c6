//! Index records and on-disk document shapes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::metadata::TrackMetadata;
use crate::quality::Quality;

/// Version of the `db.json` document. Any other version forces a rescan.
pub const SCHEMA_VERSION: u32 = 2;

/// Logical context that caused an audio file to exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Owner {
    /// Downloaded as part of an album.
    Album {
        /// Album id.
        album_id: u64,
    },
    /// Downloaded or mirrored for a playlist.
    Playlist {
        /// Playlist id.
        playlist_id: u64,
    },
    /// Downloaded as part of an artist's discography.
    Artist {
        /// Artist id.
        artist_id: u64,
        /// Album the track was downloaded through.
        album_id: u64,
    },
    /// Single-track request with no collection context.
    AdHoc,
}

impl Owner {
    /// Album id carried by the context, if any.
    #[must_use]
    pub const fn album_id(&self) -> Option<u64> {
        match self {
            Self::Album { album_id } | Self::Artist { album_id, .. } => Some(*album_id),
            Self::Playlist { .. } | Self::AdHoc => None,
        }
    }

    /// Playlist id carried by the context, if any.
    #[must_use]
    pub const fn playlist_id(&self) -> Option<u64> {
        match self {
            Self::Playlist { playlist_id } => Some(*playlist_id),
            _ => None,
        }
    }

    /// Whether committing in this context needs an album.
    #[must_use]
    pub const fn requires_album(&self) -> bool {
        matches!(self, Self::Album { .. } | Self::Artist { .. })
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Album { album_id } => write!(f, "album {album_id}"),
            Self::Playlist { playlist_id } => write!(f, "playlist {playlist_id}"),
            Self::Artist {
                artist_id,
                album_id,
            } => write!(f, "artist {artist_id} album {album_id}"),
            Self::AdHoc => f.write_str("ad hoc"),
        }
    }
}

/// Ownership record attached to a quality entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnershipTag {
    /// Originating context.
    pub owner: Owner,
    /// Bitrate code the file was requested at.
    #[serde(default)]
    pub bitrate: Option<u32>,
}

impl OwnershipTag {
    /// Tag `owner` with the bitrate code of `quality`.
    #[must_use]
    pub const fn new(owner: Owner, quality: &Quality) -> Self {
        Self {
            owner,
            bitrate: quality.bitrate(),
        }
    }
}

/// Add `tag` unless a tag with the same owner is already present.
///
/// Returns `true` if the list changed.
pub fn add_owner(owners: &mut Vec<OwnershipTag>, tag: OwnershipTag) -> bool {
    if owners.iter().any(|t| t.owner == tag.owner) {
        return false;
    }
    owners.push(tag);
    true
}

/// One stored quality variant of a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityEntry {
    /// Audio file backing this variant.
    pub path: PathBuf,
    /// Contexts that caused this file to exist.
    #[serde(default)]
    pub owners: Vec<OwnershipTag>,
    /// Size in bytes at the time of indexing.
    #[serde(default)]
    pub size: u64,
    /// Modification time in Unix milliseconds at the time of indexing.
    #[serde(default)]
    pub modified_ms: u64,
}

/// Index record of a downloaded track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEntry {
    /// Track id.
    pub track_id: u64,
    /// Album the canonical copy lives under, if known.
    #[serde(default)]
    pub album_id: Option<u64>,
    /// Cached `track.json`.
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    /// Cover of the owning album.
    #[serde(default)]
    pub cover_path: Option<PathBuf>,
    /// Stored variants by tier.
    #[serde(default)]
    pub qualities: BTreeMap<Quality, QualityEntry>,
}

impl TrackEntry {
    /// Empty record for `track_id`.
    #[must_use]
    pub const fn new(track_id: u64) -> Self {
        Self {
            track_id,
            album_id: None,
            metadata_path: None,
            cover_path: None,
            qualities: BTreeMap::new(),
        }
    }

    /// Whether every stored variant was caused by `playlist_id` alone.
    ///
    /// A variant with no ownership tag is never exclusive, and neither is a
    /// track with no variants.
    #[must_use]
    pub fn is_exclusively_owned_by_playlist(&self, playlist_id: u64) -> bool {
        let expected = Owner::Playlist { playlist_id };
        !self.qualities.is_empty()
            && self.qualities.values().all(|q| {
                !q.owners.is_empty() && q.owners.iter().all(|t| t.owner == expected)
            })
    }

    /// Whether any variant carries `owner`.
    #[must_use]
    pub fn has_owner(&self, owner: &Owner) -> bool {
        self.qualities
            .values()
            .any(|q| q.owners.iter().any(|t| &t.owner == owner))
    }
}

/// Index record of an album with at least one downloaded track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumEntry {
    /// Album id.
    pub album_id: u64,
    /// Album title.
    #[serde(default)]
    pub title: Option<String>,
    /// Album artist name.
    #[serde(default)]
    pub artist: Option<String>,
    /// Album artist id.
    #[serde(default)]
    pub artist_id: Option<u64>,
    /// Cached `album.json`.
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    /// Album cover image.
    #[serde(default)]
    pub cover_path: Option<PathBuf>,
    /// Tracks actually downloaded for this album.
    #[serde(default)]
    pub track_ids: Vec<u64>,
    /// Every track id known from metadata.
    #[serde(default)]
    pub all_track_ids: Option<Vec<u64>>,
}

impl AlbumEntry {
    /// Empty record for `album_id`.
    #[must_use]
    pub const fn new(album_id: u64) -> Self {
        Self {
            album_id,
            title: None,
            artist: None,
            artist_id: None,
            metadata_path: None,
            cover_path: None,
            track_ids: Vec::new(),
            all_track_ids: None,
        }
    }
}

/// Index record of a playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    /// Playlist id.
    pub playlist_id: u64,
    /// Playlist title.
    #[serde(default)]
    pub title: Option<String>,
    /// Cached `playlist.json`.
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    /// `items.json`.
    #[serde(default)]
    pub items_path: Option<PathBuf>,
    /// Tracks belonging to the playlist.
    #[serde(default)]
    pub track_ids: Vec<u64>,
}

impl PlaylistEntry {
    /// Empty record for `playlist_id`.
    #[must_use]
    pub const fn new(playlist_id: u64) -> Self {
        Self {
            playlist_id,
            title: None,
            metadata_path: None,
            items_path: None,
            track_ids: Vec::new(),
        }
    }
}

/// The persisted index, `db.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Document schema version.
    pub schema_version: u32,
    /// Last save time in Unix milliseconds.
    #[serde(default)]
    pub updated_at: u64,
    /// Tracks by id.
    #[serde(default)]
    pub tracks: BTreeMap<u64, TrackEntry>,
    /// Albums by id.
    #[serde(default)]
    pub albums: BTreeMap<u64, AlbumEntry>,
    /// Playlists by id.
    #[serde(default)]
    pub playlists: BTreeMap<u64, PlaylistEntry>,
}

impl Default for IndexDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            updated_at: 0,
            tracks: BTreeMap::new(),
            albums: BTreeMap::new(),
            playlists: BTreeMap::new(),
        }
    }
}

/// A track's presence inside one playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistDownload {
    /// Mirror audio file.
    pub path: PathBuf,
    /// Stored tier.
    pub quality: Quality,
    /// Mirror time in Unix milliseconds.
    #[serde(default)]
    pub downloaded_at: u64,
}

/// A playlist's `items.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItems {
    /// Playlist id.
    pub playlist_id: u64,
    /// Tracks in playlist order.
    #[serde(default)]
    pub track_ids: Vec<u64>,
    /// Mirrored tracks by id.
    #[serde(default)]
    pub downloads: BTreeMap<u64, PlaylistDownload>,
}

impl PlaylistItems {
    /// Empty items document for `playlist_id`.
    #[must_use]
    pub const fn new(playlist_id: u64) -> Self {
        Self {
            playlist_id,
            track_ids: Vec::new(),
            downloads: BTreeMap::new(),
        }
    }
}

/// A per-quality `track.json` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDocument {
    /// Normalized track metadata.
    pub track: TrackMetadata,
    /// Stored tier.
    pub quality: Quality,
    /// Contexts that caused the file to exist.
    #[serde(default)]
    pub owners: Vec<OwnershipTag>,
    /// Commit time in Unix milliseconds.
    #[serde(default)]
    pub downloaded_at: u64,
}

/// Result of resolving a track to an audio file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTrack {
    /// Track id.
    pub track_id: u64,
    /// Album the file lives under, if any.
    pub album_id: Option<u64>,
    /// Tier that was selected.
    pub quality: Quality,
    /// Audio file.
    pub path: PathBuf,
    /// Whether the file existed with nonzero size when resolved.
    pub exists: bool,
    /// File size in bytes.
    pub size: u64,
}

/// A track as listed for the "downloaded" view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedTrack {
    /// Track id.
    pub track_id: u64,
    /// Album the canonical copy lives under, if any.
    pub album_id: Option<u64>,
    /// Valid stored tiers, best first.
    pub qualities: Vec<Quality>,
    /// Audio file of the best valid tier.
    pub path: PathBuf,
    /// Cover of the owning album.
    pub cover_path: Option<PathBuf>,
}

/// A playlist as listed for the "downloaded" view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedPlaylist {
    /// Playlist id.
    pub playlist_id: u64,
    /// Playlist title.
    pub title: Option<String>,
    /// Number of tracks in the playlist.
    pub track_count: usize,
    /// Number of those tracks available offline.
    pub downloaded_count: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn quality_entry(owners: Vec<OwnershipTag>) -> QualityEntry {
        QualityEntry {
            path: PathBuf::from("/lib/a.mp3"),
            owners,
            size: 1,
            modified_ms: 0,
        }
    }

    fn playlist_tag(playlist_id: u64) -> OwnershipTag {
        OwnershipTag::new(Owner::Playlist { playlist_id }, &Quality::Mp3_320)
    }

    #[test]
    fn test_owner_serialization() {
        let json = serde_json::to_value(Owner::Artist {
            artist_id: 7,
            album_id: 55,
        })
        .unwrap();
        assert_eq!(json["kind"], "artist");
        assert_eq!(json["artist_id"], 7);
        assert_eq!(
            serde_json::to_value(Owner::AdHoc).unwrap()["kind"],
            "ad_hoc"
        );
    }

    #[test]
    fn test_add_owner_dedups_by_owner() {
        let mut owners = Vec::new();
        assert!(add_owner(&mut owners, playlist_tag(1)));
        assert!(!add_owner(
            &mut owners,
            OwnershipTag::new(Owner::Playlist { playlist_id: 1 }, &Quality::Flac)
        ));
        assert!(add_owner(&mut owners, playlist_tag(2)));
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn test_exclusive_playlist_ownership() {
        let mut track = TrackEntry::new(101);
        assert!(!track.is_exclusively_owned_by_playlist(9001));

        track
            .qualities
            .insert(Quality::Mp3_320, quality_entry(vec![playlist_tag(9001)]));
        assert!(track.is_exclusively_owned_by_playlist(9001));
        assert!(!track.is_exclusively_owned_by_playlist(9002));

        track.qualities.insert(Quality::Flac, quality_entry(vec![]));
        assert!(!track.is_exclusively_owned_by_playlist(9001));

        track.qualities.insert(
            Quality::Flac,
            quality_entry(vec![
                playlist_tag(9001),
                OwnershipTag::new(Owner::Album { album_id: 55 }, &Quality::Flac),
            ]),
        );
        assert!(!track.is_exclusively_owned_by_playlist(9001));
    }

    #[test]
    fn test_index_document_keys_are_strings() {
        let mut doc = IndexDocument::default();
        doc.tracks.insert(101, TrackEntry::new(101));
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["tracks"].get("101").is_some());
        let back: IndexDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }
}
