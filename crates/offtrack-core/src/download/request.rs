//! Download requests, outcomes and events.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, ErrorResponse};
use crate::metadata::{AlbumMetadata, PlaylistMetadata, TrackMetadata};
use crate::model::Owner;
use crate::quality::Quality;

/// A request to store one track at one tier in one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Track to download.
    pub track_id: u64,
    /// Requested tier, before entitlement clamping.
    pub quality: Quality,
    /// Context the download is made for.
    pub owner: Owner,
    /// Track metadata already known to the caller.
    pub track: Option<TrackMetadata>,
    /// Album metadata already known to the caller.
    pub album: Option<AlbumMetadata>,
    /// Playlist metadata already known to the caller.
    pub playlist: Option<PlaylistMetadata>,
}

impl DownloadRequest {
    /// Ad hoc request for `track_id` at `quality`.
    #[must_use]
    pub const fn new(track_id: u64, quality: Quality) -> Self {
        Self {
            track_id,
            quality,
            owner: Owner::AdHoc,
            track: None,
            album: None,
            playlist: None,
        }
    }

    /// Set the owning context.
    #[must_use]
    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    /// Provide track metadata.
    #[must_use]
    pub fn with_track(mut self, track: Option<TrackMetadata>) -> Self {
        self.track = track;
        self
    }

    /// Provide album metadata.
    #[must_use]
    pub fn with_album(mut self, album: AlbumMetadata) -> Self {
        self.album = Some(album);
        self
    }

    /// Provide playlist metadata.
    #[must_use]
    pub fn with_playlist(mut self, playlist: PlaylistMetadata) -> Self {
        self.playlist = Some(playlist);
        self
    }
}

/// Identity of a job for deduplication: track and clamped tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    /// Track id.
    pub track_id: u64,
    /// Clamped tier.
    pub quality: Quality,
}

impl JobKey {
    /// Key for `(track_id, quality)`.
    #[must_use]
    pub const fn new(track_id: u64, quality: Quality) -> Self {
        Self { track_id, quality }
    }

    /// Staging directory name prefix for this key.
    #[must_use]
    pub fn staging_prefix(&self) -> String {
        format!("{}_{}", self.track_id, self.quality)
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.track_id, self.quality)
    }
}

/// Terminal result of a download job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    /// Whether the track is stored.
    pub ok: bool,
    /// Track id.
    pub track_id: u64,
    /// Tier after clamping.
    pub quality: Quality,
    /// Canonical audio file on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Whether the file was already present and nothing was fetched.
    #[serde(default)]
    pub already_downloaded: bool,
    /// Playlist mirror, when the request was playlist-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_path: Option<PathBuf>,
    /// Failure, when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
    /// Mirror failure, which does not undo a stored track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_error: Option<ErrorResponse>,
}

impl DownloadOutcome {
    /// Freshly stored track.
    #[must_use]
    pub const fn stored(track_id: u64, quality: Quality, path: PathBuf) -> Self {
        Self {
            ok: true,
            track_id,
            quality,
            path: Some(path),
            already_downloaded: false,
            mirror_path: None,
            error: None,
            mirror_error: None,
        }
    }

    /// Track that was already stored.
    #[must_use]
    pub const fn already(track_id: u64, quality: Quality, path: PathBuf) -> Self {
        let mut outcome = Self::stored(track_id, quality, path);
        outcome.already_downloaded = true;
        outcome
    }

    /// Failed job.
    #[must_use]
    pub fn failed(track_id: u64, quality: Quality, error: &Error) -> Self {
        Self {
            ok: false,
            track_id,
            quality,
            path: None,
            already_downloaded: false,
            mirror_path: None,
            error: Some(ErrorResponse::from(error)),
            mirror_error: None,
        }
    }

    /// Cancelled job.
    #[must_use]
    pub fn cancelled(track_id: u64, quality: Quality) -> Self {
        Self::failed(track_id, quality, &Error::DownloadCancelled { track_id })
    }

    /// Whether the job ended by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.error_kind() == Some(ErrorKind::DownloadCancelled)
    }

    /// Failure category, if the job failed.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.error)
    }
}

/// A collection whose tracks are downloaded as one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum GroupKey {
    /// Album download.
    Album(u64),
    /// Playlist download.
    Playlist(u64),
    /// Artist discography download.
    Artist(u64),
}

impl GroupKey {
    /// Whether a job made for `owner` belongs to this group.
    #[must_use]
    pub const fn contains(&self, owner: &Owner) -> bool {
        match (self, owner) {
            (Self::Album(id), Owner::Album { album_id }) => *id == *album_id,
            (Self::Playlist(id), Owner::Playlist { playlist_id }) => *id == *playlist_id,
            (Self::Artist(id), Owner::Artist { artist_id, .. }) => *id == *artist_id,
            _ => false,
        }
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Album(id) => write!(f, "album {id}"),
            Self::Playlist(id) => write!(f, "playlist {id}"),
            Self::Artist(id) => write!(f, "artist {id}"),
        }
    }
}

/// Tally of a group download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    /// The group.
    pub group: GroupKey,
    /// Tracks announced up front.
    pub total: usize,
    /// Tracks freshly stored.
    pub stored: usize,
    /// Tracks that were already stored.
    pub already_downloaded: usize,
    /// Tracks that failed.
    pub failed: usize,
    /// Tracks never started because the group was cancelled.
    pub skipped: usize,
    /// Whether the group was cancelled.
    pub cancelled: bool,
}

impl GroupSummary {
    /// Empty tally for `group` of `total` tracks.
    #[must_use]
    pub const fn new(group: GroupKey, total: usize) -> Self {
        Self {
            group,
            total,
            stored: 0,
            already_downloaded: 0,
            failed: 0,
            skipped: 0,
            cancelled: false,
        }
    }

    /// Count one finished job.
    pub fn record(&mut self, outcome: &DownloadOutcome) {
        if outcome.ok && outcome.already_downloaded {
            self.already_downloaded += 1;
        } else if outcome.ok {
            self.stored += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Progress and terminal events published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DownloadEvent {
    /// A group download began; `total` tracks will be processed.
    GroupStarted {
        /// The group.
        group: GroupKey,
        /// Number of tracks.
        total: usize,
    },
    /// A job started.
    TrackStarted {
        /// Track id.
        track_id: u64,
        /// Clamped tier.
        quality: Quality,
    },
    /// A job stored its track.
    TrackFinished {
        /// Track id.
        track_id: u64,
        /// Clamped tier.
        quality: Quality,
        /// Canonical audio file.
        path: PathBuf,
        /// Whether nothing was fetched.
        already_downloaded: bool,
    },
    /// A job failed.
    TrackFailed {
        /// Track id.
        track_id: u64,
        /// Clamped tier.
        quality: Quality,
        /// Structured failure.
        error: ErrorResponse,
    },
    /// A job was cancelled.
    TrackCancelled {
        /// Track id.
        track_id: u64,
        /// Clamped tier.
        quality: Quality,
    },
    /// A stored track could not be mirrored into its playlist.
    MirrorFailed {
        /// Track id.
        track_id: u64,
        /// Target playlist.
        playlist_id: u64,
        /// Structured failure.
        error: ErrorResponse,
    },
    /// A group download ended.
    GroupFinished {
        /// Final tally.
        summary: GroupSummary,
    },
}

impl DownloadEvent {
    /// Terminal event for a finished job.
    #[must_use]
    pub fn for_outcome(outcome: &DownloadOutcome) -> Self {
        let track_id = outcome.track_id;
        let quality = outcome.quality.clone();
        if let (true, Some(path)) = (outcome.ok, &outcome.path) {
            return Self::TrackFinished {
                track_id,
                quality,
                path: path.clone(),
                already_downloaded: outcome.already_downloaded,
            };
        }
        if outcome.is_cancelled() {
            return Self::TrackCancelled { track_id, quality };
        }
        let error = outcome.error.clone().unwrap_or_else(|| {
            ErrorResponse::from(&Error::DownloadFailed {
                track_id,
                message: "no result".to_string(),
                detail: None,
            })
        });
        Self::TrackFailed {
            track_id,
            quality,
            error,
        }
    }
}
