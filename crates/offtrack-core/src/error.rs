//! Error types for Offtrack core operations.
//!
//! Every failure carries an [`ErrorKind`] whose wire code (`bad_request`,
//! `not_found`, ...) is what the UI layer switches on. Operations that must not
//! leave a download in an indeterminate state report failures as an
//! [`ErrorResponse`] instead of propagating the error.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// File system failures, each carrying the offending path.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// A path that was expected to exist does not.
    #[error("Path not found: {path}")]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// Reading a file or directory failed.
    #[error("Failed to read {path}: {reason}")]
    ReadFailed {
        /// Path being read.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Writing a file failed.
    #[error("Failed to write {path}: {reason}")]
    WriteFailed {
        /// Path being written.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Creating a directory failed.
    #[error("Failed to create directory {path}: {reason}")]
    CreateDirFailed {
        /// Directory being created.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Deleting a file or directory failed.
    #[error("Failed to delete {path}: {reason}")]
    DeleteFailed {
        /// Path being deleted.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Copying a file failed.
    #[error("Failed to copy {source_path} to {destination}: {reason}")]
    CopyFailed {
        /// Source file.
        source_path: PathBuf,
        /// Destination file.
        destination: PathBuf,
        /// Underlying reason.
        reason: String,
    },
}

/// Errors that can occur in Offtrack core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid identifiers in a request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resolve or remove on an entry that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The catalog returned no usable metadata for a track.
    #[error("Missing metadata for track {track_id}")]
    MissingTrackMetadata {
        /// Track that could not be described.
        track_id: u64,
    },

    /// The track has no album and the request context requires one.
    #[error("Track {track_id} has no album context")]
    MissingAlbumContext {
        /// Track without album.
        track_id: u64,
    },

    /// The catalog returned no usable metadata for an album.
    #[error("Missing metadata for album {album_id}")]
    MissingAlbumMetadata {
        /// Album that could not be described.
        album_id: u64,
    },

    /// Staging finished but produced no recognizable, non-empty audio file.
    #[error("No audio file produced in {staging}")]
    NoAudioFile {
        /// Staging directory that was searched.
        staging: PathBuf,
    },

    /// Moving staged audio into canonical storage failed, copy fallback included.
    #[error("Failed to move {from} to {to}: {reason}")]
    MoveFailed {
        /// Staged source file.
        from: PathBuf,
        /// Canonical destination.
        to: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Hard link and copy both failed while mirroring into a playlist.
    #[error("Failed to mirror track {track_id} into playlist {playlist_id}: {reason}")]
    MirrorFailed {
        /// Target playlist.
        playlist_id: u64,
        /// Mirrored track.
        track_id: u64,
        /// Underlying reason.
        reason: String,
    },

    /// The download was cancelled before it was committed.
    #[error("Download of track {track_id} was cancelled")]
    DownloadCancelled {
        /// Cancelled track.
        track_id: u64,
    },

    /// The external fetch capability failed.
    #[error("Download of track {track_id} failed: {message}")]
    DownloadFailed {
        /// Track being fetched.
        track_id: u64,
        /// Message reported by the fetch capability.
        message: String,
        /// Extra diagnostics (error chain, stack) when available.
        detail: Option<String>,
    },

    /// An index operation ran before the index was loaded.
    #[error("Library index is not loaded")]
    DbNotLoaded,

    /// File system operation failed.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Category of an [`Error`], serialized as its wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid identifiers.
    BadRequest,
    /// Entry does not exist.
    NotFound,
    /// Track metadata unavailable.
    MissingTrackMetadata,
    /// Album context unavailable.
    MissingAlbumContext,
    /// Album metadata unavailable.
    MissingAlbumMetadata,
    /// Staging produced nothing usable.
    NoAudioFile,
    /// Move into canonical storage failed.
    MoveFailed,
    /// Playlist mirror failed.
    MirrorFailed,
    /// Download cancelled.
    DownloadCancelled,
    /// External fetch failed.
    DownloadFailed,
    /// Index not loaded.
    DbNotLoaded,
    /// Other file system failure.
    #[serde(rename = "filesystem")]
    FileSystem,
    /// Configuration failure.
    Configuration,
    /// JSON failure.
    Serialization,
}

impl ErrorKind {
    /// The wire code for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::MissingTrackMetadata => "missing_track_metadata",
            Self::MissingAlbumContext => "missing_album_context",
            Self::MissingAlbumMetadata => "missing_album_metadata",
            Self::NoAudioFile => "no_audio_file",
            Self::MoveFailed => "move_failed",
            Self::MirrorFailed => "mirror_failed",
            Self::DownloadCancelled => "download_cancelled",
            Self::DownloadFailed => "download_failed",
            Self::DbNotLoaded => "db_not_loaded",
            Self::FileSystem => "filesystem",
            Self::Configuration => "configuration",
            Self::Serialization => "serialization",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Get the category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::MissingTrackMetadata { .. } => ErrorKind::MissingTrackMetadata,
            Self::MissingAlbumContext { .. } => ErrorKind::MissingAlbumContext,
            Self::MissingAlbumMetadata { .. } => ErrorKind::MissingAlbumMetadata,
            Self::NoAudioFile { .. } => ErrorKind::NoAudioFile,
            Self::MoveFailed { .. } => ErrorKind::MoveFailed,
            Self::MirrorFailed { .. } => ErrorKind::MirrorFailed,
            Self::DownloadCancelled { .. } => ErrorKind::DownloadCancelled,
            Self::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            Self::DbNotLoaded => ErrorKind::DbNotLoaded,
            Self::FileSystem(_) => ErrorKind::FileSystem,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Shorthand for a `not_found` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Shorthand for a `bad_request` error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

/// Structured failure shape handed to the UI layer.
///
/// Serializes as `{ "ok": false, "error": "<code>", "message": "...", "detail": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `false`.
    pub ok: bool,
    /// Error category for programmatic handling.
    pub error: ErrorKind,
    /// Human-readable error message.
    pub message: String,
    /// Extra diagnostics, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&Error> for ErrorResponse {
    fn from(e: &Error) -> Self {
        let detail = match e {
            Error::DownloadFailed { detail, .. } => detail.clone(),
            _ => None,
        };
        Self {
            ok: false,
            error: e.kind(),
            message: e.to_string(),
            detail,
        }
    }
}

impl From<Error> for ErrorResponse {
    fn from(e: Error) -> Self {
        Self::from(&e)
    }
}
