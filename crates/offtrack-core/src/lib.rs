//! `Offtrack` Core Library
//!
//! This crate keeps a disk-backed library of downloaded tracks:
//! - Canonical on-disk layout for albums, orphan tracks and playlist mirrors
//! - A JSON index (`db.json`) that rebuilds itself from disk when it cannot
//!   be trusted
//! - Download orchestration with entitlement clamping, deduplication of
//!   concurrent jobs, staging and atomic commits
//! - Ownership-aware deletion of tracks, albums and playlists
//! - Offline tracklists, cover healing and migration of legacy downloads
//!
//! # Error Handling
//!
//! Fallible operations return [`Result`]. Download jobs never fail outright:
//! they end with a [`DownloadOutcome`] carrying a structured
//! [`ErrorResponse`] on failure.
//!
//! ```rust,ignore
//! use offtrack_core::{LibraryConfig, OfflineLibrary, Quality};
//!
//! let library = OfflineLibrary::builder(LibraryConfig::load()?, catalog, fetcher).build()?;
//! let outcome = library.download_track(101, Some(&Quality::Flac)).await;
//! ```

pub mod artwork;
pub mod config;
pub mod deletion;
pub mod download;
pub mod error;
pub mod fetch;
pub mod index;
pub mod layout;
pub mod library;
pub mod logging;
pub mod metadata;
pub mod migrate;
pub mod mirror;
pub mod model;
pub mod offline;
pub mod quality;
pub mod scanner;
pub mod source;
pub mod store;

pub use artwork::{DEFAULT_FETCH_TIMEOUT_SECS, HealReport, HttpArtworkFetcher, heal_missing_covers};
pub use config::{LibraryConfig, default_library_directory, validate_library_directory};
pub use deletion::{
    PlaylistDeletion, QualitySelector, RemovalReport, delete_album_from_disk,
    delete_playlist_from_disk, remove_download_for_track,
};
pub use download::{
    DownloadEvent, DownloadOrchestrator, DownloadOutcome, DownloadRequest, GroupKey, GroupSummary,
    JobKey, StagedTrack, ensure_track_stored_from_staging,
};
pub use error::{Error, ErrorKind, ErrorResponse, FileSystemError, Result};
pub use fetch::{
    ArtworkFetcher, AudioFetcher, Catalog, Entitlements, FetchError, FetchRequest,
    StaticEntitlements,
};
pub use index::{LibraryIndex, PruneReport, SharedIndex};
pub use layout::{AUDIO_EXTENSIONS, PathLayout, is_audio_file};
pub use library::{OfflineLibrary, OfflineLibraryBuilder, SourceDownload};
pub use logging::{LogRotation, LoggingConfig, LoggingError, LoggingGuard, Verbosity};
pub use metadata::{AlbumMetadata, PlaylistMetadata, TrackMetadata};
pub use migrate::{MigrationReport, migrate_legacy};
pub use mirror::{CopyFile, HardLink, LinkStrategy, MirrorMethod, MirrorResult, PlaylistMirror};
pub use model::{
    AlbumEntry, DownloadedPlaylist, DownloadedTrack, IndexDocument, Owner, OwnershipTag,
    PlaylistDownload, PlaylistEntry, PlaylistItems, QualityEntry, ResolvedTrack, SCHEMA_VERSION,
    TrackDocument, TrackEntry,
};
pub use offline::{Collection, OfflineTrack, OfflineTracklist, offline_tracklist};
pub use quality::{KNOWN_QUALITIES, Quality};
pub use scanner::{has_downloaded_audio, scan_library};
pub use source::{SourceRef, parse_source};
