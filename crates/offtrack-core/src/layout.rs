//! Canonical on-disk layout of the library.
//!
//! ```text
//! <root>/
//!   db.json
//!   albums/<albumId>/{album.json, cover.jpg, tracks/<trackId>/<quality>/{audio.<ext>, track.json}}
//!   playlists/<playlistId>/{playlist.json, items.json, tracks/<trackId>/<quality>/audio.<ext>}
//!   orphans/<trackId>/<quality>/{audio.<ext>, track.json}
//!   __staging/<jobId>/
//! ```
//!
//! Everything here is a pure path computation. No I/O.

use std::path::{Path, PathBuf};

use crate::quality::Quality;

/// Index file name.
pub const DB_FILE: &str = "db.json";
/// Album metadata document name.
pub const ALBUM_FILE: &str = "album.json";
/// Album cover image name.
pub const COVER_FILE: &str = "cover.jpg";
/// Per-quality track metadata document name.
pub const TRACK_FILE: &str = "track.json";
/// Playlist metadata document name.
pub const PLAYLIST_FILE: &str = "playlist.json";
/// Playlist items document name.
pub const ITEMS_FILE: &str = "items.json";
/// Stem of every canonical audio file.
pub const AUDIO_STEM: &str = "audio";

const ALBUMS_DIR: &str = "albums";
const PLAYLISTS_DIR: &str = "playlists";
const ORPHANS_DIR: &str = "orphans";
const STAGING_DIR: &str = "__staging";
const TRACKS_DIR: &str = "tracks";

/// Extensions recognized as audio.
pub const AUDIO_EXTENSIONS: [&str; 8] = ["flac", "mp3", "m4a", "mp4", "aac", "ogg", "opus", "wav"];

/// Check if a file is an audio file based on extension.
#[must_use]
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Path mapping rooted at the library directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLayout {
    root: PathBuf,
}

impl PathLayout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Library root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the persisted index.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    /// Directory holding all albums.
    #[must_use]
    pub fn albums_dir(&self) -> PathBuf {
        self.root.join(ALBUMS_DIR)
    }

    /// Directory of one album.
    #[must_use]
    pub fn album_dir(&self, album_id: u64) -> PathBuf {
        self.albums_dir().join(album_id.to_string())
    }

    /// Cached album metadata document.
    #[must_use]
    pub fn album_json(&self, album_id: u64) -> PathBuf {
        self.album_dir(album_id).join(ALBUM_FILE)
    }

    /// Album cover image.
    #[must_use]
    pub fn album_cover(&self, album_id: u64) -> PathBuf {
        self.album_dir(album_id).join(COVER_FILE)
    }

    /// Directory of one track inside an album.
    #[must_use]
    pub fn album_track_dir(&self, album_id: u64, track_id: u64) -> PathBuf {
        self.album_dir(album_id)
            .join(TRACKS_DIR)
            .join(track_id.to_string())
    }

    /// Directory of one quality variant of an album track.
    #[must_use]
    pub fn album_quality_dir(&self, album_id: u64, track_id: u64, quality: &Quality) -> PathBuf {
        self.album_track_dir(album_id, track_id)
            .join(quality.as_str())
    }

    /// Directory holding orphaned tracks (no resolvable album).
    #[must_use]
    pub fn orphans_dir(&self) -> PathBuf {
        self.root.join(ORPHANS_DIR)
    }

    /// Directory of one orphaned track.
    #[must_use]
    pub fn orphan_track_dir(&self, track_id: u64) -> PathBuf {
        self.orphans_dir().join(track_id.to_string())
    }

    /// Quality directory of a track, under its album or under `orphans/`.
    #[must_use]
    pub fn track_quality_dir(
        &self,
        album_id: Option<u64>,
        track_id: u64,
        quality: &Quality,
    ) -> PathBuf {
        match album_id {
            Some(album_id) => self.album_quality_dir(album_id, track_id, quality),
            None => self.orphan_track_dir(track_id).join(quality.as_str()),
        }
    }

    /// Canonical audio file of a track variant.
    #[must_use]
    pub fn track_audio_path(
        &self,
        album_id: Option<u64>,
        track_id: u64,
        quality: &Quality,
        extension: &str,
    ) -> PathBuf {
        self.track_quality_dir(album_id, track_id, quality)
            .join(audio_file_name(extension))
    }

    /// Cached track metadata document of a track variant.
    #[must_use]
    pub fn track_json(&self, album_id: Option<u64>, track_id: u64, quality: &Quality) -> PathBuf {
        self.track_quality_dir(album_id, track_id, quality)
            .join(TRACK_FILE)
    }

    /// Directory holding all playlists.
    #[must_use]
    pub fn playlists_dir(&self) -> PathBuf {
        self.root.join(PLAYLISTS_DIR)
    }

    /// Directory of one playlist.
    #[must_use]
    pub fn playlist_dir(&self, playlist_id: u64) -> PathBuf {
        self.playlists_dir().join(playlist_id.to_string())
    }

    /// Cached playlist metadata document.
    #[must_use]
    pub fn playlist_json(&self, playlist_id: u64) -> PathBuf {
        self.playlist_dir(playlist_id).join(PLAYLIST_FILE)
    }

    /// Playlist items document.
    #[must_use]
    pub fn playlist_items(&self, playlist_id: u64) -> PathBuf {
        self.playlist_dir(playlist_id).join(ITEMS_FILE)
    }

    /// Mirror directory of one track inside a playlist.
    #[must_use]
    pub fn playlist_track_dir(&self, playlist_id: u64, track_id: u64) -> PathBuf {
        self.playlist_dir(playlist_id)
            .join(TRACKS_DIR)
            .join(track_id.to_string())
    }

    /// Mirror audio file of a track variant inside a playlist.
    #[must_use]
    pub fn playlist_audio_path(
        &self,
        playlist_id: u64,
        track_id: u64,
        quality: &Quality,
        extension: &str,
    ) -> PathBuf {
        self.playlist_track_dir(playlist_id, track_id)
            .join(quality.as_str())
            .join(audio_file_name(extension))
    }

    /// Root of all staging directories.
    #[must_use]
    pub fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Staging directory of one job.
    #[must_use]
    pub fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.staging_root().join(job_id)
    }

    /// Directory at which upward empty-directory cleanup stops for `path`.
    ///
    /// That is the owning album or playlist directory, or the orphans root.
    /// `None` if `path` is outside the library's content trees.
    #[must_use]
    pub fn container_root(&self, path: &Path) -> Option<PathBuf> {
        for base in [self.albums_dir(), self.playlists_dir()] {
            if let Ok(rest) = path.strip_prefix(&base)
                && let Some(first) = rest.components().next()
            {
                return Some(base.join(first.as_os_str()));
            }
        }
        let orphans = self.orphans_dir();
        path.starts_with(&orphans).then_some(orphans)
    }
}

fn audio_file_name(extension: &str) -> String {
    format!(
        "{AUDIO_STEM}.{}",
        extension.trim_start_matches('.').to_lowercase()
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn layout() -> PathLayout {
        PathLayout::new("/lib")
    }

    #[test]
    fn test_album_paths() {
        let layout = layout();
        assert_eq!(layout.db_path(), PathBuf::from("/lib/db.json"));
        assert_eq!(layout.album_json(55), PathBuf::from("/lib/albums/55/album.json"));
        assert_eq!(layout.album_cover(55), PathBuf::from("/lib/albums/55/cover.jpg"));
        assert_eq!(
            layout.track_audio_path(Some(55), 101, &Quality::Mp3_128, "MP3"),
            PathBuf::from("/lib/albums/55/tracks/101/mp3_128/audio.mp3")
        );
        assert_eq!(
            layout.track_json(Some(55), 101, &Quality::Flac),
            PathBuf::from("/lib/albums/55/tracks/101/flac/track.json")
        );
    }

    #[test]
    fn test_orphan_paths() {
        assert_eq!(
            layout().track_audio_path(None, 101, &Quality::Flac, ".flac"),
            PathBuf::from("/lib/orphans/101/flac/audio.flac")
        );
    }

    #[test]
    fn test_playlist_paths() {
        let layout = layout();
        assert_eq!(
            layout.playlist_items(9001),
            PathBuf::from("/lib/playlists/9001/items.json")
        );
        assert_eq!(
            layout.playlist_audio_path(9001, 101, &Quality::Mp3_320, "mp3"),
            PathBuf::from("/lib/playlists/9001/tracks/101/mp3_320/audio.mp3")
        );
        assert_eq!(
            layout.staging_dir("101_flac_1"),
            PathBuf::from("/lib/__staging/101_flac_1")
        );
    }

    #[test]
    fn test_container_root() {
        let layout = layout();
        assert_eq!(
            layout.container_root(Path::new("/lib/albums/55/tracks/101/flac/audio.flac")),
            Some(PathBuf::from("/lib/albums/55"))
        );
        assert_eq!(
            layout.container_root(Path::new("/lib/playlists/9001/tracks/1/mp3_128")),
            Some(PathBuf::from("/lib/playlists/9001"))
        );
        assert_eq!(
            layout.container_root(Path::new("/lib/orphans/1/flac/audio.flac")),
            Some(PathBuf::from("/lib/orphans"))
        );
        assert_eq!(layout.container_root(Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn test_is_audio_file() {
        assert!(is_audio_file(Path::new("audio.FLAC")));
        assert!(is_audio_file(Path::new("x/y/track.opus")));
        assert!(!is_audio_file(Path::new("track.json")));
        assert!(!is_audio_file(Path::new("cover.jpg")));
        assert!(!is_audio_file(Path::new("noext")));
    }
}
