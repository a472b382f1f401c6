//! The offline library facade.
//!
//! [`OfflineLibrary`] ties a [`LibraryConfig`] to one on-disk library: it
//! owns the shared index and the download orchestrator, and exposes the
//! operations a host application calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artwork::{self, HealReport, HttpArtworkFetcher};
use crate::config::LibraryConfig;
use crate::deletion::{self, PlaylistDeletion, QualitySelector, RemovalReport};
use crate::download::{
    DownloadEvent, DownloadOrchestrator, DownloadOutcome, DownloadRequest, GroupKey, GroupSummary,
};
use crate::error::{Error, Result};
use crate::fetch::{ArtworkFetcher, AudioFetcher, Catalog, Entitlements, StaticEntitlements};
use crate::index::{LibraryIndex, SharedIndex};
use crate::layout::PathLayout;
use crate::migrate::{self, MigrationReport};
use crate::mirror::PlaylistMirror;
use crate::model::{DownloadedPlaylist, DownloadedTrack, ResolvedTrack};
use crate::offline::{self, Collection, OfflineTracklist};
use crate::quality::Quality;
use crate::source::{SourceRef, parse_source};

/// What [`OfflineLibrary::download_source`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDownload {
    /// A single track job.
    Track(DownloadOutcome),
    /// An album, playlist or artist group.
    Group(GroupSummary),
}

/// Where covers come from.
enum ArtworkSource {
    /// HTTP when `fetch_missing_covers` is set.
    Configured,
    Custom(Arc<dyn ArtworkFetcher>),
    Disabled,
}

/// Builder for [`OfflineLibrary`].
pub struct OfflineLibraryBuilder {
    config: LibraryConfig,
    catalog: Arc<dyn Catalog>,
    fetcher: Arc<dyn AudioFetcher>,
    entitlements: Option<Arc<dyn Entitlements>>,
    artwork: ArtworkSource,
    mirror: Option<PlaylistMirror>,
}

impl std::fmt::Debug for OfflineLibraryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineLibraryBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OfflineLibraryBuilder {
    /// Use `entitlements` instead of the configured tier list.
    #[must_use]
    pub fn with_entitlements(mut self, entitlements: Arc<dyn Entitlements>) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    /// Fetch covers with `fetcher` instead of over HTTP.
    #[must_use]
    pub fn with_artwork(mut self, fetcher: Arc<dyn ArtworkFetcher>) -> Self {
        self.artwork = ArtworkSource::Custom(fetcher);
        self
    }

    /// Never fetch covers.
    #[must_use]
    pub fn without_artwork(mut self) -> Self {
        self.artwork = ArtworkSource::Disabled;
        self
    }

    /// Use a custom playlist mirror.
    #[must_use]
    pub fn with_mirror(mut self, mirror: PlaylistMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Build the library.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the library directory is unusable
    /// or the HTTP cover client cannot be created.
    pub fn build(self) -> Result<OfflineLibrary> {
        crate::config::validate_library_directory(&self.config.library_directory)?;
        let layout = PathLayout::new(&self.config.library_directory);
        let index = LibraryIndex::new(layout.clone()).shared();

        let artwork: Option<Arc<dyn ArtworkFetcher>> = match self.artwork {
            ArtworkSource::Custom(fetcher) => Some(fetcher),
            ArtworkSource::Configured if self.config.fetch_missing_covers => {
                let timeout = Duration::from_secs(self.config.cover_fetch_timeout_secs);
                Some(Arc::new(HttpArtworkFetcher::new(timeout)?))
            }
            ArtworkSource::Configured | ArtworkSource::Disabled => None,
        };
        let entitlements = self.entitlements.unwrap_or_else(|| {
            Arc::new(StaticEntitlements(self.config.entitled_qualities.clone()))
        });

        let mut orchestrator = DownloadOrchestrator::new(
            Arc::clone(&index),
            layout.clone(),
            self.catalog,
            self.fetcher,
            entitlements,
        );
        if let Some(fetcher) = &artwork {
            orchestrator = orchestrator.with_artwork(Arc::clone(fetcher));
        }
        if let Some(mirror) = self.mirror {
            orchestrator = orchestrator.with_mirror(mirror);
        }

        info!(
            "Opened offline library at {}",
            self.config.library_directory.display()
        );
        Ok(OfflineLibrary {
            config: self.config,
            layout,
            index,
            orchestrator,
            artwork,
        })
    }
}

/// One offline library and its download machinery.
pub struct OfflineLibrary {
    config: LibraryConfig,
    layout: PathLayout,
    index: SharedIndex,
    orchestrator: DownloadOrchestrator,
    artwork: Option<Arc<dyn ArtworkFetcher>>,
}

impl std::fmt::Debug for OfflineLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineLibrary")
            .field("root", &self.layout.root())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl OfflineLibrary {
    /// Start building a library from `config` and the two required
    /// capabilities.
    pub fn builder(
        config: LibraryConfig,
        catalog: Arc<dyn Catalog>,
        fetcher: Arc<dyn AudioFetcher>,
    ) -> OfflineLibraryBuilder {
        OfflineLibraryBuilder {
            config,
            catalog,
            fetcher,
            entitlements: None,
            artwork: ArtworkSource::Configured,
            mirror: None,
        }
    }

    /// Configuration the library was built from.
    #[must_use]
    pub const fn config(&self) -> &LibraryConfig {
        &self.config
    }

    /// Path layout of the library.
    #[must_use]
    pub const fn layout(&self) -> &PathLayout {
        &self.layout
    }

    /// Shared index.
    #[must_use]
    pub const fn index(&self) -> &SharedIndex {
        &self.index
    }

    /// Download orchestrator.
    #[must_use]
    pub const fn orchestrator(&self) -> &DownloadOrchestrator {
        &self.orchestrator
    }

    fn quality_or_default(&self, quality: Option<&Quality>) -> Quality {
        quality.cloned().unwrap_or_else(|| self.config.default_quality.clone())
    }

    /// Playable audio of `track_id`, preferring `preferred`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no valid file is stored.
    pub async fn resolve_track(
        &self,
        track_id: u64,
        preferred: Option<&Quality>,
    ) -> Result<ResolvedTrack> {
        let mut index = self.index.write().await;
        index.ensure_loaded()?;
        index.resolve_track(track_id, preferred)
    }

    /// Every downloaded track.
    pub async fn list_downloaded_tracks(&self) -> Result<Vec<DownloadedTrack>> {
        let mut index = self.index.write().await;
        index.ensure_loaded()?;
        index.list_downloaded_tracks()
    }

    /// Every playlist with at least one downloaded track.
    pub async fn list_downloaded_playlists(&self) -> Result<Vec<DownloadedPlaylist>> {
        let mut index = self.index.write().await;
        index.ensure_loaded()?;
        index.list_downloaded_playlists()
    }

    /// Tracklist of `collection` with per-track availability.
    pub async fn offline_tracklist(
        &self,
        collection: &Collection,
        preferred: Option<&Quality>,
    ) -> Result<OfflineTracklist> {
        let mut index = self.index.write().await;
        offline::offline_tracklist(&mut index, collection, preferred)
    }

    /// Download one track ad hoc at `quality`, or the default tier.
    pub async fn download_track(&self, track_id: u64, quality: Option<&Quality>) -> DownloadOutcome {
        let quality = self.quality_or_default(quality);
        self.orchestrator
            .download(DownloadRequest::new(track_id, quality))
            .await
    }

    /// Run a fully specified download request.
    pub async fn download(&self, request: DownloadRequest) -> DownloadOutcome {
        self.orchestrator.download(request).await
    }

    /// Download whatever `source` points at: a catalog URL or a short
    /// reference such as `album:55`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] for an unrecognized source, and the
    /// group lookup error when an album, playlist or artist is unknown.
    /// Per-track failures are reported in the result.
    pub async fn download_source(
        &self,
        source: &str,
        quality: Option<&Quality>,
    ) -> Result<SourceDownload> {
        let source = parse_source(source)?;
        let quality = self.quality_or_default(quality);
        debug!("Downloading {:?} at {}", source, quality);
        Ok(match source {
            SourceRef::Track(track_id) => SourceDownload::Track(
                self.orchestrator
                    .download(DownloadRequest::new(track_id, quality))
                    .await,
            ),
            SourceRef::Album(album_id) => {
                SourceDownload::Group(self.orchestrator.download_album(album_id, &quality).await?)
            }
            SourceRef::Playlist(playlist_id) => SourceDownload::Group(
                self.orchestrator
                    .download_playlist(playlist_id, &quality)
                    .await?,
            ),
            SourceRef::Artist(artist_id) => SourceDownload::Group(
                self.orchestrator
                    .download_artist(artist_id, &quality)
                    .await?,
            ),
        })
    }

    /// Cancel in-flight jobs of `track_id`. Returns how many were flagged.
    pub fn cancel_download(&self, track_id: u64, quality: Option<&Quality>) -> usize {
        self.orchestrator.cancel_download(track_id, quality)
    }

    /// Stop a group download before its next track.
    pub fn cancel_group(&self, group: GroupKey) {
        self.orchestrator.cancel_group(group);
    }

    /// Fetch covers of albums that lack one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when cover fetching is disabled.
    pub async fn heal_missing_covers(&self) -> Result<HealReport> {
        let fetcher = self
            .artwork
            .as_deref()
            .ok_or_else(|| Error::Configuration("Cover fetching is disabled".to_string()))?;
        artwork::heal_missing_covers(&self.index, fetcher).await
    }

    /// Rebuild the index from disk.
    pub async fn rescan(&self) -> Result<()> {
        self.index.write().await.rescan()
    }

    /// Remove one or all stored tiers of a track.
    pub async fn delete_track(
        &self,
        track_id: u64,
        selector: &QualitySelector,
        delete_album_container: bool,
    ) -> Result<RemovalReport> {
        let mut index = self.index.write().await;
        deletion::remove_download_for_track(&mut index, track_id, selector, delete_album_container)
    }

    /// Delete an album directory and rebuild the index.
    pub async fn delete_album(&self, album_id: u64) -> Result<()> {
        let mut index = self.index.write().await;
        deletion::delete_album_from_disk(&mut index, album_id)
    }

    /// Delete a playlist and the tracks only it owns.
    pub async fn delete_playlist(&self, playlist_id: u64) -> Result<PlaylistDeletion> {
        let mut index = self.index.write().await;
        deletion::delete_playlist_from_disk(&mut index, playlist_id)
    }

    /// Move legacy downloads into the library.
    ///
    /// Uses `legacy_dir`, or the configured legacy directory. Without either
    /// there is nothing to migrate.
    pub async fn migrate_legacy(&self, legacy_dir: Option<&Path>) -> Result<MigrationReport> {
        let dir: Option<PathBuf> = legacy_dir
            .map(Path::to_path_buf)
            .or_else(|| self.config.legacy_directory.clone());
        let Some(dir) = dir else {
            debug!("No legacy directory configured");
            return Ok(MigrationReport::default());
        };
        let mut index = self.index.write().await;
        migrate::migrate_legacy(&mut index, &dir)
    }

    /// Next pending download event, if any.
    pub async fn try_recv_event(&self) -> Option<DownloadEvent> {
        self.orchestrator.try_recv_event().await
    }

    /// Drain every pending download event.
    pub async fn events(&self) -> Vec<DownloadEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.orchestrator.try_recv_event().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fetch::{FetchRequest, MockArtworkFetcher, MockAudioFetcher, MockCatalog};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> LibraryConfig {
        LibraryConfig {
            library_directory: temp.path().join("library"),
            fetch_missing_covers: false,
            ..LibraryConfig::default()
        }
    }

    fn writing_fetcher() -> MockAudioFetcher {
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().returning(|request: FetchRequest| {
            fs::create_dir_all(&request.destination).unwrap();
            fs::write(request.destination.join("out.mp3"), b"audio").unwrap();
            Ok(())
        });
        fetcher
    }

    fn track_catalog() -> MockCatalog {
        let mut catalog = MockCatalog::new();
        catalog.expect_track().returning(|id| {
            Ok(Some(json!({"id": id, "title": format!("Track {id}"), "album": {"id": 55}})))
        });
        catalog
            .expect_album()
            .returning(|id| Ok(Some(json!({"id": id, "title": "Album", "tracks": [{"id": 101}]}))));
        catalog
    }

    #[tokio::test]
    async fn test_relative_library_directory_is_rejected() {
        let config = LibraryConfig {
            library_directory: PathBuf::from("relative"),
            ..LibraryConfig::default()
        };
        let err = OfflineLibrary::builder(
            config,
            Arc::new(MockCatalog::new()),
            Arc::new(MockAudioFetcher::new()),
        )
        .build()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_download_track_uses_default_quality() {
        let temp = TempDir::new().unwrap();
        let library = OfflineLibrary::builder(
            config(&temp),
            Arc::new(track_catalog()),
            Arc::new(writing_fetcher()),
        )
        .build()
        .unwrap();

        let outcome = library.download_track(101, None).await;

        assert!(outcome.ok, "{outcome:?}");
        assert_eq!(outcome.quality, Quality::Mp3_320);
        let resolved = library.resolve_track(101, None).await.unwrap();
        assert_eq!(resolved.quality, Quality::Mp3_320);
        assert_eq!(library.list_downloaded_tracks().await.unwrap().len(), 1);

        let events = library.events().await;
        assert!(matches!(events.first(), Some(DownloadEvent::TrackStarted { .. })));
        assert!(matches!(events.last(), Some(DownloadEvent::TrackFinished { .. })));
    }

    #[tokio::test]
    async fn test_configured_entitlements_clamp() {
        let temp = TempDir::new().unwrap();
        let config = LibraryConfig {
            entitled_qualities: vec![Quality::Mp3_128],
            ..config(&temp)
        };
        let library =
            OfflineLibrary::builder(config, Arc::new(track_catalog()), Arc::new(writing_fetcher()))
                .build()
                .unwrap();

        let outcome = library.download_track(101, Some(&Quality::Flac)).await;

        assert!(outcome.ok);
        assert_eq!(outcome.quality, Quality::Mp3_128);
    }

    #[tokio::test]
    async fn test_download_source_dispatch() {
        let temp = TempDir::new().unwrap();
        let library = OfflineLibrary::builder(
            config(&temp),
            Arc::new(track_catalog()),
            Arc::new(writing_fetcher()),
        )
        .build()
        .unwrap();

        let result = library
            .download_source("https://catalog.example/en/album/55", None)
            .await
            .unwrap();
        let SourceDownload::Group(summary) = result else {
            panic!("expected a group download");
        };
        assert_eq!(summary.group, GroupKey::Album(55));
        assert_eq!(summary.stored, 1);

        let result = library.download_source("track:101", None).await.unwrap();
        let SourceDownload::Track(outcome) = result else {
            panic!("expected a track download");
        };
        assert!(outcome.already_downloaded);

        let err = library.download_source("nonsense", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_heal_requires_artwork() {
        let temp = TempDir::new().unwrap();
        let library = OfflineLibrary::builder(
            config(&temp),
            Arc::new(MockCatalog::new()),
            Arc::new(MockAudioFetcher::new()),
        )
        .build()
        .unwrap();
        let err = library.heal_missing_covers().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let mut artwork = MockArtworkFetcher::new();
        artwork.expect_fetch_image().never();
        let library = OfflineLibrary::builder(
            config(&temp),
            Arc::new(MockCatalog::new()),
            Arc::new(MockAudioFetcher::new()),
        )
        .with_artwork(Arc::new(artwork))
        .build()
        .unwrap();
        let report = library.heal_missing_covers().await.unwrap();
        assert_eq!(report, HealReport::default());
    }

    #[tokio::test]
    async fn test_migrate_without_directory_is_noop() {
        let temp = TempDir::new().unwrap();
        let library = OfflineLibrary::builder(
            config(&temp),
            Arc::new(MockCatalog::new()),
            Arc::new(MockAudioFetcher::new()),
        )
        .build()
        .unwrap();
        let report = library.migrate_legacy(None).await.unwrap();
        assert_eq!(report, MigrationReport::default());
    }
}
