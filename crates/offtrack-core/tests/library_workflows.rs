//! Integration tests for `Offtrack` library workflows.
//!
//! These tests drive complete workflows through the public API:
//! - Downloading single tracks, albums and playlists
//! - Resolving, listing and rebuilding the index
//! - Ownership-aware deletion
//!
//! All tests run against a temporary library with fake capabilities.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use offtrack_core::{
    AudioFetcher, Catalog, Collection, DownloadRequest, DownloadedTrack, Entitlements, ErrorKind,
    FetchError, FetchRequest, LibraryConfig, LibraryIndex, MigrationReport, OfflineLibrary, Owner,
    PlaylistItems, Quality, SourceDownload, StagedTrack, TrackMetadata,
    ensure_track_stored_from_staging,
};
use serde_json::{Value, json};
use tempfile::TempDir;

// =============================================================================
// Fake capabilities
// =============================================================================

/// Catalog serving fixed documents.
#[derive(Default)]
struct FakeCatalog {
    tracks: HashMap<u64, Value>,
    albums: HashMap<u64, Value>,
    playlists: HashMap<u64, Value>,
}

impl FakeCatalog {
    fn with_track(mut self, track_id: u64, album_id: u64) -> Self {
        self.tracks.insert(
            track_id,
            json!({
                "id": track_id,
                "title": format!("Song {track_id}"),
                "artist": {"id": 7, "name": "Artist"},
                "album": {"id": album_id, "title": format!("Album {album_id}")}
            }),
        );
        self
    }

    fn with_album(mut self, album_id: u64, track_ids: &[u64]) -> Self {
        let tracks: Vec<Value> = track_ids.iter().map(|id| json!({"id": id})).collect();
        self.albums.insert(
            album_id,
            json!({
                "id": album_id,
                "title": format!("Album {album_id}"),
                "artist": {"id": 7, "name": "Artist"},
                "tracks": {"data": tracks}
            }),
        );
        self
    }

    fn with_playlist(mut self, playlist_id: u64, track_ids: &[u64]) -> Self {
        let tracks: Vec<Value> = track_ids.iter().map(|id| json!({"id": id})).collect();
        self.playlists.insert(
            playlist_id,
            json!({"id": playlist_id, "title": format!("Mix {playlist_id}"), "tracks": tracks}),
        );
        self
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn track(&self, track_id: u64) -> Result<Option<Value>, FetchError> {
        Ok(self.tracks.get(&track_id).cloned())
    }

    async fn album(&self, album_id: u64) -> Result<Option<Value>, FetchError> {
        Ok(self.albums.get(&album_id).cloned())
    }

    async fn playlist(&self, playlist_id: u64) -> Result<Option<Value>, FetchError> {
        Ok(self.playlists.get(&playlist_id).cloned())
    }

    async fn artist_albums(&self, _artist_id: u64) -> Result<Vec<Value>, FetchError> {
        Ok(Vec::new())
    }
}

/// Fetcher that writes a small audio file and counts its invocations.
#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingFetcher {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioFetcher for CountingFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        fs::create_dir_all(&request.destination)
            .map_err(|e| FetchError::failed(e.to_string()))?;
        let body = format!("audio {} {}", request.track_id, request.bitrate);
        fs::write(request.destination.join("download.mp3"), body)
            .map_err(|e| FetchError::failed(e.to_string()))
    }
}

/// Entitlements that tests can change between requests.
#[derive(Default)]
struct SwitchableEntitlements(Mutex<Vec<Quality>>);

impl SwitchableEntitlements {
    fn set(&self, qualities: Vec<Quality>) {
        *self.0.lock().unwrap() = qualities;
    }
}

impl Entitlements for SwitchableEntitlements {
    fn entitled_qualities(&self) -> Vec<Quality> {
        self.0.lock().unwrap().clone()
    }
}

// =============================================================================
// Test Fixture
// =============================================================================

/// A temporary library wired to fake capabilities.
struct TestFixture {
    temp: TempDir,
    catalog: Arc<FakeCatalog>,
    fetcher: Arc<CountingFetcher>,
    entitlements: Arc<SwitchableEntitlements>,
    library: OfflineLibrary,
}

impl TestFixture {
    fn new(catalog: FakeCatalog) -> Self {
        Self::with_fetcher(catalog, CountingFetcher::default())
    }

    fn with_fetcher(catalog: FakeCatalog, fetcher: CountingFetcher) -> Self {
        let temp = TempDir::new().unwrap();
        let catalog = Arc::new(catalog);
        let fetcher = Arc::new(fetcher);
        let entitlements = Arc::new(SwitchableEntitlements::default());
        let library = Self::open(&temp, &catalog, &fetcher, &entitlements);
        Self {
            temp,
            catalog,
            fetcher,
            entitlements,
            library,
        }
    }

    fn open(
        temp: &TempDir,
        catalog: &Arc<FakeCatalog>,
        fetcher: &Arc<CountingFetcher>,
        entitlements: &Arc<SwitchableEntitlements>,
    ) -> OfflineLibrary {
        let config = LibraryConfig {
            library_directory: temp.path().join("library"),
            ..LibraryConfig::default()
        };
        OfflineLibrary::builder(config, catalog.clone(), fetcher.clone())
            .with_entitlements(entitlements.clone())
            .without_artwork()
            .build()
            .unwrap()
    }

    /// A second library instance over the same directory, with a fresh
    /// in-memory index.
    fn reopen(&self) -> OfflineLibrary {
        Self::open(&self.temp, &self.catalog, &self.fetcher, &self.entitlements)
    }

    fn root(&self) -> &Path {
        self.library.layout().root()
    }

    async fn download(&self, source: &str) -> SourceDownload {
        self.library.download_source(source, None).await.unwrap()
    }
}

fn sorted(mut tracks: Vec<DownloadedTrack>) -> Vec<(u64, Vec<Quality>, PathBuf)> {
    tracks.sort_by_key(|t| t.track_id);
    tracks
        .into_iter()
        .map(|t| (t.track_id, t.qualities, t.path))
        .collect()
}

fn audio_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| offtrack_core::is_audio_file(p))
        .collect()
}

// =============================================================================
// Download and resolve
// =============================================================================

#[tokio::test]
async fn test_download_resolve_and_clamp() {
    let fixture = TestFixture::new(FakeCatalog::default().with_track(101, 55).with_album(55, &[101]));

    let outcome = fixture
        .library
        .download(
            DownloadRequest::new(101, Quality::Mp3_128).with_owner(Owner::Album { album_id: 55 }),
        )
        .await;
    assert!(outcome.ok, "{outcome:?}");

    let resolved = fixture
        .library
        .resolve_track(101, Some(&Quality::Mp3_128))
        .await
        .unwrap();
    assert!(resolved.exists);
    assert_eq!(resolved.quality, Quality::Mp3_128);
    assert!(resolved.path.starts_with(fixture.root().join("albums/55")));

    fixture.entitlements.set(vec![Quality::Mp3_320]);
    let outcome = fixture.library.download_track(101, Some(&Quality::Flac)).await;
    assert!(outcome.ok, "{outcome:?}");
    assert_eq!(outcome.quality, Quality::Mp3_320);

    let tracks = fixture.library.list_downloaded_tracks().await.unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].qualities, vec![Quality::Mp3_320, Quality::Mp3_128]);
    assert_eq!(fixture.fetcher.calls(), 2);
}

#[tokio::test]
async fn test_resolve_never_returns_deleted_file() {
    let fixture = TestFixture::new(FakeCatalog::default().with_track(101, 55));
    let outcome = fixture.library.download_track(101, None).await;
    let path = outcome.path.unwrap();

    fs::remove_file(&path).unwrap();

    let err = fixture.library.resolve_track(101, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(fixture.library.list_downloaded_tracks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_fetch_once() {
    let fetcher = CountingFetcher {
        delay: Some(Duration::from_millis(100)),
        ..CountingFetcher::default()
    };
    let fixture = TestFixture::with_fetcher(FakeCatalog::default().with_track(101, 55), fetcher);

    let (first, second) = tokio::join!(
        fixture.library.download_track(101, Some(&Quality::Mp3_320)),
        fixture.library.download_track(101, Some(&Quality::Mp3_320)),
    );

    assert!(first.ok && second.ok);
    assert_eq!(first.path, second.path);
    assert_eq!(fixture.fetcher.calls(), 1);
    assert_eq!(fixture.library.orchestrator().in_flight_count(), 0);
}

#[tokio::test]
async fn test_joined_playlist_request_keeps_its_own_context() {
    let fetcher = CountingFetcher {
        delay: Some(Duration::from_millis(50)),
        ..CountingFetcher::default()
    };
    let fixture = TestFixture::with_fetcher(
        FakeCatalog::default()
            .with_track(101, 55)
            .with_album(55, &[101])
            .with_playlist(9001, &[101]),
        fetcher,
    );

    let (album, playlist) = tokio::join!(
        fixture.library.download(
            DownloadRequest::new(101, Quality::Mp3_320).with_owner(Owner::Album { album_id: 55 }),
        ),
        fixture.library.download(
            DownloadRequest::new(101, Quality::Mp3_320)
                .with_owner(Owner::Playlist { playlist_id: 9001 }),
        ),
    );

    assert!(album.ok && playlist.ok, "{album:?} {playlist:?}");
    assert_eq!(fixture.fetcher.calls(), 1);
    assert!(album.mirror_path.is_none());
    let mirror = playlist.mirror_path.unwrap();
    assert!(mirror.starts_with(fixture.root().join("playlists/9001")));

    let index = fixture.library.index().read().await;
    let entry = index.track(101).unwrap().unwrap();
    assert!(entry.has_owner(&Owner::Album { album_id: 55 }));
    assert!(entry.has_owner(&Owner::Playlist { playlist_id: 9001 }));
    assert_eq!(index.playlist_download(9001, 101).unwrap().unwrap().path, mirror);
}

#[tokio::test]
async fn test_commit_twice_leaves_one_file() {
    let fixture = TestFixture::new(FakeCatalog::default());
    let staging = fixture.temp.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let audio = staging.join("101.mp3");
    fs::write(&audio, b"audio").unwrap();

    let track = TrackMetadata {
        id: 101,
        album_id: Some(55),
        ..TrackMetadata::default()
    };
    let staged = StagedTrack {
        track: &track,
        album_id: Some(55),
        album: None,
        quality: &Quality::Mp3_320,
        owner: &Owner::Album { album_id: 55 },
        audio: &audio,
    };

    let mut index = fixture.library.index().write().await;
    let first = ensure_track_stored_from_staging(&mut index, &staged).unwrap();
    let second = ensure_track_stored_from_staging(&mut index, &staged).unwrap();

    assert_eq!(first, second);
    assert_eq!(audio_files(first.parent().unwrap()).len(), 1);
    assert_eq!(index.document().unwrap().tracks.len(), 1);
    assert_eq!(index.track(101).unwrap().unwrap().qualities.len(), 1);
}

// =============================================================================
// Playlists and ownership
// =============================================================================

#[tokio::test]
async fn test_playlist_mirror_of_album_track() {
    let fixture = TestFixture::new(
        FakeCatalog::default()
            .with_track(101, 55)
            .with_album(55, &[101])
            .with_playlist(9001, &[101]),
    );
    let SourceDownload::Group(summary) = fixture.download("album:55").await else {
        panic!("expected a group download");
    };
    assert_eq!(summary.stored, 1);

    let SourceDownload::Group(summary) = fixture.download("playlist:9001").await else {
        panic!("expected a group download");
    };
    assert_eq!(summary.already_downloaded, 1);
    assert_eq!(fixture.fetcher.calls(), 1);

    let items: PlaylistItems = serde_json::from_slice(
        &fs::read(fixture.library.layout().playlist_items(9001)).unwrap(),
    )
    .unwrap();
    assert!(items.track_ids.contains(&101));
    let mirror = &items.downloads[&101].path;
    assert!(fs::metadata(mirror).unwrap().len() > 0);

    let canonical = fixture.library.resolve_track(101, None).await.unwrap().path;
    assert_ne!(mirror, &canonical);
    assert_eq!(fs::read(mirror).unwrap(), fs::read(&canonical).unwrap());

    let playlists = fixture.library.list_downloaded_playlists().await.unwrap();
    assert_eq!(playlists.len(), 1);
    assert_eq!(playlists[0].downloaded_count, 1);
}

#[tokio::test]
async fn test_deleting_album_keeps_exclusive_playlist_mirror() {
    let fixture = TestFixture::new(
        FakeCatalog::default()
            .with_track(101, 55)
            .with_playlist(9001, &[101]),
    );
    fixture.download("playlist:9001").await;
    assert!(fixture.root().join("albums/55").exists());

    fixture.library.delete_album(55).await.unwrap();

    assert!(!fixture.root().join("albums/55").exists());
    let resolved = fixture.library.resolve_track(101, None).await.unwrap();
    assert!(resolved.path.starts_with(fixture.root().join("playlists/9001")));
    let index = fixture.library.index().read().await;
    assert!(index.playlist_download(9001, 101).unwrap().is_some());
}

#[tokio::test]
async fn test_deleting_playlist_respects_other_owners() {
    let fixture = TestFixture::new(
        FakeCatalog::default()
            .with_track(101, 55)
            .with_track(102, 56)
            .with_track(103, 57)
            .with_album(55, &[101])
            .with_playlist(9001, &[101, 102, 103])
            .with_playlist(9002, &[103]),
    );
    fixture.download("playlist:9001").await;
    fixture.download("album:55").await;
    fixture.download("playlist:9002").await;
    assert_eq!(fixture.fetcher.calls(), 3);

    let deletion = fixture.library.delete_playlist(9001).await.unwrap();

    assert_eq!(deletion.deleted_tracks, vec![102]);
    assert!(!fixture.root().join("playlists/9001").exists());
    assert!(fixture.library.resolve_track(101, None).await.is_ok());
    assert!(fixture.library.resolve_track(103, None).await.is_ok());
    let err = fixture.library.resolve_track(102, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_offline_tracklist_of_playlist() {
    let fixture = TestFixture::new(
        FakeCatalog::default()
            .with_track(101, 55)
            .with_track(102, 55)
            .with_playlist(9001, &[101, 102]),
    );
    fixture.download("playlist:9001").await;
    fixture
        .library
        .delete_track(102, &offtrack_core::QualitySelector::All, false)
        .await
        .unwrap();

    let tracklist = fixture
        .library
        .offline_tracklist(&Collection::Playlist(9001), None)
        .await
        .unwrap();

    assert_eq!(tracklist.total_count, 2);
    assert_eq!(tracklist.downloaded_count, 1);
    assert_eq!(tracklist.tracks[0].track_id, 101);
    assert!(tracklist.tracks[0].downloaded);
    assert!(!tracklist.tracks[1].downloaded);
}

// =============================================================================
// Index recovery
// =============================================================================

#[tokio::test]
async fn test_rescan_matches_incremental_index() {
    let fixture = TestFixture::new(
        FakeCatalog::default()
            .with_track(101, 55)
            .with_track(102, 55)
            .with_track(103, 60)
            .with_track(104, 61)
            .with_album(55, &[101, 102])
            .with_playlist(9001, &[101, 103]),
    );
    fixture.download("album:55").await;
    fixture.download("playlist:9001").await;
    fixture.library.download_track(104, Some(&Quality::Mp3_128)).await;
    fixture
        .library
        .delete_track(102, &offtrack_core::QualitySelector::All, false)
        .await
        .unwrap();

    let incremental = sorted(fixture.library.list_downloaded_tracks().await.unwrap());
    fixture.library.rescan().await.unwrap();
    let rebuilt = sorted(fixture.library.list_downloaded_tracks().await.unwrap());

    assert_eq!(incremental, rebuilt);
    assert_eq!(
        rebuilt.iter().map(|t| t.0).collect::<Vec<_>>(),
        vec![101, 103, 104]
    );
}

#[tokio::test]
async fn test_removed_tier_stays_gone_after_rescan() {
    let fixture = TestFixture::new(
        FakeCatalog::default()
            .with_track(101, 55)
            .with_playlist(9001, &[101]),
    );
    for quality in [Quality::Mp3_128, Quality::Mp3_320] {
        fixture
            .library
            .download_source("playlist:9001", Some(&quality))
            .await
            .unwrap();
    }
    assert!(fixture.root().join("playlists/9001/tracks/101/mp3_128").exists());

    fixture
        .library
        .delete_track(
            101,
            &offtrack_core::QualitySelector::One(Quality::Mp3_128),
            false,
        )
        .await
        .unwrap();
    assert!(!fixture.root().join("playlists/9001/tracks/101/mp3_128").exists());

    let tracks = sorted(fixture.library.list_downloaded_tracks().await.unwrap());
    let playlists = fixture.library.list_downloaded_playlists().await.unwrap();
    fixture.library.rescan().await.unwrap();

    assert_eq!(sorted(fixture.library.list_downloaded_tracks().await.unwrap()), tracks);
    assert_eq!(fixture.library.list_downloaded_playlists().await.unwrap(), playlists);
    assert_eq!(tracks[0].1, vec![Quality::Mp3_320]);
    assert_eq!(playlists[0].downloaded_count, 1);
}

#[tokio::test]
async fn test_corrupt_db_is_rebuilt() {
    let fixture = TestFixture::new(
        FakeCatalog::default()
            .with_track(101, 55)
            .with_track(102, 55)
            .with_album(55, &[101, 102]),
    );
    fixture.download("album:55").await;
    let before = sorted(fixture.library.list_downloaded_tracks().await.unwrap());

    let db = fixture.library.layout().db_path();
    let content = fs::read(&db).unwrap();
    fs::write(&db, &content[..content.len() / 2]).unwrap();

    let reopened = fixture.reopen();
    let after = sorted(reopened.list_downloaded_tracks().await.unwrap());
    assert_eq!(before, after);

    let mut index = LibraryIndex::new(reopened.layout().clone());
    index.ensure_loaded().unwrap();
    assert_eq!(index.document().unwrap().tracks.len(), 2);
}

#[tokio::test]
async fn test_legacy_migration_through_facade() {
    let fixture = TestFixture::new(FakeCatalog::default());
    let legacy = fixture.temp.path().join("legacy");
    fs::create_dir_all(&legacy).unwrap();
    fs::write(legacy.join("301.mp3"), b"old audio").unwrap();
    fs::write(legacy.join("302_flac.flac"), b"old audio").unwrap();

    let report = fixture.library.migrate_legacy(Some(&legacy)).await.unwrap();

    assert_eq!(
        report,
        MigrationReport {
            migrated: 2,
            skipped: 0,
            failed: 0
        }
    );
    let resolved = fixture.library.resolve_track(302, None).await.unwrap();
    assert_eq!(resolved.quality, Quality::Flac);
}
