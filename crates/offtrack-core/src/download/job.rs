//! One download job: metadata, staging, fetch, commit and mirror.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use super::commit::{StagedTrack, ensure_track_stored_from_staging};
use super::request::{DownloadEvent, DownloadOutcome, DownloadRequest, JobKey};
use super::DownloadOrchestrator;
use crate::artwork::ensure_album_cover;
use crate::error::{Error, ErrorResponse, Result};
use crate::fetch::{FetchError, FetchRequest};
use crate::index::LibraryIndex;
use crate::layout::PathLayout;
use crate::metadata::{AlbumMetadata, TrackMetadata};
use crate::model::{Owner, OwnershipTag};
use crate::quality::Quality;
use crate::scanner::find_audio_file;
use crate::store::{child_dirs, ensure_dir, now_millis, read_json, remove_dir_all_if_exists};

/// Depth searched for audio inside a staging directory.
const STAGING_SEARCH_DEPTH: usize = 8;

/// Removes a staging directory when the job ends, however it ends.
struct StagingGuard {
    dir: PathBuf,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        match remove_dir_all_if_exists(&self.dir) {
            Ok(true) => debug!("Removed staging directory {}", self.dir.display()),
            Ok(false) => {}
            Err(e) => warn!("Could not remove staging directory {}: {}", self.dir.display(), e),
        }
    }
}

/// Whether a staging directory name belongs to `key`.
///
/// Current runs name it `<track>_<quality>_<stamp>`; older runs used
/// `<track>-<bitrate>`.
fn is_staging_for(name: &str, key: &JobKey) -> bool {
    let prefix = key.staging_prefix();
    if name == prefix
        || name
            .strip_prefix(&prefix)
            .is_some_and(|rest| rest.starts_with('_'))
    {
        return true;
    }
    key.quality
        .bitrate()
        .is_some_and(|bitrate| name == format!("{}-{}", key.track_id, bitrate))
}

/// Staging directory left behind by an earlier run of `key` that still holds
/// a complete audio file. Leftovers without audio are removed.
fn find_adoptable_staging(layout: &PathLayout, key: &JobKey) -> Option<(PathBuf, PathBuf)> {
    let mut adopted = None;
    for dir in child_dirs(&layout.staging_root()) {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_staging_for(name, key) {
            continue;
        }
        if adopted.is_none()
            && let Some(audio) = find_audio_file(&dir, STAGING_SEARCH_DEPTH)
        {
            adopted = Some((dir, audio));
            continue;
        }
        if let Err(e) = remove_dir_all_if_exists(&dir) {
            warn!("Could not remove stale staging {}: {}", dir.display(), e);
        }
    }
    adopted
}

/// Map an engine failure onto the library error taxonomy.
fn fetch_error(track_id: u64, error: FetchError) -> Error {
    match error {
        FetchError::Cancelled => Error::DownloadCancelled { track_id },
        FetchError::Failed { message, detail } => Error::DownloadFailed {
            track_id,
            message,
            detail,
        },
    }
}

/// Catalog lookups are best-effort: failures are logged and read as "absent",
/// except cancellation.
fn catalog_value<T>(
    track_id: u64,
    what: &str,
    result: std::result::Result<Option<T>, FetchError>,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(value),
        Err(FetchError::Cancelled) => Err(Error::DownloadCancelled { track_id }),
        Err(FetchError::Failed { message, .. }) => {
            warn!("Catalog lookup of {} failed: {}", what, message);
            Ok(None)
        }
    }
}

fn check_cancelled(cancel: &AtomicBool, track_id: u64) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        return Err(Error::DownloadCancelled { track_id });
    }
    Ok(())
}

impl DownloadOrchestrator {
    /// Run the job for `request` at the clamped `quality`.
    pub(super) async fn execute(
        &self,
        request: &DownloadRequest,
        quality: &Quality,
        cancel: &Arc<AtomicBool>,
    ) -> Result<DownloadOutcome> {
        let track_id = request.track_id;
        let owner = &request.owner;
        let owner_album = owner.album_id().filter(|id| *id > 0);
        if owner.requires_album() && owner_album.is_none() {
            return Err(Error::MissingAlbumContext { track_id });
        }

        if let Some(outcome) = self.short_circuit(request, quality).await? {
            return Ok(outcome);
        }

        let mut track = self.track_metadata(request).await?;
        let album_id = owner_album.or(track.album_id);
        if track.album_id.is_none() {
            track.album_id = album_id;
        }
        let album = match album_id {
            Some(id) => self.album_metadata(request, id).await?,
            None => None,
        };
        if owner.requires_album() && album.is_none() {
            return Err(Error::MissingAlbumMetadata {
                album_id: album_id.unwrap_or_default(),
            });
        }
        if let Some(album) = &album {
            track.merge_missing(&TrackMetadata {
                artist_name: album.artist_name.clone(),
                artist_id: album.artist_id,
                album_title: album.title.clone(),
                ..TrackMetadata::default()
            });
        }

        check_cancelled(cancel, track_id)?;
        let key = JobKey::new(track_id, quality.clone());
        let (guard, audio) = match find_adoptable_staging(&self.layout, &key) {
            Some((dir, audio)) => {
                info!("Adopting staged audio {} for {}", audio.display(), key);
                (StagingGuard { dir }, audio)
            }
            None => {
                let guard = self.fetch_into_staging(&key, cancel).await?;
                check_cancelled(cancel, track_id)?;
                let audio = find_audio_file(&guard.dir, STAGING_SEARCH_DEPTH).ok_or_else(|| {
                    Error::NoAudioFile {
                        staging: guard.dir.clone(),
                    }
                })?;
                (guard, audio)
            }
        };

        if let (Some(id), Some(artwork)) = (album_id, &self.artwork) {
            let mut urls = album.as_ref().map(|a| a.cover_urls.clone()).unwrap_or_default();
            urls.extend(track.cover_urls.iter().cloned());
            if ensure_album_cover(&self.layout, id, &urls, artwork.as_ref())
                .await
                .is_none()
            {
                debug!("No cover stored for album {}", id);
            }
        }

        check_cancelled(cancel, track_id)?;
        let mut index = self.index.write().await;
        let path = ensure_track_stored_from_staging(
            &mut index,
            &StagedTrack {
                track: &track,
                album_id,
                album: album.as_ref(),
                quality,
                owner,
                audio: &audio,
            },
        )?;
        drop(guard);

        let mut outcome = DownloadOutcome::stored(track_id, quality.clone(), path.clone());
        self.mirror_if_playlist(&mut index, request, quality, &path, &mut outcome);
        Ok(outcome)
    }

    /// Stamp ownership on an already stored `(track, quality)` and skip the
    /// fetch.
    async fn short_circuit(
        &self,
        request: &DownloadRequest,
        quality: &Quality,
    ) -> Result<Option<DownloadOutcome>> {
        let track_id = request.track_id;
        let mut index = self.index.write().await;
        index.ensure_loaded()?;
        let Some(resolved) = index.resolve_exact(track_id, quality)? else {
            return Ok(None);
        };
        if index.stamp_owner(track_id, quality, OwnershipTag::new(request.owner.clone(), quality))? {
            index.save()?;
        }
        debug!("Track {} already stored at {}", track_id, quality);

        let mut outcome = DownloadOutcome::already(track_id, quality.clone(), resolved.path.clone());
        self.mirror_if_playlist(&mut index, request, quality, &resolved.path, &mut outcome);
        Ok(Some(outcome))
    }

    /// Record a joiner's own context on the outcome it shared with the leader:
    /// its ownership tag and, for playlist requests, its mirror.
    pub(super) async fn adopt_joined(
        &self,
        request: &DownloadRequest,
        quality: &Quality,
        mut outcome: DownloadOutcome,
    ) -> DownloadOutcome {
        outcome.mirror_path = None;
        outcome.mirror_error = None;
        let Some(path) = outcome.path.clone().filter(|_| outcome.ok) else {
            return outcome;
        };
        let track_id = request.track_id;
        let mut index = self.index.write().await;
        let tag = OwnershipTag::new(request.owner.clone(), quality);
        let stamped = index
            .stamp_owner(track_id, quality, tag)
            .and_then(|changed| if changed { index.save() } else { Ok(()) });
        if let Err(e) = stamped {
            warn!(
                "Could not record {} on track {} at {}: {}",
                request.owner, track_id, quality, e
            );
        }
        self.mirror_if_playlist(&mut index, request, quality, &path, &mut outcome);
        outcome
    }

    /// Track metadata from the request, the collection documents it carries,
    /// then the catalog.
    async fn track_metadata(&self, request: &DownloadRequest) -> Result<TrackMetadata> {
        let track_id = request.track_id;
        let mut track = request
            .track
            .clone()
            .filter(|t| t.id == track_id)
            .or_else(|| request.album.as_ref().and_then(|a| a.track(track_id)).cloned())
            .or_else(|| request.playlist.as_ref().and_then(|p| p.track(track_id)).cloned());

        if track.as_ref().is_none_or(|t| t.title.is_none()) {
            let value = catalog_value(
                track_id,
                &format!("track {track_id}"),
                self.catalog.track(track_id).await,
            )?;
            if let Some(fetched) = value.as_ref().and_then(TrackMetadata::from_value) {
                match &mut track {
                    Some(known) => known.merge_missing(&fetched),
                    None => track = Some(fetched),
                }
            }
        }
        track.ok_or(Error::MissingTrackMetadata { track_id })
    }

    /// Album metadata from the request, the cached `album.json`, then the
    /// catalog.
    async fn album_metadata(
        &self,
        request: &DownloadRequest,
        album_id: u64,
    ) -> Result<Option<AlbumMetadata>> {
        if let Some(album) = request.album.as_ref().filter(|a| a.id == album_id) {
            return Ok(Some(album.clone()));
        }
        if let Some(album) = read_json::<AlbumMetadata>(&self.layout.album_json(album_id)) {
            return Ok(Some(album));
        }
        let value = catalog_value(
            request.track_id,
            &format!("album {album_id}"),
            self.catalog.album(album_id).await,
        )?;
        Ok(value.as_ref().and_then(AlbumMetadata::from_value))
    }

    /// Create a fresh staging directory and let the engine fill it.
    async fn fetch_into_staging(
        &self,
        key: &JobKey,
        cancel: &Arc<AtomicBool>,
    ) -> Result<StagingGuard> {
        let bitrate = key
            .quality
            .bitrate()
            .ok_or_else(|| Error::bad_request(format!("unsupported quality {}", key.quality)))?;
        let name = format!(
            "{}_{}{:04}",
            key.staging_prefix(),
            now_millis(),
            self.next_staging_seq() % 10_000
        );
        let dir = self.layout.staging_dir(&name);
        ensure_dir(&dir)?;
        let guard = StagingGuard { dir };

        debug!("Fetching {} into {}", key, guard.dir.display());
        self.fetcher
            .fetch(FetchRequest {
                track_id: key.track_id,
                bitrate,
                destination: guard.dir.clone(),
                cancel: Arc::clone(cancel),
            })
            .await
            .map_err(|e| fetch_error(key.track_id, e))?;
        Ok(guard)
    }

    /// Mirror a stored track into its playlist when the request is
    /// playlist-scoped. Failures are recorded on the outcome.
    fn mirror_if_playlist(
        &self,
        index: &mut LibraryIndex,
        request: &DownloadRequest,
        quality: &Quality,
        source: &Path,
        outcome: &mut DownloadOutcome,
    ) {
        let Owner::Playlist { playlist_id } = request.owner else {
            return;
        };
        let track_id = request.track_id;
        match self.mirror.ensure_playlist_track_mirror(
            index,
            playlist_id,
            track_id,
            quality,
            source,
            request.playlist.as_ref(),
        ) {
            Ok(mirror) => outcome.mirror_path = Some(mirror.path),
            Err(e) => {
                warn!(
                    "Could not mirror track {} into playlist {}: {}",
                    track_id, playlist_id, e
                );
                let error = ErrorResponse::from(&e);
                outcome.mirror_error = Some(error.clone());
                self.emit(DownloadEvent::MirrorFailed {
                    track_id,
                    playlist_id,
                    error,
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fetch::{MockArtworkFetcher, MockAudioFetcher, MockCatalog, StaticEntitlements};
    use crate::metadata::PlaylistMetadata;
    use crate::mirror::{MockLinkStrategy, PlaylistMirror};
    use serde_json::json;
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    fn empty_catalog() -> MockCatalog {
        let mut catalog = MockCatalog::new();
        catalog.expect_track().returning(|_| Ok(None));
        catalog.expect_album().returning(|_| Ok(None));
        catalog
    }

    fn writing_fetcher() -> MockAudioFetcher {
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().returning(|request| {
            let nested = request.destination.join("disc1");
            fs::create_dir_all(&nested).unwrap();
            fs::write(nested.join("01.flac"), b"flac-bytes").unwrap();
            Ok(())
        });
        fetcher
    }

    fn orchestrator(
        temp: &TempDir,
        catalog: MockCatalog,
        fetcher: MockAudioFetcher,
    ) -> DownloadOrchestrator {
        let layout = PathLayout::new(temp.path());
        DownloadOrchestrator::new(
            LibraryIndex::new(layout.clone()).shared(),
            layout,
            Arc::new(catalog),
            Arc::new(fetcher),
            Arc::new(StaticEntitlements::default()),
        )
    }

    fn track(id: u64, album_id: Option<u64>) -> TrackMetadata {
        TrackMetadata {
            id,
            title: Some(format!("Track {id}")),
            album_id,
            ..Default::default()
        }
    }

    #[test]
    fn test_staging_names() {
        let key = JobKey::new(101, Quality::Mp3_320);
        assert!(is_staging_for("101_mp3_320", &key));
        assert!(is_staging_for("101_mp3_320_17000000000000001", &key));
        assert!(is_staging_for("101-3", &key));
        assert!(!is_staging_for("101_mp3_128_1", &key));
        assert!(!is_staging_for("1011_mp3_320_1", &key));
        assert!(!is_staging_for("101-1", &key));
    }

    #[test]
    fn test_fetch_error_mapping() {
        assert_eq!(
            fetch_error(5, FetchError::Cancelled).kind(),
            ErrorKind::DownloadCancelled
        );
        let err = fetch_error(
            5,
            FetchError::Failed {
                message: "boom".to_string(),
                detail: Some("trace".to_string()),
            },
        );
        assert!(matches!(err, Error::DownloadFailed { track_id: 5, ref detail, .. } if detail.as_deref() == Some("trace")));
    }

    #[tokio::test]
    async fn test_adopts_leftover_staging() {
        let temp = TempDir::new().unwrap();
        let leftover = temp.path().join("__staging/101-1");
        fs::create_dir_all(&leftover).unwrap();
        fs::write(leftover.join("done.mp3"), b"audio").unwrap();
        let empty = temp.path().join("__staging/101_mp3_128_99");
        fs::create_dir_all(&empty).unwrap();

        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().never();
        let orchestrator = orchestrator(&temp, empty_catalog(), fetcher);

        let outcome = orchestrator
            .download(DownloadRequest::new(101, Quality::Mp3_128).with_track(Some(track(101, None))))
            .await;

        assert!(outcome.ok, "{outcome:?}");
        assert_eq!(
            outcome.path.unwrap(),
            temp.path().join("orphans/101/mp3_128/audio.mp3")
        );
        assert!(!leftover.exists());
        assert!(!empty.exists());
    }

    #[tokio::test]
    async fn test_nested_staging_audio_is_found() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp, empty_catalog(), writing_fetcher());

        let outcome = orchestrator
            .download(DownloadRequest::new(9, Quality::Flac).with_track(Some(track(9, Some(3)))))
            .await;

        assert!(outcome.ok, "{outcome:?}");
        assert_eq!(
            outcome.path.unwrap(),
            temp.path().join("albums/3/tracks/9/flac/audio.flac")
        );
    }

    #[tokio::test]
    async fn test_missing_track_metadata() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().never();
        let orchestrator = orchestrator(&temp, empty_catalog(), fetcher);

        let outcome = orchestrator
            .download(DownloadRequest::new(9, Quality::Flac))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::MissingTrackMetadata));
    }

    #[tokio::test]
    async fn test_album_owner_requires_album_metadata() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().never();
        let orchestrator = orchestrator(&temp, empty_catalog(), fetcher);

        let outcome = orchestrator
            .download(
                DownloadRequest::new(9, Quality::Flac)
                    .with_owner(Owner::Album { album_id: 3 })
                    .with_track(Some(track(9, Some(3)))),
            )
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::MissingAlbumMetadata));
    }

    #[tokio::test]
    async fn test_catalog_failure_reads_as_absent() {
        let temp = TempDir::new().unwrap();
        let mut catalog = MockCatalog::new();
        catalog
            .expect_track()
            .returning(|_| Err(FetchError::failed("rate limited")));
        let orchestrator = orchestrator(&temp, catalog, MockAudioFetcher::new());

        let outcome = orchestrator
            .download(DownloadRequest::new(9, Quality::Flac))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::MissingTrackMetadata));
    }

    #[tokio::test]
    async fn test_catalog_metadata_completes_embedded_track() {
        let temp = TempDir::new().unwrap();
        let mut catalog = MockCatalog::new();
        catalog.expect_track().returning(|id| {
            Ok(Some(json!({"id": id, "title": "Full title", "album": {"id": 3}})))
        });
        let orchestrator = orchestrator(&temp, catalog, writing_fetcher());
        let album = AlbumMetadata {
            id: 3,
            title: Some("Record".to_string()),
            track_ids: vec![9],
            tracks: vec![TrackMetadata {
                id: 9,
                ..Default::default()
            }],
            ..Default::default()
        };

        let outcome = orchestrator
            .download(
                DownloadRequest::new(9, Quality::Flac)
                    .with_owner(Owner::Album { album_id: 3 })
                    .with_album(album),
            )
            .await;

        assert!(outcome.ok, "{outcome:?}");
        let sidecar: crate::model::TrackDocument =
            read_json(&temp.path().join("albums/3/tracks/9/flac/track.json")).unwrap();
        assert_eq!(sidecar.track.title.as_deref(), Some("Full title"));
        assert_eq!(sidecar.track.album_title.as_deref(), Some("Record"));
    }

    #[tokio::test]
    async fn test_playlist_request_is_mirrored() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp, empty_catalog(), writing_fetcher());
        let playlist = PlaylistMetadata {
            id: 77,
            title: Some("Mix".to_string()),
            track_ids: vec![9],
            ..Default::default()
        };

        let outcome = orchestrator
            .download(
                DownloadRequest::new(9, Quality::Flac)
                    .with_owner(Owner::Playlist { playlist_id: 77 })
                    .with_track(Some(track(9, None)))
                    .with_playlist(playlist),
            )
            .await;

        assert!(outcome.ok, "{outcome:?}");
        assert_eq!(
            outcome.mirror_path.unwrap(),
            temp.path().join("playlists/77/tracks/9/flac/audio.flac")
        );
        assert!(temp.path().join("playlists/77/playlist.json").exists());
    }

    #[tokio::test]
    async fn test_mirror_failure_keeps_stored_track() {
        let temp = TempDir::new().unwrap();
        let mut strategy = MockLinkStrategy::new();
        strategy
            .expect_method()
            .returning(|| crate::mirror::MirrorMethod::Copy);
        strategy
            .expect_place()
            .returning(|_, _| Err(io::Error::other("read-only")));
        let orchestrator = orchestrator(&temp, empty_catalog(), writing_fetcher())
            .with_mirror(PlaylistMirror::with_strategies(vec![Box::new(strategy)]));

        let outcome = orchestrator
            .download(
                DownloadRequest::new(9, Quality::Flac)
                    .with_owner(Owner::Playlist { playlist_id: 77 })
                    .with_track(Some(track(9, Some(3)))),
            )
            .await;

        assert!(outcome.ok);
        assert_eq!(
            outcome.mirror_error.map(|e| e.error),
            Some(ErrorKind::MirrorFailed)
        );
        let mut saw_mirror_failed = false;
        while let Some(event) = orchestrator.try_recv_event().await {
            saw_mirror_failed |= matches!(event, DownloadEvent::MirrorFailed { playlist_id: 77, .. });
        }
        assert!(saw_mirror_failed);
    }

    #[tokio::test]
    async fn test_cover_is_fetched_before_commit() {
        let temp = TempDir::new().unwrap();
        let mut artwork = MockArtworkFetcher::new();
        artwork
            .expect_fetch_image()
            .times(1)
            .returning(|_| Ok(b"jpeg".to_vec()));
        let orchestrator = orchestrator(&temp, empty_catalog(), writing_fetcher())
            .with_artwork(Arc::new(artwork));
        let mut meta = track(9, Some(3));
        meta.cover_urls = vec!["https://img/3.jpg".to_string()];

        let outcome = orchestrator
            .download(DownloadRequest::new(9, Quality::Flac).with_track(Some(meta)))
            .await;

        assert!(outcome.ok);
        let cover = temp.path().join("albums/3/cover.jpg");
        assert!(cover.exists());
        let index = orchestrator.index().read().await;
        assert_eq!(index.track(9).unwrap().unwrap().cover_path, Some(cover));
    }
}
