//! Download orchestration.
//!
//! The orchestrator turns "store this track at this tier for this context"
//! into exactly one fetch per `(track, tier)` at a time:
//!
//! - requests are clamped to the user's entitlement, then deduplicated: a
//!   second request for an in-flight key waits for the first one's outcome;
//! - a key already present in the index short-circuits to an ownership stamp
//!   (plus a playlist mirror for playlist requests);
//! - otherwise the fetch capability fills a fresh staging directory, whose
//!   audio is committed into canonical storage and the index.
//!
//! Every job ends with a structured [`DownloadOutcome`], never an `Err`.
//! Group downloads (album, playlist, artist) run their tracks one at a time
//! and can be cancelled between tracks.

mod commit;
mod group;
mod job;
mod request;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info};

pub use commit::{StagedTrack, ensure_track_stored_from_staging};
pub use request::{
    DownloadEvent, DownloadOutcome, DownloadRequest, GroupKey, GroupSummary, JobKey,
};

use crate::error::Error;
use crate::fetch::{ArtworkFetcher, AudioFetcher, Catalog, Entitlements};
use crate::index::SharedIndex;
use crate::layout::PathLayout;
use crate::mirror::PlaylistMirror;
use crate::model::Owner;
use crate::quality::Quality;

/// Shared state of one in-flight job.
#[derive(Debug)]
struct InFlight {
    outcome: watch::Receiver<Option<DownloadOutcome>>,
    cancel: Arc<AtomicBool>,
}

type InFlightMap = Mutex<HashMap<JobKey, InFlight>>;

/// Evicts a job from the in-flight map when dropped.
struct InFlightGuard<'a> {
    map: &'a InFlightMap,
    key: JobKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Whether this caller leads a job or joins one already running.
enum Role {
    Lead(watch::Sender<Option<DownloadOutcome>>, Arc<AtomicBool>),
    Join(watch::Receiver<Option<DownloadOutcome>>),
}

/// Coordinates download jobs against one library.
pub struct DownloadOrchestrator {
    index: SharedIndex,
    layout: PathLayout,
    catalog: Arc<dyn Catalog>,
    fetcher: Arc<dyn AudioFetcher>,
    entitlements: Arc<dyn Entitlements>,
    artwork: Option<Arc<dyn ArtworkFetcher>>,
    mirror: PlaylistMirror,
    in_flight: InFlightMap,
    cancelled_groups: Mutex<HashSet<GroupKey>>,
    /// Running group downloads, counted from their first catalog lookup.
    active_groups: Mutex<HashMap<GroupKey, usize>>,
    staging_seq: AtomicU64,
    event_tx: mpsc::UnboundedSender<DownloadEvent>,
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<DownloadEvent>>>,
}

impl std::fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("layout", &self.layout)
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

impl DownloadOrchestrator {
    /// Create an orchestrator over `index`.
    pub fn new(
        index: SharedIndex,
        layout: PathLayout,
        catalog: Arc<dyn Catalog>,
        fetcher: Arc<dyn AudioFetcher>,
        entitlements: Arc<dyn Entitlements>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            index,
            layout,
            catalog,
            fetcher,
            entitlements,
            artwork: None,
            mirror: PlaylistMirror::default(),
            in_flight: Mutex::new(HashMap::new()),
            cancelled_groups: Mutex::new(HashSet::new()),
            active_groups: Mutex::new(HashMap::new()),
            staging_seq: AtomicU64::new(0),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
        }
    }

    /// Fetch missing album covers at commit time with `fetcher`.
    #[must_use]
    pub fn with_artwork(mut self, fetcher: Arc<dyn ArtworkFetcher>) -> Self {
        self.artwork = Some(fetcher);
        self
    }

    /// Use a custom playlist mirror.
    #[must_use]
    pub fn with_mirror(mut self, mirror: PlaylistMirror) -> Self {
        self.mirror = mirror;
        self
    }

    /// Index this orchestrator commits into.
    #[must_use]
    pub const fn index(&self) -> &SharedIndex {
        &self.index
    }

    /// Store one track. Never fails: failures are reported in the outcome.
    pub async fn download(&self, request: DownloadRequest) -> DownloadOutcome {
        let track_id = request.track_id;
        let quality = request
            .quality
            .clamp_to(&self.entitlements.entitled_qualities());
        if quality != request.quality {
            debug!(
                "Clamped track {} from {} to {}",
                track_id, request.quality, quality
            );
        }

        if track_id == 0 {
            return self.reject(&request, quality, Error::bad_request("track id is required"));
        }
        if !quality.is_known() {
            let message = format!("unsupported quality {quality}");
            return self.reject(&request, quality, Error::bad_request(message));
        }

        let key = JobKey::new(track_id, quality.clone());
        let role = {
            let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = map.get(&key) {
                Role::Join(existing.outcome.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                let cancel = Arc::new(AtomicBool::new(false));
                map.insert(
                    key.clone(),
                    InFlight {
                        outcome: rx,
                        cancel: Arc::clone(&cancel),
                    },
                );
                Role::Lead(tx, cancel)
            }
        };

        match role {
            Role::Join(rx) => {
                debug!("Joining in-flight download {}", key);
                let outcome = Self::join(rx, track_id, quality.clone()).await;
                self.adopt_joined(&request, &quality, outcome).await
            }
            Role::Lead(tx, cancel) => {
                let _guard = InFlightGuard {
                    map: &self.in_flight,
                    key,
                };
                self.emit(DownloadEvent::TrackStarted {
                    track_id,
                    quality: quality.clone(),
                });

                let outcome = match self.execute(&request, &quality, &cancel).await {
                    Ok(outcome) => outcome,
                    Err(Error::DownloadCancelled { .. }) => {
                        info!("Download of track {} at {} cancelled", track_id, quality);
                        DownloadOutcome::cancelled(track_id, quality)
                    }
                    Err(e) => {
                        error!("Download of track {} at {} failed: {}", track_id, quality, e);
                        DownloadOutcome::failed(track_id, quality, &e)
                    }
                };

                self.emit(DownloadEvent::for_outcome(&outcome));
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
        }
    }

    async fn join(
        mut rx: watch::Receiver<Option<DownloadOutcome>>,
        track_id: u64,
        quality: Quality,
    ) -> DownloadOutcome {
        let shared = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        // A leader that vanished without an outcome was cancelled.
        shared.unwrap_or_else(|| DownloadOutcome::cancelled(track_id, quality))
    }

    fn reject(
        &self,
        request: &DownloadRequest,
        quality: Quality,
        error: Error,
    ) -> DownloadOutcome {
        error!("Rejected download of track {}: {}", request.track_id, error);
        let outcome = DownloadOutcome::failed(request.track_id, quality, &error);
        self.emit(DownloadEvent::for_outcome(&outcome));
        outcome
    }

    /// Flag in-flight jobs of `track_id` as cancelled (every tier when
    /// `quality` is `None`). Returns how many jobs were flagged.
    pub fn cancel_download(&self, track_id: u64, quality: Option<&Quality>) -> usize {
        let map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let mut flagged = 0;
        for (key, job) in map.iter() {
            if key.track_id == track_id && quality.is_none_or(|q| *q == key.quality) {
                job.cancel.store(true, Ordering::SeqCst);
                flagged += 1;
            }
        }
        info!("Cancellation requested for track {} ({} jobs)", track_id, flagged);
        flagged
    }

    /// Stop a group download before its next track. The track in flight
    /// finishes normally.
    pub fn cancel_group(&self, group: GroupKey) {
        info!("Cancellation requested for {}", group);
        self.cancelled_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group);
    }

    /// Whether jobs made for `owner` belong to a cancelled group.
    pub fn is_cancelled_owner(&self, owner: &Owner) -> bool {
        self.cancelled_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|group| group.contains(owner))
    }

    /// Number of jobs currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Try to receive a download event without blocking.
    pub async fn try_recv_event(&self) -> Option<DownloadEvent> {
        let mut rx = self.event_rx.write().await;
        rx.try_recv().ok()
    }

    /// Get a clone of the event sender for external use.
    #[must_use]
    pub fn event_sender(&self) -> mpsc::UnboundedSender<DownloadEvent> {
        self.event_tx.clone()
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.event_tx.send(event);
    }

    fn next_staging_seq(&self) -> u64 {
        self.staging_seq.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fetch::{
        FetchError, FetchRequest, MockAudioFetcher, MockCatalog, StaticEntitlements,
    };
    use crate::index::LibraryIndex;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn catalog() -> MockCatalog {
        let mut catalog = MockCatalog::new();
        catalog.expect_track().returning(|id| {
            Ok(Some(json!({
                "id": id,
                "title": format!("Track {id}"),
                "artist": {"id": 7, "name": "Band"},
                "album": {"id": 55, "title": "Record"}
            })))
        });
        catalog.expect_album().returning(|id| {
            Ok(Some(json!({
                "id": id,
                "title": "Record",
                "artist": {"id": 7, "name": "Band"},
                "tracks": {"data": [{"id": 101}, {"id": 102}]}
            })))
        });
        catalog
    }

    fn write_staged(request: &FetchRequest) {
        fs::create_dir_all(&request.destination).unwrap();
        fs::write(request.destination.join("track.mp3"), b"audio-bytes").unwrap();
    }

    fn orchestrator(
        temp: &TempDir,
        fetcher: MockAudioFetcher,
        entitled: Vec<Quality>,
    ) -> DownloadOrchestrator {
        let layout = PathLayout::new(temp.path());
        DownloadOrchestrator::new(
            LibraryIndex::new(layout.clone()).shared(),
            layout,
            Arc::new(catalog()),
            Arc::new(fetcher),
            Arc::new(StaticEntitlements(entitled)),
        )
    }

    fn staging_is_empty(root: &Path) -> bool {
        fs::read_dir(root.join("__staging")).map_or(true, |mut d| d.next().is_none())
    }

    #[tokio::test]
    async fn test_download_commits_and_cleans_staging() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().times(1).returning(|request| {
            assert_eq!(request.bitrate, 1);
            write_staged(&request);
            Ok(())
        });
        let orchestrator = orchestrator(&temp, fetcher, vec![]);

        let outcome = orchestrator
            .download(
                DownloadRequest::new(101, Quality::Mp3_128)
                    .with_owner(Owner::Album { album_id: 55 }),
            )
            .await;

        assert!(outcome.ok, "{outcome:?}");
        assert!(!outcome.already_downloaded);
        assert_eq!(
            outcome.path.unwrap(),
            temp.path().join("albums/55/tracks/101/mp3_128/audio.mp3")
        );
        assert!(staging_is_empty(temp.path()));
        assert_eq!(orchestrator.in_flight_count(), 0);

        assert!(matches!(
            orchestrator.try_recv_event().await,
            Some(DownloadEvent::TrackStarted { track_id: 101, .. })
        ));
        assert!(matches!(
            orchestrator.try_recv_event().await,
            Some(DownloadEvent::TrackFinished { track_id: 101, .. })
        ));
    }

    #[tokio::test]
    async fn test_second_request_short_circuits() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().times(1).returning(|request| {
            write_staged(&request);
            Ok(())
        });
        let orchestrator = orchestrator(&temp, fetcher, vec![]);

        let first = orchestrator
            .download(DownloadRequest::new(101, Quality::Mp3_128))
            .await;
        let second = orchestrator
            .download(
                DownloadRequest::new(101, Quality::Mp3_128)
                    .with_owner(Owner::Album { album_id: 55 }),
            )
            .await;

        assert!(first.ok && second.ok);
        assert!(second.already_downloaded);
        let index = orchestrator.index().read().await;
        let entry = index.track(101).unwrap().unwrap();
        assert_eq!(entry.qualities[&Quality::Mp3_128].owners.len(), 2);
    }

    #[tokio::test]
    async fn test_quality_is_clamped_to_entitlement() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().times(1).returning(|request| {
            assert_eq!(request.bitrate, 3);
            write_staged(&request);
            Ok(())
        });
        let orchestrator = orchestrator(&temp, fetcher, vec![Quality::Mp3_320, Quality::Mp3_128]);

        let outcome = orchestrator
            .download(DownloadRequest::new(101, Quality::Flac))
            .await;

        assert!(outcome.ok);
        assert_eq!(outcome.quality, Quality::Mp3_320);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_structured() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().returning(|_| {
            Err(FetchError::Failed {
                message: "stream unavailable".to_string(),
                detail: Some("403".to_string()),
            })
        });
        let orchestrator = orchestrator(&temp, fetcher, vec![]);

        let outcome = orchestrator
            .download(DownloadRequest::new(101, Quality::Mp3_128))
            .await;

        assert!(!outcome.ok);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::DownloadFailed));
        assert_eq!(outcome.error.unwrap().detail.as_deref(), Some("403"));
        assert!(staging_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_empty_staging_is_no_audio_file() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().returning(|request| {
            fs::write(request.destination.join("cover.jpg"), b"img").unwrap();
            Ok(())
        });
        let orchestrator = orchestrator(&temp, fetcher, vec![]);

        let outcome = orchestrator
            .download(DownloadRequest::new(101, Quality::Mp3_128))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::NoAudioFile));
        assert!(staging_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp, MockAudioFetcher::new(), vec![]);

        let outcome = orchestrator
            .download(DownloadRequest::new(0, Quality::Flac))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::BadRequest));

        let outcome = orchestrator
            .download(DownloadRequest::new(1, Quality::Other("atmos".to_string())))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::BadRequest));

        let outcome = orchestrator
            .download(
                DownloadRequest::new(1, Quality::Flac).with_owner(Owner::Album { album_id: 0 }),
            )
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::MissingAlbumContext));
    }

    #[tokio::test]
    async fn test_concurrent_requests_fetch_once() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().returning(move |request| {
            counter.fetch_add(1, Ordering::SeqCst);
            write_staged(&request);
            Ok(())
        });
        let orchestrator = orchestrator(&temp, fetcher, vec![]);

        let (a, b) = tokio::join!(
            orchestrator.download(DownloadRequest::new(101, Quality::Mp3_128)),
            orchestrator.download(DownloadRequest::new(101, Quality::Mp3_128)),
        );

        assert!(a.ok && b.ok);
        assert_eq!(a.path, b.path);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_not_committed() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().returning(|request| {
            write_staged(&request);
            // The engine noticed cancellation between its steps.
            request.cancel.store(true, Ordering::SeqCst);
            Err(FetchError::Cancelled)
        });
        let orchestrator = orchestrator(&temp, fetcher, vec![]);

        let outcome = orchestrator
            .download(DownloadRequest::new(101, Quality::Mp3_128))
            .await;

        assert!(outcome.is_cancelled());
        assert!(staging_is_empty(temp.path()));
        let mut index = orchestrator.index().write().await;
        assert!(index.resolve_track(101, None).is_err());
    }

    #[tokio::test]
    async fn test_group_cancellation_is_structural() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp, MockAudioFetcher::new(), vec![]);
        assert_eq!(orchestrator.cancel_download(101, None), 0);

        orchestrator.cancel_group(GroupKey::Album(55));
        assert!(orchestrator.is_cancelled_owner(&Owner::Album { album_id: 55 }));
        assert!(!orchestrator.is_cancelled_owner(&Owner::Album { album_id: 56 }));
        assert!(!orchestrator.is_cancelled_owner(&Owner::AdHoc));
    }
}
