//! Album, playlist and artist downloads.

use std::sync::PoisonError;

use tracing::{info, warn};

use super::request::{DownloadEvent, DownloadRequest, GroupKey, GroupSummary};
use super::DownloadOrchestrator;
use crate::error::{Error, Result};
use crate::fetch::FetchError;
use crate::metadata::{AlbumMetadata, PlaylistMetadata};
use crate::model::Owner;
use crate::quality::Quality;
use crate::store::read_json;

/// Group-level catalog lookups read failures as "absent".
fn lookup<T>(what: &str, result: std::result::Result<T, FetchError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Catalog lookup of {} failed: {}", what, e);
            None
        }
    }
}

/// One running download of a group, from its first catalog lookup to its
/// last track.
struct GroupRun<'a> {
    orchestrator: &'a DownloadOrchestrator,
    group: GroupKey,
}

impl Drop for GroupRun<'_> {
    fn drop(&mut self) {
        let mut active = self
            .orchestrator
            .active_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let remaining = active.get_mut(&self.group).map(|count| {
            *count = count.saturating_sub(1);
            *count
        });
        if remaining.unwrap_or_default() == 0 {
            active.remove(&self.group);
            self.orchestrator
                .cancelled_groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.group);
        }
    }
}

impl DownloadOrchestrator {
    /// Register a run of `group`. A cancellation left from an earlier run is
    /// dropped only when no other run of the group is active, so a cancel
    /// issued while this run resolves its track list still applies.
    fn begin_group(&self, group: GroupKey) -> GroupRun<'_> {
        let mut active = self.active_groups.lock().unwrap_or_else(PoisonError::into_inner);
        let count = active.entry(group).or_default();
        if *count == 0 {
            self.cancelled_groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&group);
        }
        *count = count.saturating_add(1);
        GroupRun {
            orchestrator: self,
            group,
        }
    }

    /// Download every track of an album.
    pub async fn download_album(&self, album_id: u64, quality: &Quality) -> Result<GroupSummary> {
        let _run = self.begin_group(GroupKey::Album(album_id));
        let album = self
            .group_album(album_id)
            .await
            .ok_or(Error::MissingAlbumMetadata { album_id })?;
        let requests = album
            .track_ids
            .iter()
            .map(|track_id| {
                DownloadRequest::new(*track_id, quality.clone())
                    .with_owner(Owner::Album { album_id })
                    .with_album(album.clone())
            })
            .collect();
        Ok(self.run_group(GroupKey::Album(album_id), requests).await)
    }

    /// Download every track of a playlist and mirror it into the playlist.
    pub async fn download_playlist(
        &self,
        playlist_id: u64,
        quality: &Quality,
    ) -> Result<GroupSummary> {
        let _run = self.begin_group(GroupKey::Playlist(playlist_id));
        let what = format!("playlist {playlist_id}");
        let playlist = lookup(&what, self.catalog.playlist(playlist_id).await)
            .flatten()
            .and_then(|value| PlaylistMetadata::from_value(&value))
            .or_else(|| read_json(&self.layout.playlist_json(playlist_id)))
            .ok_or_else(|| Error::not_found(what))?;
        let requests = playlist
            .track_ids
            .iter()
            .map(|track_id| {
                DownloadRequest::new(*track_id, quality.clone())
                    .with_owner(Owner::Playlist { playlist_id })
                    .with_playlist(playlist.clone())
            })
            .collect();
        Ok(self.run_group(GroupKey::Playlist(playlist_id), requests).await)
    }

    /// Download an artist's discography.
    ///
    /// Every album's track list is resolved before the first track starts so
    /// the announced total is complete.
    pub async fn download_artist(&self, artist_id: u64, quality: &Quality) -> Result<GroupSummary> {
        let _run = self.begin_group(GroupKey::Artist(artist_id));
        let what = format!("artist {artist_id}");
        let documents = lookup(&what, self.catalog.artist_albums(artist_id).await)
            .unwrap_or_default();
        if documents.is_empty() {
            return Err(Error::not_found(what));
        }

        let mut requests = Vec::new();
        for document in &documents {
            let Some(mut album) = AlbumMetadata::from_value(document) else {
                continue;
            };
            if album.track_ids.is_empty() {
                match self.group_album(album.id).await {
                    Some(full) => album = full,
                    None => {
                        warn!("Skipping album {} of artist {}: no track list", album.id, artist_id);
                        continue;
                    }
                }
            }
            let album_id = album.id;
            requests.extend(album.track_ids.iter().map(|track_id| {
                DownloadRequest::new(*track_id, quality.clone())
                    .with_owner(Owner::Artist {
                        artist_id,
                        album_id,
                    })
                    .with_album(album.clone())
            }));
        }
        Ok(self.run_group(GroupKey::Artist(artist_id), requests).await)
    }

    async fn group_album(&self, album_id: u64) -> Option<AlbumMetadata> {
        lookup(&format!("album {album_id}"), self.catalog.album(album_id).await)
            .flatten()
            .and_then(|value| AlbumMetadata::from_value(&value))
            .or_else(|| read_json(&self.layout.album_json(album_id)))
    }

    /// Run `requests` one at a time, checking for cancellation of `group`
    /// before each track.
    async fn run_group(&self, group: GroupKey, requests: Vec<DownloadRequest>) -> GroupSummary {
        let total = requests.len();
        let mut summary = GroupSummary::new(group, total);
        info!("Starting download of {} ({} tracks)", group, total);
        self.emit(DownloadEvent::GroupStarted { group, total });

        for (position, request) in requests.into_iter().enumerate() {
            if self.is_cancelled_owner(&request.owner) {
                summary.cancelled = true;
                summary.skipped = total - position;
                info!("Download of {} cancelled, {} tracks skipped", group, summary.skipped);
                break;
            }
            let outcome = self.download(request).await;
            summary.record(&outcome);
        }

        info!(
            "Finished download of {}: {} stored, {} already present, {} failed",
            group, summary.stored, summary.already_downloaded, summary.failed
        );
        self.emit(DownloadEvent::GroupFinished {
            summary: summary.clone(),
        });
        summary
    }
}
