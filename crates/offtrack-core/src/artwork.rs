//! Album cover fetching and healing.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fetch::{ArtworkFetcher, FetchError};
use crate::index::SharedIndex;
use crate::layout::PathLayout;
use crate::metadata::AlbumMetadata;
use crate::model::TrackDocument;
use crate::store::{is_non_empty_file, read_json, write_bytes_atomic};

/// Default timeout for cover fetch requests.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// [`ArtworkFetcher`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpArtworkFetcher {
    client: reqwest::Client,
}

impl HttpArtworkFetcher {
    /// Create a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtworkFetcher for HttpArtworkFetcher {
    async fn fetch_image(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| FetchError::failed(format!("Failed to fetch cover: {e}")))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("image/") {
            warn!("Unexpected content type for cover: {}", content_type);
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| FetchError::failed(format!("Failed to read cover data: {e}")))?;
        if data.is_empty() {
            return Err(FetchError::failed("Empty cover data"));
        }
        Ok(data.to_vec())
    }
}

/// Make sure `albums/<id>/cover.jpg` exists, trying `urls` in order.
///
/// Returns the cover path when it exists afterwards.
pub async fn ensure_album_cover(
    layout: &PathLayout,
    album_id: u64,
    urls: &[String],
    fetcher: &dyn ArtworkFetcher,
) -> Option<PathBuf> {
    let cover = layout.album_cover(album_id);
    if is_non_empty_file(&cover) {
        return Some(cover);
    }
    for url in urls {
        match fetcher.fetch_image(url).await {
            Ok(bytes) if !bytes.is_empty() => match write_bytes_atomic(&cover, &bytes) {
                Ok(()) => {
                    debug!("Fetched cover of album {} from {}", album_id, url);
                    return Some(cover);
                }
                Err(e) => {
                    warn!("Could not write cover of album {}: {}", album_id, e);
                    return None;
                }
            },
            Ok(_) => debug!("Empty cover from {}", url),
            Err(e) => debug!("Cover fetch from {} failed: {}", url, e),
        }
    }
    None
}

/// Counts reported by [`heal_missing_covers`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealReport {
    /// Albums without a cover.
    pub missing: usize,
    /// Covers written.
    pub healed: usize,
    /// Albums still without a cover.
    pub failed: usize,
}

/// Fetch covers for every indexed album that lacks one.
///
/// Candidate URLs come from `album.json`, then from the tracks' cached
/// `track.json`. The index lock is not held while fetching.
pub async fn heal_missing_covers(
    index: &SharedIndex,
    fetcher: &dyn ArtworkFetcher,
) -> Result<HealReport> {
    let (layout, candidates) = {
        let mut index = index.write().await;
        index.ensure_loaded()?;
        let layout = index.layout().clone();
        let doc = index.document()?;
        let candidates: Vec<(u64, Vec<String>)> = doc
            .albums
            .values()
            .filter(|album| !is_non_empty_file(&layout.album_cover(album.album_id)))
            .map(|album| {
                let mut urls = read_json::<AlbumMetadata>(&layout.album_json(album.album_id))
                    .map(|meta| meta.cover_urls)
                    .unwrap_or_default();
                for track_id in &album.track_ids {
                    let sidecar = doc
                        .tracks
                        .get(track_id)
                        .and_then(|t| t.metadata_path.as_ref())
                        .and_then(|p| read_json::<TrackDocument>(p));
                    for url in sidecar.map(|s| s.track.cover_urls).unwrap_or_default() {
                        if !urls.contains(&url) {
                            urls.push(url);
                        }
                    }
                }
                (album.album_id, urls)
            })
            .collect();
        (layout, candidates)
    };

    let mut report = HealReport {
        missing: candidates.len(),
        ..HealReport::default()
    };
    let mut healed = Vec::new();
    for (album_id, urls) in candidates {
        match ensure_album_cover(&layout, album_id, &urls, fetcher).await {
            Some(cover) => healed.push((album_id, cover)),
            None => {
                warn!("No cover available for album {}", album_id);
                report.failed += 1;
            }
        }
    }
    report.healed = healed.len();

    if !healed.is_empty() {
        let mut index = index.write().await;
        for (album_id, cover) in healed {
            let Some(album) = index.album(album_id)?.cloned() else {
                continue;
            };
            let mut patch = crate::model::AlbumEntry::new(album_id);
            patch.cover_path = Some(cover.clone());
            index.upsert_album(patch)?;
            for track_id in album.track_ids {
                let mut patch = crate::model::TrackEntry::new(track_id);
                patch.cover_path = Some(cover.clone());
                index.upsert_track(patch)?;
            }
        }
        index.save()?;
    }

    info!(
        "Cover healing: {} missing, {} healed, {} failed",
        report.missing, report.healed, report.failed
    );
    Ok(report)
}
