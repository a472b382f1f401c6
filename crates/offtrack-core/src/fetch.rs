//! External capabilities the library depends on.
//!
//! The catalog client, the audio fetch engine, cover image downloads and the
//! user's entitlements all live outside this crate. They are consumed through
//! the traits below and held as `Arc<dyn ...>`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::quality::Quality;

/// Failure reported by an external capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The operation observed its cancellation flag and stopped.
    #[error("cancelled")]
    Cancelled,

    /// The operation failed.
    #[error("{message}")]
    Failed {
        /// Human-readable message.
        message: String,
        /// Error chain or stack, when available.
        detail: Option<String>,
    },
}

impl FetchError {
    /// Failure with a message and no detail.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            detail: None,
        }
    }
}

/// Authenticated catalog client returning raw upstream documents.
///
/// `Ok(None)` means the catalog has no such entity.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Track document by id.
    async fn track(&self, track_id: u64) -> Result<Option<Value>, FetchError>;

    /// Album document by id, including its track list.
    async fn album(&self, album_id: u64) -> Result<Option<Value>, FetchError>;

    /// Playlist document by id, including its track list.
    async fn playlist(&self, playlist_id: u64) -> Result<Option<Value>, FetchError>;

    /// Album documents of an artist's discography.
    async fn artist_albums(&self, artist_id: u64) -> Result<Vec<Value>, FetchError>;
}

/// Parameters of one audio fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Track to fetch.
    pub track_id: u64,
    /// Bitrate code of the requested tier.
    pub bitrate: u32,
    /// Staging directory to populate.
    pub destination: PathBuf,
    /// Cooperative cancellation flag.
    pub cancel: Arc<AtomicBool>,
}

impl FetchRequest {
    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Engine that downloads (and decrypts) audio into a staging directory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    /// Populate `request.destination` with one or more audio files.
    async fn fetch(&self, request: FetchRequest) -> Result<(), FetchError>;
}

/// Downloader for cover images.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtworkFetcher: Send + Sync {
    /// Image bytes at `url`.
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Source of the tiers the current user may stream.
#[cfg_attr(test, mockall::automock)]
pub trait Entitlements: Send + Sync {
    /// Entitled tiers. Empty means unknown, in which case nothing is clamped.
    fn entitled_qualities(&self) -> Vec<Quality>;
}

/// Fixed entitlement list.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements(pub Vec<Quality>);

impl Entitlements for StaticEntitlements {
    fn entitled_qualities(&self) -> Vec<Quality> {
        self.0.clone()
    }
}
