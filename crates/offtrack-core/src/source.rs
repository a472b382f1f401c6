//! Parsing of download sources (catalog URLs and short references).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

type Pattern = LazyLock<std::result::Result<Regex, regex::Error>>;

static URL_PATTERN: Pattern = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.)?[A-Za-z0-9.-]+(?:/[a-z]{2}(?:-[a-z]{2})?)?/(track|album|playlist|artist)/(\d+)/?(?:[?#].*)?$",
    )
});

static SHORT_PATTERN: Pattern =
    LazyLock::new(|| Regex::new(r"^(track|album|playlist|artist):(\d+)$"));

fn compiled(pattern: &'static Pattern) -> Result<&'static Regex> {
    pattern
        .as_ref()
        .map_err(|e| Error::Configuration(format!("Invalid source pattern: {e}")))
}

/// What a download source points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    /// A single track.
    Track(u64),
    /// A whole album.
    Album(u64),
    /// A playlist.
    Playlist(u64),
    /// An artist's discography.
    Artist(u64),
}

impl SourceRef {
    fn from_parts(kind: &str, id: &str) -> Option<Self> {
        let id: u64 = id.parse().ok().filter(|id| *id > 0)?;
        match kind {
            "track" => Some(Self::Track(id)),
            "album" => Some(Self::Album(id)),
            "playlist" => Some(Self::Playlist(id)),
            "artist" => Some(Self::Artist(id)),
            _ => None,
        }
    }
}

/// Parse a catalog URL (`https://host/en/album/55`) or a short reference
/// (`album:55`).
pub fn parse_source(input: &str) -> Result<SourceRef> {
    let input = input.trim();
    [compiled(&URL_PATTERN)?, compiled(&SHORT_PATTERN)?]
        .into_iter()
        .find_map(|pattern| {
            let captures = pattern.captures(input)?;
            SourceRef::from_parts(captures.get(1)?.as_str(), captures.get(2)?.as_str())
        })
        .ok_or_else(|| Error::bad_request(format!("Unrecognized download source: {input}")))
}
