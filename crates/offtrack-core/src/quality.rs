//! Audio quality tiers.
//!
//! Tier identifiers are normalized to a closed set (`flac`, `mp3_320`,
//! `mp3_128`). Unrecognized identifiers pass through as [`Quality::Other`] so
//! newer library layouts stay readable, but they never take part in fallback
//! ordering and cannot be downloaded.

use serde::{Deserialize, Serialize};

/// Audio quality tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Quality {
    /// Lossless FLAC.
    Flac,
    /// 320 kbps MP3.
    Mp3_320,
    /// 128 kbps MP3.
    Mp3_128,
    /// Unrecognized tier, kept verbatim.
    Other(String),
}

/// Known tiers from best to worst.
pub const KNOWN_QUALITIES: [Quality; 3] = [Quality::Flac, Quality::Mp3_320, Quality::Mp3_128];

impl Quality {
    /// Normalize a tier identifier.
    ///
    /// ```rust
    /// use offtrack_core::Quality;
    ///
    /// assert_eq!(Quality::normalize("FLAC"), Quality::Flac);
    /// assert_eq!(Quality::normalize("320"), Quality::Mp3_320);
    /// assert_eq!(Quality::normalize("dolby_atmos"), Quality::Other("dolby_atmos".to_string()));
    /// ```
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_lowercase().as_str() {
            "flac" | "lossless" | "9" => Self::Flac,
            "mp3_320" | "320" | "high" | "3" => Self::Mp3_320,
            "mp3_128" | "128" | "standard" | "1" => Self::Mp3_128,
            _ => Self::Other(trimmed.to_string()),
        }
    }

    /// Canonical identifier, used for directory names and JSON keys.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Flac => "flac",
            Self::Mp3_320 => "mp3_320",
            Self::Mp3_128 => "mp3_128",
            Self::Other(raw) => raw,
        }
    }

    /// Numeric bitrate code handed to the fetch capability.
    #[must_use]
    pub const fn bitrate(&self) -> Option<u32> {
        match self {
            Self::Flac => Some(9),
            Self::Mp3_320 => Some(3),
            Self::Mp3_128 => Some(1),
            Self::Other(_) => None,
        }
    }

    /// Inverse of [`Quality::bitrate`].
    #[must_use]
    pub const fn from_bitrate(code: u32) -> Option<Self> {
        match code {
            9 => Some(Self::Flac),
            3 => Some(Self::Mp3_320),
            1 => Some(Self::Mp3_128),
            _ => None,
        }
    }

    /// File extension expected for this tier's native container.
    #[must_use]
    pub const fn default_extension(&self) -> &'static str {
        match self {
            Self::Flac => "flac",
            Self::Mp3_320 | Self::Mp3_128 | Self::Other(_) => "mp3",
        }
    }

    /// Rank in the fallback order (higher is better). `None` for unknown tiers.
    #[must_use]
    pub const fn rank(&self) -> Option<u8> {
        match self {
            Self::Flac => Some(3),
            Self::Mp3_320 => Some(2),
            Self::Mp3_128 => Some(1),
            Self::Other(_) => None,
        }
    }

    /// Whether this is one of the known tiers.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        self.rank().is_some()
    }

    /// Downgrade (never upgrade) to the best tier the user is entitled to.
    ///
    /// The request is left unchanged when no entitled tier is at or below it,
    /// when the entitlement list names no known tier, or when the request is
    /// not a known tier.
    #[must_use]
    pub fn clamp_to(&self, entitled: &[Self]) -> Self {
        let Some(requested_rank) = self.rank() else {
            return self.clone();
        };

        entitled
            .iter()
            .filter(|q| q.rank().is_some_and(|r| r <= requested_rank))
            .max_by_key(|q| q.rank())
            .map_or_else(|| self.clone(), Clone::clone)
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Quality {
    fn from(raw: String) -> Self {
        Self::normalize(&raw)
    }
}

impl From<&str> for Quality {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

impl From<Quality> for String {
    fn from(quality: Quality) -> Self {
        quality.as_str().to_string()
    }
}

/// Order in which tiers are tried when resolving a track.
///
/// The preferred tier first (if given), then flac > mp3_320 > mp3_128, then any
/// remaining tiers from `available` that are not part of the known set.
#[must_use]
pub fn fallback_order<'a>(
    preferred: Option<&Quality>,
    available: impl IntoIterator<Item = &'a Quality>,
) -> Vec<Quality> {
    let mut order: Vec<Quality> = Vec::with_capacity(KNOWN_QUALITIES.len() + 1);
    if let Some(preferred) = preferred {
        order.push(preferred.clone());
    }
    for quality in KNOWN_QUALITIES {
        if !order.contains(&quality) {
            order.push(quality);
        }
    }
    for quality in available {
        if !order.contains(quality) {
            order.push(quality.clone());
        }
    }
    order
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(Quality::normalize("lossless"), Quality::Flac);
        assert_eq!(Quality::normalize(" MP3_320 "), Quality::Mp3_320);
        assert_eq!(Quality::normalize("128"), Quality::Mp3_128);
        assert_eq!(Quality::normalize("1"), Quality::Mp3_128);
        assert_eq!(
            Quality::normalize("hi_res_360"),
            Quality::Other("hi_res_360".to_string())
        );
    }

    #[test]
    fn test_bitrate_codes() {
        assert_eq!(Quality::Flac.bitrate(), Some(9));
        assert_eq!(Quality::Mp3_320.bitrate(), Some(3));
        assert_eq!(Quality::Mp3_128.bitrate(), Some(1));
        assert_eq!(Quality::Other("x".to_string()).bitrate(), None);
        assert_eq!(Quality::from_bitrate(3), Some(Quality::Mp3_320));
        assert_eq!(Quality::from_bitrate(42), None);
    }

    #[test]
    fn test_clamp_downgrades_to_entitlement() {
        let entitled = [Quality::Mp3_320, Quality::Mp3_128];
        assert_eq!(Quality::Flac.clamp_to(&entitled), Quality::Mp3_320);
        assert_eq!(Quality::Mp3_128.clamp_to(&entitled), Quality::Mp3_128);
    }

    #[test]
    fn test_clamp_never_upgrades() {
        let entitled = [Quality::Flac];
        assert_eq!(Quality::Mp3_128.clamp_to(&entitled), Quality::Mp3_128);
        assert_eq!(Quality::Mp3_320.clamp_to(&entitled), Quality::Mp3_320);
        let entitled = [Quality::Flac, Quality::Mp3_128];
        assert_eq!(Quality::Mp3_320.clamp_to(&entitled), Quality::Mp3_128);
    }

    #[test]
    fn test_clamp_without_entitlement_is_identity() {
        assert_eq!(Quality::Flac.clamp_to(&[]), Quality::Flac);
        let other = Quality::Other("x".to_string());
        assert_eq!(other.clamp_to(&[Quality::Mp3_128]), other);
    }

    #[test]
    fn test_fallback_order() {
        let other = Quality::Other("atmos".to_string());
        let available = [Quality::Mp3_128, other.clone()];
        let order = fallback_order(Some(&Quality::Mp3_128), &available);
        assert_eq!(
            order,
            vec![Quality::Mp3_128, Quality::Flac, Quality::Mp3_320, other]
        );

        let order = fallback_order(None, &[]);
        assert_eq!(order, KNOWN_QUALITIES.to_vec());
    }

    #[test]
    fn test_serde_as_string_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(Quality::Mp3_320, 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"mp3_320":1}"#);
        let back: std::collections::BTreeMap<Quality, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&Quality::Mp3_320), Some(&1));
    }
}
