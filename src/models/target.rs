use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of source a reference points at.
///
/// `Video` means a streaming-platform reference that needs an account session
/// to fetch; `FeedEpisode` means an open podcast feed enclosure that can be
/// fetched directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Video,
    FeedEpisode,
}

impl TargetKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::FeedEpisode => "feed_episode",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "feed_episode" => Ok(Self::FeedEpisode),
            other => Err(anyhow::anyhow!("unknown target kind: {other}")),
        }
    }
}

/// One piece of content awaiting acquisition.
///
/// Immutable once canonicalized; the canonical id is the key used by the
/// dedup service, the stage tracker and the acquisition record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionTarget {
    pub raw_reference: String,
    pub canonical_id: String,
    pub kind: TargetKind,
    pub title: Option<String>,
    pub channel: Option<String>,
}

impl AcquisitionTarget {
    #[must_use]
    pub fn new(
        raw_reference: impl Into<String>,
        canonical_id: impl Into<String>,
        kind: TargetKind,
    ) -> Self {
        Self {
            raw_reference: raw_reference.into(),
            canonical_id: canonical_id.into(),
            kind,
            title: None,
            channel: None,
        }
    }

    #[must_use]
    pub fn with_titles(mut self, title: Option<String>, channel: Option<String>) -> Self {
        self.title = title;
        self.channel = channel;
        self
    }
}

impl fmt::Display for AcquisitionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.canonical_id, self.kind)
    }
}
