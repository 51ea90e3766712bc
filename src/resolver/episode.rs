//! Cross-source episode resolution.
//!
//! A video reference that also exists as a podcast episode should be acquired
//! through the feed instead of the platform. Resolution matches the video's
//! channel name against podcast feeds, fuzzy when needed, and remembers
//! confirmed channel-to-feed pairings in an alias cache so repeat lookups
//! skip the fuzzy pass entirely.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clients::episodes::EpisodeSearchBackend;
use crate::db::Store;
use crate::models::AcquisitionTarget;

/// Most similar feed candidates considered per lookup.
const MAX_CANDIDATES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeCandidate {
    pub feed_url: String,
    pub feed_title: String,
    pub episode_guid: String,
    pub episode_title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// Cached alias hit, no fuzzy comparison performed.
    Alias,
    /// Fuzzy channel match at or above the auto-accept threshold.
    Fuzzy,
    /// Fuzzy match in the gray zone; caller decides whether to trust it.
    FuzzyLowConfidence,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub candidate: EpisodeCandidate,
    pub confidence: f64,
    pub method: ResolutionMethod,
}

pub struct EpisodeResolver {
    store: Store,
    backend: Arc<dyn EpisodeSearchBackend>,
    auto_accept: f64,
    low_confidence: f64,
    fuzzy_calls: AtomicU64,
}

impl EpisodeResolver {
    pub fn new(
        store: Store,
        backend: Arc<dyn EpisodeSearchBackend>,
        auto_accept: f64,
        low_confidence: f64,
    ) -> Self {
        Self {
            store,
            backend,
            auto_accept,
            low_confidence,
            fuzzy_calls: AtomicU64::new(0),
        }
    }

    /// Number of fuzzy comparisons performed since construction.
    pub fn fuzzy_call_count(&self) -> u64 {
        self.fuzzy_calls.load(Ordering::Relaxed)
    }

    /// Attempts to resolve a video target to a feed episode. Returns `None`
    /// when the target has no channel/title metadata or no feed matches
    /// above the low-confidence floor.
    pub async fn resolve(&self, target: &AcquisitionTarget) -> Result<Option<Resolved>> {
        let (Some(channel), Some(title)) = (&target.channel, &target.title) else {
            return Ok(None);
        };

        let alias_key = alias_key(channel);

        if let Some(alias) = self
            .store
            .get_alias(&alias_key)
            .await
            .context("alias lookup")?
        {
            debug!(channel = %channel, feed = %alias.feed_url, "alias cache hit");
            if let Some(episode) = self
                .backend
                .find_episode(&alias.feed_url, title)
                .await
                .context("episode lookup in aliased feed")?
            {
                return Ok(Some(Resolved {
                    candidate: EpisodeCandidate {
                        feed_url: alias.feed_url,
                        feed_title: alias.feed_title,
                        episode_guid: episode.guid,
                        episode_title: episode.title,
                    },
                    confidence: 1.0,
                    method: ResolutionMethod::Alias,
                }));
            }
            // Feed is the right one but this episode is not in it; no
            // point running the fuzzy pass against other feeds.
            return Ok(None);
        }

        let feeds = self
            .backend
            .search_feeds(channel)
            .await
            .context("feed search")?;
        if feeds.is_empty() {
            return Ok(None);
        }

        let wanted = normalize_channel(channel);
        let mut scored: Vec<(f64, _)> = feeds
            .into_iter()
            .map(|feed| {
                self.fuzzy_calls.fetch_add(1, Ordering::Relaxed);
                let score = strsim::normalized_levenshtein(&wanted, &normalize_channel(&feed.title));
                (score, feed)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(MAX_CANDIDATES);

        let (score, best) = match scored.first() {
            Some((score, feed)) if *score >= self.low_confidence => (*score, feed.clone()),
            _ => return Ok(None),
        };

        let Some(episode) = self
            .backend
            .find_episode(&best.url, title)
            .await
            .context("episode lookup in matched feed")?
        else {
            return Ok(None);
        };

        let method = if score >= self.auto_accept {
            self.store
                .upsert_alias(&alias_key, &best.url, &best.title, score)
                .await
                .context("persisting channel alias")?;
            info!(channel = %channel, feed = %best.url, score, "channel alias learned");
            ResolutionMethod::Fuzzy
        } else {
            ResolutionMethod::FuzzyLowConfidence
        };

        Ok(Some(Resolved {
            candidate: EpisodeCandidate {
                feed_url: best.url,
                feed_title: best.title,
                episode_guid: episode.guid,
                episode_title: episode.title,
            },
            confidence: score,
            method,
        }))
    }
}

fn alias_key(channel: &str) -> String {
    format!("channel:{}", normalize_channel(channel))
}

/// Channel names vary in decoration across sources; strip the common noise
/// before comparing.
fn normalize_channel(name: &str) -> String {
    let mut s = name.trim().to_lowercase();
    if let Some(rest) = s.strip_prefix("the ") {
        s = rest.to_string();
    }
    for suffix in [" podcast", " show", " channel"] {
        if let Some(rest) = s.strip_suffix(suffix) {
            s = rest.to_string();
            break;
        }
    }
    s.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_decorations() {
        assert_eq!(normalize_channel("The Daily Widget Podcast"), "daily widget");
        assert_eq!(normalize_channel("Widget Show"), "widget");
        assert_eq!(normalize_channel("  Plain Name "), "plain name");
    }

    #[test]
    fn alias_keys_collide_for_equivalent_names() {
        assert_eq!(
            alias_key("The Daily Widget Podcast"),
            alias_key("daily widget")
        );
    }
}
