//! HTTP client for the podcast search index.
//!
//! The index answers two narrow questions: which feeds could belong to a
//! channel name, and does a given feed carry an episode with this title.
//! Episode lookup returns at most a handful of candidates instead of the
//! whole feed, which is what makes resolution cheap.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search index unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("search index error: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedCandidate {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpisodeItem {
    pub guid: String,
    pub title: String,
}

#[async_trait]
pub trait EpisodeSearchBackend: Send + Sync {
    async fn search_feeds(&self, channel: &str) -> Result<Vec<FeedCandidate>, SearchError>;

    async fn find_episode(
        &self,
        feed_url: &str,
        title: &str,
    ) -> Result<Option<EpisodeItem>, SearchError>;
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

pub struct HttpEpisodeSearchClient {
    client: Client,
    base_url: String,
}

impl HttpEpisodeSearchClient {
    pub fn new(config: &SearchConfig) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SearchError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SearchError::Upstream(format!("{status}: {text}")));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl EpisodeSearchBackend for HttpEpisodeSearchClient {
    async fn search_feeds(&self, channel: &str) -> Result<Vec<FeedCandidate>, SearchError> {
        debug!(channel, "feed search");
        #[derive(Deserialize)]
        struct Feeds {
            feeds: Vec<FeedCandidate>,
        }
        let body: Feeds = self.get_json("/search/byterm", &[("q", channel)]).await?;
        Ok(body.feeds)
    }

    async fn find_episode(
        &self,
        feed_url: &str,
        title: &str,
    ) -> Result<Option<EpisodeItem>, SearchError> {
        debug!(feed_url, title, "episode lookup");
        #[derive(Deserialize)]
        struct Episodes {
            items: Vec<EpisodeItem>,
        }
        let body: Episodes = self
            .get_json("/episodes/bytitle", &[("feed", feed_url), ("title", title)])
            .await?;
        Ok(body.items.into_iter().next())
    }
}
