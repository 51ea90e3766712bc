//! HTTP client for the platform fetch service.
//!
//! The fetch service wraps the actual platform tooling; this crate only
//! decides which credential to present and how hard to push. Failures carry
//! the upstream error text verbatim so the classifier can pattern-match it.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Upstream(String),
}

/// Advisory pacing passed through to the fetch service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingHint {
    Rapid,
    Slow,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub channel: Option<String>,
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchOutcome {
    pub local_file: String,
}

#[async_trait]
pub trait FetchBackend: Send + Sync {
    /// Lightweight metadata for a reference, no credential needed.
    async fn fetch_metadata(&self, reference: &str) -> Result<VideoMetadata, FetchError>;

    /// Pre-made captions where the platform exposes them. `Ok(None)` means
    /// the reference has no captions, which is not an error.
    async fn fetch_captions(
        &self,
        reference: &str,
        credential: &str,
    ) -> Result<Option<String>, FetchError>;

    /// Full audio download using the given credential.
    async fn fetch_audio(
        &self,
        reference: &str,
        credential: &str,
        pacing: PacingHint,
    ) -> Result<FetchOutcome, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

pub struct HttpFetchClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct FetchRequest<'a> {
    reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pacing: Option<PacingHint>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FetchResponse<T> {
    Ok(T),
    Err { error: String },
}

impl HttpFetchClient {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &FetchRequest<'_>,
    ) -> Result<T, FetchError> {
        debug!(path, reference = body.reference, "fetch service call");
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(FetchError::Upstream(format!("{status}: {text}")));
        }

        match resp.json::<FetchResponse<T>>().await? {
            FetchResponse::Ok(v) => Ok(v),
            FetchResponse::Err { error } => Err(FetchError::Upstream(error)),
        }
    }
}

#[async_trait]
impl FetchBackend for HttpFetchClient {
    async fn fetch_metadata(&self, reference: &str) -> Result<VideoMetadata, FetchError> {
        self.post(
            "/metadata",
            &FetchRequest {
                reference,
                credential: None,
                pacing: None,
            },
        )
        .await
    }

    async fn fetch_captions(
        &self,
        reference: &str,
        credential: &str,
    ) -> Result<Option<String>, FetchError> {
        #[derive(Deserialize)]
        struct Captions {
            text: Option<String>,
        }
        let captions: Captions = self
            .post(
                "/captions",
                &FetchRequest {
                    reference,
                    credential: Some(credential),
                    pacing: Some(PacingHint::Rapid),
                },
            )
            .await?;
        Ok(captions.text)
    }

    async fn fetch_audio(
        &self,
        reference: &str,
        credential: &str,
        pacing: PacingHint,
    ) -> Result<FetchOutcome, FetchError> {
        self.post(
            "/audio",
            &FetchRequest {
                reference,
                credential: Some(credential),
                pacing: Some(pacing),
            },
        )
        .await
    }
}
