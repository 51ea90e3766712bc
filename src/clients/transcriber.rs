//! HTTP client for the local transcription service.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("transcription service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("transcription failed: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait TranscribeBackend: Send + Sync {
    async fn transcribe(&self, audio_file: &str) -> Result<String, TranscribeError>;
}

#[derive(Debug, Clone)]
pub struct TranscriberConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

pub struct HttpTranscribeClient {
    client: Client,
    base_url: String,
}

impl HttpTranscribeClient {
    pub fn new(config: &TranscriberConfig) -> Result<Self, TranscribeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    audio_file: &'a str,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: Option<String>,
    error: Option<String>,
}

#[async_trait]
impl TranscribeBackend for HttpTranscribeClient {
    async fn transcribe(&self, audio_file: &str) -> Result<String, TranscribeError> {
        debug!(audio_file, "transcription request");
        let resp = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .json(&TranscribeRequest { audio_file })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TranscribeError::Upstream(format!("{status}: {text}")));
        }

        let body: TranscribeResponse = resp.json().await?;
        match (body.text, body.error) {
            (Some(text), _) => Ok(text),
            (None, Some(error)) => Err(TranscribeError::Upstream(error)),
            (None, None) => Err(TranscribeError::Upstream("empty response".to_string())),
        }
    }
}
