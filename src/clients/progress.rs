//! Progress events for the acquisition pipeline.
//!
//! Events are broadcast best-effort; a slow or absent subscriber never
//! blocks the pipeline. The default subscriber just logs them.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ProgressEvent {
    BatchStarted {
        total: usize,
        duplicates: usize,
    },
    MetadataFetched {
        target_id: String,
        title: String,
    },
    TranscriptAcquired {
        target_id: String,
        via_captions: bool,
    },
    QueuedForSlowPath {
        target_id: String,
    },
    SessionStarted {
        account: String,
        max_items: usize,
    },
    SessionFinished {
        account: String,
        completed: usize,
        failed: usize,
    },
    AccountDisabled {
        account: String,
    },
    TargetFailed {
        target_id: String,
        kind: String,
        permanent: bool,
    },
    BatchFinished {
        completed: usize,
        failed: usize,
    },
}

#[derive(Clone)]
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Send ignoring the no-subscribers error.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    /// Spawns a task that mirrors every event into the log.
    pub fn spawn_log_sink(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            info!(target: "progress", "{}", json);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
