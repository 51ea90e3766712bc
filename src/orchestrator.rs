//! Two-phase acquisition orchestrator.
//!
//! Phase 1 is the rapid pass: lightweight metadata for every target, an
//! episode-resolution attempt so feed-hosted content is fetched from its
//! feed, and a direct captions grab where the platform already has a
//! transcript. Phase 2 is the slow path for whatever remains: feed episodes
//! download directly, platform videos go through the account scheduler.
//! Every transition lands in the stage ledger, so either phase can resume
//! after a crash without redoing finished work.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::classifier::classify;
use crate::clients::{FetchBackend, PacingHint, ProgressBus, ProgressEvent, TranscribeBackend};
use crate::config::Config;
use crate::db::Store;
use crate::dedup::{DedupPolicy, DedupService};
use crate::models::{AcquisitionTarget, Stage, StageState, StageStatusInput, TargetKind};
use crate::resolver::episode::{EpisodeResolver, ResolutionMethod};
use crate::resolver::ident;
use crate::scheduler::{Scheduler, sanitize_id};

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub total: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub captioned: usize,
    pub feed_direct: usize,
    pub queued_slow: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    config: Config,
    store: Store,
    fetcher: Arc<dyn FetchBackend>,
    transcriber: Arc<dyn TranscribeBackend>,
    resolver: EpisodeResolver,
    dedup: DedupService,
    scheduler: Arc<Scheduler>,
    progress: ProgressBus,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Store,
        fetcher: Arc<dyn FetchBackend>,
        transcriber: Arc<dyn TranscribeBackend>,
        resolver: EpisodeResolver,
        scheduler: Arc<Scheduler>,
        progress: ProgressBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let dedup = DedupService::new(store.clone());
        Self {
            config,
            store,
            fetcher,
            transcriber,
            resolver,
            dedup,
            scheduler,
            progress,
            shutdown,
        }
    }

    /// Runs a batch of raw references through both phases. With `drain`
    /// set, the scheduler is driven to completion inline; otherwise queued
    /// videos are left for the daemon's sessions.
    pub async fn run(
        &self,
        references: &[String],
        policy: DedupPolicy,
        drain: bool,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary {
            total: references.len(),
            ..RunSummary::default()
        };

        let mut targets = Vec::with_capacity(references.len());
        for reference in references {
            match ident::canonicalize(reference) {
                Ok(target) => targets.push(target),
                Err(err) => {
                    warn!(reference = %reference, error = %err, "skipping malformed reference");
                    summary.malformed += 1;
                    self.store
                        .record_permanent_failure(reference, "malformed", &err.to_string())
                        .await?;
                }
            }
        }

        for target in &targets {
            self.store.upsert_record(target).await?;
        }

        let parts = self.dedup.partition(targets, policy).await?;
        summary.duplicates = parts.duplicates.len();
        for (target, reason) in &parts.duplicates {
            debug!(target = %target.canonical_id, reason = %reason, "duplicate skipped");
        }
        info!(
            unique = parts.unique.len(),
            duplicates = summary.duplicates,
            "batch accepted"
        );
        self.progress.publish(ProgressEvent::BatchStarted {
            total: summary.total,
            duplicates: summary.duplicates,
        });

        let slow_path = self.phase_one(parts.unique, &mut summary).await?;
        self.phase_two(slow_path, drain, &mut summary).await?;

        self.progress.publish(ProgressEvent::BatchFinished {
            completed: summary.captioned + summary.feed_direct,
            failed: summary.failed,
        });
        Ok(summary)
    }

    /// Rapid pass. Returns the targets that still need the slow path.
    async fn phase_one(
        &self,
        targets: Vec<AcquisitionTarget>,
        summary: &mut RunSummary,
    ) -> Result<Vec<AcquisitionTarget>> {
        let mut slow_path = Vec::new();
        let mut since_pause = 0u32;

        for mut target in targets {
            if *self.shutdown.borrow() {
                slow_path.push(target);
                continue;
            }

            if self
                .store
                .stage_completed(&target.canonical_id, Stage::Transcript)
                .await?
            {
                debug!(target = %target.canonical_id, "transcript already present");
                continue;
            }

            self.ensure_metadata(&mut target).await?;

            if target.kind == TargetKind::Video {
                target = self.try_resolve_to_feed(target).await?;
            }

            if target.kind == TargetKind::Video && self.try_captions(&target).await? {
                summary.captioned += 1;
            } else {
                self.progress.publish(ProgressEvent::QueuedForSlowPath {
                    target_id: target.canonical_id.clone(),
                });
                slow_path.push(target);
            }

            since_pause += 1;
            if since_pause >= self.config.pacing.rapid_batch_size {
                since_pause = 0;
                let pause = draw(
                    self.config.pacing.rapid_pause_min_secs,
                    self.config.pacing.rapid_pause_max_secs,
                );
                debug!(secs = pause, "rapid batch pause");
                self.interruptible_sleep(StdDuration::from_secs(pause)).await;
            } else {
                let delay = draw(
                    self.config.pacing.rapid_delay_min_secs,
                    self.config.pacing.rapid_delay_max_secs,
                );
                self.interruptible_sleep(StdDuration::from_secs(delay)).await;
            }
        }

        Ok(slow_path)
    }

    async fn phase_two(
        &self,
        slow_path: Vec<AcquisitionTarget>,
        drain: bool,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let (feed, video): (Vec<_>, Vec<_>) = slow_path
            .into_iter()
            .partition(|t| t.kind == TargetKind::FeedEpisode);

        for target in feed {
            if *self.shutdown.borrow() {
                break;
            }
            if self.acquire_feed_episode(&target).await? {
                summary.feed_direct += 1;
            } else {
                summary.failed += 1;
            }
            let delay = draw(
                self.config.pacing.slow_delay_min_secs,
                self.config.pacing.slow_delay_max_secs,
            );
            if self
                .interruptible_sleep(StdDuration::from_secs(delay))
                .await
            {
                break;
            }
        }

        summary.queued_slow = video.len();
        if !video.is_empty() {
            self.scheduler.enqueue(video).await?;
            self.scheduler.ensure_plans().await?;
            if drain {
                self.scheduler.run_once().await?;
            }
        }
        Ok(())
    }

    /// Fetches metadata once per target; a prior completed metadata stage
    /// is reused from the record.
    async fn ensure_metadata(&self, target: &mut AcquisitionTarget) -> Result<()> {
        if let Some(record) = self.store.get_record(&target.canonical_id).await?
            && record.metadata_complete
        {
            target.title = record.title;
            target.channel = record.channel;
            return Ok(());
        }

        match self.fetcher.fetch_metadata(&target.raw_reference).await {
            Ok(meta) => {
                target.title = Some(meta.title.clone());
                target.channel = meta.channel.clone();
                self.store.upsert_record(target).await?;
                self.store.set_metadata_complete(&target.canonical_id).await?;
                self.store
                    .upsert_stage(&StageStatusInput::new(
                        &target.canonical_id,
                        Stage::Metadata,
                        StageState::Completed,
                    ))
                    .await?;
                self.progress.publish(ProgressEvent::MetadataFetched {
                    target_id: target.canonical_id.clone(),
                    title: meta.title,
                });
            }
            Err(err) => {
                let c = classify(&err.to_string());
                warn!(
                    target = %target.canonical_id,
                    kind = %c.kind,
                    error = %err,
                    "metadata fetch failed"
                );
                self.store
                    .upsert_stage(
                        &StageStatusInput::new(
                            &target.canonical_id,
                            Stage::Metadata,
                            StageState::Failed,
                        )
                        .metadata(serde_json::json!({ "error": err.to_string() })),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Swaps a video target over to its feed-hosted equivalent when the
    /// resolver finds one with enough confidence. Low-confidence matches
    /// stay on the platform path.
    async fn try_resolve_to_feed(&self, target: AcquisitionTarget) -> Result<AcquisitionTarget> {
        let resolved = match self.resolver.resolve(&target).await {
            Ok(r) => r,
            Err(err) => {
                warn!(target = %target.canonical_id, error = %err, "episode resolution failed");
                None
            }
        };

        let Some(resolved) = resolved else {
            return Ok(target);
        };
        if resolved.method == ResolutionMethod::FuzzyLowConfidence {
            debug!(
                target = %target.canonical_id,
                confidence = resolved.confidence,
                "low-confidence feed match, keeping platform source"
            );
            return Ok(target);
        }

        info!(
            target = %target.canonical_id,
            feed = %resolved.candidate.feed_url,
            confidence = resolved.confidence,
            "resolved to feed episode"
        );
        counter!("scribarr_feed_resolutions_total").increment(1);
        let mut swapped = target;
        swapped.kind = TargetKind::FeedEpisode;
        swapped.raw_reference = format!(
            "{}#{}",
            resolved.candidate.feed_url, resolved.candidate.episode_guid
        );
        self.store.upsert_record(&swapped).await?;
        Ok(swapped)
    }

    /// Attempts the direct captions grab. Returns true when a transcript
    /// was written.
    async fn try_captions(&self, target: &AcquisitionTarget) -> Result<bool> {
        let credential = self
            .config
            .accounts
            .credentials
            .first()
            .map_or("", String::as_str);

        match self
            .fetcher
            .fetch_captions(&target.raw_reference, credential)
            .await
        {
            Ok(Some(text)) => {
                let path = self.write_transcript(&target.canonical_id, &text).await?;
                self.store.set_transcript(&target.canonical_id, &path).await?;
                self.store
                    .upsert_stage(&StageStatusInput::new(
                        &target.canonical_id,
                        Stage::Transcript,
                        StageState::Completed,
                    ))
                    .await?;
                counter!("scribarr_transcripts_total", "source" => "captions").increment(1);
                self.progress.publish(ProgressEvent::TranscriptAcquired {
                    target_id: target.canonical_id.clone(),
                    via_captions: true,
                });
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => {
                debug!(target = %target.canonical_id, error = %err, "captions fetch failed");
                Ok(false)
            }
        }
    }

    /// Feed audio is public, so it skips the account machinery entirely:
    /// one direct download plus transcription.
    async fn acquire_feed_episode(&self, target: &AcquisitionTarget) -> Result<bool> {
        if self
            .store
            .stage_completed(&target.canonical_id, Stage::Transcript)
            .await?
        {
            return Ok(true);
        }

        self.store
            .upsert_stage(&StageStatusInput::new(
                &target.canonical_id,
                Stage::Audio,
                StageState::InProgress,
            ))
            .await?;

        let outcome = match self
            .fetcher
            .fetch_audio(&target.raw_reference, "", PacingHint::Slow)
            .await
        {
            Ok(o) => o,
            Err(err) => {
                let c = classify(&err.to_string());
                warn!(target = %target.canonical_id, error = %err, "feed download failed");
                self.store
                    .record_permanent_failure(
                        &target.raw_reference,
                        c.kind.as_str(),
                        &err.to_string(),
                    )
                    .await?;
                self.store
                    .upsert_stage(
                        &StageStatusInput::new(
                            &target.canonical_id,
                            Stage::Audio,
                            StageState::Failed,
                        )
                        .metadata(serde_json::json!({ "error": err.to_string() })),
                    )
                    .await?;
                self.progress.publish(ProgressEvent::TargetFailed {
                    target_id: target.canonical_id.clone(),
                    kind: c.kind.as_str().to_string(),
                    permanent: true,
                });
                return Ok(false);
            }
        };

        self.store.set_audio_complete(&target.canonical_id).await?;
        self.store
            .upsert_stage(
                &StageStatusInput::new(&target.canonical_id, Stage::Audio, StageState::Completed)
                    .metadata(serde_json::json!({ "local_path": outcome.local_file })),
            )
            .await?;

        match self.transcriber.transcribe(&outcome.local_file).await {
            Ok(text) => {
                let path = self.write_transcript(&target.canonical_id, &text).await?;
                self.store.set_transcript(&target.canonical_id, &path).await?;
                self.store
                    .upsert_stage(&StageStatusInput::new(
                        &target.canonical_id,
                        Stage::Transcript,
                        StageState::Completed,
                    ))
                    .await?;
                counter!("scribarr_transcripts_total", "source" => "local").increment(1);
                self.progress.publish(ProgressEvent::TranscriptAcquired {
                    target_id: target.canonical_id.clone(),
                    via_captions: false,
                });
                Ok(true)
            }
            Err(err) => {
                warn!(target = %target.canonical_id, error = %err, "transcription failed");
                self.store
                    .upsert_stage(
                        &StageStatusInput::new(
                            &target.canonical_id,
                            Stage::Transcript,
                            StageState::Failed,
                        )
                        .metadata(serde_json::json!({ "error": err.to_string() })),
                    )
                    .await?;
                Ok(false)
            }
        }
    }

    /// Sweep for targets whose audio landed but whose transcription failed
    /// or was interrupted. Retries the transcription from the stored local
    /// path without touching the network.
    pub async fn transcribe_pending(&self) -> Result<usize> {
        let completed_audio = self
            .store
            .list_stage_with_status(Stage::Audio, StageState::Completed)
            .await?;

        let mut recovered = 0;
        for row in completed_audio {
            if self.store.stage_completed(&row.target_id, Stage::Transcript).await? {
                continue;
            }
            let Some(local_path) = row
                .metadata
                .as_deref()
                .and_then(|m| serde_json::from_str::<serde_json::Value>(m).ok())
                .and_then(|v| v.get("local_path").and_then(|p| p.as_str().map(String::from)))
            else {
                continue;
            };

            match self.transcriber.transcribe(&local_path).await {
                Ok(text) => {
                    let path = self.write_transcript(&row.target_id, &text).await?;
                    self.store.set_transcript(&row.target_id, &path).await?;
                    self.store
                        .upsert_stage(&StageStatusInput::new(
                            &row.target_id,
                            Stage::Transcript,
                            StageState::Completed,
                        ))
                        .await?;
                    recovered += 1;
                }
                Err(err) => {
                    warn!(target = %row.target_id, error = %err, "transcription retry failed");
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered pending transcriptions");
        }
        Ok(recovered)
    }

    /// Sleeps, returning true if shutdown was signalled. The phase loops
    /// re-check the flag at their top, so an interrupted pacing delay sends
    /// the remaining targets to the slow path instead of stalling exit.
    async fn interruptible_sleep(&self, duration: StdDuration) -> bool {
        // A cloned receiver marks the current value as seen, so a signal
        // that landed before the clone must be checked explicitly.
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown.changed() => *shutdown.borrow(),
        }
    }

    async fn write_transcript(&self, canonical_id: &str, text: &str) -> Result<String> {
        let dir = PathBuf::from(&self.config.general.transcripts_path);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating transcripts dir {}", dir.display()))?;
        let file = dir.join(format!("{}.txt", sanitize_id(canonical_id)));
        tokio::fs::write(&file, text)
            .await
            .with_context(|| format!("writing transcript {}", file.display()))?;
        Ok(file.display().to_string())
    }
}

fn draw(min: u64, max: u64) -> u64 {
    if min >= max {
        return min;
    }
    let mut rng = rand::rng();
    rand::Rng::random_range(&mut rng, min..=max)
}
