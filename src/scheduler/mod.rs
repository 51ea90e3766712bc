//! Session-based duty-cycle scheduler.
//!
//! One logical worker per account, but only one session runs at a time per
//! account and sessions are consumed strictly in order. All shared mutable
//! state (credential health, plans, the pending and retry queues) lives
//! behind a single mutex so cooldown and last-use bookkeeping cannot race.
//! The state document is rewritten after every mutation; per-item completion
//! is tracked in the stage ledger, which is what makes crash recovery safe.

pub mod plan;
pub mod state;

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::classifier::{FailureKind, classify};
use crate::clients::{FetchBackend, PacingHint, ProgressBus, ProgressEvent, TranscribeBackend};
use crate::config::Config;
use crate::db::Store;
use crate::models::{AcquisitionTarget, Stage, StageState, StageStatusInput};

pub use plan::{PlanStatus, SessionPlan};
pub use state::{AccountState, SchedulerState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueEntry {
    pub target: AcquisitionTarget,
    pub attempts: u32,
    pub last_error: String,
    pub kind: FailureKind,
    pub last_account: Option<usize>,
    pub not_before: DateTime<Utc>,
}

struct Shared {
    state: SchedulerState,
    pending: VecDeque<AcquisitionTarget>,
    retry: Vec<RetryQueueEntry>,
}

impl Shared {
    /// Pulls up to `limit` items for the given account: eligible retry
    /// entries first (preferring ones that last failed on a different
    /// account), then fresh targets.
    fn take_batch(
        &mut self,
        account_index: usize,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<(AcquisitionTarget, u32)> {
        let mut batch = Vec::with_capacity(limit);

        let mut pass = |retry: &mut Vec<RetryQueueEntry>,
                        batch: &mut Vec<(AcquisitionTarget, u32)>,
                        other_account_only: bool| {
            let mut i = 0;
            while i < retry.len() && batch.len() < limit {
                let eligible = retry[i].not_before <= now
                    && (!other_account_only || retry[i].last_account != Some(account_index));
                if eligible {
                    let entry = retry.remove(i);
                    batch.push((entry.target, entry.attempts));
                } else {
                    i += 1;
                }
            }
        };
        pass(&mut self.retry, &mut batch, true);
        pass(&mut self.retry, &mut batch, false);

        while batch.len() < limit {
            match self.pending.pop_front() {
                Some(target) => batch.push((target, 0)),
                None => break,
            }
        }
        batch
    }

    fn queued_len(&self) -> usize {
        self.pending.len() + self.retry.len()
    }
}

pub struct Scheduler {
    config: Config,
    store: Store,
    fetcher: Arc<dyn FetchBackend>,
    transcriber: Arc<dyn TranscribeBackend>,
    progress: ProgressBus,
    shared: Arc<Mutex<Shared>>,
    state_path: PathBuf,
    shutdown: watch::Receiver<bool>,
}

enum ItemOutcome {
    Completed,
    Requeued,
    PermanentFailure,
    /// The account can no longer continue this session.
    AccountStopped,
}

impl Scheduler {
    pub fn new(
        config: Config,
        store: Store,
        fetcher: Arc<dyn FetchBackend>,
        transcriber: Arc<dyn TranscribeBackend>,
        progress: ProgressBus,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let state_path = PathBuf::from(&config.general.state_path);
        let mut state = SchedulerState::load_or_default(&state_path)?;
        state.sync_accounts(&config.accounts.credentials);
        Ok(Self {
            config,
            store,
            fetcher,
            transcriber,
            progress,
            shared: Arc::new(Mutex::new(Shared {
                state,
                pending: VecDeque::new(),
                retry: Vec::new(),
            })),
            state_path,
            shutdown,
        })
    }

    /// Direct access to the persisted state, for inspection commands.
    pub async fn snapshot(&self) -> SchedulerState {
        self.shared.lock().await.state.clone()
    }

    /// Queues targets for the slow path and records them in the stage
    /// ledger so a restart can find them again.
    pub async fn enqueue(&self, targets: Vec<AcquisitionTarget>) -> Result<()> {
        for target in &targets {
            self.store
                .upsert_stage(&StageStatusInput::new(
                    &target.canonical_id,
                    Stage::Audio,
                    StageState::Queued,
                ))
                .await?;
        }
        let mut shared = self.shared.lock().await;
        shared.pending.extend(targets);
        Ok(())
    }

    pub async fn queued_len(&self) -> usize {
        self.shared.lock().await.queued_len()
    }

    /// Tops up session plans immediately, for one-shot runs that do not go
    /// through the daemon loop.
    pub async fn ensure_plans(&self) -> Result<()> {
        let now = Utc::now();
        let mut shared = self.shared.lock().await;
        let mut rng = rand::rng();
        shared
            .state
            .extend_plans(now, &self.config.sessions, &mut rng);
        for account in shared.state.accounts.values_mut() {
            account.skip_expired(now);
        }
        shared.state.persist(&self.state_path)?;
        Ok(())
    }

    /// Overwrites an account's plans, for tests and manual scheduling.
    pub async fn set_plans(&self, account_index: usize, plans: Vec<SessionPlan>) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if let Some(account) = shared.state.accounts.get_mut(&account_index) {
            account.plans = plans;
            account.next_session_idx = 0;
        }
        shared.state.persist(&self.state_path)?;
        Ok(())
    }

    /// Daemon loop: top up plans, then keep one session task per due
    /// account in flight. Accounts run their sessions concurrently; each
    /// account still consumes its own plans strictly in order. Returns on
    /// shutdown, after in-flight sessions have wound down.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("Scheduler started");
        let mut sessions: JoinSet<usize> = JoinSet::new();
        let mut running: HashSet<usize> = HashSet::new();

        loop {
            if *self.shutdown.borrow() {
                info!("Scheduler stopping");
                while let Some(finished) = sessions.join_next().await {
                    if let Ok(idx) = finished {
                        running.remove(&idx);
                    }
                }
                return Ok(());
            }

            let now = Utc::now();
            let due = {
                let mut shared = self.shared.lock().await;
                let mut rng = rand::rng();
                shared
                    .state
                    .extend_plans(now, &self.config.sessions, &mut rng);
                for account in shared.state.accounts.values_mut() {
                    account.skip_expired(now);
                }
                shared.state.persist(&self.state_path)?;
                shared.state.due_accounts(now, &self.config.accounts)
            };

            for account_index in due {
                if running.contains(&account_index) {
                    continue;
                }
                running.insert(account_index);
                let this = Arc::clone(self);
                sessions.spawn(async move {
                    if let Err(e) = this.run_session(account_index).await {
                        error!(account_index, "session failed: {e:#}");
                    }
                    account_index
                });
            }

            let wakeup = {
                let shared = self.shared.lock().await;
                shared.state.next_wakeup(now)
            };
            let cap = StdDuration::from_secs(self.config.scheduler.sleep_cap_secs);
            let sleep_for = match wakeup {
                Some(t) if t > now => {
                    let until = (t - now).to_std().unwrap_or(StdDuration::from_secs(1));
                    until.min(cap)
                }
                Some(_) => StdDuration::from_secs(1),
                None => cap,
            };
            debug!(
                secs = sleep_for.as_secs(),
                in_flight = running.len(),
                "scheduler idle"
            );

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
                Some(finished) = sessions.join_next(), if !running.is_empty() => {
                    if let Ok(idx) = finished {
                        running.remove(&idx);
                    }
                }
            }
        }
    }

    /// Drains the queues by running due sessions back to back, without the
    /// daemon's idle sleeps. Used for one-shot batch runs. Stops when the
    /// queues are empty, nothing further is runnable, or no account remains
    /// active.
    pub async fn run_once(&self) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let now = Utc::now();
            let (due, queued, active) = {
                let shared = self.shared.lock().await;
                (
                    shared.state.due_account(now, &self.config.accounts),
                    shared.queued_len(),
                    shared.state.active_account_count(),
                )
            };
            if queued == 0 {
                return Ok(());
            }
            if active == 0 {
                warn!("no active accounts remain, {} targets left queued", queued);
                return Ok(());
            }
            let Some(account_index) = due else {
                debug!(queued, "queue not empty but no session is due");
                return Ok(());
            };
            self.run_session(account_index).await?;
        }
    }

    async fn run_session(&self, account_index: usize) -> Result<()> {
        let now = Utc::now();

        // Claim the session and its batch under one lock.
        let (account_name, batch) = {
            let mut shared = self.shared.lock().await;
            let Some(account) = shared.state.accounts.get_mut(&account_index) else {
                return Ok(());
            };
            let name = account.credential.name.clone();
            let Some(plan) = account.current_plan_mut() else {
                return Ok(());
            };
            plan.status = PlanStatus::Running;
            let limit = plan.max_items as usize;
            let batch = shared.take_batch(account_index, limit, now);
            shared.state.persist(&self.state_path)?;
            (name, batch)
        };

        info!(
            account = %account_name,
            items = batch.len(),
            "session started"
        );
        self.progress.publish(ProgressEvent::SessionStarted {
            account: account_name.clone(),
            max_items: batch.len(),
        });

        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut stopped_at: Option<usize> = None;

        for (i, (target, attempts)) in batch.iter().enumerate() {
            if *self.shutdown.borrow() {
                stopped_at = Some(i);
                break;
            }

            match self
                .run_item(account_index, &account_name, target, *attempts)
                .await?
            {
                ItemOutcome::Completed => completed += 1,
                ItemOutcome::Requeued => failed += 1,
                ItemOutcome::PermanentFailure => failed += 1,
                ItemOutcome::AccountStopped => {
                    failed += 1;
                    stopped_at = Some(i + 1);
                    break;
                }
            }

            if i + 1 < batch.len() {
                let delay = {
                    let mut rng = rand::rng();
                    rng.random_range(
                        self.config.pacing.slow_delay_min_secs
                            ..=self.config.pacing.slow_delay_max_secs,
                    )
                };
                if self
                    .interruptible_sleep(StdDuration::from_secs(delay))
                    .await
                {
                    stopped_at = Some(i + 1);
                    break;
                }
            }
        }

        // Whatever the session did not get to goes back to the front of the
        // queue; an account disable additionally marks those items blocked
        // in the stage ledger (handled at failure time).
        if let Some(cut) = stopped_at {
            let leftover: Vec<_> = batch[cut..].iter().map(|(t, _)| t.clone()).collect();
            if !leftover.is_empty() {
                self.requeue_blocked(account_index, &leftover).await?;
            }
        }

        {
            let mut shared = self.shared.lock().await;
            if let Some(account) = shared.state.accounts.get_mut(&account_index) {
                account.advance();
            }
            let mut rng = rand::rng();
            shared
                .state
                .mark_request(account_index, Utc::now(), &self.config.accounts, &mut rng);
            shared.state.persist(&self.state_path)?;
        }

        info!(account = %account_name, completed, failed, "session finished");
        self.progress.publish(ProgressEvent::SessionFinished {
            account: account_name,
            completed,
            failed,
        });
        Ok(())
    }

    async fn run_item(
        &self,
        account_index: usize,
        account_name: &str,
        target: &AcquisitionTarget,
        prior_attempts: u32,
    ) -> Result<ItemOutcome> {
        // The stage ledger, not queue membership, decides whether the work
        // is already done. This is what makes crash replays idempotent.
        if self
            .store
            .stage_completed(&target.canonical_id, Stage::Audio)
            .await?
        {
            debug!(target = %target.canonical_id, "audio already acquired, skipping");
            return Ok(ItemOutcome::Completed);
        }

        self.store
            .upsert_stage(
                &StageStatusInput::new(&target.canonical_id, Stage::Audio, StageState::InProgress)
                    .worker(account_name),
            )
            .await?;

        let fetch = self
            .fetcher
            .fetch_audio(&target.raw_reference, account_name, PacingHint::Slow)
            .await;

        match fetch {
            Ok(outcome) => {
                counter!("scribarr_fetch_success_total").increment(1);
                {
                    let mut shared = self.shared.lock().await;
                    if let Some(account) = shared.state.accounts.get_mut(&account_index) {
                        account.credential.record_success(Utc::now());
                    }
                    shared.state.persist(&self.state_path)?;
                }
                self.store.set_audio_complete(&target.canonical_id).await?;
                self.store
                    .upsert_stage(
                        &StageStatusInput::new(
                            &target.canonical_id,
                            Stage::Audio,
                            StageState::Completed,
                        )
                        .worker(account_name)
                        .metadata(serde_json::json!({ "local_path": outcome.local_file })),
                    )
                    .await?;

                self.transcribe_audio(target, &outcome.local_file).await?;
                Ok(ItemOutcome::Completed)
            }
            Err(err) => {
                let error_text = err.to_string();
                self.handle_fetch_failure(account_index, account_name, target, prior_attempts, &error_text)
                    .await
            }
        }
    }

    async fn handle_fetch_failure(
        &self,
        account_index: usize,
        account_name: &str,
        target: &AcquisitionTarget,
        prior_attempts: u32,
        error_text: &str,
    ) -> Result<ItemOutcome> {
        let classification = classify(error_text);
        let kind = classification.kind;
        let now = Utc::now();
        counter!("scribarr_fetch_failures_total", "kind" => kind.as_str()).increment(1);
        warn!(
            target = %target.canonical_id,
            account = %account_name,
            kind = %kind,
            error = %error_text,
            "fetch failed"
        );

        let attempts = prior_attempts + 1;
        let newly_disabled = {
            let mut shared = self.shared.lock().await;
            let disabled = shared
                .state
                .accounts
                .get_mut(&account_index)
                .is_some_and(|account| account.credential.record_failure(kind, error_text, now));
            if kind == FailureKind::RateLimit
                && let Some(account) = shared.state.accounts.get_mut(&account_index)
            {
                let until =
                    now + Duration::seconds(self.config.retry.rate_limit_cooldown_secs as i64);
                account.credential.apply_cooldown(until);
            }
            shared.state.persist(&self.state_path)?;
            disabled
        };

        let permanent = !classification.retryable || attempts >= self.config.retry.max_attempts;

        if permanent {
            self.store
                .record_permanent_failure(&target.raw_reference, kind.as_str(), error_text)
                .await?;
            self.store
                .upsert_stage(
                    &StageStatusInput::new(&target.canonical_id, Stage::Audio, StageState::Failed)
                        .worker(account_name)
                        .metadata(serde_json::json!({
                            "error": error_text,
                            "kind": kind.as_str(),
                            "attempts": attempts,
                        })),
                )
                .await?;
            self.progress.publish(ProgressEvent::TargetFailed {
                target_id: target.canonical_id.clone(),
                kind: kind.as_str().to_string(),
                permanent: true,
            });
        } else {
            let backoff = self.config.retry.backoff_base_secs.saturating_mul(
                1u64 << (attempts - 1).min(8),
            );
            let entry = RetryQueueEntry {
                target: target.clone(),
                attempts,
                last_error: error_text.to_string(),
                kind,
                last_account: Some(account_index),
                not_before: now + Duration::seconds(backoff as i64),
            };
            let mut shared = self.shared.lock().await;
            shared.retry.push(entry);
            self.progress.publish(ProgressEvent::TargetFailed {
                target_id: target.canonical_id.clone(),
                kind: kind.as_str().to_string(),
                permanent: false,
            });
        }

        if newly_disabled {
            warn!(account = %account_name, "account disabled after repeated auth failures");
            counter!("scribarr_accounts_disabled_total").increment(1);
            self.progress.publish(ProgressEvent::AccountDisabled {
                account: account_name.to_string(),
            });
            return Ok(ItemOutcome::AccountStopped);
        }
        if kind == FailureKind::RateLimit {
            // The account is cooling down; the rest of the batch goes back.
            return Ok(ItemOutcome::AccountStopped);
        }
        if permanent {
            Ok(ItemOutcome::PermanentFailure)
        } else {
            Ok(ItemOutcome::Requeued)
        }
    }

    /// Returns unworked batch items to the retry queue and marks them
    /// blocked in the ledger so an operator can see why they stalled.
    async fn requeue_blocked(
        &self,
        account_index: usize,
        leftover: &[AcquisitionTarget],
    ) -> Result<()> {
        for target in leftover {
            self.store
                .upsert_stage(&StageStatusInput::new(
                    &target.canonical_id,
                    Stage::Audio,
                    StageState::Blocked,
                ))
                .await?;
        }
        let now = Utc::now();
        let mut shared = self.shared.lock().await;
        for target in leftover {
            shared.retry.push(RetryQueueEntry {
                target: target.clone(),
                attempts: 0,
                last_error: String::new(),
                kind: FailureKind::Transient,
                last_account: Some(account_index),
                not_before: now,
            });
        }
        Ok(())
    }

    async fn transcribe_audio(&self, target: &AcquisitionTarget, local_file: &str) -> Result<()> {
        self.store
            .upsert_stage(&StageStatusInput::new(
                &target.canonical_id,
                Stage::Transcript,
                StageState::InProgress,
            ))
            .await?;

        match self.transcriber.transcribe(local_file).await {
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
            }
            Err(err) => {
                // Audio is safely on disk; a later sweep can retry the
                // transcription without re-downloading.
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
            }
        }
        Ok(())
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

    /// Sleeps, returning true if shutdown was signalled.
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
}

pub(crate) fn sanitize_id(canonical_id: &str) -> String {
    canonical_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
