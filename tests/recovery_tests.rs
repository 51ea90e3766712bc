//! Crash-recovery and account-disable persistence tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::watch;

use scribarr::clients::ProgressBus;
use scribarr::clients::fetcher::{FetchBackend, FetchError, FetchOutcome, PacingHint, VideoMetadata};
use scribarr::clients::transcriber::{TranscribeBackend, TranscribeError};
use scribarr::config::Config;
use scribarr::db::Store;
use scribarr::models::{AcquisitionTarget, Stage, StageState, StageStatusInput, TargetKind};
use scribarr::scheduler::{PlanStatus, Scheduler, SessionPlan};

fn test_config(credentials: &[&str]) -> Config {
    let suffix = uuid::Uuid::new_v4();
    let mut config = Config::default();
    config.general.database_path = format!(
        "sqlite:{}",
        std::env::temp_dir()
            .join(format!("scribarr-rec-{suffix}.db"))
            .display()
    );
    config.general.state_path = std::env::temp_dir()
        .join(format!("scribarr-rec-state-{suffix}.json"))
        .display()
        .to_string();
    config.general.transcripts_path = std::env::temp_dir()
        .join(format!("scribarr-rec-tx-{suffix}"))
        .display()
        .to_string();
    config.accounts.credentials = credentials.iter().map(|s| (*s).to_string()).collect();
    config.accounts.min_request_delay_secs = 0;
    config.accounts.max_request_delay_secs = 0;
    config.accounts.quiet_hours_start = 0;
    config.accounts.quiet_hours_end = 0;
    config.pacing.slow_delay_min_secs = 0;
    config.pacing.slow_delay_max_secs = 0;
    config.retry.backoff_base_secs = 0;
    config
}

/// Backend that rejects every audio fetch with an auth challenge.
struct AlwaysAuthFail;

#[async_trait]
impl FetchBackend for AlwaysAuthFail {
    async fn fetch_metadata(&self, reference: &str) -> Result<VideoMetadata, FetchError> {
        Ok(VideoMetadata {
            title: reference.to_string(),
            channel: None,
            duration_secs: None,
        })
    }

    async fn fetch_captions(
        &self,
        _reference: &str,
        _credential: &str,
    ) -> Result<Option<String>, FetchError> {
        Ok(None)
    }

    async fn fetch_audio(
        &self,
        _reference: &str,
        _credential: &str,
        _pacing: PacingHint,
    ) -> Result<FetchOutcome, FetchError> {
        Err(FetchError::Upstream(
            "401 Unauthorized: sign in to continue".to_string(),
        ))
    }
}

/// Backend whose audio fetch only proceeds once two callers are inside it,
/// so completing a pair of downloads proves the sessions overlapped.
struct PairedFetch {
    barrier: tokio::sync::Barrier,
}

#[async_trait]
impl FetchBackend for PairedFetch {
    async fn fetch_metadata(&self, reference: &str) -> Result<VideoMetadata, FetchError> {
        Ok(VideoMetadata {
            title: reference.to_string(),
            channel: None,
            duration_secs: None,
        })
    }

    async fn fetch_captions(
        &self,
        _reference: &str,
        _credential: &str,
    ) -> Result<Option<String>, FetchError> {
        Ok(None)
    }

    async fn fetch_audio(
        &self,
        reference: &str,
        _credential: &str,
        _pacing: PacingHint,
    ) -> Result<FetchOutcome, FetchError> {
        self.barrier.wait().await;
        Ok(FetchOutcome {
            local_file: format!("/tmp/audio/{reference}.m4a"),
        })
    }
}

struct NoopTranscribe;

#[async_trait]
impl TranscribeBackend for NoopTranscribe {
    async fn transcribe(&self, _audio_file: &str) -> Result<String, TranscribeError> {
        Ok(String::new())
    }
}

fn build_scheduler(
    config: &Config,
    store: Store,
    fetch: Arc<dyn FetchBackend>,
) -> (Arc<Scheduler>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(
        Scheduler::new(
            config.clone(),
            store,
            fetch,
            Arc::new(NoopTranscribe),
            ProgressBus::new(),
            shutdown_rx,
        )
        .expect("scheduler"),
    );
    (scheduler, shutdown_tx)
}

fn video(i: usize) -> AcquisitionTarget {
    AcquisitionTarget::new(
        format!("crash{i:06}"),
        format!("yt:crash{i:06}"),
        TargetKind::Video,
    )
}

#[tokio::test]
async fn account_disable_survives_restart() {
    let config = test_config(&["acc-0"]);
    let store = Store::new(&config.general.database_path).await.unwrap();

    let (scheduler, _tx) = build_scheduler(&config, store.clone(), Arc::new(AlwaysAuthFail));
    scheduler
        .set_plans(
            0,
            vec![SessionPlan {
                account_index: 0,
                scheduled_start: Utc::now() - Duration::minutes(1),
                duration_minutes: 30,
                max_items: 5,
                status: PlanStatus::Pending,
            }],
        )
        .await
        .unwrap();
    scheduler
        .enqueue((0..5).map(video).collect())
        .await
        .unwrap();

    scheduler.run_once().await.unwrap();

    let state = scheduler.snapshot().await;
    let cred = &state.accounts[&0].credential;
    assert!(!cred.active, "three auth failures must disable the account");
    assert_eq!(cred.consecutive_auth_failures, 3);

    // Simulated restart: a fresh scheduler over the same state file.
    let (restarted, _tx2) = build_scheduler(&config, store, Arc::new(AlwaysAuthFail));
    let state = restarted.snapshot().await;
    let cred = &state.accounts[&0].credential;
    assert!(!cred.active, "disable must persist across restart");
    assert_eq!(cred.consecutive_auth_failures, 3);
}

#[tokio::test]
async fn disable_blocks_rest_of_batch_in_ledger() {
    let config = test_config(&["acc-0"]);
    let store = Store::new(&config.general.database_path).await.unwrap();

    let (scheduler, _tx) = build_scheduler(&config, store.clone(), Arc::new(AlwaysAuthFail));
    scheduler
        .set_plans(
            0,
            vec![SessionPlan {
                account_index: 0,
                scheduled_start: Utc::now() - Duration::minutes(1),
                duration_minutes: 30,
                max_items: 5,
                status: PlanStatus::Pending,
            }],
        )
        .await
        .unwrap();
    scheduler
        .enqueue((0..5).map(video).collect())
        .await
        .unwrap();
    scheduler.run_once().await.unwrap();

    // Items 0-2 consumed the credential; 3 and 4 never got a chance and
    // must be visible as blocked.
    let blocked = store
        .list_stage_with_status(Stage::Audio, StageState::Blocked)
        .await
        .unwrap();
    assert_eq!(blocked.len(), 2);
    let queued = scheduler.queued_len().await;
    assert_eq!(queued, 5, "failed and blocked items stay queued for retry");
}

#[tokio::test]
async fn unfinished_ledger_entries_resume_into_the_queue() {
    let config = test_config(&["acc-0"]);
    let store = Store::new(&config.general.database_path).await.unwrap();

    // A run that got as far as queueing two targets, one of them mid-fetch.
    for (i, status) in [StageState::Queued, StageState::InProgress]
        .into_iter()
        .enumerate()
    {
        let target = video(i);
        store.upsert_record(&target).await.unwrap();
        store
            .upsert_stage(&StageStatusInput::new(
                &target.canonical_id,
                Stage::Audio,
                status,
            ))
            .await
            .unwrap();
    }
    // A finished target must not be resumed.
    let done = video(9);
    store.upsert_record(&done).await.unwrap();
    store
        .upsert_stage(&StageStatusInput::new(
            &done.canonical_id,
            Stage::Audio,
            StageState::Completed,
        ))
        .await
        .unwrap();

    let (scheduler, _tx) = build_scheduler(&config, store.clone(), Arc::new(AlwaysAuthFail));
    let resumed = scribarr::resume_from_ledger(&store, &scheduler).await.unwrap();
    assert_eq!(resumed, 2);
    assert_eq!(scheduler.queued_len().await, 2);
}

#[tokio::test]
async fn due_sessions_run_concurrently_across_accounts() {
    let config = test_config(&["acc-0", "acc-1"]);
    let store = Store::new(&config.general.database_path).await.unwrap();
    let fetch = Arc::new(PairedFetch {
        barrier: tokio::sync::Barrier::new(2),
    });
    let (scheduler, shutdown_tx) = build_scheduler(&config, store.clone(), fetch);

    // One-item sessions so each account holds exactly one download.
    for idx in 0..2 {
        scheduler
            .set_plans(
                idx,
                vec![SessionPlan {
                    account_index: idx,
                    scheduled_start: Utc::now() - Duration::minutes(1),
                    duration_minutes: 30,
                    max_items: 1,
                    status: PlanStatus::Pending,
                }],
            )
            .await
            .unwrap();
    }
    for i in 0..2 {
        store.upsert_record(&video(i)).await.unwrap();
    }
    scheduler
        .enqueue((0..2).map(video).collect())
        .await
        .unwrap();

    let daemon = {
        let sched = Arc::clone(&scheduler);
        tokio::spawn(async move { sched.start().await })
    };

    // Serial sessions would park the first fetch at the barrier forever.
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            let mut done = 0;
            for i in 0..2 {
                let record = store.get_record(&video(i).canonical_id).await.unwrap();
                if record.is_some_and(|r| r.audio_complete) {
                    done += 1;
                }
            }
            if done == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("both accounts' sessions must make progress at the same time");

    shutdown_tx.send(true).unwrap();
    daemon.await.unwrap().unwrap();
}

#[tokio::test]
async fn scheduler_state_file_is_replaced_atomically() {
    let config = test_config(&["acc-0", "acc-1"]);
    let store = Store::new(&config.general.database_path).await.unwrap();
    let (scheduler, _tx) = build_scheduler(&config, store, Arc::new(AlwaysAuthFail));
    scheduler.ensure_plans().await.unwrap();

    let path = std::path::Path::new(&config.general.state_path);
    assert!(path.exists());
    // No leftover temp file once the write is complete.
    assert!(!path.with_extension("json.tmp").exists());

    let state = scribarr::scheduler::SchedulerState::load_or_default(path).unwrap();
    assert_eq!(state.accounts.len(), 2);
    assert!(!state.accounts[&0].plans.is_empty());
}
