pub mod accounts;
pub mod classifier;
pub mod clients;
pub mod config;
pub mod db;
pub mod dedup;
pub mod entities;
pub mod models;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clients::episodes::{HttpEpisodeSearchClient, SearchConfig};
use clients::fetcher::{FetchConfig, HttpFetchClient};
use clients::transcriber::{HttpTranscribeClient, TranscriberConfig};
use clients::{FetchBackend, ProgressBus, TranscribeBackend};
pub use config::Config;
use db::Store;
use dedup::DedupPolicy;
use models::{AcquisitionTarget, Stage, TargetKind};
use orchestrator::Orchestrator;
use resolver::EpisodeResolver;
use scheduler::Scheduler;

pub async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let _prometheus_handle = if config.observability.metrics_enabled {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let builder = PrometheusBuilder::new();
        let handle = builder
            .install_recorder()
            .context("Failed to install Prometheus recorder")?;
        Some(handle)
    } else {
        None
    };

    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    let fmt_layer = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "daemon" | "-d" | "--daemon" => run_daemon(config).await,

        "run" | "r" => {
            if args.len() < 3 {
                println!("Usage: scribarr run <reference> [reference ...]");
                println!("       scribarr run --file <path> [--policy <policy>]");
                return Ok(());
            }
            let (references, policy) = parse_run_args(&args[2..])?;
            cmd_run(&config, references, policy).await
        }

        "add" | "a" => {
            if args.len() < 3 {
                println!("Usage: scribarr add <reference> [reference ...]");
                println!("References are queued durably and worked by the daemon.");
                return Ok(());
            }
            let (references, policy) = parse_run_args(&args[2..])?;
            cmd_add(&config, references, policy).await
        }

        "list" | "ls" | "l" => cmd_list(&config).await,

        "status" | "st" => {
            let target_id = args.get(2).map(String::as_str);
            cmd_status(&config, target_id).await
        }

        "accounts" => cmd_accounts(&config),

        "failures" => {
            let limit = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(20);
            cmd_failures(&config, limit).await
        }

        "prune-failures" => {
            let days = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(30);
            cmd_prune_failures(&config, days).await
        }

        "aliases" => cmd_aliases(&config).await,

        "transcribe-pending" => cmd_transcribe_pending(&config).await,

        "init" | "--init" => {
            Config::create_default_if_missing()?;
            println!("✓ Config file created. Edit config.toml and run again.");
            Ok(())
        }

        "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }

        _ => {
            println!("Unknown command: {}", args[1]);
            println!();
            print_help();
            Ok(())
        }
    }
}

fn print_help() {
    println!("Scribarr - Transcript Acquisition Manager");
    println!("Acquires transcribable content for batches of video and podcast references");
    println!();
    println!("USAGE:");
    println!("  scribarr <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("  run <refs...>        Acquire a batch now (both phases, inline)");
    println!("  add <refs...>        Queue references for the daemon");
    println!("  list, ls             List acquisition records");
    println!("  status [target_id]   Show per-stage status");
    println!("  accounts             Show account health and upcoming sessions");
    println!("  failures [n]         Show recent permanent failures (default: 20)");
    println!("  prune-failures [d]   Delete failure entries older than d days (default: 30)");
    println!("  aliases              List learned channel-to-feed aliases");
    println!("  transcribe-pending   Retry transcriptions for already-downloaded audio");
    println!("  daemon               Run as background daemon with session scheduler");
    println!("  init                 Create default config file");
    println!("  help                 Show this help message");
    println!();
    println!("RUN OPTIONS:");
    println!("  --file <path>        Read references from a file, one per line");
    println!("  --policy <policy>    skip_all | allow_retranscribe | allow_resummary |");
    println!("                       force_reprocess (default from config)");
}

fn parse_run_args(args: &[String]) -> anyhow::Result<(Vec<String>, Option<DedupPolicy>)> {
    let mut references = Vec::new();
    let mut policy = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                let path = args
                    .get(i + 1)
                    .context("--file requires a path argument")?;
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading reference file {path}"))?;
                references.extend(
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(String::from),
                );
                i += 2;
            }
            "--policy" | "-p" => {
                let raw = args
                    .get(i + 1)
                    .context("--policy requires a value")?;
                policy = Some(DedupPolicy::from_str(raw)?);
                i += 2;
            }
            other => {
                references.push(other.to_string());
                i += 1;
            }
        }
    }
    Ok((references, policy))
}

struct Components {
    store: Store,
    scheduler: Arc<Scheduler>,
    orchestrator: Orchestrator,
    progress: ProgressBus,
    shutdown_tx: watch::Sender<bool>,
}

async fn build_components(config: &Config) -> anyhow::Result<Components> {
    let store = Store::with_pool_options(
        &config.general.database_path,
        config.general.max_db_connections,
        config.general.min_db_connections,
    )
    .await?;

    let fetcher: Arc<dyn FetchBackend> = Arc::new(HttpFetchClient::new(&FetchConfig {
        base_url: config.fetch.base_url.clone(),
        timeout_secs: config.fetch.request_timeout_seconds,
    })?);
    let transcriber: Arc<dyn TranscribeBackend> =
        Arc::new(HttpTranscribeClient::new(&TranscriberConfig {
            base_url: config.transcriber.base_url.clone(),
            timeout_secs: config.transcriber.request_timeout_seconds,
        })?);
    let search_backend = Arc::new(HttpEpisodeSearchClient::new(&SearchConfig {
        base_url: config.resolver.search_url.clone(),
        timeout_secs: config.resolver.request_timeout_seconds,
    })?);

    let resolver = EpisodeResolver::new(
        store.clone(),
        search_backend,
        config.resolver.auto_accept_threshold,
        config.resolver.low_confidence_threshold,
    );

    let progress = ProgressBus::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        store.clone(),
        Arc::clone(&fetcher),
        Arc::clone(&transcriber),
        progress.clone(),
        shutdown_rx.clone(),
    )?);

    let orchestrator = Orchestrator::new(
        config.clone(),
        store.clone(),
        fetcher,
        transcriber,
        resolver,
        Arc::clone(&scheduler),
        progress.clone(),
        shutdown_rx,
    );

    Ok(Components {
        store,
        scheduler,
        orchestrator,
        progress,
        shutdown_tx,
    })
}

/// Rebuilds the in-memory queue from the stage ledger after a restart.
pub async fn resume_from_ledger(store: &Store, scheduler: &Scheduler) -> anyhow::Result<usize> {
    let unfinished = store.list_unfinished_stage(Stage::Audio).await?;
    let mut targets = Vec::new();
    for target_id in unfinished {
        if let Some(record) = store.get_record(&target_id).await? {
            let kind = TargetKind::from_str(&record.kind).unwrap_or(TargetKind::Video);
            let mut target = AcquisitionTarget::new(record.raw_reference, record.canonical_id, kind);
            target.title = record.title;
            target.channel = record.channel;
            targets.push(target);
        }
    }
    let count = targets.len();
    if count > 0 {
        info!(count, "resuming unfinished targets from the stage ledger");
        scheduler.enqueue(targets).await?;
    }
    Ok(count)
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    info!(
        "Scribarr v{} starting in daemon mode...",
        env!("CARGO_PKG_VERSION")
    );
    if !config.scheduler.enabled {
        anyhow::bail!("scheduler is disabled in config, nothing for the daemon to do");
    }

    let components = build_components(&config).await?;
    let log_sink = components.progress.spawn_log_sink();

    resume_from_ledger(&components.store, &components.scheduler).await?;

    let scheduler_handle = {
        let sched = Arc::clone(&components.scheduler);
        tokio::spawn(async move {
            if let Err(e) = sched.start().await {
                error!("Scheduler stopped with error: {}", e);
            }
        })
    };

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
        }
        Err(e) => {
            error!("Error listening for shutdown: {}", e);
        }
    }

    components.shutdown_tx.send(true).ok();
    scheduler_handle.await.ok();
    log_sink.abort();
    info!("Daemon stopped");
    Ok(())
}

async fn cmd_run(
    config: &Config,
    references: Vec<String>,
    policy: Option<DedupPolicy>,
) -> anyhow::Result<()> {
    if references.is_empty() {
        println!("No references given.");
        return Ok(());
    }
    let policy = resolve_policy(config, policy)?;
    let components = build_components(config).await?;
    let _log_sink = components.progress.spawn_log_sink();

    let summary = components
        .orchestrator
        .run(&references, policy, true)
        .await?;
    let recovered = components.orchestrator.transcribe_pending().await?;

    println!("Batch finished:");
    println!("  total:           {}", summary.total);
    println!("  malformed:       {}", summary.malformed);
    println!("  duplicates:      {}", summary.duplicates);
    println!("  via captions:    {}", summary.captioned);
    println!("  via feeds:       {}", summary.feed_direct);
    println!("  queued slow:     {}", summary.queued_slow);
    println!("  failed:          {}", summary.failed);
    if recovered > 0 {
        println!("  transcripts recovered: {recovered}");
    }
    Ok(())
}

async fn cmd_add(
    config: &Config,
    references: Vec<String>,
    policy: Option<DedupPolicy>,
) -> anyhow::Result<()> {
    if references.is_empty() {
        println!("No references given.");
        return Ok(());
    }
    let policy = resolve_policy(config, policy)?;
    let components = build_components(config).await?;

    // Phase 1 runs inline; the remainder is left in the durable ledger for
    // the daemon's sessions to pick up.
    let summary = components
        .orchestrator
        .run(&references, policy, false)
        .await?;
    println!(
        "Queued {} reference(s); {} already done via captions/feeds, {} duplicates.",
        summary.queued_slow,
        summary.captioned + summary.feed_direct,
        summary.duplicates
    );
    Ok(())
}

async fn cmd_list(config: &Config) -> anyhow::Result<()> {
    let store = Store::new(&config.general.database_path).await?;
    let records = store.list_all_records().await?;
    if records.is_empty() {
        println!("No acquisition records.");
        return Ok(());
    }
    println!(
        "{:<40} {:<12} {:>5} {:>5} {:>6}",
        "TARGET", "KIND", "META", "AUDIO", "SCRIPT"
    );
    for r in records {
        println!(
            "{:<40} {:<12} {:>5} {:>5} {:>6}",
            truncate(&r.canonical_id, 40),
            r.kind,
            mark(r.metadata_complete),
            mark(r.audio_complete),
            mark(r.transcript_path.is_some()),
        );
    }
    Ok(())
}

async fn cmd_status(config: &Config, target_id: Option<&str>) -> anyhow::Result<()> {
    let store = Store::new(&config.general.database_path).await?;
    match target_id {
        Some(id) => {
            let stages = store.get_stages_for_target(id).await?;
            if stages.is_empty() {
                println!("No stage records for {id}");
                return Ok(());
            }
            for s in stages {
                println!(
                    "{:<12} {:<12} worker={} {}",
                    s.stage,
                    s.status,
                    s.assigned_worker.as_deref().unwrap_or("-"),
                    s.metadata.as_deref().unwrap_or(""),
                );
            }
        }
        None => {
            let incomplete = store.list_incomplete_records().await?;
            println!("{} target(s) incomplete:", incomplete.len());
            for r in incomplete {
                let done: Vec<&str> = [
                    ("metadata", r.metadata_complete),
                    ("audio", r.audio_complete),
                ]
                .into_iter()
                .filter_map(|(n, ok)| ok.then_some(n))
                .collect();
                println!("  {} [{}]", r.canonical_id, done.join(", "));
            }
        }
    }
    Ok(())
}

fn cmd_accounts(config: &Config) -> anyhow::Result<()> {
    let state_path = std::path::Path::new(&config.general.state_path);
    let state = scheduler::SchedulerState::load_or_default(state_path)?;
    if state.accounts.is_empty() {
        println!("No accounts registered yet. Configure [accounts] credentials and run.");
        return Ok(());
    }
    for (idx, account) in &state.accounts {
        let cred = &account.credential;
        let status = if cred.active { "active" } else { "DISABLED" };
        println!(
            "[{}] {} - {} (auth failures: {}, sessions pending: {})",
            idx,
            cred.name,
            status,
            cred.consecutive_auth_failures,
            account.plans.len().saturating_sub(account.next_session_idx),
        );
        if let Some(until) = cred.cooldown_until {
            println!("     cooldown until {until}");
        }
        if let Some(plan) = account.current_plan() {
            println!(
                "     next session: {} ({} min, up to {} items)",
                plan.scheduled_start, plan.duration_minutes, plan.max_items
            );
        }
        for err in cred.recent_errors.iter().rev().take(3) {
            println!("     recent error: {}", truncate(err, 100));
        }
    }
    Ok(())
}

async fn cmd_failures(config: &Config, limit: u64) -> anyhow::Result<()> {
    let store = Store::new(&config.general.database_path).await?;
    let failures = store.list_recent_failures(limit).await?;
    if failures.is_empty() {
        println!("No permanent failures recorded.");
        return Ok(());
    }
    for f in failures {
        println!("{} [{}] {} - {}", f.created_at, f.kind, f.reference, f.reason);
    }
    Ok(())
}

async fn cmd_prune_failures(config: &Config, days: i64) -> anyhow::Result<()> {
    let store = Store::new(&config.general.database_path).await?;
    let removed = store.prune_failures(days).await?;
    println!("Pruned {removed} failure entries older than {days} days.");
    Ok(())
}

async fn cmd_aliases(config: &Config) -> anyhow::Result<()> {
    let store = Store::new(&config.general.database_path).await?;
    let aliases = store.list_aliases().await?;
    if aliases.is_empty() {
        println!("No channel aliases learned yet.");
        return Ok(());
    }
    for a in aliases {
        let verifier = a.verified_by.as_deref().unwrap_or("unverified");
        println!(
            "{} -> {} ({} via {}, confidence {:.2}, {verifier})",
            a.alias_key, a.feed_url, a.alias_type, a.method, a.confidence
        );
    }
    Ok(())
}

async fn cmd_transcribe_pending(config: &Config) -> anyhow::Result<()> {
    let components = build_components(config).await?;
    let recovered = components.orchestrator.transcribe_pending().await?;
    println!("Recovered {recovered} transcription(s).");
    Ok(())
}

fn resolve_policy(config: &Config, policy: Option<DedupPolicy>) -> anyhow::Result<DedupPolicy> {
    match policy {
        Some(p) => Ok(p),
        None => DedupPolicy::from_str(&config.dedup.default_policy),
    }
}

fn mark(flag: bool) -> &'static str {
    if flag { "✓" } else { "-" }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
