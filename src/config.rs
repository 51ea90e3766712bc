use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    pub accounts: AccountsConfig,

    pub sessions: SessionConfig,

    pub scheduler: SchedulerConfig,

    pub pacing: PacingConfig,

    pub retry: RetryConfig,

    pub resolver: ResolverConfig,

    pub dedup: DedupConfig,

    pub fetch: FetchBackendConfig,

    pub transcriber: TranscriberConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub database_path: String,

    /// Scheduler state document, atomically rewritten after every mutation.
    /// Safe to hand-edit between runs (e.g. to disable an account manually).
    pub state_path: String,

    pub transcripts_path: String,

    pub log_level: String,

    /// Number of tokio worker threads (default: 2). 0 uses the CPU count.
    pub worker_threads: usize,

    pub max_db_connections: u32,

    pub min_db_connections: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: "sqlite:data/scribarr.db".to_string(),
            state_path: "data/scheduler_state.json".to_string(),
            transcripts_path: "transcripts".to_string(),
            log_level: "info".to_string(),
            worker_threads: 2,
            max_db_connections: 5,
            min_db_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Credential references handed opaquely to the fetch backend, one per
    /// account slot. The index in this list is the account index.
    pub credentials: Vec<String>,

    /// Per-request delay window in seconds; the delay before an account may
    /// be reused is drawn uniformly from [min, max].
    pub min_request_delay_secs: u64,

    pub max_request_delay_secs: u64,

    /// Local hours during which accounts stay idle. start == end disables
    /// quiet hours entirely.
    pub quiet_hours_start: u32,

    pub quiet_hours_end: u32,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            min_request_delay_secs: 180,
            max_request_delay_secs: 300,
            quiet_hours_start: 2,
            quiet_hours_end: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sessions_per_day_min: u32,

    pub sessions_per_day_max: u32,

    pub duration_min_minutes: u32,

    pub duration_max_minutes: u32,

    pub max_items_min: u32,

    pub max_items_max: u32,

    /// Planning horizon in days.
    pub horizon_days: u32,

    /// Per-account start offset in hours, applied as index * stagger mod 24,
    /// so accounts never burst in lockstep.
    pub stagger_hours: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sessions_per_day_min: 2,
            sessions_per_day_max: 4,
            duration_min_minutes: 20,
            duration_max_minutes: 45,
            max_items_min: 5,
            max_items_max: 12,
            horizon_days: 7,
            stagger_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,

    /// Idle sleeps are capped at this many seconds so shutdown stays
    /// responsive even when the next session is hours away.
    pub sleep_cap_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sleep_cap_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Phase 1 delay window between items, seconds.
    pub rapid_delay_min_secs: u64,

    pub rapid_delay_max_secs: u64,

    /// Phase 1 batch pause: every `rapid_batch_size` items, pause for a
    /// duration drawn from [pause_min, pause_max] seconds.
    pub rapid_batch_size: u32,

    pub rapid_pause_min_secs: u64,

    pub rapid_pause_max_secs: u64,

    /// Phase 2 delay window between items, seconds.
    pub slow_delay_min_secs: u64,

    pub slow_delay_max_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            rapid_delay_min_secs: 1,
            rapid_delay_max_secs: 3,
            rapid_batch_size: 20,
            rapid_pause_min_secs: 30,
            rapid_pause_max_secs: 60,
            slow_delay_min_secs: 180,
            slow_delay_max_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per target before the failure is recorded as permanent.
    pub max_attempts: u32,

    /// Base for exponential backoff between attempts, seconds.
    pub backoff_base_secs: u64,

    /// Account-level cooldown applied after a rate-limit classification.
    pub rate_limit_cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 30,
            rate_limit_cooldown_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Episode-level title search endpoint.
    pub search_url: String,

    /// Similarity at or above which a match is auto-accepted and an alias
    /// persisted.
    pub auto_accept_threshold: f64,

    /// Similarity at or above which a match is returned flagged as
    /// low-confidence. Below this, resolution falls back to direct download.
    pub low_confidence_threshold: f64,

    pub request_timeout_seconds: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            search_url: "https://api.podcastindex.local".to_string(),
            auto_accept_threshold: 0.9,
            low_confidence_threshold: 0.7,
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Default policy for batch runs: skip_all, allow_retranscribe,
    /// allow_resummary or force_reprocess.
    pub default_policy: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            default_policy: "skip_all".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchBackendConfig {
    pub base_url: String,

    pub request_timeout_seconds: u64,
}

impl Default for FetchBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7810".to_string(),
            request_timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    pub base_url: String,

    pub request_timeout_seconds: u64,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7820".to_string(),
            request_timeout_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            accounts: AccountsConfig::default(),
            sessions: SessionConfig::default(),
            scheduler: SchedulerConfig::default(),
            pacing: PacingConfig::default(),
            retry: RetryConfig::default(),
            resolver: ResolverConfig::default(),
            dedup: DedupConfig::default(),
            fetch: FetchBackendConfig::default(),
            transcriber: TranscriberConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = Self::config_paths();

        for path in &paths {
            if path.exists() {
                info!("Loading config from: {}", path.display());
                return Self::load_from_path(path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Config saved to: {}", path.display());
        Ok(())
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("scribarr").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".scribarr").join("config.toml"));
        }

        paths
    }

    fn default_config_path() -> PathBuf {
        PathBuf::from("config.toml")
    }

    pub fn create_default_if_missing() -> Result<bool> {
        let path = Self::default_config_path();
        if path.exists() {
            Ok(false)
        } else {
            let config = Self::default();
            config.save_to_path(&path)?;
            info!("Created default config file: {}", path.display());
            Ok(true)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.accounts.min_request_delay_secs > self.accounts.max_request_delay_secs {
            anyhow::bail!("accounts.min_request_delay_secs must be <= max_request_delay_secs");
        }

        if self.accounts.quiet_hours_start >= 24 || self.accounts.quiet_hours_end >= 24 {
            anyhow::bail!("quiet hours must be within 0..24");
        }

        if self.sessions.sessions_per_day_min == 0
            || self.sessions.sessions_per_day_min > self.sessions.sessions_per_day_max
        {
            anyhow::bail!("sessions_per_day range is invalid");
        }

        if self.sessions.duration_min_minutes == 0
            || self.sessions.duration_min_minutes > self.sessions.duration_max_minutes
        {
            anyhow::bail!("session duration range is invalid");
        }

        if self.sessions.max_items_min == 0
            || self.sessions.max_items_min > self.sessions.max_items_max
        {
            anyhow::bail!("session max_items range is invalid");
        }

        if self.sessions.horizon_days == 0 {
            anyhow::bail!("sessions.horizon_days must be > 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be > 0");
        }

        if !(0.0..=1.0).contains(&self.resolver.auto_accept_threshold)
            || !(0.0..=1.0).contains(&self.resolver.low_confidence_threshold)
            || self.resolver.low_confidence_threshold > self.resolver.auto_accept_threshold
        {
            anyhow::bail!("resolver thresholds must satisfy 0 <= low <= auto <= 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.accounts.min_request_delay_secs, 180);
        assert_eq!(config.accounts.max_request_delay_secs, 300);
        assert_eq!(config.sessions.horizon_days, 7);
        assert_eq!(config.retry.max_attempts, 3);
        assert!((config.resolver.auto_accept_threshold - 0.9).abs() < f64::EPSILON);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[accounts]"));
        assert!(toml_str.contains("[sessions]"));
        assert!(toml_str.contains("[pacing]"));
    }

    #[test]
    fn test_config_deserialization_with_partial_sections() {
        let toml_str = r#"
            [general]
            log_level = "debug"

            [accounts]
            credentials = ["acc-0", "acc-1"]
            min_request_delay_secs = 5
            max_request_delay_secs = 10
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.accounts.credentials.len(), 2);
        assert_eq!(config.accounts.min_request_delay_secs, 5);

        // Untouched sections keep their defaults.
        assert_eq!(config.sessions.sessions_per_day_min, 2);
        assert_eq!(config.pacing.rapid_batch_size, 20);
    }

    #[test]
    fn test_validate_rejects_inverted_delay_window() {
        let mut config = Config::default();
        config.accounts.min_request_delay_secs = 500;
        config.accounts.max_request_delay_secs = 100;
        assert!(config.validate().is_err());
    }
}
