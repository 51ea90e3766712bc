//! Persisted scheduler state.
//!
//! One JSON document holds every account's credential health and session
//! plans. It is rewritten atomically (temp file then rename) after every
//! mutation, and it is the only in-memory source of truth between writes.
//! The layout is stable and human-editable, so an operator can disable an
//! account by hand between runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::accounts::{AccountCredential, in_quiet_hours};
use crate::config::{AccountsConfig, SessionConfig};
use crate::scheduler::plan::{PlanStatus, SessionPlan, generate_plans};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub credential: AccountCredential,
    pub plans: Vec<SessionPlan>,
    pub next_session_idx: usize,
}

impl AccountState {
    /// The earliest unconsumed plan, if any.
    #[must_use]
    pub fn current_plan(&self) -> Option<&SessionPlan> {
        self.plans.get(self.next_session_idx)
    }

    pub fn current_plan_mut(&mut self) -> Option<&mut SessionPlan> {
        self.plans.get_mut(self.next_session_idx)
    }

    /// Marks the current plan completed and advances. Sessions are consumed
    /// strictly in order.
    pub fn advance(&mut self) {
        if let Some(plan) = self.plans.get_mut(self.next_session_idx) {
            plan.status = PlanStatus::Completed;
        }
        self.next_session_idx += 1;
    }

    /// Drops plans whose window has already fully passed without being run,
    /// so a long outage does not replay a backlog of stale sessions.
    pub fn skip_expired(&mut self, now: DateTime<Utc>) {
        while let Some(plan) = self.plans.get_mut(self.next_session_idx) {
            if plan.status == PlanStatus::Pending && plan.end_time() < now {
                plan.status = PlanStatus::Completed;
                self.next_session_idx += 1;
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub accounts: BTreeMap<usize, AccountState>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SchedulerState {
    /// Loads the persisted document, or starts empty when none exists.
    /// A session left `running` by a crash is rewound to pending; per-item
    /// completion lives in the stage ledger, so re-running it is safe.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scheduler state {}", path.display()))?;
        let mut state: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing scheduler state {}", path.display()))?;

        for account in state.accounts.values_mut() {
            let name = account.credential.name.clone();
            if let Some(plan) = account.current_plan_mut()
                && plan.status == PlanStatus::Running
            {
                warn!(
                    account = %name,
                    "session was running at shutdown, rewinding to pending"
                );
                plan.status = PlanStatus::Pending;
            }
        }
        Ok(state)
    }

    /// Atomic rewrite: serialize to a sibling temp file, then rename over
    /// the target so a reader never sees a torn document.
    pub fn persist(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Some(Utc::now());
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir {}", parent.display()))?;
        }
        let tmp: PathBuf = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(self).context("serializing scheduler state")?;
        std::fs::write(&tmp, raw)
            .with_context(|| format!("writing scheduler state {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming scheduler state into {}", path.display()))?;
        Ok(())
    }

    /// Reconciles accounts with the configured credential list. New
    /// credentials get a fresh health record; removed ones are dropped.
    /// Existing health (including disabled state) is preserved.
    pub fn sync_accounts(&mut self, credentials: &[String]) {
        for (idx, name) in credentials.iter().enumerate() {
            self.accounts.entry(idx).or_insert_with(|| {
                info!(account = %name, index = idx, "registering account");
                AccountState {
                    credential: AccountCredential::new(name.clone()),
                    plans: Vec::new(),
                    next_session_idx: 0,
                }
            });
        }
        self.accounts.retain(|idx, _| *idx < credentials.len());
    }

    /// Tops up every active account so it always has plans covering the
    /// horizon from `now`.
    pub fn extend_plans<R: Rng>(&mut self, now: DateTime<Utc>, cfg: &SessionConfig, rng: &mut R) {
        for (idx, account) in &mut self.accounts {
            if !account.credential.active {
                continue;
            }
            let horizon_end = now + Duration::days(i64::from(cfg.horizon_days));
            let last_planned = account.plans.last().map(|p| p.scheduled_start);
            let plan_from = match last_planned {
                Some(t) if t >= horizon_end => continue,
                Some(t) => t + Duration::days(1),
                None => now,
            };
            let fresh = generate_plans(*idx, plan_from, cfg, rng);
            account.plans.extend(fresh);
        }
    }

    /// Every account whose next pending session is due and whose credential
    /// is usable right now, ordered by how overdue the session is.
    #[must_use]
    pub fn due_accounts(&self, now: DateTime<Utc>, accounts_cfg: &AccountsConfig) -> Vec<usize> {
        if in_quiet_hours(now, accounts_cfg.quiet_hours_start, accounts_cfg.quiet_hours_end) {
            return Vec::new();
        }
        let mut due: Vec<(usize, DateTime<Utc>)> = self
            .accounts
            .iter()
            .filter(|(_, a)| a.credential.is_available(now))
            .filter_map(|(idx, a)| {
                a.current_plan()
                    .filter(|p| p.is_due(now))
                    .map(|p| (*idx, p.scheduled_start))
            })
            .collect();
        due.sort_by_key(|(_, start)| *start);
        due.into_iter().map(|(idx, _)| idx).collect()
    }

    /// The single most overdue runnable account, for one-shot drains.
    #[must_use]
    pub fn due_account(&self, now: DateTime<Utc>, accounts_cfg: &AccountsConfig) -> Option<usize> {
        self.due_accounts(now, accounts_cfg).into_iter().next()
    }

    /// The next instant anything could become runnable: the nearest pending
    /// session start or cooldown expiry across all active accounts.
    #[must_use]
    pub fn next_wakeup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        let mut consider = |t: DateTime<Utc>| {
            if earliest.is_none_or(|e| t < e) {
                earliest = Some(t);
            }
        };
        for account in self.accounts.values() {
            if !account.credential.active {
                continue;
            }
            if let Some(plan) = account.current_plan() {
                consider(plan.scheduled_start);
            }
            if let Some(until) = account.credential.cooldown_until
                && until > now
            {
                consider(until);
            }
        }
        earliest
    }

    /// Records a request on the account and draws the next-use delay from
    /// the configured window.
    pub fn mark_request<R: Rng>(
        &mut self,
        account_index: usize,
        now: DateTime<Utc>,
        accounts_cfg: &AccountsConfig,
        rng: &mut R,
    ) {
        if let Some(account) = self.accounts.get_mut(&account_index) {
            let delay =
                rng.random_range(accounts_cfg.min_request_delay_secs..=accounts_cfg.max_request_delay_secs);
            account.credential.last_used_at = Some(now);
            account
                .credential
                .apply_cooldown(now + Duration::seconds(delay as i64));
        }
    }

    #[must_use]
    pub fn active_account_count(&self) -> usize {
        self.accounts
            .values()
            .filter(|a| a.credential.active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FailureKind;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn temp_state_path() -> PathBuf {
        std::env::temp_dir().join(format!("scribarr-state-{}.json", uuid::Uuid::new_v4()))
    }

    fn populated_state() -> SchedulerState {
        let mut state = SchedulerState::default();
        state.sync_accounts(&["acc-0".to_string(), "acc-1".to_string()]);
        state.extend_plans(
            Utc::now(),
            &SessionConfig::default(),
            &mut StdRng::seed_from_u64(3),
        );
        state
    }

    #[test]
    fn persist_then_load_roundtrips() {
        let path = temp_state_path();
        let mut state = populated_state();
        state.persist(&path).unwrap();

        let loaded = SchedulerState::load_or_default(&path).unwrap();
        assert_eq!(loaded.accounts.len(), 2);
        assert_eq!(
            loaded.accounts[&0].plans.len(),
            state.accounts[&0].plans.len()
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn running_session_rewinds_to_pending_on_load() {
        let path = temp_state_path();
        let mut state = populated_state();
        state
            .accounts
            .get_mut(&0)
            .unwrap()
            .current_plan_mut()
            .unwrap()
            .status = PlanStatus::Running;
        state.persist(&path).unwrap();

        let loaded = SchedulerState::load_or_default(&path).unwrap();
        assert_eq!(
            loaded.accounts[&0].current_plan().unwrap().status,
            PlanStatus::Pending
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn disabled_account_survives_reload() {
        let path = temp_state_path();
        let mut state = populated_state();
        let now = Utc::now();
        {
            let cred = &mut state.accounts.get_mut(&1).unwrap().credential;
            for _ in 0..3 {
                cred.record_failure(FailureKind::Auth, "401 unauthorized", now);
            }
            assert!(!cred.active);
        }
        state.persist(&path).unwrap();

        let mut loaded = SchedulerState::load_or_default(&path).unwrap();
        loaded.sync_accounts(&["acc-0".to_string(), "acc-1".to_string()]);
        assert!(!loaded.accounts[&1].credential.active);
        assert_eq!(loaded.accounts[&1].credential.consecutive_auth_failures, 3);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn due_account_requires_available_credential_and_due_plan() {
        let mut state = populated_state();
        let cfg = AccountsConfig::default();
        let now = Utc::now();

        // Force both accounts' first plan into the past, then cool one down.
        for account in state.accounts.values_mut() {
            account.plans[0].scheduled_start = now - Duration::minutes(5);
        }
        state
            .accounts
            .get_mut(&0)
            .unwrap()
            .credential
            .apply_cooldown(now + Duration::minutes(10));

        // Pick an hour outside default quiet hours deterministically.
        let mut cfg = cfg;
        cfg.quiet_hours_start = 0;
        cfg.quiet_hours_end = 0;

        assert_eq!(state.due_account(now, &cfg), Some(1));
    }

    #[test]
    fn next_wakeup_is_nearest_of_session_and_cooldown() {
        let mut state = populated_state();
        let now = Utc::now();
        let near = now + Duration::minutes(2);
        for account in state.accounts.values_mut() {
            account.plans[0].scheduled_start = now + Duration::hours(3);
        }
        state
            .accounts
            .get_mut(&1)
            .unwrap()
            .credential
            .apply_cooldown(near);

        assert_eq!(state.next_wakeup(now), Some(near));
    }

    #[test]
    fn sync_drops_removed_accounts_and_keeps_health() {
        let mut state = populated_state();
        state.sync_accounts(&["acc-0".to_string()]);
        assert_eq!(state.accounts.len(), 1);
        assert!(state.accounts.contains_key(&0));
    }

    #[test]
    fn skip_expired_consumes_stale_sessions_in_order() {
        let mut state = populated_state();
        let account = state.accounts.get_mut(&0).unwrap();
        let long_ago = Utc::now() - Duration::days(2);
        account.plans[0].scheduled_start = long_ago;
        account.plans[1].scheduled_start = long_ago + Duration::hours(1);

        account.skip_expired(Utc::now());
        assert!(account.next_session_idx >= 2);
    }
}
