//! Account credential health tracking.
//!
//! Each platform credential carries a small health record: how many auth
//! failures it has seen in a row, whether it is still usable, a short ring of
//! recent errors for inspection, and an optional cooldown after throttling.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::FailureKind;

/// Auth failures in a row before a credential is pulled from rotation.
pub const MAX_CONSECUTIVE_AUTH_FAILURES: u32 = 3;

/// How many recent errors to keep per credential.
const ERROR_RING_LEN: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCredential {
    pub name: String,
    pub active: bool,
    pub consecutive_auth_failures: u32,
    /// Failures of any kind since the last success.
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub total_successes: u64,
    #[serde(default)]
    pub total_failures: u64,
    #[serde(default)]
    pub recent_errors: Vec<String>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled_at: Option<DateTime<Utc>>,
}

impl AccountCredential {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
            consecutive_auth_failures: 0,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            recent_errors: Vec::new(),
            cooldown_until: None,
            last_used_at: None,
            last_success_at: None,
            disabled_at: None,
        }
    }

    /// Usable right now: active and not cooling down.
    #[must_use]
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        match self.cooldown_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Resets both failure streaks; totals only ever grow.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_auth_failures = 0;
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.last_used_at = Some(now);
        self.last_success_at = Some(now);
    }

    /// Records a failure against this credential. Returns true when this
    /// failure is the one that disabled it.
    pub fn record_failure(
        &mut self,
        kind: FailureKind,
        error_text: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.last_used_at = Some(now);
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.push_error(error_text);

        match kind {
            FailureKind::Auth => {
                self.consecutive_auth_failures += 1;
                if self.active && self.consecutive_auth_failures >= MAX_CONSECUTIVE_AUTH_FAILURES {
                    self.active = false;
                    self.disabled_at = Some(now);
                    return true;
                }
            }
            // Non-auth failures do not reset the auth streak; only a
            // successful request proves the credential is healthy.
            FailureKind::RateLimit
            | FailureKind::Proxy
            | FailureKind::Format
            | FailureKind::Transient => {}
        }
        false
    }

    pub fn apply_cooldown(&mut self, until: DateTime<Utc>) {
        self.cooldown_until = Some(until);
    }

    pub fn reactivate(&mut self) {
        self.active = true;
        self.consecutive_auth_failures = 0;
        self.consecutive_failures = 0;
        self.disabled_at = None;
    }

    fn push_error(&mut self, error_text: &str) {
        self.recent_errors.push(error_text.to_string());
        if self.recent_errors.len() > ERROR_RING_LEN {
            let excess = self.recent_errors.len() - ERROR_RING_LEN;
            self.recent_errors.drain(..excess);
        }
    }
}

/// Whether `now` falls inside the configured quiet window. The window may
/// wrap around midnight (start 22, end 6). Equal start and end disables it.
#[must_use]
pub fn in_quiet_hours(now: DateTime<Utc>, start_hour: u32, end_hour: u32) -> bool {
    if start_hour == end_hour {
        return false;
    }
    let hour = now.hour();
    if start_hour < end_hour {
        hour >= start_hour && hour < end_hour
    } else {
        hour >= start_hour || hour < end_hour
    }
}
