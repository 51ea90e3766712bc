//! Failure classification for fetch errors.
//!
//! Backends report failures as free-form text; this module maps that text to a
//! failure kind through an ordered pattern table, so remediation (cooldown,
//! requeue, permanent record) can be decided without touching the network.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Credential rejected or challenge page served; counts toward the
    /// account's consecutive-auth-failure limit.
    Auth,
    /// Platform throttling; back off and move the work to another account.
    RateLimit,
    /// Upstream relay/tunnel trouble, usually transient.
    Proxy,
    /// Content not available in the requested form; never retried.
    Format,
    /// Anything unrecognized; retried with bounded backoff.
    Transient,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Proxy => "proxy",
            Self::Format => "format",
            Self::Transient => "transient",
        }
    }

    /// Whether a failure of this kind is worth another attempt at all.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Format)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    pub retryable: bool,
}

/// Ordered substring rules, checked top to bottom against the lowercased
/// error text. Order matters: "429" must win over a message that also
/// happens to mention a proxy, so the more specific families come first.
const RULES: &[(&str, FailureKind)] = &[
    ("401", FailureKind::Auth),
    ("403", FailureKind::Auth),
    ("sign in", FailureKind::Auth),
    ("sign-in", FailureKind::Auth),
    ("cookies", FailureKind::Auth),
    ("unauthorized", FailureKind::Auth),
    ("login required", FailureKind::Auth),
    ("account has been", FailureKind::Auth),
    ("429", FailureKind::RateLimit),
    ("too many requests", FailureKind::RateLimit),
    ("rate limit", FailureKind::RateLimit),
    ("throttl", FailureKind::RateLimit),
    ("slow down", FailureKind::RateLimit),
    ("502", FailureKind::Proxy),
    ("bad gateway", FailureKind::Proxy),
    ("relay offline", FailureKind::Proxy),
    ("tunnel", FailureKind::Proxy),
    ("proxy", FailureKind::Proxy),
    ("requested format", FailureKind::Format),
    ("format not available", FailureKind::Format),
    ("no suitable format", FailureKind::Format),
    ("unsupported format", FailureKind::Format),
    ("no captions", FailureKind::Format),
    ("video unavailable", FailureKind::Format),
];

#[must_use]
pub fn classify(error_text: &str) -> Classification {
    let lowered = error_text.to_lowercase();

    for (pattern, kind) in RULES {
        if lowered.contains(pattern) {
            return Classification {
                kind: *kind,
                retryable: kind.is_retryable(),
            };
        }
    }

    Classification {
        kind: FailureKind::Transient,
        retryable: true,
    }
}
