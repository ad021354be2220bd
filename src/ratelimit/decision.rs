//! Admission decisions and their caller-facing rendering.

use std::time::Duration;

use serde::Serialize;

use super::policy::Policy;

/// Which counter produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// In-process fixed-window counter
    Local,
    /// Shared-store sliding-window counter
    Distributed,
    /// Local counter used because the shared store failed
    Fallback,
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The ceiling that was applied
    pub limit: u64,
    /// Admissions left in the current window
    pub remaining: u64,
    /// How long a rejected caller should wait; zero when allowed
    pub retry_after: Duration,
    /// Time until the current window frees capacity
    pub reset_after: Duration,
    /// Wall-clock reading (ms since epoch) at which the window resets
    pub reset_at_millis: u64,
    /// Counter that produced this decision
    pub source: DecisionSource,
}

impl Decision {
    pub(crate) fn admitted(
        limit: u64,
        remaining: u64,
        reset_after: Duration,
        now_millis: u64,
        source: DecisionSource,
    ) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after: Duration::ZERO,
            reset_after,
            reset_at_millis: reset_at(now_millis, reset_after),
            source,
        }
    }

    pub(crate) fn rejected(
        limit: u64,
        retry_after: Duration,
        now_millis: u64,
        source: DecisionSource,
    ) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after,
            reset_after: retry_after,
            reset_at_millis: reset_at(now_millis, retry_after),
            source,
        }
    }

    pub(crate) fn with_source(mut self, source: DecisionSource) -> Self {
        self.source = source;
        self
    }

    /// Retry-after in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after)
    }

    /// Build the rejection body for a denied decision under `policy`.
    pub fn rejection(&self, policy: &Policy) -> Option<Rejection> {
        if self.allowed {
            return None;
        }
        let response = policy.on_exceeded();
        Some(Rejection {
            status: response.status,
            success: false,
            message: response.message.clone(),
            error: response.error.clone(),
            retry_after: self.retry_after_secs(),
        })
    }

    /// Rate limit headers describing this decision.
    pub fn headers(&self, style: HeaderStyle) -> Vec<(&'static str, String)> {
        let mut headers = match style {
            HeaderStyle::Standard => vec![
                ("RateLimit-Limit", self.limit.to_string()),
                ("RateLimit-Remaining", self.remaining.to_string()),
                ("RateLimit-Reset", ceil_secs(self.reset_after).to_string()),
            ],
            HeaderStyle::Legacy => vec![
                ("X-RateLimit-Limit", self.limit.to_string()),
                ("X-RateLimit-Remaining", self.remaining.to_string()),
                (
                    "X-RateLimit-Reset",
                    self.reset_at_millis.div_ceil(1000).to_string(),
                ),
            ],
        };
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs().to_string()));
        }
        headers
    }
}

/// Which family of rate limit headers to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStyle {
    /// `RateLimit-*`, reset as delta seconds
    Standard,
    /// `X-RateLimit-*`, reset as epoch seconds
    Legacy,
}

/// Body returned to a caller whose request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Status for the HTTP layer; not part of the body
    #[serde(skip)]
    pub status: u16,
    pub success: bool,
    pub message: String,
    pub error: String,
    #[serde(rename = "retryAfter")]
    pub retry_after: u64,
}

fn reset_at(now_millis: u64, after: Duration) -> u64 {
    now_millis.saturating_add(super::clock::duration_millis(after))
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}
