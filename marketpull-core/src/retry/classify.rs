//! Failure classification and the per-kind backoff policy.
//!
//! The upstream reports failures as free text (sometimes with a numeric code
//! embedded), so classification reads the error variant first and then the
//! rendered message. Codes are matched as whole tokens, phrases as
//! case-insensitive substrings.

use crate::error::EngineError;
use crate::upstream::UpstreamError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of upstream failure; each kind has its own recovery delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Request count or data volume quota exceeded.
    RateLimited,
    GatewayTimeout,
    /// Local proxy not running or refusing the application key.
    ProxyError,
    NetworkError,
    GeneralError,
}

impl FailureKind {
    pub const ALL: [FailureKind; 5] = [
        FailureKind::RateLimited,
        FailureKind::GatewayTimeout,
        FailureKind::ProxyError,
        FailureKind::NetworkError,
        FailureKind::GeneralError,
    ];
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::RateLimited => "request limit reached",
            FailureKind::GatewayTimeout => "gateway time-out",
            FailureKind::ProxyError => "proxy not running or unreachable",
            FailureKind::NetworkError => "network error",
            FailureKind::GeneralError => "upstream error",
        };
        f.write_str(label)
    }
}

struct Rule {
    kind: FailureKind,
    codes: &'static [&'static str],
    phrases: &'static [&'static str],
}

/// Checked in order; the first matching rule wins.
const RULES: &[Rule] = &[
    Rule {
        kind: FailureKind::RateLimited,
        codes: &["429"],
        phrases: &[
            "too many requests",
            "request limit",
            "rate limit",
            "volume limit",
            "limit exceeded",
        ],
    },
    Rule {
        kind: FailureKind::GatewayTimeout,
        codes: &["504", "2504"],
        phrases: &["gateway time-out", "gateway timeout"],
    },
    Rule {
        kind: FailureKind::ProxyError,
        codes: &["401", "407"],
        phrases: &["proxy"],
    },
    Rule {
        kind: FailureKind::NetworkError,
        codes: &["500", "502", "503"],
        phrases: &[
            "network error",
            "connection refused",
            "connection reset",
            "unreachable",
        ],
    },
];

/// Map an upstream failure to its kind.
pub fn classify(error: &UpstreamError) -> FailureKind {
    match error {
        UpstreamError::Transport(_) => FailureKind::NetworkError,
        UpstreamError::Timeout(_) => FailureKind::GatewayTimeout,
        UpstreamError::Empty(_) => FailureKind::GeneralError,
        other => classify_message(&other.to_string()),
    }
}

/// Classify a raw failure message. Unrecognized messages are general errors.
pub fn classify_message(message: &str) -> FailureKind {
    let lowered = message.to_ascii_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    RULES
        .iter()
        .find(|rule| {
            rule.codes.iter().any(|code| tokens.contains(code))
                || rule.phrases.iter().any(|phrase| lowered.contains(phrase))
        })
        .map(|rule| rule.kind)
        .unwrap_or(FailureKind::GeneralError)
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Recovery delays per failure kind plus the fixed pause before every
/// request. Values are seconds so they read naturally from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub request_delay_secs: f64,
    pub rate_limited_secs: f64,
    pub gateway_timeout_secs: f64,
    pub proxy_error_secs: f64,
    pub network_error_secs: f64,
    pub general_error_secs: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            request_delay_secs: 3.0,
            rate_limited_secs: 6.0 * 3600.0,
            gateway_timeout_secs: 5.0 * 60.0,
            proxy_error_secs: 6.0 * 3600.0,
            network_error_secs: 3600.0,
            general_error_secs: 5.0 * 60.0,
        }
    }
}

impl BackoffPolicy {
    /// No waiting at all. Useful for tests and replaying against fakes.
    pub fn immediate() -> Self {
        Self {
            request_delay_secs: 0.0,
            rate_limited_secs: 0.0,
            gateway_timeout_secs: 0.0,
            proxy_error_secs: 0.0,
            network_error_secs: 0.0,
            general_error_secs: 0.0,
        }
    }

    pub fn request_delay(&self) -> Duration {
        secs(self.request_delay_secs)
    }

    pub fn delay_for(&self, kind: FailureKind) -> Duration {
        secs(match kind {
            FailureKind::RateLimited => self.rate_limited_secs,
            FailureKind::GatewayTimeout => self.gateway_timeout_secs,
            FailureKind::ProxyError => self.proxy_error_secs,
            FailureKind::NetworkError => self.network_error_secs,
            FailureKind::GeneralError => self.general_error_secs,
        })
    }

    /// Override the delay of one failure kind.
    pub fn with_delay(mut self, kind: FailureKind, delay: Duration) -> Self {
        let value = delay.as_secs_f64();
        match kind {
            FailureKind::RateLimited => self.rate_limited_secs = value,
            FailureKind::GatewayTimeout => self.gateway_timeout_secs = value,
            FailureKind::ProxyError => self.proxy_error_secs = value,
            FailureKind::NetworkError => self.network_error_secs = value,
            FailureKind::GeneralError => self.general_error_secs = value,
        }
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay_secs = delay.as_secs_f64();
        self
    }

    /// Every delay must be a finite, non-negative number of seconds.
    pub fn validate(&self) -> Result<(), EngineError> {
        let entries = [
            ("request_delay_secs", self.request_delay_secs),
            ("rate_limited_secs", self.rate_limited_secs),
            ("gateway_timeout_secs", self.gateway_timeout_secs),
            ("proxy_error_secs", self.proxy_error_secs),
            ("network_error_secs", self.network_error_secs),
            ("general_error_secs", self.general_error_secs),
        ];
        for (name, value) in entries {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::Config(format!(
                    "{name} must be a non-negative number of seconds, got {value}"
                )));
            }
        }
        Ok(())
    }
}
