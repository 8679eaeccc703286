//! Failure classification for upstream errors
//!
//! Maps a raw `UpstreamError` onto a closed set of failure kinds using an
//! ordered rule table; the first matching rule wins. Each kind carries retry
//! guidance, whether it should quarantine the credential, and fixed user-facing
//! text. Raw provider text never leaves this module in user-visible fields.

use std::sync::LazyLock;

use provider::UpstreamError;
use regex::Regex;
use serde::Serialize;

/// Failure categories, in classification precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Quota exhausted for this credential (429, "quota exceeded")
    Quota,
    /// Short-term throttling that is not quota exhaustion
    RateLimit,
    /// Credential rejected or lacking permission
    InvalidCredential,
    /// Transport failure: timeout, DNS, refused connection
    Network,
    /// Nothing else matched
    Unknown,
}

impl ErrorKind {
    /// Label for metrics and logging.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Quota => "quota",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::InvalidCredential => "invalid_credential",
            ErrorKind::Network => "network",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether one failure of this kind is enough to quarantine a credential.
    pub fn quarantine_worthy(&self) -> bool {
        matches!(self, ErrorKind::Quota | ErrorKind::InvalidCredential)
    }

    /// Retry delay used when the error carries no explicit hint.
    pub fn default_retry_delay_secs(&self) -> u64 {
        match self {
            ErrorKind::Quota => 3600,
            ErrorKind::RateLimit => 60,
            ErrorKind::InvalidCredential => 300,
            ErrorKind::Network => 5,
            ErrorKind::Unknown => 30,
        }
    }

    /// Whether a UI should offer an immediate retry button.
    pub fn user_retryable(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Unknown)
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::Quota => "The free trial allowance has been used up",
            ErrorKind::RateLimit => "Requests are coming in too quickly",
            ErrorKind::InvalidCredential => "The service is temporarily unavailable",
            ErrorKind::Network => "There was a network connection problem",
            ErrorKind::Unknown => "The service is temporarily unavailable",
        }
    }

    fn suggestion(&self, wait_hint: &str) -> String {
        match self {
            ErrorKind::Quota => format!(
                "Please try again in {wait_hint}, or upgrade to a paid plan for a higher quota"
            ),
            ErrorKind::RateLimit => {
                "Please wait a moment and try again, your request is being handled".into()
            }
            ErrorKind::InvalidCredential => {
                "Please try again later, we are working on a technical issue".into()
            }
            ErrorKind::Network => "Please check your network connection and try again".into(),
            ErrorKind::Unknown => {
                "Please try again later, and contact support if the problem persists".into()
            }
        }
    }
}

/// Structured, user-safe view of one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub user_message: &'static str,
    pub suggestion: String,
    pub suggested_retry_delay_secs: u64,
    pub quarantine_worthy: bool,
    /// Human-readable form of the retry delay ("2 minutes").
    pub wait_hint: String,
    pub user_retryable: bool,
}

/// Normalized view of an error that rules match against.
struct Signal {
    status: Option<u16>,
    transport: bool,
    text: String,
}

impl Signal {
    fn contains_any(&self, patterns: &[&str]) -> bool {
        patterns.iter().any(|p| self.text.contains(p))
    }
}

struct Rule {
    kind: ErrorKind,
    matches: fn(&Signal) -> bool,
}

const QUOTA_PATTERNS: &[&str] = &[
    "quota exceeded",
    "exceeded your current quota",
    "resource_exhausted",
    "resource has been exhausted",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "rate-limit", "ratelimit", "too many requests"];

const INVALID_CREDENTIAL_PATTERNS: &[&str] = &[
    "api key not valid",
    "invalid api key",
    "api_key_invalid",
    "permission denied",
    "permission_denied",
    "unauthenticated",
];

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "fetch",
    "connection",
    "econnreset",
    "econnrefused",
];

/// Classification rules, evaluated in order. The final rule always matches.
const RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::Quota,
        matches: |s| {
            s.status == Some(429) || s.contains_any(QUOTA_PATTERNS) || STATUS_429_RE.is_match(&s.text)
        },
    },
    Rule {
        kind: ErrorKind::RateLimit,
        matches: |s| s.contains_any(RATE_LIMIT_PATTERNS),
    },
    Rule {
        kind: ErrorKind::InvalidCredential,
        matches: |s| matches!(s.status, Some(401 | 403)) || s.contains_any(INVALID_CREDENTIAL_PATTERNS),
    },
    Rule {
        kind: ErrorKind::Network,
        matches: |s| s.transport || s.contains_any(NETWORK_PATTERNS),
    },
    Rule {
        kind: ErrorKind::Unknown,
        matches: |_| true,
    },
];

/// A 429 status quoted in error text without a structured status
static STATUS_429_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b429\b").expect("valid regex"));

/// "Please retry in 37.5s", "retry in 500ms"
static RETRY_IN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry in (\d+(?:\.\d+)?)\s*(ms|s|sec|seconds?)\b").expect("valid regex")
});

/// `"retryDelay": "37s"` from structured retry info
static RETRY_DELAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)retry_?delay"?\s*[:=]\s*"?(\d+(?:\.\d+)?)s"#).expect("valid regex")
});

/// "retry after 120 seconds"
static RETRY_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry after (\d+(?:\.\d+)?)\s*(?:s|sec|seconds?)\b").expect("valid regex")
});

/// Determine the kind of an upstream error. Total: unmatched input is `Unknown`.
pub fn classify_kind(error: &UpstreamError) -> ErrorKind {
    let signal = Signal {
        status: error.status(),
        transport: error.is_transport(),
        text: error.message().to_lowercase(),
    };
    RULES
        .iter()
        .find(|rule| (rule.matches)(&signal))
        .map(|rule| rule.kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// Classify an upstream error into user-safe guidance.
///
/// Quota errors honour a retry hint embedded in the message; every other kind
/// uses its fixed default delay.
pub fn classify(error: &UpstreamError) -> ClassifiedError {
    let kind = classify_kind(error);
    let delay = match kind {
        ErrorKind::Quota => {
            parse_retry_hint(error.message()).unwrap_or(kind.default_retry_delay_secs())
        }
        _ => kind.default_retry_delay_secs(),
    };
    from_kind(kind, delay)
}

/// Build the classified view for a kind and delay.
pub fn from_kind(kind: ErrorKind, retry_delay_secs: u64) -> ClassifiedError {
    let wait_hint = format_wait(retry_delay_secs);
    ClassifiedError {
        kind,
        user_message: kind.user_message(),
        suggestion: kind.suggestion(&wait_hint),
        suggested_retry_delay_secs: retry_delay_secs,
        quarantine_worthy: kind.quarantine_worthy(),
        wait_hint,
        user_retryable: kind.user_retryable(),
    }
}

/// Extract a retry delay hint, in whole seconds (rounded up, at least 1).
pub fn parse_retry_hint(message: &str) -> Option<u64> {
    let secs = if let Some(caps) = RETRY_IN_RE.captures(message) {
        let value: f64 = caps[1].parse().ok()?;
        match caps.get(2).map(|m| m.as_str().to_lowercase()) {
            Some(unit) if unit == "ms" => value / 1000.0,
            _ => value,
        }
    } else if let Some(caps) = RETRY_DELAY_RE
        .captures(message)
        .or_else(|| RETRY_AFTER_RE.captures(message))
    {
        caps[1].parse().ok()?
    } else {
        return None;
    };
    Some((secs.ceil() as u64).max(1))
}

/// Render a delay for humans: seconds under a minute, minutes under an hour,
/// otherwise hours. Always rounds up.
pub fn format_wait(secs: u64) -> String {
    fn plural(n: u64, unit: &str) -> String {
        if n == 1 {
            format!("1 {unit}")
        } else {
            format!("{n} {unit}s")
        }
    }
    if secs < 60 {
        plural(secs, "second")
    } else if secs < 3600 {
        plural(secs.div_ceil(60), "minute")
    } else {
        plural(secs.div_ceil(3600), "hour")
    }
}
