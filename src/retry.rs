//! Failure classification and retry backoff.
//!
//! Everything here is pure: no I/O, no clock. The processor classifies a
//! provisioner failure once, and the resulting [`ErrorCategory`] is what the
//! store persists and acts on.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Transient,
    Resource,
    Configuration,
    Data,
    Permanent,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Resource)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "TRANSIENT"),
            ErrorCategory::Resource => write!(f, "RESOURCE"),
            ErrorCategory::Configuration => write!(f, "CONFIGURATION"),
            ErrorCategory::Data => write!(f, "DATA"),
            ErrorCategory::Permanent => write!(f, "PERMANENT"),
        }
    }
}

/// What went wrong, as reported by the provisioner or the processor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Timeout,
    Throttled,
    Network,
    OutOfMemory,
    DiskFull,
    InvalidReference,
    InvalidParameter,
    MissingInput,
    MalformedInput,
    Internal,
    Cancelled,
    /// Kind not known to the reporter; resolved from the detail text.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {detail}")]
pub struct ErrorSignal {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ErrorSignal {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// A signal carrying only free text, e.g. a process's stderr.
    pub fn from_message(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
}

// Checked in order; first match wins.
const MESSAGE_PATTERNS: &[(&str, ErrorCategory)] = &[
    ("timed out", ErrorCategory::Transient),
    ("timeout", ErrorCategory::Transient),
    ("throttl", ErrorCategory::Transient),
    ("rate exceeded", ErrorCategory::Transient),
    ("too many requests", ErrorCategory::Transient),
    ("connection reset", ErrorCategory::Transient),
    ("connection refused", ErrorCategory::Transient),
    ("temporarily unavailable", ErrorCategory::Transient),
    ("spot instance", ErrorCategory::Transient),
    ("out of memory", ErrorCategory::Resource),
    ("oomkilled", ErrorCategory::Resource),
    ("cannot allocate memory", ErrorCategory::Resource),
    ("no space left", ErrorCategory::Resource),
    ("disk full", ErrorCategory::Resource),
    ("quota exceeded", ErrorCategory::Resource),
    ("invalid reference", ErrorCategory::Configuration),
    ("invalid parameter", ErrorCategory::Configuration),
    ("unknown genome", ErrorCategory::Configuration),
    ("config", ErrorCategory::Configuration),
    ("no such file", ErrorCategory::Data),
    ("not found", ErrorCategory::Data),
    ("malformed", ErrorCategory::Data),
    ("corrupt", ErrorCategory::Data),
    ("truncated", ErrorCategory::Data),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryClassifier;

impl RetryClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, signal: &ErrorSignal) -> Classification {
        let category = match signal.kind {
            ErrorKind::Timeout | ErrorKind::Throttled | ErrorKind::Network => {
                ErrorCategory::Transient
            }
            // A cancelled run never reached a verdict; running it again is safe.
            ErrorKind::Cancelled => ErrorCategory::Transient,
            ErrorKind::OutOfMemory | ErrorKind::DiskFull => ErrorCategory::Resource,
            ErrorKind::InvalidReference | ErrorKind::InvalidParameter => {
                ErrorCategory::Configuration
            }
            ErrorKind::MissingInput | ErrorKind::MalformedInput => ErrorCategory::Data,
            ErrorKind::Internal => ErrorCategory::Permanent,
            ErrorKind::Unknown => Self::classify_message(&signal.detail),
        };

        Classification {
            category,
            retryable: category.is_retryable(),
        }
    }

    fn classify_message(detail: &str) -> ErrorCategory {
        let lowered = detail.to_ascii_lowercase();
        MESSAGE_PATTERNS
            .iter()
            .find(|(pattern, _)| lowered.contains(pattern))
            .map(|(_, category)| *category)
            .unwrap_or(ErrorCategory::Permanent)
    }
}

/// Capped exponential backoff: `min(base * 2^n, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_secs(config.backoff_base_secs),
            Duration::from_secs(config.backoff_max_secs),
        )
    }

    /// Delay before retry number `n + 1`, where `n` is the retry count at the
    /// time of the failure.
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_retryability() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::Resource.is_retryable());
        assert!(!ErrorCategory::Configuration.is_retryable());
        assert!(!ErrorCategory::Data.is_retryable());
        assert!(!ErrorCategory::Permanent.is_retryable());
    }

    #[test]
    fn classify_by_kind() {
        let c = RetryClassifier::new();
        let cases = [
            (ErrorKind::Timeout, ErrorCategory::Transient),
            (ErrorKind::Throttled, ErrorCategory::Transient),
            (ErrorKind::OutOfMemory, ErrorCategory::Resource),
            (ErrorKind::DiskFull, ErrorCategory::Resource),
            (ErrorKind::InvalidReference, ErrorCategory::Configuration),
            (ErrorKind::MalformedInput, ErrorCategory::Data),
            (ErrorKind::Internal, ErrorCategory::Permanent),
        ];
        for (kind, expected) in cases {
            let result = c.classify(&ErrorSignal::new(kind, "x"));
            assert_eq!(result.category, expected, "{kind:?}");
            assert_eq!(result.retryable, expected.is_retryable());
        }
    }

    #[test]
    fn classify_free_text() {
        let c = RetryClassifier::new();
        let category =
            |msg: &str| c.classify(&ErrorSignal::from_message(msg)).category;

        assert_eq!(category("Connection timed out after 30s"), ErrorCategory::Transient);
        assert_eq!(category("ThrottlingException: Rate exceeded"), ErrorCategory::Transient);
        assert_eq!(category("Killed: Out Of Memory"), ErrorCategory::Resource);
        assert_eq!(category("write failed: No space left on device"), ErrorCategory::Resource);
        assert_eq!(category("invalid reference hg19"), ErrorCategory::Configuration);
        assert_eq!(category("malformed FASTQ header"), ErrorCategory::Data);
        assert_eq!(category("segfault in aligner"), ErrorCategory::Permanent);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::from_secs(2));
        assert_eq!(b.delay(1), Duration::from_secs(4));
        assert_eq!(b.delay(2), Duration::from_secs(8));
        assert_eq!(b.delay(10), Duration::from_secs(2048));
        assert_eq!(b.delay(11), Duration::from_secs(3600));
        assert_eq!(b.delay(64), Duration::from_secs(3600));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let b = Backoff::default();
        for n in 0..100 {
            assert!(b.delay(n) <= b.delay(n + 1), "delay({n}) > delay({})", n + 1);
            assert!(b.delay(n) <= Duration::from_secs(3600));
        }
    }
}
