//! Error classification for failed jobs.
//!
//! Priority-ordered pattern matching over the lower-cased error message,
//! first match wins: auth → quota → timeout → schema → transient →
//! permanent → unknown. The class drives every retry decision; the
//! signature groups repeated occurrences of "the same" failure across jobs
//! and ticks.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Failure class of a job error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Credentials, identity, or permission problems. Never retried;
    /// retrying a bad key only burns quota.
    Auth,
    /// Rate limits and exhausted upstream quotas.
    Quota,
    /// Deadlines and aborted calls.
    Timeout,
    /// Storage schema drift (missing columns/tables).
    Schema,
    /// Network blips and upstream 5xx.
    Transient,
    /// Bad input, missing resources, parse failures.
    Permanent,
    /// Anything unrecognized. Treated conservatively as non-retryable.
    Unknown,
}

impl ErrorClass {
    /// Classes the scanner will automatically retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Quota | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::Timeout => "timeout",
            Self::Schema => "schema",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of classifying a raw error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: ErrorClass,
    /// Stable stage/code tag for the matched rule.
    pub code: &'static str,
    /// The original message, trimmed.
    pub message: String,
    /// Grouping key: sha256 prefix over (code, error name, normalized message).
    pub signature: String,
}

/// A single classification rule with a compiled regex.
struct ClassRule {
    class: ErrorClass,
    code: &'static str,
    regex: Regex,
}

/// Priority-ordered classifier over raw error text.
pub struct ErrorClassifier {
    rules: Vec<ClassRule>,
}

impl ErrorClassifier {
    /// Build the classifier with the default rule table.
    ///
    /// Rule order IS the precedence: the first matching rule decides the
    /// class, so a message mentioning both a rate limit and a timeout
    /// classifies as quota.
    pub fn new() -> Self {
        // Static patterns, exercised by tests.
        let rule = |class, code, pattern: &str| ClassRule {
            class,
            code,
            regex: Regex::new(pattern).unwrap(),
        };

        let rules = vec![
            // auth
            rule(
                ErrorClass::Auth,
                "auth_rejected",
                r"(credential|unauthorized|forbidden|\b401\b|\b403\b|permission denied|access denied|invalid (api[ _-]?key|token)|token expired|authentication)",
            ),
            // quota
            rule(
                ErrorClass::Quota,
                "rate_limited",
                r"(rate[ _-]?limit|\b429\b|quota|too many requests|resource[ _-]?exhausted|throttl)",
            ),
            // timeout
            rule(
                ErrorClass::Timeout,
                "timed_out",
                r"(timed?[ _-]?out|deadline exceeded|\betimedout\b|\baborted\b|deadline)",
            ),
            // schema
            rule(
                ErrorClass::Schema,
                "schema_drift",
                r"(no such (column|table)|column .{0,60}does not exist|unknown column|undefined column|missing column)",
            ),
            // transient
            rule(
                ErrorClass::Transient,
                "upstream_unavailable",
                r"(\beconnreset\b|\beconnrefused\b|\bepipe\b|\beai_again\b|socket hang ?up|\b502\b|\b503\b|\b504\b|bad gateway|service unavailable|fetch failed|connection (reset|refused|closed)|network|temporarily unavailable)",
            ),
            // permanent
            rule(
                ErrorClass::Permanent,
                "rejected_input",
                r"(not found|\b404\b|\b400\b|invalid|malformed|parse error|unsupported|bad request|unprocessable)",
            ),
        ];

        Self { rules }
    }

    /// Classify a raw error message. Total: any input (including empty)
    /// yields a classification, never a panic.
    pub fn classify(&self, raw: &str) -> Classification {
        let message = coerce_message(raw);
        let lowered = message.to_lowercase();

        for rule in &self.rules {
            if rule.regex.is_match(&lowered) {
                return Classification {
                    class: rule.class,
                    code: rule.code,
                    signature: signature(rule.code, &error_name(&message), &lowered),
                    message,
                };
            }
        }

        Classification {
            class: ErrorClass::Unknown,
            code: "unknown",
            signature: signature("unknown", &error_name(&message), &lowered),
            message,
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff for a retryable class.
///
/// `min(base * 2^attempt, 1 hour)`. Quota errors use a 2-minute base
/// because upstream throttles recover more slowly than network blips.
pub fn backoff(class: ErrorClass, attempt: u32) -> Duration {
    const CAP_SECS: u64 = 3600;
    let base: u64 = match class {
        ErrorClass::Quota => 120,
        _ => 30,
    };
    let factor = 2u64.saturating_pow(attempt.min(32));
    Duration::from_secs(base.saturating_mul(factor).min(CAP_SECS))
}

/// Deterministic grouping key for an error occurrence.
///
/// Hashes `(code, error name, normalized message)` so repeats of the same
/// failure collapse to one key regardless of timestamps or instance ids.
pub fn signature(code: &str, name: &str, lowered_message: &str) -> String {
    let normalized = normalize_message(lowered_message);
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.update(b"|");
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Coerce arbitrary input into a non-empty message.
fn coerce_message(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "unknown error".to_string()
    } else {
        trimmed.chars().take(2000).collect()
    }
}

/// Extract a leading `SomethingError:`-style name, or `"Error"`.
fn error_name(message: &str) -> String {
    let head = message.split([':', ' ']).next().unwrap_or("");
    if head.len() < 64 && (head.ends_with("Error") || head.ends_with("Exception")) {
        head.to_string()
    } else {
        "Error".to_string()
    }
}

/// Collapse volatile fragments so instance ids, counts, and timestamps do
/// not split signature groups.
fn normalize_message(lowered: &str) -> String {
    let mut out = String::with_capacity(lowered.len().min(200));
    let mut last_was_hash = false;
    let mut last_was_space = false;
    for ch in lowered.chars() {
        if ch.is_ascii_digit() {
            if !last_was_hash {
                out.push('#');
                last_was_hash = true;
                last_was_space = false;
            }
            continue;
        }
        last_was_hash = false;
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
            continue;
        }
        last_was_space = false;
        out.push(ch);
        if out.len() >= 200 {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(msg: &str) -> Classification {
        ErrorClassifier::new().classify(msg)
    }

    #[test]
    fn auth_patterns() {
        assert_eq!(classify("403 Forbidden: invalid credentials").class, ErrorClass::Auth);
        assert_eq!(classify("Unauthorized").class, ErrorClass::Auth);
        assert_eq!(classify("invalid api key provided").class, ErrorClass::Auth);
    }

    #[test]
    fn quota_patterns() {
        assert_eq!(classify("429 Too Many Requests").class, ErrorClass::Quota);
        assert_eq!(classify("RESOURCE_EXHAUSTED: quota exceeded").class, ErrorClass::Quota);
    }

    #[test]
    fn timeout_patterns() {
        assert_eq!(classify("deadline exceeded after 30s").class, ErrorClass::Timeout);
        assert_eq!(classify("request timed out").class, ErrorClass::Timeout);
        assert_eq!(classify("ETIMEDOUT").class, ErrorClass::Timeout);
    }

    #[test]
    fn schema_patterns() {
        assert_eq!(classify("no such column: leased_until").class, ErrorClass::Schema);
        assert_eq!(
            classify("column \"next_run_at\" does not exist").class,
            ErrorClass::Schema
        );
    }

    #[test]
    fn transient_patterns() {
        assert_eq!(classify("ECONNRESET").class, ErrorClass::Transient);
        assert_eq!(classify("fetch failed: ECONNREFUSED api.example.com").class, ErrorClass::Transient);
        assert_eq!(classify("502 Bad Gateway").class, ErrorClass::Transient);
    }

    #[test]
    fn permanent_patterns() {
        assert_eq!(classify("document not found").class, ErrorClass::Permanent);
        assert_eq!(classify("malformed PDF header").class, ErrorClass::Permanent);
    }

    #[test]
    fn unknown_is_default() {
        assert_eq!(classify("something odd happened").class, ErrorClass::Unknown);
        assert_eq!(classify("").class, ErrorClass::Unknown);
        assert_eq!(classify("").message, "unknown error");
    }

    #[test]
    fn precedence_is_fixed() {
        // Mentions both quota and timeout tokens; quota is checked first.
        assert_eq!(
            classify("rate limit hit, request timed out waiting for slot").class,
            ErrorClass::Quota
        );
        // Auth beats everything.
        assert_eq!(
            classify("403 forbidden fetching url, connection reset").class,
            ErrorClass::Auth
        );
    }

    #[test]
    fn retryability() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::Quota.is_retryable());
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(!ErrorClass::Auth.is_retryable());
        assert!(!ErrorClass::Schema.is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());
        assert!(!ErrorClass::Unknown.is_retryable());
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify("fetch failed: ECONNREFUSED api.example.com");
        let b = classify("fetch failed: ECONNREFUSED api.example.com");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_collapses_volatile_fragments() {
        let a = classify("timeout after 30s on attempt 2");
        let b = classify("timeout after 45s on attempt 7");
        assert_eq!(a.signature, b.signature);

        let c = classify("timeout calling ocr service");
        assert_ne!(a.signature, c.signature);
    }

    #[test]
    fn signature_is_short_hex() {
        let sig = classify("ECONNRESET").signature;
        assert_eq!(sig.len(), 16);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(ErrorClass::Transient, 0), Duration::from_secs(30));
        assert_eq!(backoff(ErrorClass::Transient, 1), Duration::from_secs(60));
        assert_eq!(backoff(ErrorClass::Transient, 4), Duration::from_secs(480));
        assert_eq!(backoff(ErrorClass::Transient, 20), Duration::from_secs(3600));
        // Monotone in attempt.
        for n in 0..20 {
            assert!(backoff(ErrorClass::Timeout, n) <= backoff(ErrorClass::Timeout, n + 1));
        }
    }

    #[test]
    fn quota_backs_off_slower() {
        assert_eq!(backoff(ErrorClass::Quota, 0), Duration::from_secs(120));
        assert_eq!(backoff(ErrorClass::Quota, 1), Duration::from_secs(240));
        for n in 0..10 {
            assert!(backoff(ErrorClass::Quota, n) >= backoff(ErrorClass::Transient, n));
        }
    }

    #[test]
    fn backoff_huge_attempt_does_not_overflow() {
        assert_eq!(backoff(ErrorClass::Quota, u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn error_name_extraction() {
        let c = classify("TypeError: cannot read property 'pages' of undefined invalid");
        assert_eq!(c.class, ErrorClass::Permanent);
        // Name feeds the signature: same message with a different leading
        // name must produce a different group.
        let d = classify("RangeError: cannot read property 'pages' of undefined invalid");
        assert_ne!(c.signature, d.signature);
    }
}
