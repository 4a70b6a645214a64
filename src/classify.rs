//! Error classification
//!
//! Pure mapping from captured stderr to a closed set of categories. The
//! orchestrator uses the category to pick a state-machine edge, so the
//! function must stay deterministic: no locale, clock or environment lookups.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Something failed inside the program under test.
    Code,
    /// Environment, auth or network trouble the code cannot fix.
    Infra,
    /// Nothing on stderr.
    None,
    /// Not classified yet in this run.
    #[default]
    Unclassified,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Code => "CODE",
            ErrorCategory::Infra => "INFRA",
            ErrorCategory::None => "NONE",
            ErrorCategory::Unclassified => "UNCLASSIFIED",
        }
    }
}

/// Lowercase substrings that mark an infrastructure failure.
///
/// Bare HTTP status numbers are deliberately absent: they collide with
/// traceback line numbers, and client libraries spell the reason phrase out.
pub const INFRA_KEYWORDS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "access denied",
    "rate limit",
    "ratelimit",
    "too many requests",
    "timeout",
    "timed out",
    "connection refused",
    "connectionrefused",
    "connectionerror",
    "connection reset",
    "network is unreachable",
    "temporary failure in name resolution",
    "name or service not known",
    "ssl error",
    "sslerror",
    "certificate verify failed",
    "credential",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub reason: String,
    /// Exception line such as `ZeroDivisionError: division by zero`, when one
    /// can be found.
    pub signature: Option<String>,
}

/// Classify stderr text. INFRA wins over CODE when both are present.
pub fn classify(stderr: &str) -> ErrorCategory {
    classify_detailed(stderr).category
}

pub fn classify_detailed(stderr: &str) -> Classification {
    if stderr.trim().is_empty() {
        return Classification {
            category: ErrorCategory::None,
            reason: "No error output captured".to_string(),
            signature: None,
        };
    }

    let signature = exception_signature(stderr);
    let lower = stderr.to_lowercase();

    if let Some(keyword) = INFRA_KEYWORDS.iter().find(|k| lower.contains(*k)) {
        return Classification {
            category: ErrorCategory::Infra,
            reason: format!("Detected infrastructure keyword: {}", keyword),
            signature,
        };
    }

    let reason = match &signature {
        Some(sig) => format!("Captured exception: {}", sig),
        None => "Error output present without infrastructure markers".to_string(),
    };

    Classification {
        category: ErrorCategory::Code,
        reason,
        signature,
    }
}

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// `ZeroDivisionError: division by zero`, bare or in a pytest `E` block.
fn exception_line() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &PATTERN,
        r"(?m)^(?:E\s+)?\s*([A-Za-z_][\w.]*(?:Error|Exception|Exit|Interrupt|Failure))\b(?::\s*(.*))?$",
    )
}

/// pytest crash location: `tests/test_app.py:5: AssertionError`.
fn crash_line() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &PATTERN,
        r"(?m)^\S+\.py:\d+:\s+([A-Za-z_][\w.]*(?:Error|Exception|Exit|Interrupt|Failure))\s*$",
    )
}

/// pytest short summary: `FAILED tests/test_app.py::test_divide - assert 2.0 == 3`.
fn failed_test_line() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&PATTERN, r"(?m)^FAILED\s+(\S+)(?:\s+-\s+(.*))?$")
}

fn last_match(pattern: Option<&Regex>, text: &str, prefix: &str) -> Option<String> {
    pattern?.captures_iter(text).last().map(|caps| {
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        match caps.get(2).map(|m| m.as_str().trim()) {
            Some(message) if !message.is_empty() => format!("{}{}: {}", prefix, name, message),
            _ => format!("{}{}", prefix, name),
        }
    })
}

/// Find the failure signature: the last exception line of a traceback,
/// else the last pytest crash location, else the last failed test id.
pub fn exception_signature(text: &str) -> Option<String> {
    last_match(exception_line(), text, "")
        .or_else(|| last_match(crash_line(), text, ""))
        .or_else(|| last_match(failed_test_line(), text, "FAILED "))
}
