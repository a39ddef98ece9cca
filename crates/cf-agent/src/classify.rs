//! Error-string classification and dependency-request extraction.
//!
//! Grounded on `at-session/src/cli_adapter.rs`'s status-output string
//! matching and `at-core/src/worktree_manager.rs`'s plain substring-based
//! conflict parsing — this workspace never reaches for `regex` for text this
//! shaped, so neither does this module.

use cf_core::types::DependencyRequest;

/// Error taxonomy from spec §7. Concept-level, not an exception hierarchy —
/// callers match on variant to decide retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    AgentUnavailable,
    AgentAuth,
    RateLimit,
    Timeout,
    Merge,
    PushRejected,
    Unknown,
}

impl ErrorClass {
    /// Whether the retry wrapper in [`crate::supervisor`] should retry this
    /// class at all. Auth errors are fatal and require a human.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::AgentAuth | ErrorClass::Merge | ErrorClass::PushRejected)
    }
}

/// Classify a raw error/stderr string per spec §4.5 / §7's substring table.
/// Order matters: more specific phrases are checked before generic ones.
pub fn classify_error_text(text: &str) -> ErrorClass {
    let lower = text.to_lowercase();

    if contains_any(&lower, &["not authenticated", "unauthorized", "401"]) {
        return ErrorClass::AgentAuth;
    }
    if contains_any(&lower, &["rate limit", "quota", "429"]) {
        return ErrorClass::RateLimit;
    }
    if contains_any(&lower, &["rejected", "non-fast-forward", "fetch first"]) {
        return ErrorClass::PushRejected;
    }
    if contains_any(&lower, &["conflict", "merge failed"]) {
        return ErrorClass::Merge;
    }
    if contains_any(&lower, &["timeout", "timed out"]) {
        return ErrorClass::Timeout;
    }
    if contains_any(&lower, &["unavailable"]) {
        return ErrorClass::AgentUnavailable;
    }
    if contains_any(&lower, &["network", "econnreset", "econnrefused", "socket hang up"]) {
        return ErrorClass::Network;
    }
    ErrorClass::Unknown
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// The literal marker an agent reply uses to declare a dependency request.
pub const DEPENDENCY_CHANGE_MARKER: &str = "DEPENDENCY_CHANGE_REQUIRED";

/// Find `DEPENDENCY_CHANGE_REQUIRED` in agent text and parse the JSON object
/// that follows it (first balanced `{...}` span, matching spec §4.5).
pub fn extract_dependency_request(text: &str) -> Option<DependencyRequest> {
    let marker_pos = text.find(DEPENDENCY_CHANGE_MARKER)?;
    let after = &text[marker_pos + DEPENDENCY_CHANGE_MARKER.len()..];
    let json_str = first_balanced_object(after)?;
    serde_json::from_str(&json_str).ok()
}

/// Scan for the first `{`, then return the substring up to its matching `}`,
/// respecting string literals and escapes so braces inside strings don't
/// confuse the balance count.
fn first_balanced_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = start;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(text[start..=i].to_string());
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}
