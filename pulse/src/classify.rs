//! Error classification, fingerprinting and context redaction.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::model::ErrorKind;

/// Classification ranks, checked in order; the first category whose message
/// substrings or status codes match wins.
const RANKS: &[(ErrorKind, &[&str], &[u16])] = &[
    (ErrorKind::Panic, &["panic", "runtime error"], &[]),
    (
        ErrorKind::Timeout,
        &["timeout", "deadline exceeded", "context canceled"],
        &[408, 504],
    ),
    (
        ErrorKind::Auth,
        &["unauthorized", "forbidden", "authentication", "permission denied"],
        &[401, 403],
    ),
    (ErrorKind::NotFound, &["not found", "no rows"], &[404]),
    (
        ErrorKind::Validation,
        &["validation", "invalid", "required", "must be"],
        &[400, 422],
    ),
    (
        ErrorKind::Database,
        &["sql", "database", "connection refused", "duplicate key", "constraint", "deadlock"],
        &[],
    ),
];

/// One case-insensitive matcher over every rank's substrings; pattern index
/// maps back to its rank below.
static MATCHER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    let patterns: Vec<&str> = RANKS.iter().flat_map(|(_, subs, _)| subs.iter().copied()).collect();
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(patterns)
        .expect("valid patterns")
});

/// Classify an error message plus response status into an [`ErrorKind`].
pub fn classify(message: &str, status: u16) -> ErrorKind {
    let mut matched = [false; 64];
    for m in MATCHER.find_overlapping_iter(message) {
        matched[m.pattern().as_usize()] = true;
    }

    let mut offset = 0;
    for (kind, subs, statuses) in RANKS {
        let by_message = (offset..offset + subs.len()).any(|i| matched[i]);
        if by_message || statuses.contains(&status) {
            return *kind;
        }
        offset += subs.len();
    }
    ErrorKind::Internal
}

/// Stable 16-hex deduplication key over `method|route|message`.
pub fn fingerprint(method: &str, route: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(route.as_bytes());
    hasher.update(b"|");
    hasher.update(message.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
];

/// Copy headers into a plain map, replacing sensitive values with
/// `[REDACTED]`.
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let key = name.as_str().to_ascii_lowercase();
        let value = if SENSITIVE_HEADERS.contains(&key.as_str()) {
            "[REDACTED]".to_string()
        } else {
            value.to_str().unwrap_or("[binary]").to_string()
        };
        out.insert(key, value);
    }
    out
}

/// Frame prefixes dropped from captured stack traces: the async runtime, the
/// HTTP stack, the standard library, and the engine itself.
const NOISE_FRAMES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "tokio::",
    "hyper::",
    "hyper_util::",
    "axum::",
    "axum_core::",
    "tower::",
    "tower_service::",
    "futures_util::",
    "futures_core::",
    "pulse::errors",
    "pulse::trace",
    "rust_begin_unwind",
    "__rust",
    "_start",
];

/// Reduce a captured backtrace to application frames.
///
/// Works on the textual form of `std::backtrace::Backtrace`: a frame is a
/// symbol line (`  N: path::to::fn`) optionally followed by an `at` line;
/// both are dropped when the symbol belongs to a noisy layer.
pub fn clean_stack(raw: &str) -> String {
    let mut out = String::new();
    let mut keep_current = false;

    for line in raw.lines() {
        let trimmed = line.trim_start();
        let is_location = trimmed.starts_with("at ");

        if is_location {
            if keep_current {
                out.push_str(line);
                out.push('\n');
            }
            continue;
        }

        // Symbol line: "  12: some::symbol::name"
        let symbol = trimmed
            .split_once(": ")
            .map_or(trimmed, |(_, rest)| rest);
        keep_current = !NOISE_FRAMES.iter().any(|p| symbol.starts_with(p));
        if keep_current {
            out.push_str(line);
            out.push('\n');
        }
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_substring_in_rank_order() {
        assert_eq!(classify("panic: index out of range", 500), ErrorKind::Panic);
        assert_eq!(classify("deadline exceeded", 200), ErrorKind::Timeout);
        assert_eq!(classify("user unauthorized", 500), ErrorKind::Auth);
        assert_eq!(classify("record not found", 500), ErrorKind::NotFound);
        assert_eq!(classify("field is required", 500), ErrorKind::Validation);
        assert_eq!(classify("duplicate key violation", 500), ErrorKind::Database);
        assert_eq!(classify("something odd", 500), ErrorKind::Internal);
    }

    #[test]
    fn classifies_case_insensitively() {
        assert_eq!(classify("Deadline Exceeded", 200), ErrorKind::Timeout);
        assert_eq!(classify("VALIDATION failed", 200), ErrorKind::Validation);
    }

    #[test]
    fn classifies_by_status_code() {
        assert_eq!(classify("", 504), ErrorKind::Timeout);
        assert_eq!(classify("", 403), ErrorKind::Auth);
        assert_eq!(classify("", 404), ErrorKind::NotFound);
        assert_eq!(classify("", 422), ErrorKind::Validation);
        assert_eq!(classify("", 500), ErrorKind::Internal);
    }

    #[test]
    fn earlier_rank_wins_over_later() {
        // "timeout" (rank 2) beats "invalid" (rank 5) regardless of position.
        assert_eq!(classify("invalid state after timeout", 200), ErrorKind::Timeout);
        // A panic substring beats a timeout status.
        assert_eq!(classify("runtime error: nil deref", 504), ErrorKind::Panic);
    }

    #[test]
    fn fingerprint_is_stable_and_16_hex() {
        let a = fingerprint("GET", "/users/{id}", "boom");
        let b = fingerprint("GET", "/users/{id}", "boom");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        // Any component changing changes the key.
        assert_ne!(a, fingerprint("POST", "/users/{id}", "boom"));
        assert_ne!(a, fingerprint("GET", "/users", "boom"));
        assert_ne!(a, fingerprint("GET", "/users/{id}", "bam"));
    }

    #[test]
    fn redacts_sensitive_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer secret".parse().unwrap());
        headers.insert("Cookie", "session=abc".parse().unwrap());
        headers.insert("X-Api-Key", "key123".parse().unwrap());
        headers.insert("Accept", "application/json".parse().unwrap());

        let redacted = redact_headers(&headers);
        assert_eq!(redacted["authorization"], "[REDACTED]");
        assert_eq!(redacted["cookie"], "[REDACTED]");
        assert_eq!(redacted["x-api-key"], "[REDACTED]");
        assert_eq!(redacted["accept"], "application/json");
    }

    #[test]
    fn clean_stack_drops_runtime_frames() {
        let raw = "   0: rust_begin_unwind\n             at /rustc/lib.rs:10\n   1: tokio::runtime::task::poll\n             at /cargo/tokio/task.rs:1\n   2: my_app::handlers::create_user\n             at src/handlers.rs:42\n   3: std::panicking::try\n             at /rustc/panicking.rs:5";
        let cleaned = clean_stack(raw);
        assert!(cleaned.contains("my_app::handlers::create_user"));
        assert!(cleaned.contains("src/handlers.rs:42"));
        assert!(!cleaned.contains("tokio::"));
        assert!(!cleaned.contains("rust_begin_unwind"));
        assert!(!cleaned.contains("std::panicking"));
    }
}
