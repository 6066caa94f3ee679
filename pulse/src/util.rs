//! Small shared helpers.

use axum::http::HeaderMap;

/// Match a path against a glob pattern where `*` matches any run of
/// characters (including `/`) and `?` matches exactly one.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = path.chars().collect();

    // Iterative backtracking over the last-seen `*`.
    let (mut pi, mut si) = (0usize, 0usize);
    let (mut star, mut matched) = (None::<usize>, 0usize);

    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            matched = si;
            pi += 1;
        } else if let Some(star_pos) = star {
            pi = star_pos + 1;
            matched += 1;
            si = matched;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Best-effort client IP: `X-Forwarded-For` (first hop), then `X-Real-IP`,
/// then the literal `unknown`.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real.trim().to_string();
    }
    "unknown".into()
}

/// Bytes to megabytes with two useful decimals of precision.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
