use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static GIT_LOG_BOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(git\s+log\s+--oneline)\s+-\d+$").expect("static regex"));

/// Normalize a command string for keying: trim, collapse interior whitespace,
/// and apply equivalence rewrites so trivially-equivalent spellings share a
/// cache/dedup key (`ls -al` ≡ `ls -la`; the trailing numeric bound on
/// `git log --oneline -N` is dropped).
pub fn normalize_command(command: &str) -> String {
    let collapsed = command.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Some(caps) = GIT_LOG_BOUND.captures(&collapsed) {
        return caps[1].split_whitespace().collect::<Vec<_>>().join(" ");
    }

    let mut tokens: Vec<String> = collapsed.split(' ').map(str::to_string).collect();
    if tokens.first().is_some_and(|t| t == "ls") {
        for token in tokens.iter_mut().skip(1) {
            *token = sort_short_flags(token);
        }
    }
    tokens.join(" ")
}

/// Sort the letters of a combined short-flag cluster (`-al` → `-la` and
/// `-la` → `-la`), leaving long flags and non-flag tokens untouched.
fn sort_short_flags(token: &str) -> String {
    let Some(rest) = token.strip_prefix('-') else {
        return token.to_string();
    };
    if rest.is_empty() || rest.starts_with('-') || !rest.chars().all(|c| c.is_ascii_alphabetic()) {
        return token.to_string();
    }
    let mut letters: Vec<char> = rest.chars().collect();
    letters.sort_unstable();
    // Reverse so "-al" and "-la" both land on the conventional "-la" spelling.
    letters.reverse();
    let mut out = String::with_capacity(token.len());
    out.push('-');
    out.extend(letters);
    out
}

/// Stable digest of `(normalized_command, cwd)`. First 16 bytes of SHA-256,
/// hex-encoded; stable across Rust versions, unlike SipHash.
pub fn command_key(command: &str, cwd: &str) -> String {
    let normalized = normalize_command(command);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    hasher.update(cwd.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Fingerprint of a command result for duplicate detection: digest of
/// `(stdout, exit_code)`.
pub fn result_fingerprint(stdout: &str, exit_code: i32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stdout.as_bytes());
    hasher.update([0u8]);
    hasher.update(exit_code.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// First whitespace-delimited token of a command ("base"), used for the
/// high-dedup and coalescable sets.
pub fn base_command(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}
