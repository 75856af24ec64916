use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Filesystem-safe rendering of the current wall clock, used to name
/// per-session artifacts (`capture-<slug>/`, `rest-<slug>.har`, ...).
pub fn timestamp_slug() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Idempotently create `path` and any missing parents.
pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create directory {:?}", path))
}

/// Open `path` for appending, creating parent directories first.
/// The caller owns the handle and its close.
pub fn open_append_stream(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open append stream {:?}", path))
}

/// Serialize `value` as one JSON line. A value that fails to serialize is
/// replaced by a sentinel line instead of propagating the error; only the
/// underlying IO error is surfaced.
pub fn write_json_line<T: Serialize>(stream: &mut File, value: &T) -> std::io::Result<()> {
    match serde_json::to_string(value) {
        Ok(line) => writeln!(stream, "{}", line),
        Err(_) => writeln!(stream, "{}", r#"{"_error":"unserializable"}"#),
    }
}

/// Restrict `id` to `[A-Za-z0-9._-]` (other bytes become `_`) and cap the
/// result at 64 characters, so host-assigned request ids are safe as file
/// name components.
pub fn sanitize_file_component(id: &str) -> String {
    let mut out: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(64);
    out
}

fn bearer_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Three dot-separated Base64URL groups, first group starting with "ey"
        // (the Base64 of `{"`), which is how signed tokens open in the wild.
        Regex::new(r"ey[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").expect("static regex")
    })
}

/// Return the first substring of `s` that looks like a signed bearer token.
pub fn find_bearer_token(s: &str) -> Option<&str> {
    bearer_token_regex().find(s).map(|m| m.as_str())
}

/// Copy of `s` with every detectable bearer token's signature collapsed to
/// `<redacted:Nb>`.
pub fn bearer_tokens_redacted(s: &str) -> String {
    bearer_token_regex()
        .replace_all(s, |caps: &regex::Captures<'_>| redact_bearer_token(&caps[0]))
        .into_owned()
}

/// Decode one Base64URL segment and parse it as JSON. Returns `None` on any
/// failure: bad padding, bad alphabet, or a payload that is not JSON.
pub fn decode_base64url_json(s: &str) -> Option<JsonValue> {
    let mut normalized = s.replace('-', "+").replace('_', "/");
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(normalized)
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Split a token on `.` and decode its header and payload segments
/// independently; either side may fail without affecting the other.
pub fn decode_bearer_token(token: &str) -> (Option<JsonValue>, Option<JsonValue>) {
    let mut parts = token.split('.');
    let header = parts.next().and_then(decode_base64url_json);
    let payload = parts.next().and_then(decode_base64url_json);
    (header, payload)
}

/// Replace the signature segment of a three-part token with
/// `<redacted:Nb>` where N is the signature's original length. The header
/// and payload segments pass through verbatim; anything that is not a
/// three-part token is returned unchanged.
pub fn redact_bearer_token(token: &str) -> String {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return token.to_string();
    }
    format!(
        "{}.{}.<redacted:{}b>",
        parts[0],
        parts[1],
        parts[2].len()
    )
}
