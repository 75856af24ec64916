use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::events::SetCookie;
use crate::util::redact_bearer_token;

/// Sentinel replacing secret field and cookie values in emitted and
/// archived copies.
pub const SECRET_SENTINEL: &str = "***";

fn json_secret_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""(password|pass|token|secret|apiKey)"(\s*:\s*)"(?:[^"\\]|\\.)*""#)
            .expect("static regex")
    })
}

fn form_secret_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|[&?])(password|pass|token|secret|apiKey)=[^&]*").expect("static regex")
    })
}

/// Replace the values of secret-bearing fields in a request body. JSON
/// bodies redact the usual credential field names; urlencoded bodies redact
/// the same keys. Builds a new string, never mutates in place.
pub fn redact_body_text(text: &str, content_type: Option<&str>) -> String {
    let is_form = content_type
        .map(|ct| ct.contains("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_form {
        return form_secret_regex()
            .replace_all(text, |caps: &regex::Captures<'_>| {
                format!("{}{}={}", &caps[1], &caps[2], SECRET_SENTINEL)
            })
            .into_owned();
    }
    json_secret_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            format!(r#""{}"{}"{}""#, &caps[1], &caps[2], SECRET_SENTINEL)
        })
        .into_owned()
}

/// Redacted copy of a parsed cookie: the value is replaced by the sentinel,
/// name and flags are preserved.
pub fn redact_set_cookie(cookie: &SetCookie) -> SetCookie {
    SetCookie {
        name: cookie.name.clone(),
        value: SECRET_SENTINEL.to_string(),
        flags: cookie.flags.clone(),
    }
}

/// Redacted copy of a header map: bearer signatures in `authorization` are
/// collapsed and `cookie` values replaced by the sentinel. Other headers
/// pass through.
pub fn redact_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let v = match name.as_str() {
                "authorization" => redact_authorization_value(value),
                "cookie" => SECRET_SENTINEL.to_string(),
                _ => value.clone(),
            };
            (name.clone(), v)
        })
        .collect()
}

fn redact_authorization_value(value: &str) -> String {
    if let Some(token) = value.strip_prefix("Bearer ").map(str::trim) {
        return format!("Bearer {}", redact_bearer_token(token));
    }
    value.to_string()
}
