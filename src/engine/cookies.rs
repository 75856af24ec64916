use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::events::{CorsAllow, SetCookie};

/// Parse one raw `Set-Cookie` line into name, value, and a lowercased flag
/// map. Bare flags (`Secure`, `HttpOnly`) become `true`; valued flags keep
/// their value as a lowercased string. Lines without a `name=value` head
/// are rejected.
pub fn parse_set_cookie(line: &str) -> Option<SetCookie> {
    let mut parts = line.split(';');
    let head = parts.next()?.trim();
    let (name, value) = head.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut flags: BTreeMap<String, JsonValue> = BTreeMap::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => {
                flags.insert(
                    k.trim().to_ascii_lowercase(),
                    JsonValue::String(v.trim().to_ascii_lowercase()),
                );
            }
            None => {
                flags.insert(part.to_ascii_lowercase(), JsonValue::Bool(true));
            }
        }
    }

    Some(SetCookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        flags,
    })
}

/// Group the `Access-Control-Allow-*` grant out of an already-lowercased
/// response header map. Returns `None` when no allow header is present.
pub fn extract_cors_allow(headers: &BTreeMap<String, String>) -> Option<CorsAllow> {
    let origin = headers.get("access-control-allow-origin").cloned();
    let methods = headers.get("access-control-allow-methods").cloned();
    let allow_headers = headers.get("access-control-allow-headers").cloned();
    let credentials = headers
        .get("access-control-allow-credentials")
        .map(|v| v.trim().eq_ignore_ascii_case("true"));

    if origin.is_none() && methods.is_none() && allow_headers.is_none() && credentials.is_none() {
        return None;
    }
    Some(CorsAllow {
        origin,
        methods,
        headers: allow_headers,
        credentials,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn simple_cookie_with_bare_and_valued_flags() {
        let c = parse_set_cookie("s=XYZ; Path=/; HttpOnly").expect("parses");
        assert_eq!(c.name, "s");
        assert_eq!(c.value, "XYZ");
        assert_eq!(c.flags["path"], "/");
        assert_eq!(c.flags["httponly"], true);
    }

    #[test]
    fn flag_names_and_values_are_lowercased() {
        let c = parse_set_cookie("t=Q1; Max-Age=60; Secure; SameSite=Lax").expect("parses");
        assert_eq!(c.flags["max-age"], "60");
        assert_eq!(c.flags["secure"], true);
        assert_eq!(c.flags["samesite"], "lax");
    }

    #[test]
    fn cookie_without_name_value_head_is_rejected() {
        assert_eq!(parse_set_cookie("no-equals-here; Secure"), None);
        assert_eq!(parse_set_cookie("=orphan; Path=/"), None);
    }

    #[test]
    fn cors_allow_groups_headers_and_parses_credentials() {
        let headers = BTreeMap::from([
            (
                "access-control-allow-origin".to_string(),
                "https://a.test".to_string(),
            ),
            (
                "access-control-allow-credentials".to_string(),
                "True".to_string(),
            ),
            ("vary".to_string(), "Origin".to_string()),
        ]);
        let allow = extract_cors_allow(&headers).expect("some");
        assert_eq!(allow.origin.as_deref(), Some("https://a.test"));
        assert_eq!(allow.credentials, Some(true));
        assert_eq!(allow.methods, None);
    }

    #[test]
    fn absent_allow_headers_yield_none() {
        let headers = BTreeMap::from([("content-type".to_string(), "text/html".to_string())]);
        assert_eq!(extract_cors_allow(&headers), None);
    }
}
