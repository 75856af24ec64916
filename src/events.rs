use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Cap on UTF-8 body previews carried by events and archives.
pub const PREVIEW_MAX_CHARS: usize = 512;

/// Coerce an arbitrary method string onto the supported set; anything else
/// is treated as a GET.
pub fn normalize_method(method: &str) -> &'static str {
    match method.to_ascii_uppercase().as_str() {
        "POST" => "POST",
        "PUT" => "PUT",
        "PATCH" => "PATCH",
        "DELETE" => "DELETE",
        "HEAD" => "HEAD",
        "OPTIONS" => "OPTIONS",
        _ => "GET",
    }
}

/// Truncate `text` to at most [`PREVIEW_MAX_CHARS`] characters on a char
/// boundary.
pub fn preview_of(text: &str) -> String {
    text.chars().take(PREVIEW_MAX_CHARS).collect()
}

/// Request lifecycle timestamps in milliseconds since epoch. `start_ts` is
/// stamped at request creation; the other two arrive with the first body
/// byte and terminal completion respectively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub start_ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_byte_ts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<u64>,
}

/// CORS metadata attached to a request that consumed a matching pre-flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsInfo {
    pub preflight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// The `Access-Control-Allow-*` grant carried by a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsAllow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<bool>,
}

/// One parsed `Set-Cookie` line. Flag keys are lowercased; flag values are
/// strings (`path`, `max-age`, ...) or `true` for bare flags (`secure`,
/// `httponly`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, JsonValue>,
}

/// A detected bearer token: the token itself with its signature segment
/// redacted, plus the decoded header/payload when they are valid
/// Base64URL-encoded JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtInfo {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

/// Normalized request metadata, one per host-assigned request id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub id: String,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub timing: Timing,
    /// Raw upload bytes; held in memory only, never serialized.
    #[serde(skip)]
    pub body: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtInfo>,
}

/// Normalized response metadata for the same id as its request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResponse {
    pub id: String,
    pub status: u16,
    pub status_text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Byte size after content decoding.
    pub body_size: usize,
    /// Raw post-decode bytes; held in memory only, never serialized.
    #[serde(skip)]
    pub body: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    pub timing: Timing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,
    /// Path of the persisted body file, when the persistence gate fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors_allow: Option<CorsAllow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_cookies: Option<Vec<SetCookie>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtInfo>,
}

/// Aggregate of one request and its optional response, keyed by a route that
/// collapses volatile path segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedTransaction {
    pub id: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub route_key: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub query_string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_ms: Option<u64>,
    pub request: CapturedRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CapturedResponse>,
}

/// Payload of `rest:request` and `rest:before-send-headers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub ts: u64,
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub req_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_body: Option<String>,
}

/// Payload of `rest:response`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    pub ts: u64,
    pub url: String,
    pub method: String,
    pub status: u16,
    pub status_text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub res_headers: BTreeMap<String, String>,
    pub body_size: usize,
    pub timing_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_cookies: Option<Vec<SetCookie>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_body: Option<String>,
}

/// Payload of `rest:error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub ts: u64,
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub req_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One WebSocket frame recovered through the diagnostic channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsFrameEvent {
    pub ts: u64,
    pub direction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_code: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectHop {
    pub from: String,
    pub to: String,
    pub status: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiator {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Payload of `cdp:initiator`: richer per-request metadata (initiator and
/// redirect chain) than the primary lifecycle callbacks expose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatorEvent {
    pub request_id: String,
    pub url: String,
    #[serde(default)]
    pub redirect_chain: Vec<RedirectHop>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<Initiator>,
}

/// Every event the pipeline emits, as a tagged union. The channel string is
/// a rendering concern at the IPC boundary, not part of the core types.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Request(RequestEvent),
    BeforeSendHeaders(RequestEvent),
    Response(ResponseEvent),
    Error(ErrorEvent),
    Transaction(Box<CapturedTransaction>),
    WsFrame(WsFrameEvent),
    Initiator(InitiatorEvent),
}

impl CaptureEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            CaptureEvent::Request(_) => "rest:request",
            CaptureEvent::BeforeSendHeaders(_) => "rest:before-send-headers",
            CaptureEvent::Response(_) => "rest:response",
            CaptureEvent::Error(_) => "rest:error",
            CaptureEvent::Transaction(_) => "rest:txn",
            CaptureEvent::WsFrame(_) => "ws:frame",
            CaptureEvent::Initiator(_) => "cdp:initiator",
        }
    }

    /// Render the payload for the IPC boundary. A payload that cannot be
    /// serialized is replaced with a sentinel object.
    pub fn payload_json(&self) -> JsonValue {
        let serialized = match self {
            CaptureEvent::Request(p) | CaptureEvent::BeforeSendHeaders(p) => {
                serde_json::to_value(p)
            }
            CaptureEvent::Response(p) => serde_json::to_value(p),
            CaptureEvent::Error(p) => serde_json::to_value(p),
            CaptureEvent::Transaction(p) => serde_json::to_value(p),
            CaptureEvent::WsFrame(p) => serde_json::to_value(p),
            CaptureEvent::Initiator(p) => serde_json::to_value(p),
        };
        serialized.unwrap_or_else(|_| serde_json::json!({ "_unserializable": true }))
    }
}

/// Receives every event the pipeline emits, synchronously on the emitting
/// thread.
pub type EventSink = std::sync::Arc<dyn Fn(&CaptureEvent) + Send + Sync>;

/// Invoke the sink, discarding a panicking sink rather than letting it
/// unwind into the host's callback.
pub fn emit_guarded(sink: &EventSink, event: &CaptureEvent) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(event)));
    if outcome.is_err() {
        tracing::debug!(channel = event.channel(), "event sink panicked; event dropped");
    }
}

/// A `{channel, payload}` pair delivering guest-originated or diagnostic
/// events to the controller for routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    #[serde(default)]
    pub payload: JsonValue,
}

/// Channels the controller knows how to route into the recorder. Anything
/// else is forwarded to the inspector untouched.
pub fn is_known_channel(channel: &str) -> bool {
    matches!(
        channel,
        "rest:request"
            | "rest:before-send-headers"
            | "rest:response"
            | "rest:error"
            | "rest:txn"
            | "ws:open"
            | "ws:msg"
            | "ws:close"
            | "ws:error"
            | "ws:frame"
            | "cdp:initiator"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn method_normalization_coerces_unknown_to_get() {
        assert_eq!(normalize_method("post"), "POST");
        assert_eq!(normalize_method("OPTIONS"), "OPTIONS");
        assert_eq!(normalize_method("PROPFIND"), "GET");
        assert_eq!(normalize_method(""), "GET");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "é".repeat(600);
        let p = preview_of(&long);
        assert_eq!(p.chars().count(), PREVIEW_MAX_CHARS);
    }

    #[test]
    fn channels_render_stably() {
        let ev = CaptureEvent::Request(RequestEvent::default());
        assert_eq!(ev.channel(), "rest:request");
        let ev = CaptureEvent::Transaction(Box::default());
        assert_eq!(ev.channel(), "rest:txn");
        let ev = CaptureEvent::WsFrame(WsFrameEvent::default());
        assert_eq!(ev.channel(), "ws:frame");
    }

    #[test]
    fn wire_payloads_use_camel_case_and_drop_raw_bytes() {
        let mut resp = CapturedResponse {
            id: "1".into(),
            status: 200,
            status_text: "OK".into(),
            body_size: 5,
            body: Some(b"hello".to_vec()),
            ..Default::default()
        };
        resp.timing.start_ts = 10;
        resp.timing.end_ts = Some(20);

        let v = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(v["bodySize"], 5);
        assert_eq!(v["statusText"], "OK");
        assert_eq!(v["timing"]["startTs"], 10);
        assert!(v.get("body").is_none(), "raw bytes must stay off the wire");
    }

    #[test]
    fn payload_json_renders_event_payloads() {
        let ev = WsFrameEvent {
            ts: 7,
            direction: "in".into(),
            data: Some("ok".into()),
            ..Default::default()
        };
        let rendered = CaptureEvent::WsFrame(ev).payload_json();
        assert_eq!(rendered["direction"], "in");
        assert_eq!(rendered["ts"], 7);
        assert!(rendered.get("_unserializable").is_none());
    }

    #[test]
    fn known_channel_set_matches_router() {
        for ch in [
            "rest:request",
            "rest:txn",
            "ws:open",
            "ws:frame",
            "cdp:initiator",
        ] {
            assert!(is_known_channel(ch), "{ch} should be known");
        }
        assert!(!is_known_channel("inspector:ping"));
    }
}
