//! The network capture engine: five ordered lifecycle callbacks on the
//! navigation host, per-id request contexts and response accumulators, a
//! pass-through body tap, pre-flight correlation, bearer-token detection,
//! and five emitted event kinds. Nothing in here may take the pipeline
//! down: failures degrade the current event or skip the current operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

mod cookies;
mod decode;
#[cfg(test)]
mod tests;

use crate::aggregator::TransactionAggregator;
use crate::bridge::{BridgeHandle, DiagnosticBridge, DiagnosticChannel};
use crate::events::{
    CaptureEvent, CapturedRequest, CapturedResponse, CorsInfo, ErrorEvent, EventSink, JwtInfo,
    RequestEvent, ResponseEvent, Timing, emit_guarded, normalize_method, preview_of,
};
use crate::recorder::SavedBody;
use crate::redact;
use crate::util;

/// How long a recorded pre-flight may wait for its real request, measured
/// from the pre-flight's before-send-headers callback.
const PREFLIGHT_TTL_MS: u64 = 3_000;

/// Persists a response body somewhere durable; returns the descriptor the
/// engine attaches to the response. Wired by the session controller.
pub type BodySink = Arc<dyn Fn(&str, &[u8], Option<&str>) -> Result<SavedBody> + Send + Sync>;

/// The embedded browsing surface, reduced to the interface the engine
/// needs: install/uninstall one lifecycle observer and optionally expose a
/// debugger-style channel.
pub trait NavigationHost: Send + Sync {
    fn install(&self, observer: Arc<dyn LifecycleObserver>) -> Result<()>;
    fn uninstall(&self);
    /// Whether the host streams response bodies through
    /// [`LifecycleObserver::on_response_chunk`]. Without it the engine
    /// proceeds with headers and sizes only.
    fn supports_body_stream(&self) -> bool {
        true
    }
    fn diagnostic_channel(&self) -> Option<Arc<dyn DiagnosticChannel>> {
        None
    }
}

/// Request lifecycle callbacks in pipeline order. Every event carries the
/// host-stamped wall clock in milliseconds.
pub trait LifecycleObserver: Send + Sync {
    fn on_before_request(&self, ev: BeforeRequest);
    fn on_before_send_headers(&self, ev: BeforeSendHeaders);
    fn on_headers_received(&self, ev: HeadersReceived);
    /// Streaming body tap: bytes observed == bytes forwarded; the engine
    /// only clones into its accumulator.
    fn on_response_chunk(&self, id: &str, ts: u64, chunk: &[u8]);
    fn on_completed(&self, ev: Completed);
    fn on_error(&self, ev: ErrorOccurred);
}

#[derive(Debug, Clone)]
pub struct BeforeRequest {
    pub id: String,
    pub ts: u64,
    pub method: String,
    pub url: String,
    /// Upload bytes when the host exposes them synchronously.
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct BeforeSendHeaders {
    pub id: String,
    pub ts: u64,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct HeadersReceived {
    pub id: String,
    pub ts: u64,
    pub status: u16,
    pub status_text: String,
    /// Raw header pairs; repeated names (notably `Set-Cookie`) arrive as
    /// separate pairs.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Completed {
    pub id: String,
    pub ts: u64,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct ErrorOccurred {
    pub id: String,
    pub ts: u64,
    pub error: String,
}

/// Capture options, resolved once from configuration at session start.
#[derive(Clone, Default)]
pub struct EngineOptions {
    pub redact_secrets: bool,
    pub capture_bodies: bool,
    pub capture_body_max_bytes: usize,
    /// Compiled body-type filter; `None` matches nothing and disables
    /// persistence.
    pub capture_body_types: Option<Regex>,
    pub enable_cdp: bool,
}

const REQUEST_HEADER_WHITELIST: &[&str] = &[
    "content-type",
    "content-length",
    "accept",
    "accept-encoding",
    "user-agent",
    "origin",
    "referer",
    "host",
    "cache-control",
    "pragma",
];

fn retain_request_header(name: &str, redact: bool) -> bool {
    REQUEST_HEADER_WHITELIST.contains(&name)
        || (!redact && matches!(name, "authorization" | "cookie"))
}

fn retain_response_header(name: &str, redact: bool) -> bool {
    retain_request_header(name, redact)
        || name.starts_with("access-control-allow-")
        || name == "vary"
}

/// Lowercase keys and keep only whitelisted names. Repeated names keep the
/// last value; `Set-Cookie` never passes this filter.
fn filter_headers(
    pairs: &[(String, String)],
    retain: impl Fn(&str) -> bool,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in pairs {
        let lower = name.to_ascii_lowercase();
        if retain(&lower) {
            out.insert(lower, value.clone());
        }
    }
    out
}

fn raw_header_map(pairs: &[(String, String)]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in pairs {
        out.insert(name.to_ascii_lowercase(), value.clone());
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PreflightKey {
    host: String,
    path: String,
    method: String,
}

#[derive(Debug, Clone)]
struct PreflightRecord {
    ts: u64,
    origin: Option<String>,
}

#[derive(Debug, Default)]
struct RequestContext {
    request: CapturedRequest,
}

#[derive(Debug, Default)]
struct ResponseAccumulator {
    status: u16,
    status_text: String,
    headers: BTreeMap<String, String>,
    set_cookie_lines: Vec<String>,
    content_type: Option<String>,
    content_encoding: Option<String>,
    body: Vec<u8>,
    first_byte_ts: Option<u64>,
}

#[derive(Default)]
struct EngineState {
    requests: HashMap<String, RequestContext>,
    accumulators: HashMap<String, ResponseAccumulator>,
    preflights: HashMap<PreflightKey, PreflightRecord>,
}

pub struct CaptureEngine {
    sink: EventSink,
    body_sink: Option<BodySink>,
    options: EngineOptions,
    aggregator: Mutex<TransactionAggregator>,
    state: Mutex<EngineState>,
    detached: AtomicBool,
}

/// Disposer for an attached engine. Dropping the handle does not detach;
/// `detach()` must be called and is safe to call from any callback context,
/// including inside an event sink.
pub struct EngineHandle {
    host: Arc<dyn NavigationHost>,
    engine: Arc<CaptureEngine>,
    bridge: BridgeHandle,
}

impl EngineHandle {
    pub fn detach(&self) {
        if self.engine.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        self.host.uninstall();
        self.bridge.detach();

        let mut state = lock(&self.engine.state);
        state.requests.clear();
        state.accumulators.clear();
        state.preflights.clear();
        drop(state);
        lock(&self.engine.aggregator).reset();
        debug!("capture engine detached");
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

/// `(host-with-port, path, query-map)` split of a request URL. An URL the
/// parser rejects degrades to empty host and the raw string as path.
fn split_url(raw: &str) -> (String, String, BTreeMap<String, String>) {
    match Url::parse(raw) {
        Ok(url) => {
            let host = match (url.host_str(), url.port()) {
                (Some(h), Some(p)) => format!("{h}:{p}"),
                (Some(h), None) => h.to_string(),
                (None, _) => String::new(),
            };
            let query = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            (host, url.path().to_string(), query)
        }
        Err(_) => (String::new(), raw.to_string(), BTreeMap::new()),
    }
}

fn jwt_from_authorization(value: &str) -> Option<JwtInfo> {
    let token = value.strip_prefix("Bearer ").map(str::trim)?;
    if token.split('.').count() != 3 {
        return None;
    }
    let (header, payload) = util::decode_bearer_token(token);
    Some(JwtInfo {
        token: util::redact_bearer_token(token),
        header,
        payload,
    })
}

impl CaptureEngine {
    /// Install the engine on `host` and, when enabled, the diagnostic
    /// bridge. The returned handle is the sole cancellation surface.
    pub fn attach(
        host: Arc<dyn NavigationHost>,
        sink: EventSink,
        body_sink: Option<BodySink>,
        options: EngineOptions,
    ) -> Result<EngineHandle> {
        let engine = Arc::new(CaptureEngine {
            sink: sink.clone(),
            body_sink,
            options,
            aggregator: Mutex::new(TransactionAggregator::new()),
            state: Mutex::new(EngineState::default()),
            detached: AtomicBool::new(false),
        });
        let observer: Arc<dyn LifecycleObserver> = engine.clone();
        host.install(observer)?;
        if !host.supports_body_stream() {
            debug!("host exposes no body stream; responses will carry sizes only");
        }

        let bridge = if engine.options.enable_cdp {
            DiagnosticBridge::attach(host.diagnostic_channel(), sink)
        } else {
            BridgeHandle::noop()
        };

        Ok(EngineHandle {
            host,
            engine,
            bridge,
        })
    }

    fn emit(&self, event: CaptureEvent) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        emit_guarded(&self.sink, &event);
    }

    fn redacting(&self) -> bool {
        self.options.redact_secrets
    }

    fn body_preview(&self, body: &[u8], content_type: Option<&str>) -> Option<String> {
        let text = std::str::from_utf8(body).ok()?;
        let text = if self.redacting() {
            redact::redact_body_text(text, content_type)
        } else {
            text.to_string()
        };
        Some(preview_of(&text))
    }

    /// Drop expired pre-flight records; cheap because the map only ever
    /// holds in-flight OPTIONS probes.
    fn purge_preflights(state: &mut EngineState, now: u64) {
        state
            .preflights
            .retain(|_, rec| now.saturating_sub(rec.ts) <= PREFLIGHT_TTL_MS);
    }

    /// Persistence gate: every condition must hold, including a wired body
    /// sink, before a body reaches disk.
    fn maybe_persist(&self, id: &str, body: &[u8], content_type: Option<&str>) -> Option<SavedBody> {
        let sink = self.body_sink.as_ref()?;
        if !self.options.capture_bodies || body.is_empty() {
            return None;
        }
        if body.len() > self.options.capture_body_max_bytes {
            return None;
        }
        let ct = content_type?;
        if !self.options.capture_body_types.as_ref()?.is_match(ct) {
            return None;
        }
        match sink(id, body, content_type) {
            Ok(saved) => Some(saved),
            Err(err) => {
                warn!("body persistence failed for {id}: {err}");
                None
            }
        }
    }
}

impl LifecycleObserver for CaptureEngine {
    fn on_before_request(&self, ev: BeforeRequest) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let method = normalize_method(&ev.method).to_string();
        let (host, path, query) = split_url(&ev.url);
        let body_preview = ev
            .body
            .as_deref()
            .and_then(|b| self.body_preview(b, None));

        let request = CapturedRequest {
            id: ev.id.clone(),
            method: method.clone(),
            url: ev.url.clone(),
            host,
            path,
            query,
            headers: BTreeMap::new(),
            timing: Timing {
                start_ts: ev.ts,
                ..Default::default()
            },
            body: ev.body,
            body_preview: body_preview.clone(),
            cors: None,
            jwt: None,
        };

        lock(&self.state)
            .requests
            .insert(ev.id.clone(), RequestContext {
                request: request.clone(),
            });
        lock(&self.aggregator).on_request(request.clone());

        self.emit(CaptureEvent::Request(RequestEvent {
            ts: ev.ts,
            url: request.url,
            method,
            req_headers: BTreeMap::new(),
            req_body: body_preview,
        }));
    }

    fn on_before_send_headers(&self, ev: BeforeSendHeaders) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let raw = raw_header_map(&ev.headers);
        let redacting = self.redacting();
        let filtered = filter_headers(&ev.headers, |name| retain_request_header(name, redacting));
        let jwt = raw.get("authorization").and_then(|v| jwt_from_authorization(v));

        let event = {
            let mut state = lock(&self.state);
            Self::purge_preflights(&mut state, ev.ts);

            let ctx = state
                .requests
                .entry(ev.id.clone())
                .or_insert_with(|| synthetic_context(&ev.id));
            ctx.request.headers = filtered.clone();
            if let Some(jwt) = &jwt {
                ctx.request.jwt = Some(jwt.clone());
            }

            let host = ctx.request.host.clone();
            let path = ctx.request.path.clone();
            let method = ctx.request.method.clone();
            let event = RequestEvent {
                ts: ev.ts,
                url: ctx.request.url.clone(),
                method: method.clone(),
                req_headers: filtered,
                req_body: ctx.request.body_preview.clone(),
            };

            if method == "OPTIONS"
                && let Some(acrm) = raw.get("access-control-request-method")
            {
                state.preflights.insert(
                    PreflightKey {
                        host,
                        path,
                        method: acrm.to_ascii_uppercase(),
                    },
                    PreflightRecord {
                        ts: ev.ts,
                        origin: raw.get("origin").cloned(),
                    },
                );
            } else {
                let key = PreflightKey { host, path, method };
                if let Some(rec) = state.preflights.remove(&key)
                    && let Some(ctx) = state.requests.get_mut(&ev.id)
                {
                    ctx.request.cors = Some(CorsInfo {
                        preflight: true,
                        origin: rec.origin,
                    });
                }
            }

            event
        };

        {
            let mut agg = lock(&self.aggregator);
            if let Some(jwt) = jwt {
                agg.patch_request_token(&ev.id, jwt);
            }
            let state = lock(&self.state);
            if let Some(ctx) = state.requests.get(&ev.id) {
                agg.patch_request_meta(
                    &ev.id,
                    ctx.request.headers.clone(),
                    ctx.request.cors.clone(),
                );
            }
        }

        self.emit(CaptureEvent::BeforeSendHeaders(event));
    }

    fn on_headers_received(&self, ev: HeadersReceived) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let redacting = self.redacting();
        let filtered = filter_headers(&ev.headers, |name| retain_response_header(name, redacting));
        let raw = raw_header_map(&ev.headers);
        let set_cookie_lines: Vec<String> = ev
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, value)| value.clone())
            .collect();

        let mut state = lock(&self.state);
        state
            .requests
            .entry(ev.id.clone())
            .or_insert_with(|| synthetic_context(&ev.id));
        state.accumulators.insert(ev.id.clone(), ResponseAccumulator {
            status: ev.status,
            status_text: ev.status_text,
            headers: filtered,
            set_cookie_lines,
            content_type: raw.get("content-type").cloned(),
            content_encoding: raw.get("content-encoding").cloned(),
            body: Vec::new(),
            first_byte_ts: None,
        });
    }

    fn on_response_chunk(&self, id: &str, ts: u64, chunk: &[u8]) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let mut state = lock(&self.state);
        let acc = state.accumulators.entry(id.to_string()).or_default();
        if acc.first_byte_ts.is_none() {
            acc.first_byte_ts = Some(ts);
        }
        acc.body.extend_from_slice(chunk);
    }

    fn on_completed(&self, ev: Completed) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let (ctx, acc) = {
            let mut state = lock(&self.state);
            let ctx = state
                .requests
                .remove(&ev.id)
                .unwrap_or_else(|| synthetic_context(&ev.id));
            let acc = state.accumulators.remove(&ev.id).unwrap_or_default();
            (ctx, acc)
        };

        let decoded = match decode::decode_content(&acc.body, acc.content_encoding.as_deref()) {
            Some(bytes) => bytes,
            None => {
                debug!(
                    "content decoding failed for {} ({:?}); keeping raw bytes",
                    ev.id, acc.content_encoding
                );
                acc.body
            }
        };
        let body_size = decoded.len();
        let content_type = acc.content_type.clone();
        let body_preview = self.body_preview(&decoded, content_type.as_deref());

        // A token in the response body is worth surfacing; persistence and
        // previews must still honor redaction.
        let body_text = std::str::from_utf8(&decoded).ok();
        let jwt = body_text.and_then(|t| util::find_bearer_token(t)).map(|token| {
            let (header, payload) = util::decode_bearer_token(token);
            JwtInfo {
                token: util::redact_bearer_token(token),
                header,
                payload,
            }
        });

        let bytes_for_disk: std::borrow::Cow<'_, [u8]> = if self.redacting()
            && let Some(text) = body_text
            && util::find_bearer_token(text).is_some()
        {
            let redacted = util::bearer_tokens_redacted(text);
            std::borrow::Cow::Owned(redacted.into_bytes())
        } else {
            std::borrow::Cow::Borrowed(&decoded)
        };

        let saved = self.maybe_persist(&ev.id, &bytes_for_disk, content_type.as_deref());

        let set_cookies: Vec<_> = acc
            .set_cookie_lines
            .iter()
            .filter_map(|line| cookies::parse_set_cookie(line))
            .map(|c| {
                if self.redacting() {
                    redact::redact_set_cookie(&c)
                } else {
                    c
                }
            })
            .collect();
        let set_cookies = (!set_cookies.is_empty()).then_some(set_cookies);
        let cors_allow = cookies::extract_cors_allow(&acc.headers);

        let timing = Timing {
            start_ts: ctx.request.timing.start_ts,
            first_byte_ts: acc.first_byte_ts,
            end_ts: Some(ev.ts),
        };
        let timing_ms = ev.ts.saturating_sub(ctx.request.timing.start_ts);

        let response = CapturedResponse {
            id: ev.id.clone(),
            status: acc.status,
            status_text: acc.status_text.clone(),
            headers: acc.headers.clone(),
            content_type: content_type.clone(),
            body_size,
            body: Some(decoded),
            body_preview,
            timing,
            from_cache: Some(ev.from_cache),
            body_path: saved.as_ref().map(|s| s.path.clone()),
            cors_allow,
            set_cookies,
            jwt,
        };

        let txn = lock(&self.aggregator).on_response(response.clone());

        self.emit(CaptureEvent::Response(ResponseEvent {
            ts: ev.ts,
            url: ctx.request.url.clone(),
            method: ctx.request.method.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            res_headers: response.headers.clone(),
            body_size,
            timing_ms,
            content_type,
            set_cookies: response.set_cookies.clone(),
            body_path: response.body_path.clone(),
            req_body: ctx.request.body_preview.clone(),
        }));
        if let Some(txn) = txn {
            self.emit(CaptureEvent::Transaction(Box::new(txn)));
        }
    }

    fn on_error(&self, ev: ErrorOccurred) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let ctx = {
            let mut state = lock(&self.state);
            state.accumulators.remove(&ev.id);
            state
                .requests
                .remove(&ev.id)
                .unwrap_or_else(|| synthetic_context(&ev.id))
        };

        self.emit(CaptureEvent::Error(ErrorEvent {
            ts: ev.ts,
            url: ctx.request.url.clone(),
            method: ctx.request.method.clone(),
            req_headers: ctx.request.headers.clone(),
            error: Some(ev.error),
        }));
    }
}

/// Context for callbacks that arrived without a pre-request; the start
/// timestamp stays zeroed so nothing downstream mistakes it for a measured
/// value.
fn synthetic_context(id: &str) -> RequestContext {
    RequestContext {
        request: CapturedRequest {
            id: id.to_string(),
            method: "GET".to_string(),
            ..Default::default()
        },
    }
}
