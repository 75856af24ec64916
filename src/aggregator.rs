use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as JsonValue;

use crate::events::{CapturedRequest, CapturedResponse, CapturedTransaction, CorsInfo, JwtInfo};

/// In-memory correlator keyed by request id. Transactions are held open
/// until their response (or terminal error) arrives; the ordered list
/// reflects request-creation order and is never reordered.
#[derive(Debug, Default)]
pub struct TransactionAggregator {
    index: HashMap<String, usize>,
    ordered: Vec<CapturedTransaction>,
}

fn uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-4[0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}",
        )
        .expect("static regex")
    })
}

fn long_digits_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{8,}").expect("static regex"))
}

fn iso_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}(?:T\d{2}:\d{2}(?::\d{2})?(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)?")
            .expect("static regex")
    })
}

fn digits_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"))
}

/// Collapse the volatile segments of a path so related requests group under
/// one key: UUIDs become `:uuid`, runs of 8+ digits `:long`, ISO-8601-like
/// dates `:date`, and remaining digit runs `:id`. Idempotent.
pub fn compute_route_key(path: &str) -> String {
    let s = uuid_regex().replace_all(path, ":uuid");
    let s = long_digits_regex().replace_all(&s, ":long");
    let s = iso_date_regex().replace_all(&s, ":date");
    let s = digits_regex().replace_all(&s, ":id");
    s.into_owned()
}

/// Pull an operation-name suffix out of a JSON RPC body: a string
/// `operationName` wins; otherwise a persisted-query hash contributes its
/// first 8 hex characters.
fn rpc_suffix(body_text: &str) -> Option<String> {
    let value: JsonValue = serde_json::from_str(body_text).ok()?;
    let obj = value.as_object()?;
    if let Some(name) = obj.get("operationName").and_then(|v| v.as_str())
        && !name.is_empty()
    {
        return Some(format!("#{name}"));
    }
    let hash = obj
        .get("extensions")?
        .get("persistedQuery")?
        .get("sha256Hash")?
        .as_str()?;
    if hash.len() < 8 {
        return None;
    }
    Some(format!("#persisted:{}", &hash[..8]))
}

fn looks_like_json_rpc(req: &CapturedRequest) -> bool {
    match req.headers.get("content-type") {
        Some(ct) => ct.contains("json"),
        // Headers may not have arrived yet when the request is registered;
        // fall back to sniffing the body shape.
        None => req
            .body_preview
            .as_deref()
            .is_some_and(|b| b.trim_start().starts_with('{')),
    }
}

impl TransactionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction for `req` and return a copy of it. The route key
    /// is `host + normalized path`, with an RPC operation suffix when the
    /// body carries one.
    pub fn on_request(&mut self, req: CapturedRequest) -> CapturedTransaction {
        let mut route_key = format!("{}{}", req.host, compute_route_key(&req.path));
        if looks_like_json_rpc(&req)
            && let Some(body) = req.body_preview.as_deref()
            && let Some(suffix) = rpc_suffix(body)
        {
            route_key.push_str(&suffix);
        }

        let query_string = req
            .url
            .split_once('?')
            .map(|(_, q)| q.to_string())
            .unwrap_or_default();

        let txn = CapturedTransaction {
            id: req.id.clone(),
            method: req.method.clone(),
            host: req.host.clone(),
            path: req.path.clone(),
            route_key,
            query_string,
            duration_ms: None,
            ttfb_ms: None,
            receive_ms: None,
            request: req,
            response: None,
        };

        self.index.insert(txn.id.clone(), self.ordered.len());
        self.ordered.push(txn.clone());
        txn
    }

    /// Attach bearer-token info to an open transaction's request; a missing
    /// id or an already-patched request is a no-op.
    pub fn patch_request_token(&mut self, id: &str, jwt: JwtInfo) {
        if let Some(&pos) = self.index.get(id)
            && let Some(txn) = self.ordered.get_mut(pos)
            && txn.request.jwt.is_none()
        {
            txn.request.jwt = Some(jwt);
        }
    }

    /// Refresh an open transaction's request with the header map and CORS
    /// verdict that only become known at the before-send-headers callback.
    pub fn patch_request_meta(
        &mut self,
        id: &str,
        headers: std::collections::BTreeMap<String, String>,
        cors: Option<CorsInfo>,
    ) {
        if let Some(&pos) = self.index.get(id)
            && let Some(txn) = self.ordered.get_mut(pos)
        {
            txn.request.headers = headers;
            if cors.is_some() {
                txn.request.cors = cors;
            }
        }
    }

    /// Attach `resp` to its transaction and derive durations. A response
    /// with no open transaction (late or duplicate) is silently dropped.
    pub fn on_response(&mut self, resp: CapturedResponse) -> Option<CapturedTransaction> {
        let &pos = self.index.get(&resp.id)?;
        let txn = self.ordered.get_mut(pos)?;

        let start = resp.timing.start_ts;
        if let Some(end) = resp.timing.end_ts {
            let duration = end.saturating_sub(start);
            txn.duration_ms = Some(duration);
            if let Some(first) = resp.timing.first_byte_ts {
                let ttfb = first.saturating_sub(start);
                txn.ttfb_ms = Some(ttfb);
                txn.receive_ms = Some(duration.saturating_sub(ttfb));
            }
        }
        txn.response = Some(resp);
        Some(txn.clone())
    }

    /// Clear all state; called at session boundaries.
    pub fn reset(&mut self) {
        self.index.clear();
        self.ordered.clear();
    }

    pub fn ordered(&self) -> &[CapturedTransaction] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
