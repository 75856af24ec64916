use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use url::Url;

use crate::events::{CapturedTransaction, RequestEvent, ResponseEvent};
use crate::har::{self, Har};
use crate::redact;
use crate::util;

/// Descriptor of one persisted response body, held until the matching
/// response entry is written.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedBody {
    pub path: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    ts: u64,
    headers: std::collections::BTreeMap<String, String>,
    body_preview: Option<String>,
}

#[derive(Default)]
struct RecorderInner {
    har: Option<Har>,
    ws_stream: Option<File>,
    txn_stream: Option<File>,
    pending: HashMap<(String, String), PendingRequest>,
    saved: HashMap<(String, String), SavedBody>,
    ws_lines: u64,
    stopped: bool,
}

/// Owns one capture session's on-disk artifacts: the HAR archive for REST
/// transactions, the WebSocket NDJSON stream, an optional aggregated
/// transaction stream, and the saved-bodies directory.
pub struct CaptureRecorder {
    base_dir: PathBuf,
    bodies_dir: PathBuf,
    har_path: PathBuf,
    slug: String,
    redact: bool,
    inner: Mutex<RecorderInner>,
}

fn lock_inner<'a>(m: &'a Mutex<RecorderInner>) -> std::sync::MutexGuard<'a, RecorderInner> {
    match m.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

impl CaptureRecorder {
    /// Create the session's timestamped directory tree under
    /// `output_folder` and open the WebSocket append stream.
    pub fn create(output_folder: &Path, title: &str, redact: bool) -> Result<Self> {
        let slug = util::timestamp_slug();
        let base_dir = output_folder.join(format!("capture-{slug}"));
        let bodies_dir = base_dir.join(format!("bodies-{slug}"));
        util::ensure_directory(&bodies_dir)?;

        let har_path = base_dir.join(format!("rest-{slug}.har"));
        let ws_path = base_dir.join(format!("ws-{slug}.wslog.ndjson"));
        let ws_stream = util::open_append_stream(&ws_path)?;

        Ok(CaptureRecorder {
            base_dir,
            bodies_dir,
            har_path,
            slug,
            redact,
            inner: Mutex::new(RecorderInner {
                har: Some(Har::new(title, util::now_ms())),
                ws_stream: Some(ws_stream),
                ..Default::default()
            }),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn har_path(&self) -> &Path {
        &self.har_path
    }

    /// Remember a request for pairing with its response. Only the most
    /// recent request per `(method, url)` is kept, so retries overwrite.
    pub fn on_rest_request(&self, ev: &RequestEvent) {
        let mut inner = lock_inner(&self.inner);
        if inner.stopped {
            return;
        }
        inner.pending.insert(
            (ev.method.clone(), ev.url.clone()),
            PendingRequest {
                ts: ev.ts,
                headers: ev.req_headers.clone(),
                body_preview: ev.req_body.clone(),
            },
        );
    }

    /// Write `bytes` under the session's bodies directory and return the
    /// descriptor. IO errors propagate; the caller must not attach the
    /// descriptor on failure.
    pub fn save_body(
        &self,
        id_hint: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<SavedBody> {
        let name = format!(
            "{}_{}.bin",
            util::now_ms(),
            util::sanitize_file_component(id_hint)
        );
        let path = self.bodies_dir.join(name);
        fs::write(&path, bytes).with_context(|| format!("failed to save body {:?}", path))?;
        Ok(SavedBody {
            path: path.to_string_lossy().into_owned(),
            size: bytes.len(),
            content_type: content_type.map(|s| s.to_string()),
        })
    }

    /// Record a descriptor to be attached to the next matching response
    /// entry.
    pub fn note_response_body(&self, method: &str, url: &str, saved: SavedBody) {
        let mut inner = lock_inner(&self.inner);
        inner
            .saved
            .insert((method.to_string(), url.to_string()), saved);
    }

    /// Append one HAR entry for a completed response. An unmatched response
    /// (no remembered request) is still archived, with its start derived
    /// from `endTs - timingMs`.
    pub fn on_rest_response(&self, ev: &ResponseEvent) {
        let mut inner = lock_inner(&self.inner);
        if inner.stopped {
            return;
        }
        let key = (ev.method.clone(), ev.url.clone());
        let pending = inner.pending.remove(&key);
        let saved = inner.saved.remove(&key);

        let entry = self.build_entry(ev, pending, saved);
        if let Some(har) = inner.har.as_mut() {
            har.log.entries.push(entry);
        }
    }

    fn build_entry(
        &self,
        ev: &ResponseEvent,
        pending: Option<PendingRequest>,
        saved: Option<SavedBody>,
    ) -> har::Entry {
        let started_ms = pending
            .as_ref()
            .map(|p| p.ts)
            .unwrap_or_else(|| ev.ts.saturating_sub(ev.timing_ms));

        let req_headers = pending
            .as_ref()
            .map(|p| {
                if self.redact {
                    redact::redact_headers(&p.headers)
                } else {
                    p.headers.clone()
                }
            })
            .unwrap_or_default();

        let post_data = pending.as_ref().and_then(|p| p.body_preview.as_deref()).map(|body| {
            let mime = req_headers
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| "text/plain".to_string());
            let text = if self.redact {
                redact::redact_body_text(body, Some(&mime))
            } else {
                body.to_string()
            };
            har::PostData { mime_type: mime, text }
        });

        let query_string = Url::parse(&ev.url)
            .map(|u| {
                u.query_pairs()
                    .map(|(k, v)| har::NameValue {
                        name: k.into_owned(),
                        value: v.into_owned(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let res_headers = if self.redact {
            redact::redact_headers(&ev.res_headers)
        } else {
            ev.res_headers.clone()
        };

        let cookies = ev
            .set_cookies
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|c| har::NameValue {
                name: c.name.clone(),
                value: c.value.clone(),
            })
            .collect();

        let file = saved.and_then(|s| {
            Path::new(&s.path)
                .strip_prefix(&self.base_dir)
                .map(|rel| rel.to_string_lossy().into_owned())
                .ok()
        });

        har::Entry {
            pageref: "page_1".to_string(),
            started_date_time: har::iso_date_time(started_ms),
            time: ev.timing_ms,
            request: har::Request {
                method: ev.method.clone(),
                url: ev.url.clone(),
                http_version: har::HTTP_VERSION.to_string(),
                cookies: Vec::new(),
                headers: to_name_values(&req_headers),
                query_string,
                headers_size: -1,
                body_size: post_data.as_ref().map(|p| p.text.len() as i64).unwrap_or(0),
                post_data,
            },
            response: har::Response {
                status: ev.status,
                status_text: ev.status_text.clone(),
                http_version: har::HTTP_VERSION.to_string(),
                cookies,
                headers: to_name_values(&res_headers),
                content: har::Content {
                    size: ev.body_size as i64,
                    mime_type: ev.content_type.clone().unwrap_or_default(),
                    text: None,
                    file,
                },
                redirect_url: String::new(),
                headers_size: -1,
                body_size: ev.body_size as i64,
                redacted: self.redact.then_some(true),
            },
            cache: har::Cache::default(),
            timings: har::Timings {
                send: 0,
                wait: ev.timing_ms as i64,
                receive: 0,
            },
        }
    }

    /// Append one `{type, ...payload}` line to the WebSocket NDJSON stream.
    /// Failures are swallowed and logged; WS capture must never stall the
    /// pipeline.
    pub fn on_ws(&self, kind: &str, payload: &JsonValue) {
        let mut line = match payload {
            JsonValue::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                if !other.is_null() {
                    map.insert("payload".to_string(), other.clone());
                }
                map
            }
        };
        line.insert("type".to_string(), JsonValue::String(kind.to_string()));

        let mut inner = lock_inner(&self.inner);
        if let Some(stream) = inner.ws_stream.as_mut() {
            match util::write_json_line(stream, &line) {
                Ok(()) => inner.ws_lines += 1,
                Err(err) => warn!("failed to append ws event: {err}"),
            }
        }
    }

    pub fn ws_line_count(&self) -> u64 {
        lock_inner(&self.inner).ws_lines
    }

    /// Open the aggregated-transactions stream. With `path` unset the
    /// stream lives next to the other artifacts.
    pub fn start_ndjson(&self, path: Option<&Path>) -> Result<()> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_dir.join(format!("txns-{}.ndjson", self.slug)));
        let stream = util::open_append_stream(&path)?;
        lock_inner(&self.inner).txn_stream = Some(stream);
        Ok(())
    }

    /// Append one aggregated transaction; a silent no-op while no stream is
    /// open.
    pub fn push_txn_ndjson(&self, txn: &CapturedTransaction) {
        let mut inner = lock_inner(&self.inner);
        if let Some(stream) = inner.txn_stream.as_mut()
            && let Err(err) = util::write_json_line(stream, txn)
        {
            warn!("failed to append transaction: {err}");
        }
    }

    pub fn stop_ndjson(&self) {
        lock_inner(&self.inner).txn_stream = None;
    }

    pub fn har_entry_count(&self) -> usize {
        lock_inner(&self.inner)
            .har
            .as_ref()
            .map(|h| h.log.entries.len())
            .unwrap_or(0)
    }

    /// Flush the HAR archive and close every stream. Each step is guarded
    /// independently; calling `stop` twice is a no-op.
    pub fn stop(&self) {
        let mut inner = lock_inner(&self.inner);
        if inner.stopped {
            return;
        }
        inner.stopped = true;

        if let Some(har) = inner.har.take() {
            match serde_json::to_string_pretty(&har) {
                Ok(text) => {
                    if let Err(err) = fs::write(&self.har_path, text) {
                        warn!("failed to write HAR archive {:?}: {err}", self.har_path);
                    }
                }
                Err(err) => warn!("failed to serialize HAR archive: {err}"),
            }
        }
        inner.ws_stream = None;
        inner.txn_stream = None;
        inner.pending.clear();
        inner.saved.clear();
        debug!("capture session {} stopped", self.slug);
    }
}

fn to_name_values(map: &std::collections::BTreeMap<String, String>) -> Vec<har::NameValue> {
    map.iter()
        .map(|(name, value)| har::NameValue {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}
