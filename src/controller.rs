use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::CaptureConfig;
use crate::engine::{BodySink, CaptureEngine, EngineHandle, NavigationHost};
use crate::events::{
    CaptureEvent, CapturedTransaction, Envelope, EventSink, RequestEvent, ResponseEvent,
    is_known_channel,
};
use crate::recorder::{CaptureRecorder, SavedBody};

/// Ships `(channel, payload)` pairs to the inspector UI; supplied by the
/// embedding application.
pub type InspectorSink = Arc<dyn Fn(&str, &JsonValue) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureState {
    pub capturing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
}

/// Tagged result of a user-visible control operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub state: CaptureState,
}

struct ActiveCapture {
    recorder: Arc<CaptureRecorder>,
    engine: EngineHandle,
}

/// Wires the capture pipeline together for one session at a time: on
/// `start` the engine's event sink fans out to the session recorder and the
/// inspector broadcast; `stop` detaches every hook and flushes artifacts.
pub struct SessionController {
    config: CaptureConfig,
    inspector: InspectorSink,
    active: Mutex<Option<ActiveCapture>>,
    state_tx: watch::Sender<CaptureState>,
}

fn lock_active<'a>(
    m: &'a Mutex<Option<ActiveCapture>>,
) -> std::sync::MutexGuard<'a, Option<ActiveCapture>> {
    match m.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

impl SessionController {
    pub fn new(config: CaptureConfig, inspector: InspectorSink) -> Self {
        let (state_tx, _) = watch::channel(CaptureState::default());
        SessionController {
            config,
            inspector,
            active: Mutex::new(None),
            state_tx,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state_tx.borrow().clone()
    }

    /// Push channel for state changes; every `start`/`stop` broadcasts.
    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state_tx.subscribe()
    }

    fn broadcast(&self, state: CaptureState) {
        let _ = self.state_tx.send(state);
    }

    fn reply_ok(&self) -> ControlReply {
        ControlReply {
            ok: true,
            reason: None,
            state: self.state(),
        }
    }

    fn reply_err(&self, reason: &str) -> ControlReply {
        ControlReply {
            ok: false,
            reason: Some(reason.to_string()),
            state: self.state(),
        }
    }

    /// Begin capturing on `host`. Starting while already capturing returns
    /// the current state unchanged.
    pub fn start(&self, host: Arc<dyn NavigationHost>) -> ControlReply {
        let mut active = lock_active(&self.active);
        if active.is_some() {
            return self.reply_ok();
        }

        let recorder = match CaptureRecorder::create(
            &self.config.output_folder,
            &self.config.target_url,
            self.config.redact_secrets,
        ) {
            Ok(r) => Arc::new(r),
            Err(err) => {
                warn!("failed to create capture session: {err:#}");
                return self.reply_err("archive-create-failed");
            }
        };
        if let Err(err) = recorder.start_ndjson(None) {
            warn!("transaction stream unavailable for this session: {err:#}");
        }

        let sink = fanout_sink(recorder.clone(), self.inspector.clone());
        let body_recorder = recorder.clone();
        let body_sink: BodySink =
            Arc::new(move |id, bytes, content_type| body_recorder.save_body(id, bytes, content_type));

        let engine = match CaptureEngine::attach(
            host,
            sink,
            Some(body_sink),
            self.config.engine_options(),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                warn!("failed to attach capture engine: {err:#}");
                recorder.stop();
                return self.reply_err("host-attach-failed");
            }
        };

        let state = CaptureState {
            capturing: true,
            session_dir: Some(recorder.base_dir().to_string_lossy().into_owned()),
            started_at_ms: Some(crate::util::now_ms()),
        };
        info!("capture started, archiving to {:?}", recorder.base_dir());
        *active = Some(ActiveCapture { recorder, engine });
        drop(active);

        self.broadcast(state);
        self.reply_ok()
    }

    /// Detach every hook, flush the archives, and broadcast the idle state.
    pub fn stop(&self) -> ControlReply {
        let mut active = lock_active(&self.active);
        let Some(capture) = active.take() else {
            drop(active);
            return self.reply_err("not-running");
        };
        drop(active);

        capture.engine.detach();
        capture.recorder.stop_ndjson();
        capture.recorder.stop();
        info!("capture stopped");

        self.broadcast(CaptureState::default());
        self.reply_ok()
    }

    /// Route a guest-originated event envelope: known channels reach the
    /// recorder, everything is forwarded to the inspector.
    pub fn deliver_envelope(&self, envelope: &Envelope) -> ControlReply {
        let recorder = lock_active(&self.active)
            .as_ref()
            .map(|a| a.recorder.clone());

        if let Some(recorder) = recorder
            && is_known_channel(&envelope.channel)
        {
            route_to_recorder(&recorder, envelope);
        }
        (self.inspector)(&envelope.channel, &envelope.payload);
        self.reply_ok()
    }
}

fn route_to_recorder(recorder: &CaptureRecorder, envelope: &Envelope) {
    match envelope.channel.as_str() {
        "ws:open" | "ws:msg" | "ws:close" | "ws:error" | "ws:frame" => {
            let kind = envelope.channel.trim_start_matches("ws:");
            recorder.on_ws(kind, &envelope.payload);
        }
        "rest:request" | "rest:before-send-headers" => {
            match serde_json::from_value::<RequestEvent>(envelope.payload.clone()) {
                Ok(ev) => recorder.on_rest_request(&ev),
                Err(err) => warn!("unparseable {} envelope: {err}", envelope.channel),
            }
        }
        "rest:response" => {
            match serde_json::from_value::<ResponseEvent>(envelope.payload.clone()) {
                Ok(ev) => recorder.on_rest_response(&ev),
                Err(err) => warn!("unparseable rest:response envelope: {err}"),
            }
        }
        "rest:txn" => {
            match serde_json::from_value::<CapturedTransaction>(envelope.payload.clone()) {
                Ok(txn) => recorder.push_txn_ndjson(&txn),
                Err(err) => warn!("unparseable rest:txn envelope: {err}"),
            }
        }
        // rest:error and cdp:initiator have no archive representation.
        _ => {}
    }
}

/// The engine's sink: REST events feed the session recorder, and every
/// event is rendered for the inspector broadcast.
fn fanout_sink(recorder: Arc<CaptureRecorder>, inspector: InspectorSink) -> EventSink {
    Arc::new(move |event: &CaptureEvent| {
        match event {
            CaptureEvent::Request(req) | CaptureEvent::BeforeSendHeaders(req) => {
                recorder.on_rest_request(req);
            }
            CaptureEvent::Response(resp) => {
                if let Some(path) = &resp.body_path {
                    recorder.note_response_body(
                        &resp.method,
                        &resp.url,
                        SavedBody {
                            path: path.clone(),
                            size: resp.body_size,
                            content_type: resp.content_type.clone(),
                        },
                    );
                }
                recorder.on_rest_response(resp);
            }
            CaptureEvent::Transaction(txn) => recorder.push_txn_ndjson(txn),
            CaptureEvent::WsFrame(_) => {
                recorder.on_ws("frame", &event.payload_json());
            }
            CaptureEvent::Error(_) | CaptureEvent::Initiator(_) => {}
        }
        inspector(event.channel(), &event.payload_json());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use crate::engine::{
        BeforeRequest, BeforeSendHeaders, Completed, HeadersReceived, LifecycleObserver,
    };

    struct TestHost {
        observer: StdMutex<Option<Arc<dyn LifecycleObserver>>>,
        uninstalls: AtomicUsize,
    }

    impl TestHost {
        fn new() -> Arc<Self> {
            Arc::new(TestHost {
                observer: StdMutex::new(None),
                uninstalls: AtomicUsize::new(0),
            })
        }

        fn drive_transaction(&self, id: &str, url: &str, start: u64) {
            let Some(obs) = self.observer.lock().expect("lock").clone() else {
                return;
            };
            obs.on_before_request(BeforeRequest {
                id: id.into(),
                ts: start,
                method: "GET".into(),
                url: url.into(),
                body: None,
            });
            obs.on_before_send_headers(BeforeSendHeaders {
                id: id.into(),
                ts: start + 5,
                headers: vec![("Accept".into(), "*/*".into())],
            });
            obs.on_headers_received(HeadersReceived {
                id: id.into(),
                ts: start + 20,
                status: 200,
                status_text: "OK".into(),
                headers: vec![("Content-Type".into(), "text/plain".into())],
            });
            obs.on_response_chunk(id, start + 25, b"hello");
            obs.on_completed(Completed {
                id: id.into(),
                ts: start + 50,
                from_cache: false,
            });
        }
    }

    impl NavigationHost for TestHost {
        fn install(&self, observer: Arc<dyn LifecycleObserver>) -> anyhow::Result<()> {
            *self.observer.lock().expect("lock") = Some(observer);
            Ok(())
        }

        fn uninstall(&self) {
            self.uninstalls.fetch_add(1, Ordering::SeqCst);
            *self.observer.lock().expect("lock") = None;
        }
    }

    fn test_controller(dir: &std::path::Path) -> (SessionController, Arc<StdMutex<Vec<String>>>) {
        let seen: Arc<StdMutex<Vec<String>>> = Arc::default();
        let seen_inner = seen.clone();
        let inspector: InspectorSink = Arc::new(move |channel, _payload| {
            seen_inner.lock().expect("lock").push(channel.to_string());
        });

        let config = CaptureConfig {
            output_folder: dir.to_path_buf(),
            redact_secrets: false,
            enable_cdp: false,
            ..Default::default()
        };
        (SessionController::new(config, inspector), seen)
    }

    fn session_dir(controller: &SessionController) -> std::path::PathBuf {
        std::path::PathBuf::from(controller.state().session_dir.expect("session dir"))
    }

    #[test]
    fn stop_without_start_returns_not_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (controller, _) = test_controller(dir.path());

        let reply = controller.stop();
        assert!(!reply.ok);
        assert_eq!(reply.reason.as_deref(), Some("not-running"));
    }

    #[test]
    fn start_is_idempotent_while_capturing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (controller, _) = test_controller(dir.path());
        let host = TestHost::new();

        let first = controller.start(host.clone());
        assert!(first.ok);
        assert!(first.state.capturing);
        let first_dir = first.state.session_dir.clone();

        let second = controller.start(host.clone());
        assert!(second.ok);
        assert_eq!(second.state.session_dir, first_dir, "no second session spawned");

        controller.stop();
    }

    #[test]
    fn graceful_shutdown_flushes_archives_and_silences_hooks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (controller, seen) = test_controller(dir.path());
        let host = TestHost::new();

        assert!(controller.start(host.clone()).ok);
        let base = session_dir(&controller);

        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            host.drive_transaction(id, "https://a.test/page", 1_000 + (i as u64) * 100);
        }
        for i in 0..5 {
            controller.deliver_envelope(&Envelope {
                channel: "ws:msg".to_string(),
                payload: serde_json::json!({"ts": i, "id": "ws1", "data": "x"}),
            });
        }

        let reply = controller.stop();
        assert!(reply.ok);
        assert!(!reply.state.capturing);

        // Archive contents match what was emitted.
        let har_path = std::fs::read_dir(&base)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().is_some_and(|e| e == "har"))
            .expect("har file");
        let har: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(&har_path).expect("har")).expect("json");
        assert_eq!(har["log"]["entries"].as_array().expect("entries").len(), 3);

        let ws_path = std::fs::read_dir(&base)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.to_string_lossy().ends_with(".wslog.ndjson"))
            .expect("ws log");
        let ws_text = std::fs::read_to_string(&ws_path).expect("ws text");
        assert_eq!(ws_text.lines().count(), 5);
        for line in ws_text.lines() {
            let parsed: JsonValue = serde_json::from_str(line).expect("line parses");
            assert_eq!(parsed["type"], "msg");
        }

        // Hooks are gone: further host callbacks emit nothing new.
        let before = seen.lock().expect("lock").len();
        host.drive_transaction("late", "https://a.test/late", 9_000);
        assert_eq!(seen.lock().expect("lock").len(), before);
        assert_eq!(host.uninstalls.load(Ordering::SeqCst), 1);

        let reply = controller.stop();
        assert_eq!(reply.reason.as_deref(), Some("not-running"));
    }

    #[test]
    fn events_fan_out_to_inspector_in_lifecycle_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (controller, seen) = test_controller(dir.path());
        let host = TestHost::new();

        controller.start(host.clone());
        host.drive_transaction("a", "https://a.test/x", 1_000);
        controller.stop();

        let channels = seen.lock().expect("lock").clone();
        assert_eq!(
            channels,
            vec![
                "rest:request",
                "rest:before-send-headers",
                "rest:response",
                "rest:txn"
            ]
        );
    }

    #[test]
    fn transactions_stream_to_ndjson() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (controller, _) = test_controller(dir.path());
        let host = TestHost::new();

        controller.start(host.clone());
        let base = session_dir(&controller);
        host.drive_transaction("a", "https://a.test/x", 1_000);
        host.drive_transaction("b", "https://a.test/y", 2_000);
        controller.stop();

        let txn_path = std::fs::read_dir(&base)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.file_name().is_some_and(|n| n.to_string_lossy().starts_with("txns-")))
            .expect("txn stream");
        let text = std::fs::read_to_string(txn_path).expect("text");
        let lines: Vec<JsonValue> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("parses"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], "a");
        assert_eq!(lines[0]["durationMs"], 50);
        assert_eq!(lines[1]["id"], "b");
    }

    #[test]
    fn unknown_envelopes_reach_inspector_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (controller, seen) = test_controller(dir.path());
        let host = TestHost::new();

        controller.start(host.clone());
        controller.deliver_envelope(&Envelope {
            channel: "inspector:ping".to_string(),
            payload: serde_json::json!({"x": 1}),
        });
        let reply = controller.stop();
        assert!(reply.ok);

        assert_eq!(
            seen.lock().expect("lock").as_slice(),
            ["inspector:ping"],
            "forwarded, but nowhere else"
        );
    }

    #[test]
    fn state_subscription_sees_start_and_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (controller, _) = test_controller(dir.path());
        let host = TestHost::new();

        let rx = controller.subscribe();
        assert!(!rx.borrow().capturing);

        controller.start(host.clone());
        assert!(rx.borrow().capturing);
        assert!(rx.borrow().session_dir.is_some());

        controller.stop();
        assert!(!rx.borrow().capturing);
    }

    #[test]
    fn guest_rest_envelopes_land_in_the_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (controller, _) = test_controller(dir.path());
        let host = TestHost::new();

        controller.start(host.clone());
        let base = session_dir(&controller);

        controller.deliver_envelope(&Envelope {
            channel: "rest:request".to_string(),
            payload: serde_json::json!({
                "ts": 1_000, "url": "https://guest.test/api", "method": "GET",
                "reqHeaders": {"accept": "*/*"}
            }),
        });
        controller.deliver_envelope(&Envelope {
            channel: "rest:response".to_string(),
            payload: serde_json::json!({
                "ts": 1_080, "url": "https://guest.test/api", "method": "GET",
                "status": 201, "statusText": "Created", "bodySize": 2, "timingMs": 80
            }),
        });
        controller.stop();

        let har_path = std::fs::read_dir(&base)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().is_some_and(|e| e == "har"))
            .expect("har file");
        let har: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(&har_path).expect("har")).expect("json");
        let entry = &har["log"]["entries"][0];
        assert_eq!(entry["response"]["status"], 201);
        assert_eq!(entry["request"]["url"], "https://guest.test/api");
    }
}
