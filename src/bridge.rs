//! Optional attachment to the navigation host's debugger-style channel.
//! The bridge recovers metadata the primary lifecycle callbacks cannot
//! observe (initiator, redirect chain, WebSocket frame payloads) and is
//! strictly additive: losing it degrades observability but never touches
//! REST capture.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, warn};

use crate::events::{
    CaptureEvent, EventSink, Initiator, InitiatorEvent, RedirectHop, WsFrameEvent, emit_guarded,
};

/// The host's out-of-band debugging channel, as the bridge sees it.
pub trait DiagnosticChannel: Send + Sync {
    /// Subscribe the observer. Fails when the channel is already claimed by
    /// another consumer or the protocol versions do not match.
    fn subscribe(&self, observer: Arc<dyn DiagnosticObserver>) -> Result<()>;
    fn unsubscribe(&self);
}

pub trait DiagnosticObserver: Send + Sync {
    fn on_message(&self, msg: DiagnosticMessage);
}

/// The four message kinds the bridge consumes.
#[derive(Debug, Clone)]
pub enum DiagnosticMessage {
    RequestWillBeSent {
        request_id: String,
        url: String,
        /// Status of the redirect response when this send is a redirect hop.
        redirect_status: Option<u16>,
        initiator: Option<Initiator>,
    },
    WebSocketCreated {
        request_id: String,
        url: String,
    },
    WebSocketFrameSent {
        request_id: String,
        ts: u64,
        op_code: Option<u8>,
        data: Option<String>,
    },
    WebSocketFrameReceived {
        request_id: String,
        ts: u64,
        op_code: Option<u8>,
        data: Option<String>,
    },
}

#[derive(Debug, Clone, Default)]
struct CdpRequestInfo {
    url: String,
    redirect_chain: Vec<RedirectHop>,
    initiator: Option<Initiator>,
}

#[derive(Default)]
struct BridgeState {
    requests: HashMap<String, CdpRequestInfo>,
    ws_urls: HashMap<String, String>,
}

pub struct DiagnosticBridge {
    sink: EventSink,
    state: Mutex<BridgeState>,
    detached: AtomicBool,
}

/// Handle returned by [`DiagnosticBridge::attach`]. A failed or skipped
/// attach yields a no-op handle so callers can detach unconditionally.
pub struct BridgeHandle {
    channel: Option<Arc<dyn DiagnosticChannel>>,
    bridge: Option<Arc<DiagnosticBridge>>,
}

impl BridgeHandle {
    pub fn noop() -> Self {
        BridgeHandle {
            channel: None,
            bridge: None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.bridge.is_some()
    }

    /// Unsubscribe and drop all bridge state. Idempotent.
    pub fn detach(&self) {
        let Some(bridge) = &self.bridge else {
            return;
        };
        if bridge.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = &self.channel {
            channel.unsubscribe();
        }
        let mut state = lock_state(&bridge.state);
        state.requests.clear();
        state.ws_urls.clear();
    }
}

fn lock_state<'a>(m: &'a Mutex<BridgeState>) -> std::sync::MutexGuard<'a, BridgeState> {
    match m.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

impl DiagnosticBridge {
    /// Subscribe to `channel` and emit `cdp:initiator` / `ws:frame` events
    /// into `sink`. When the channel is absent or refuses the subscription,
    /// capture continues without bridge events.
    pub fn attach(channel: Option<Arc<dyn DiagnosticChannel>>, sink: EventSink) -> BridgeHandle {
        let Some(channel) = channel else {
            debug!("no diagnostic channel exposed; bridge skipped");
            return BridgeHandle::noop();
        };
        let bridge = Arc::new(DiagnosticBridge {
            sink,
            state: Mutex::new(BridgeState::default()),
            detached: AtomicBool::new(false),
        });
        match channel.subscribe(bridge.clone()) {
            Ok(()) => BridgeHandle {
                channel: Some(channel),
                bridge: Some(bridge),
            },
            Err(err) => {
                warn!("diagnostic channel attach failed, continuing without it: {err}");
                BridgeHandle::noop()
            }
        }
    }

    fn emit(&self, event: CaptureEvent) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        emit_guarded(&self.sink, &event);
    }
}

impl DiagnosticObserver for DiagnosticBridge {
    fn on_message(&self, msg: DiagnosticMessage) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        match msg {
            DiagnosticMessage::RequestWillBeSent {
                request_id,
                url,
                redirect_status,
                initiator,
            } => {
                let event = {
                    let mut state = lock_state(&self.state);
                    let info = state.requests.entry(request_id.clone()).or_default();
                    if let Some(status) = redirect_status
                        && !info.url.is_empty()
                    {
                        info.redirect_chain.push(RedirectHop {
                            from: info.url.clone(),
                            to: url.clone(),
                            status,
                        });
                    }
                    info.url = url;
                    if initiator.is_some() {
                        info.initiator = initiator;
                    }
                    InitiatorEvent {
                        request_id,
                        url: info.url.clone(),
                        redirect_chain: info.redirect_chain.clone(),
                        initiator: info.initiator.clone(),
                    }
                };
                self.emit(CaptureEvent::Initiator(event));
            }
            DiagnosticMessage::WebSocketCreated { request_id, url } => {
                lock_state(&self.state).ws_urls.insert(request_id, url);
            }
            DiagnosticMessage::WebSocketFrameSent {
                request_id,
                ts,
                op_code,
                data,
            } => self.emit_frame(&request_id, ts, "out", op_code, data),
            DiagnosticMessage::WebSocketFrameReceived {
                request_id,
                ts,
                op_code,
                data,
            } => self.emit_frame(&request_id, ts, "in", op_code, data),
        }
    }
}

impl DiagnosticBridge {
    fn emit_frame(
        &self,
        request_id: &str,
        ts: u64,
        direction: &str,
        op_code: Option<u8>,
        data: Option<String>,
    ) {
        let url = lock_state(&self.state).ws_urls.get(request_id).cloned();
        self.emit(CaptureEvent::WsFrame(WsFrameEvent {
            ts,
            direction: direction.to_string(),
            url,
            op_code,
            data,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;

    use anyhow::anyhow;
    use pretty_assertions::assert_eq;

    struct StubChannel {
        refuse: bool,
        unsubscribed: AtomicBool,
        observer: StdMutex<Option<Arc<dyn DiagnosticObserver>>>,
    }

    impl StubChannel {
        fn new(refuse: bool) -> Arc<Self> {
            Arc::new(StubChannel {
                refuse,
                unsubscribed: AtomicBool::new(false),
                observer: StdMutex::new(None),
            })
        }

        fn send(&self, msg: DiagnosticMessage) {
            let observer = self.observer.lock().expect("observer lock").clone();
            if let Some(obs) = observer {
                obs.on_message(msg);
            }
        }
    }

    impl DiagnosticChannel for StubChannel {
        fn subscribe(&self, observer: Arc<dyn DiagnosticObserver>) -> Result<()> {
            if self.refuse {
                return Err(anyhow!("already attached"));
            }
            *self.observer.lock().expect("observer lock") = Some(observer);
            Ok(())
        }

        fn unsubscribe(&self) {
            self.unsubscribed.store(true, Ordering::SeqCst);
        }
    }

    fn collecting_sink() -> (EventSink, Arc<StdMutex<Vec<CaptureEvent>>>) {
        let collected: Arc<StdMutex<Vec<CaptureEvent>>> = Arc::default();
        let inner = collected.clone();
        let sink: EventSink = Arc::new(move |ev| {
            inner.lock().expect("sink lock").push(ev.clone());
        });
        (sink, collected)
    }

    #[test]
    fn refused_subscription_degrades_to_noop() {
        let (sink, collected) = collecting_sink();
        let handle = DiagnosticBridge::attach(Some(StubChannel::new(true)), sink);
        assert!(!handle.is_attached());
        handle.detach();
        assert!(collected.lock().expect("lock").is_empty());
    }

    #[test]
    fn missing_channel_degrades_to_noop() {
        let (sink, _) = collecting_sink();
        let handle = DiagnosticBridge::attach(None, sink);
        assert!(!handle.is_attached());
    }

    #[test]
    fn redirect_chain_accumulates_across_sends() {
        let channel = StubChannel::new(false);
        let (sink, collected) = collecting_sink();
        let _handle = DiagnosticBridge::attach(Some(channel.clone()), sink);

        channel.send(DiagnosticMessage::RequestWillBeSent {
            request_id: "r1".into(),
            url: "https://a.test/start".into(),
            redirect_status: None,
            initiator: Some(Initiator {
                kind: "script".into(),
                url: Some("https://a.test/app.js".into()),
            }),
        });
        channel.send(DiagnosticMessage::RequestWillBeSent {
            request_id: "r1".into(),
            url: "https://a.test/moved".into(),
            redirect_status: Some(302),
            initiator: None,
        });

        let events = collected.lock().expect("lock");
        assert_eq!(events.len(), 2);
        let CaptureEvent::Initiator(last) = &events[1] else {
            panic!("expected initiator event");
        };
        assert_eq!(last.url, "https://a.test/moved");
        assert_eq!(last.redirect_chain.len(), 1);
        assert_eq!(last.redirect_chain[0].from, "https://a.test/start");
        assert_eq!(last.redirect_chain[0].status, 302);
        assert_eq!(
            last.initiator.as_ref().map(|i| i.kind.as_str()),
            Some("script"),
            "initiator survives redirect hops"
        );
    }

    #[test]
    fn frames_carry_direction_and_created_url() {
        let channel = StubChannel::new(false);
        let (sink, collected) = collecting_sink();
        let _handle = DiagnosticBridge::attach(Some(channel.clone()), sink);

        channel.send(DiagnosticMessage::WebSocketCreated {
            request_id: "ws1".into(),
            url: "wss://a.test/feed".into(),
        });
        channel.send(DiagnosticMessage::WebSocketFrameSent {
            request_id: "ws1".into(),
            ts: 10,
            op_code: Some(1),
            data: Some("ping".into()),
        });
        channel.send(DiagnosticMessage::WebSocketFrameReceived {
            request_id: "ws2".into(),
            ts: 11,
            op_code: Some(2),
            data: None,
        });

        let events = collected.lock().expect("lock");
        assert_eq!(events.len(), 2);
        let CaptureEvent::WsFrame(out) = &events[0] else {
            panic!("expected frame");
        };
        assert_eq!(out.direction, "out");
        assert_eq!(out.url.as_deref(), Some("wss://a.test/feed"));
        let CaptureEvent::WsFrame(inc) = &events[1] else {
            panic!("expected frame");
        };
        assert_eq!(inc.direction, "in");
        assert_eq!(inc.url, None, "unknown socket has no url");
    }

    #[test]
    fn detach_is_idempotent_and_stops_emission() {
        let channel = StubChannel::new(false);
        let (sink, collected) = collecting_sink();
        let handle = DiagnosticBridge::attach(Some(channel.clone()), sink);

        handle.detach();
        handle.detach();
        assert!(channel.unsubscribed.load(Ordering::SeqCst));

        channel.send(DiagnosticMessage::WebSocketFrameSent {
            request_id: "ws1".into(),
            ts: 10,
            op_code: None,
            data: None,
        });
        assert!(collected.lock().expect("lock").is_empty());
    }
}
