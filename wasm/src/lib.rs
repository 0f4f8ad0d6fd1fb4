// parley-wasm: browser bindings for calls and chat

pub mod chat;
pub mod media;
pub mod rpc;

use crate::media::{BrowserMedia, CapturedStream};
use crate::rpc::{JsSignalTransport, RpcProxy};
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use parking_lot::Mutex;
use parley_core::{
    CallEngine, CallError, CallEvent, ClientConfig, IceCandidate, InboundSignal, MediaHandle,
    Signal, SignalKind,
};
use serde::Serialize;
use std::sync::Arc;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::future_to_promise;

#[wasm_bindgen]
pub fn init_logging() {
    console_error_panic_hook::set_once();
    tracing_wasm::set_as_global_default();
}

/// Read the optional config argument; `undefined` or `null` means defaults
pub(crate) fn client_config(value: JsValue) -> Result<ClientConfig, JsValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(ClientConfig::default());
    }
    serde_wasm_bindgen::from_value(value).map_err(|e| JsValue::from_str(&format!("invalid config: {}", e)))
}

pub(crate) fn to_js<T: Serialize>(value: &T) -> JsValue {
    serde_wasm_bindgen::to_value(value).unwrap_or(JsValue::UNDEFINED)
}

/// Call events as seen by the page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WasmCallEvent {
    IncomingCall { from: String },
    StateChanged { status: String, remote: String },
    LocalMediaReady { stream_id: String },
    RemoteMediaReady { stream_id: String },
    Error { kind: String, message: String },
}

impl From<&CallEvent> for WasmCallEvent {
    fn from(event: &CallEvent) -> Self {
        match event {
            CallEvent::IncomingCall { from } => Self::IncomingCall { from: from.clone() },
            CallEvent::StateChanged { status, remote } => Self::StateChanged {
                status: status.to_string(),
                remote: remote.clone(),
            },
            CallEvent::LocalMediaReady(handle) => Self::LocalMediaReady {
                stream_id: handle.id().to_string(),
            },
            CallEvent::RemoteMediaReady(handle) => Self::RemoteMediaReady {
                stream_id: handle.id().to_string(),
            },
            CallEvent::Error { kind, message } => Self::Error {
                kind: kind.to_string(),
                message: message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct WasmCallError {
    kind: String,
    message: String,
}

fn call_error(err: CallError) -> JsValue {
    to_js(&WasmCallError {
        kind: err.kind().to_string(),
        message: err.to_string(),
    })
}

/// Streams the page renders; replaced as new media arrives
#[derive(Default)]
struct RenderTargets {
    local: Option<MediaHandle>,
    remote: Option<MediaHandle>,
}

fn stream_of(handle: &Option<MediaHandle>) -> Option<web_sys::MediaStream> {
    handle
        .as_ref()
        .and_then(|h| h.resource::<CapturedStream>())
        .map(|captured| captured.stream().clone())
}

#[wasm_bindgen]
pub struct CallClient {
    username: String,
    engine: CallEngine,
    /// Push side of the engine's inbound signal stream
    signals: UnboundedSender<InboundSignal>,
    /// Events waiting to be drained by JS.
    events: Arc<Mutex<Vec<WasmCallEvent>>>,
    targets: Arc<Mutex<RenderTargets>>,
}

#[wasm_bindgen]
impl CallClient {
    /// Build a client for `username` that signals through `rpc_proxy`.
    ///
    /// Spawns the engine loop and the event pump on the page's event loop.
    #[wasm_bindgen(constructor)]
    pub fn new(username: String, rpc_proxy: JsValue, config: JsValue) -> Result<CallClient, JsValue> {
        init_logging();
        let config = client_config(config)?;
        let proxy = RpcProxy::new(rpc_proxy);
        let engine = CallEngine::new(
            Arc::new(JsSignalTransport::new(proxy, username.clone())),
            Arc::new(BrowserMedia::new(config.ice_servers.clone())),
            config.call,
        );

        let (signals, inbound) = mpsc::unbounded();
        let runner = engine.clone();
        wasm_bindgen_futures::spawn_local(async move {
            runner.run(inbound).await;
        });

        let events = Arc::new(Mutex::new(Vec::new()));
        let targets = Arc::new(Mutex::new(RenderTargets::default()));
        let mut ui = engine.subscribe();
        let events_clone = Arc::clone(&events);
        let targets_clone = Arc::clone(&targets);
        wasm_bindgen_futures::spawn_local(async move {
            while let Some(event) = ui.next().await {
                match &event {
                    CallEvent::LocalMediaReady(handle) => {
                        targets_clone.lock().local = Some(handle.clone());
                    }
                    CallEvent::RemoteMediaReady(handle) => {
                        targets_clone.lock().remote = Some(handle.clone());
                    }
                    CallEvent::StateChanged { status, .. } if !status.is_live() => {
                        *targets_clone.lock() = RenderTargets::default();
                    }
                    _ => {}
                }
                events_clone.lock().push(WasmCallEvent::from(&event));
            }
        });

        tracing::info!("📞 Call client ready for {}", username);
        Ok(CallClient {
            username,
            engine,
            signals,
            events,
            targets,
        })
    }

    #[wasm_bindgen(getter)]
    pub fn username(&self) -> String {
        self.username.clone()
    }

    /// Current call status, e.g. `"negotiating"`
    pub fn status(&self) -> String {
        self.engine.status().to_string()
    }

    #[wasm_bindgen(js_name = isInCall)]
    pub fn is_in_call(&self) -> bool {
        self.engine.is_in_call()
    }

    /// Resolves with the local `MediaStream` once the offer is on its way
    #[wasm_bindgen(js_name = initiateCall)]
    pub fn initiate_call(&self, remote: String) -> js_sys::Promise {
        let engine = self.engine.clone();
        let local = self.username.clone();
        future_to_promise(async move {
            let handle = engine.initiate_call(&local, &remote).await.map_err(call_error)?;
            Ok(stream_of(&Some(handle)).map(JsValue::from).unwrap_or(JsValue::UNDEFINED))
        })
    }

    #[wasm_bindgen(js_name = acceptCall)]
    pub fn accept_call(&self, from: String) -> js_sys::Promise {
        let engine = self.engine.clone();
        let local = self.username.clone();
        future_to_promise(async move {
            let handle = engine.accept_call(&local, &from).await.map_err(call_error)?;
            Ok(stream_of(&Some(handle)).map(JsValue::from).unwrap_or(JsValue::UNDEFINED))
        })
    }

    #[wasm_bindgen(js_name = rejectCall)]
    pub fn reject_call(&self, from: String) -> js_sys::Promise {
        let engine = self.engine.clone();
        future_to_promise(async move {
            engine.reject_call(&from).await.map_err(call_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    #[wasm_bindgen(js_name = hangUp)]
    pub fn hang_up(&self) -> js_sys::Promise {
        let engine = self.engine.clone();
        future_to_promise(async move {
            engine.hang_up().await.map_err(call_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// Drive the negotiation watchdog; resolves `true` if a call was ended.
    /// Meant to be called from a `setInterval`.
    #[wasm_bindgen(js_name = checkTimeouts)]
    pub fn check_timeouts(&self) -> js_sys::Promise {
        let engine = self.engine.clone();
        future_to_promise(async move { Ok(JsValue::from_bool(engine.check_timeouts().await)) })
    }

    #[wasm_bindgen(js_name = onIncomingCall)]
    pub fn on_incoming_call(&self, from: String) {
        self.push(InboundSignal::new(from, Signal::IncomingCall));
    }

    /// Offer or answer pushed by the service; `signal_type` is the wire name
    #[wasm_bindgen(js_name = onWebRTCSignal)]
    pub fn on_webrtc_signal(&self, from: String, signal_type: String, data: String) -> Result<(), JsValue> {
        let kind: SignalKind = signal_type.parse().map_err(|e: String| JsValue::from_str(&e))?;
        self.push(InboundSignal::new(from, Signal::from_parts(kind, data)));
        Ok(())
    }

    #[wasm_bindgen(js_name = onICECandidate)]
    pub fn on_ice_candidate(&self, from: String, candidate: String) {
        self.push(InboundSignal::new(
            from,
            Signal::IceCandidate(IceCandidate::new(candidate)),
        ));
    }

    #[wasm_bindgen(js_name = onCallEnded)]
    pub fn on_call_ended(&self, from: String) {
        self.push(InboundSignal::new(from, Signal::CallEnd));
    }

    /// Return all events queued since the last call and clear the queue.
    ///
    /// Returns a JS array of `{ type, ... }` objects.
    #[wasm_bindgen(js_name = drainEvents)]
    pub fn drain_events(&self) -> js_sys::Array {
        let events: Vec<WasmCallEvent> = std::mem::take(&mut *self.events.lock());
        events.iter().map(to_js).collect()
    }

    #[wasm_bindgen(js_name = localStream)]
    pub fn local_stream(&self) -> Option<web_sys::MediaStream> {
        stream_of(&self.targets.lock().local)
    }

    #[wasm_bindgen(js_name = remoteStream)]
    pub fn remote_stream(&self) -> Option<web_sys::MediaStream> {
        stream_of(&self.targets.lock().remote)
    }

    fn push(&self, inbound: InboundSignal) {
        tracing::debug!("⬇️ {}", inbound);
        if self.signals.unbounded_send(inbound).is_err() {
            tracing::warn!("Call engine loop is gone; signal dropped");
        }
    }
}


#[cfg(all(test, target_arch = "wasm32"))]
mod browser_tests {
    use super::*;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    fn proxy() -> JsValue {
        js_sys::Function::new_no_args(
            "const ok = () => Promise.resolve({ success: true, message: '' }); \
             return { initiateCall: ok, sendWebRTCSignal: ok, sendICECandidate: ok, endCall: ok };",
        )
        .call0(&JsValue::NULL)
        .unwrap()
    }

    #[wasm_bindgen_test]
    async fn test_incoming_call_is_queued_for_the_page() {
        let client = CallClient::new("bob".into(), proxy(), JsValue::UNDEFINED).unwrap();
        client.on_incoming_call("alice".into());

        // A timer lets the engine loop and the event pump run to completion.
        let sleep = js_sys::Function::new_no_args("return new Promise(r => setTimeout(r, 20));")
            .call0(&JsValue::NULL)
            .unwrap();
        wasm_bindgen_futures::JsFuture::from(js_sys::Promise::from(sleep))
            .await
            .unwrap();

        let events = client.drain_events();
        assert_eq!(events.length(), 1);
        assert_eq!(client.drain_events().length(), 0);
        assert_eq!(client.status(), "idle");
    }

    #[wasm_bindgen_test]
    fn test_unknown_signal_type_is_rejected() {
        let client = CallClient::new("bob".into(), proxy(), JsValue::NULL).unwrap();
        assert!(client
            .on_webrtc_signal("alice".into(), "hello".into(), String::new())
            .is_err());
    }
}
