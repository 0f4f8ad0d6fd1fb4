// RPC proxy bridge
//
// The browser page owns the connection to the chat service and hands us its
// proxy object. Every outbound signal and chat request is a method call on
// that object which resolves to `{ success, message }`, a list, a user map,
// or nothing at all.

use async_trait::async_trait;
use js_sys::{Array, Function, Promise, Reflect, Uint8Array};
use parley_core::{
    ChatService, IceCandidate, SessionDescription, SignalKind, SignalTransport, StoredMessage,
    TransportError, VoiceNote,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;

/// Service reply to a state-changing request
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct RpcResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl RpcResponse {
    pub(crate) fn into_result(self) -> Result<(), TransportError> {
        if self.success {
            return Ok(());
        }
        let lower = self.message.to_lowercase();
        if lower.contains("not connected") || lower.contains("offline") || lower.contains("not found")
        {
            Err(TransportError::RemoteUnavailable(self.message))
        } else {
            Err(TransportError::Rejected(self.message))
        }
    }
}

fn describe(value: &JsValue) -> String {
    if let Some(err) = value.dyn_ref::<js_sys::Error>() {
        return String::from(err.message());
    }
    value.as_string().unwrap_or_else(|| format!("{:?}", value))
}

/// Handle to the page's chat-service proxy object
#[derive(Clone)]
pub struct RpcProxy {
    target: JsValue,
}

impl RpcProxy {
    pub fn new(target: JsValue) -> Self {
        Self { target }
    }

    /// Invoke `method` and await its result if it returned a promise
    async fn call(&self, method: &str, args: Array) -> Result<JsValue, TransportError> {
        let function = Reflect::get(&self.target, &JsValue::from_str(method))
            .ok()
            .and_then(|value| value.dyn_into::<Function>().ok())
            .ok_or(TransportError::NotConnected)?;

        tracing::debug!("→ rpc {}", method);
        let returned = function
            .apply(&self.target, &args)
            .map_err(|e| TransportError::Rejected(format!("{}: {}", method, describe(&e))))?;

        match returned.dyn_into::<Promise>() {
            Ok(promise) => JsFuture::from(promise)
                .await
                .map_err(|e| TransportError::Rejected(format!("{}: {}", method, describe(&e)))),
            Err(value) => Ok(value),
        }
    }

    async fn request(&self, method: &str, args: Array) -> Result<(), TransportError> {
        let value = self.call(method, args).await?;
        let response: RpcResponse = serde_wasm_bindgen::from_value(value)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        response.into_result()
    }

    async fn list<T: DeserializeOwned>(&self, method: &str, args: Array) -> Result<Vec<T>, TransportError> {
        self.fetch(method, args).await
    }

    /// Like [`list`](Self::list) for replies that are a plain object or a `Map`
    async fn map<T: DeserializeOwned>(&self, method: &str, args: Array) -> Result<BTreeMap<String, T>, TransportError> {
        self.fetch(method, args).await
    }

    async fn fetch<R: DeserializeOwned + Default>(&self, method: &str, args: Array) -> Result<R, TransportError> {
        let value = self.call(method, args).await?;
        if value.is_null() || value.is_undefined() {
            return Ok(R::default());
        }
        serde_wasm_bindgen::from_value(value)
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }
}

/// Queued message as the service returns it; the service's own timestamp
/// type is not portable, so arrival time is used instead
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingMessage {
    from: String,
    to: String,
    content: String,
    #[serde(default)]
    is_group: bool,
}

impl From<PendingMessage> for StoredMessage {
    fn from(message: PendingMessage) -> Self {
        StoredMessage {
            from: message.from,
            to: message.to,
            content: message.content,
            is_group: message.is_group,
            timestamp: None,
        }
    }
}

/// Parse one history line, `{type:text,from:a,target:b,isGroup:false,msg:...,ts:...}`.
/// Anything that is not a text record yields `None`.
pub(crate) fn parse_history_record(record: &str) -> Option<StoredMessage> {
    let body = record.trim().strip_prefix('{')?.strip_suffix('}')?;
    if record_field(body, "type").map_or(false, |kind| kind != "text") {
        return None;
    }
    let from = record_field(body, "from")?;
    let to = record_field(body, "target")?;
    let is_group = record_field(body, "isGroup") == Some("true");

    // The text may contain commas; it runs up to the trailing timestamp.
    let start = body.find(",msg:")? + ",msg:".len();
    let rest = &body[start..];
    let content = rest.rfind(",ts:").map_or(rest, |end| &rest[..end]);
    if content.is_empty() {
        return None;
    }

    Some(StoredMessage {
        from: from.to_string(),
        to: to.to_string(),
        content: content.to_string(),
        is_group,
        timestamp: None,
    })
}

fn record_field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.split(',')
        .find_map(|part| part.strip_prefix(key)?.strip_prefix(':'))
        .filter(|value| !value.is_empty())
}

fn args(values: &[&str]) -> Array {
    values.iter().map(|v| JsValue::from_str(v)).collect()
}

/// [`SignalTransport`] that relays through the page's proxy as `local`
pub struct JsSignalTransport {
    proxy: RpcProxy,
    local: String,
}

impl JsSignalTransport {
    pub fn new(proxy: RpcProxy, local: impl Into<String>) -> Self {
        Self {
            proxy,
            local: local.into(),
        }
    }

    async fn send_signal(&self, remote: &str, kind: SignalKind, data: &str) -> Result<(), TransportError> {
        let kind = kind.to_string();
        self.proxy
            .request("sendWebRTCSignal", args(&[&self.local, remote, &kind, data]))
            .await
    }
}

#[async_trait(?Send)]
impl SignalTransport for JsSignalTransport {
    async fn send_initiate_call(&self, remote: &str) -> Result<(), TransportError> {
        self.proxy
            .request("initiateCall", args(&[&self.local, remote]))
            .await
    }

    async fn send_offer(&self, remote: &str, offer: &SessionDescription) -> Result<(), TransportError> {
        self.send_signal(remote, SignalKind::Offer, offer.as_str()).await
    }

    async fn send_answer(&self, remote: &str, answer: &SessionDescription) -> Result<(), TransportError> {
        self.send_signal(remote, SignalKind::Answer, answer.as_str()).await
    }

    async fn send_candidate(&self, remote: &str, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.proxy
            .request("sendICECandidate", args(&[&self.local, remote, candidate.as_str()]))
            .await
    }

    async fn send_call_end(&self, remote: &str) -> Result<(), TransportError> {
        self.proxy.request("endCall", args(&[&self.local, remote])).await
    }
}

/// [`ChatService`] over the page's proxy
pub struct JsChatService {
    proxy: RpcProxy,
}

impl JsChatService {
    pub fn new(proxy: RpcProxy) -> Self {
        Self { proxy }
    }

    async fn send_voice(&self, method: &str, from: &str, to: &str, note: &VoiceNote) -> Result<(), TransportError> {
        let call_args = args(&[from, to]);
        call_args.push(&Uint8Array::from(note.data.as_slice()));
        self.proxy.request(method, call_args).await
    }
}

#[async_trait(?Send)]
impl ChatService for JsChatService {
    async fn login(&self, user: &str) -> Result<(), TransportError> {
        self.proxy.request("login", args(&[user])).await
    }

    async fn logout(&self, user: &str) -> Result<(), TransportError> {
        self.proxy.request("logout", args(&[user])).await
    }

    async fn send_message_to_user(&self, from: &str, to: &str, text: &str) -> Result<(), TransportError> {
        self.proxy
            .request("sendMessageToUser", args(&[from, to, text]))
            .await
    }

    async fn send_message_to_group(&self, from: &str, group: &str, text: &str) -> Result<(), TransportError> {
        self.proxy
            .request("sendMessageToGroup", args(&[from, group, text]))
            .await
    }

    async fn send_voice_note_to_user(&self, from: &str, to: &str, note: &VoiceNote) -> Result<(), TransportError> {
        self.send_voice("sendVoiceNoteToUser", from, to, note).await
    }

    async fn send_voice_note_to_group(&self, from: &str, group: &str, note: &VoiceNote) -> Result<(), TransportError> {
        self.send_voice("sendVoiceNoteToGroup", from, group, note).await
    }

    async fn create_group(&self, creator: &str, group: &str) -> Result<(), TransportError> {
        // The service takes the group name first.
        self.proxy.request("createGroup", args(&[group, creator])).await
    }

    async fn add_to_group(&self, group: &str, user: &str) -> Result<(), TransportError> {
        self.proxy.request("addToGroup", args(&[group, user])).await
    }

    async fn get_user_groups(&self, user: &str) -> Result<Vec<String>, TransportError> {
        self.proxy.list("getUserGroups", args(&[user])).await
    }

    async fn get_online_users(&self) -> Result<Vec<String>, TransportError> {
        self.proxy.list("getOnlineUsers", Array::new()).await
    }

    async fn get_all_users(&self) -> Result<BTreeMap<String, bool>, TransportError> {
        self.proxy.map("getAllUsers", Array::new()).await
    }

    async fn get_group_members(&self, group: &str) -> Result<Vec<String>, TransportError> {
        self.proxy.list("getGroupMembers", args(&[group])).await
    }

    async fn get_history(&self, user: &str) -> Result<Vec<StoredMessage>, TransportError> {
        let records: Vec<String> = self.proxy.list("getHistory", args(&[user])).await?;
        let total = records.len();
        let parsed: Vec<StoredMessage> = records
            .iter()
            .filter_map(|record| parse_history_record(record))
            .collect();
        if parsed.len() < total {
            tracing::debug!("Skipped {} history record(s)", total - parsed.len());
        }
        Ok(parsed)
    }

    async fn get_pending_messages(&self, user: &str) -> Result<Vec<StoredMessage>, TransportError> {
        let pending: Vec<PendingMessage> = self.proxy.list("getPendingMessages", args(&[user])).await?;
        Ok(pending.into_iter().map(StoredMessage::from).collect())
    }
}
