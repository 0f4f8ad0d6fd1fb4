// Browser media: getUserMedia capture and RTCPeerConnection negotiation
//
// Peer-connection callbacks are stored next to the connection instead of being
// leaked with `.forget()`, and are detached when the call's primitive closes.

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{
    IceCandidate, IceServerConfig, MediaAdapter, MediaError, MediaEventSink, MediaHandle,
    MediaKind, NegotiationPrimitive, SessionDescription,
};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::Arc;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    DomException, MediaStream, MediaStreamConstraints, MediaStreamTrack, RtcConfiguration,
    RtcIceCandidateInit, RtcIceServer, RtcPeerConnection, RtcPeerConnectionIceEvent,
    RtcPeerConnectionState, RtcSdpType, RtcSessionDescriptionInit, RtcTrackEvent,
};

/// Map the `DOMException` name a `getUserMedia` rejection carries to a media error
pub fn media_error_from_dom(name: &str, message: &str) -> MediaError {
    match name {
        "NotAllowedError" | "SecurityError" | "PermissionDeniedError" => {
            MediaError::PermissionDenied
        }
        "NotFoundError" | "OverconstrainedError" | "DevicesNotFoundError" => {
            MediaError::NoDeviceFound
        }
        _ => MediaError::Unavailable(format!("{}: {}", name, message)),
    }
}

fn capture_error(value: JsValue) -> MediaError {
    match value.dyn_ref::<DomException>() {
        Some(ex) => media_error_from_dom(&ex.name(), &ex.message()),
        None => MediaError::Unavailable(format!("{:?}", value)),
    }
}

fn negotiation_error(step: &str, value: JsValue) -> MediaError {
    let detail = value
        .dyn_ref::<DomException>()
        .map(|ex| ex.message())
        .or_else(|| value.as_string())
        .unwrap_or_else(|| format!("{:?}", value));
    MediaError::Negotiation(format!("{}: {}", step, detail))
}

/// Wire shape of a session description, `{"type": "offer", "sdp": "v=0..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DescriptionPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl DescriptionPayload {
    pub(crate) fn encode(kind: &str, sdp: String) -> Result<SessionDescription, MediaError> {
        let payload = Self {
            kind: kind.to_string(),
            sdp,
        };
        serde_json::to_string(&payload)
            .map(SessionDescription::new)
            .map_err(|e| MediaError::Negotiation(e.to_string()))
    }

    /// Parse a remote description, insisting on the expected `type`
    pub(crate) fn decode(description: &SessionDescription, expected: &str) -> Result<Self, MediaError> {
        let payload: Self = serde_json::from_str(description.as_str())
            .map_err(|e| MediaError::Negotiation(format!("malformed {}: {}", expected, e)))?;
        if payload.kind != expected {
            return Err(MediaError::Negotiation(format!(
                "expected {}, got {}",
                expected, payload.kind
            )));
        }
        Ok(payload)
    }
}

/// Wire shape of a trickled candidate, matching `RTCIceCandidate.toJSON()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CandidatePayload {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl CandidatePayload {
    pub(crate) fn encode(&self) -> Result<IceCandidate, MediaError> {
        serde_json::to_string(self)
            .map(IceCandidate::new)
            .map_err(|e| MediaError::Negotiation(e.to_string()))
    }

    pub(crate) fn decode(candidate: &IceCandidate) -> Result<Self, MediaError> {
        serde_json::from_str(candidate.as_str())
            .map_err(|e| MediaError::Negotiation(format!("malformed candidate: {}", e)))
    }
}

/// A browser `MediaStream` carried inside a [`MediaHandle`]
pub struct CapturedStream {
    stream: MediaStream,
    stopped: Cell<bool>,
}

impl CapturedStream {
    pub fn new(stream: MediaStream) -> Self {
        Self {
            stream,
            stopped: Cell::new(false),
        }
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    /// Stop every track. Returns false if the stream was already stopped.
    pub fn stop(&self) -> bool {
        if self.stopped.replace(true) {
            return false;
        }
        for track in self.tracks() {
            track.stop();
        }
        true
    }

    fn tracks(&self) -> Vec<MediaStreamTrack> {
        self.stream
            .get_tracks()
            .iter()
            .filter_map(|track| track.dyn_into::<MediaStreamTrack>().ok())
            .collect()
    }
}

/// `RTCPeerConnection` with its event callbacks kept alive alongside it
pub struct ManagedPeerConnection {
    peer_connection: RtcPeerConnection,
    onicecandidate: Option<Closure<dyn FnMut(RtcPeerConnectionIceEvent)>>,
    ontrack: Option<Closure<dyn FnMut(RtcTrackEvent)>>,
    onconnectionstatechange: Option<Closure<dyn FnMut(web_sys::Event)>>,
    closed: bool,
}

impl ManagedPeerConnection {
    pub fn new(config: &RtcConfiguration) -> Result<Self, MediaError> {
        let peer_connection = RtcPeerConnection::new_with_configuration(config)
            .map_err(|e| MediaError::Unavailable(format!("RTCPeerConnection: {:?}", e)))?;

        Ok(Self {
            peer_connection,
            onicecandidate: None,
            ontrack: None,
            onconnectionstatechange: None,
            closed: false,
        })
    }

    pub fn set_onicecandidate<F>(&mut self, callback: F)
    where
        F: FnMut(RtcPeerConnectionIceEvent) + 'static,
    {
        let closure =
            Closure::wrap(Box::new(callback) as Box<dyn FnMut(RtcPeerConnectionIceEvent)>);
        self.peer_connection
            .set_onicecandidate(Some(closure.as_ref().unchecked_ref()));
        self.onicecandidate = Some(closure);
    }

    pub fn set_ontrack<F>(&mut self, callback: F)
    where
        F: FnMut(RtcTrackEvent) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(RtcTrackEvent)>);
        self.peer_connection
            .set_ontrack(Some(closure.as_ref().unchecked_ref()));
        self.ontrack = Some(closure);
    }

    pub fn set_onconnectionstatechange<F>(&mut self, callback: F)
    where
        F: FnMut(web_sys::Event) + 'static,
    {
        let closure = Closure::wrap(Box::new(callback) as Box<dyn FnMut(web_sys::Event)>);
        self.peer_connection
            .set_onconnectionstatechange(Some(closure.as_ref().unchecked_ref()));
        self.onconnectionstatechange = Some(closure);
    }

    /// Route candidates, remote media and fatal state changes to `events`
    pub fn report_to(&mut self, events: MediaEventSink, kind: MediaKind) {
        let sink = events.clone();
        self.set_onicecandidate(move |event: RtcPeerConnectionIceEvent| {
            // A null candidate marks the end of gathering.
            let Some(candidate) = event.candidate() else {
                return;
            };
            let payload = CandidatePayload {
                candidate: candidate.candidate(),
                sdp_mid: candidate.sdp_mid(),
                sdp_m_line_index: candidate.sdp_m_line_index(),
            };
            match payload.encode() {
                Ok(candidate) => sink.local_candidate(candidate),
                Err(err) => tracing::warn!("Dropping local candidate: {}", err),
            }
        });

        let sink = events.clone();
        let mut announced = false;
        self.set_ontrack(move |event: RtcTrackEvent| {
            // Later tracks join the stream that was already announced.
            if announced {
                return;
            }
            match event.streams().get(0).dyn_into::<MediaStream>() {
                Ok(stream) => {
                    announced = true;
                    sink.remote_media(MediaHandle::new(kind, CapturedStream::new(stream)));
                }
                Err(_) => tracing::debug!("Remote track arrived without a stream"),
            }
        });

        let peer = self.peer_connection.clone();
        self.set_onconnectionstatechange(move |_| {
            let state = peer.connection_state();
            tracing::debug!("Peer connection state: {:?}", state);
            if state == RtcPeerConnectionState::Failed {
                events.failed("peer connection failed");
            }
        });
    }

    pub fn add_stream(&self, stream: &CapturedStream) {
        for track in stream.tracks() {
            self.peer_connection.add_track_0(&track, stream.stream());
        }
    }

    pub fn peer(&self) -> RtcPeerConnection {
        self.peer_connection.clone()
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.peer_connection.close();
        self.cleanup_callbacks();
    }

    fn cleanup_callbacks(&mut self) {
        self.peer_connection.set_onicecandidate(None);
        self.peer_connection.set_ontrack(None);
        self.peer_connection.set_onconnectionstatechange(None);

        self.onicecandidate = None;
        self.ontrack = None;
        self.onconnectionstatechange = None;
    }
}

impl Drop for ManagedPeerConnection {
    fn drop(&mut self) {
        self.cleanup_callbacks();
    }
}

struct BrowserPrimitive {
    connection: Mutex<ManagedPeerConnection>,
}

impl BrowserPrimitive {
    /// The lock is only held long enough to clone the JS handle.
    fn peer(&self) -> RtcPeerConnection {
        self.connection.lock().peer()
    }

    async fn install_local(
        &self,
        sdp_type: RtcSdpType,
        kind: &str,
        description: JsValue,
    ) -> Result<SessionDescription, MediaError> {
        let sdp = js_sys::Reflect::get(&description, &JsValue::from_str("sdp"))
            .ok()
            .and_then(|value| value.as_string())
            .ok_or_else(|| MediaError::Negotiation(format!("{} has no sdp", kind)))?;

        let init = RtcSessionDescriptionInit::new(sdp_type);
        init.set_sdp(&sdp);
        JsFuture::from(self.peer().set_local_description(&init))
            .await
            .map_err(|e| negotiation_error("setLocalDescription", e))?;

        DescriptionPayload::encode(kind, sdp)
    }

    async fn apply_remote(
        &self,
        sdp_type: RtcSdpType,
        kind: &str,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let payload = DescriptionPayload::decode(description, kind)?;
        let init = RtcSessionDescriptionInit::new(sdp_type);
        init.set_sdp(&payload.sdp);
        JsFuture::from(self.peer().set_remote_description(&init))
            .await
            .map_err(|e| negotiation_error("setRemoteDescription", e))?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl NegotiationPrimitive for BrowserPrimitive {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = JsFuture::from(self.peer().create_offer())
            .await
            .map_err(|e| negotiation_error("createOffer", e))?;
        self.install_local(RtcSdpType::Offer, "offer", offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = JsFuture::from(self.peer().create_answer())
            .await
            .map_err(|e| negotiation_error("createAnswer", e))?;
        self.install_local(RtcSdpType::Answer, "answer", answer).await
    }

    async fn apply_remote_offer(&self, offer: &SessionDescription) -> Result<(), MediaError> {
        self.apply_remote(RtcSdpType::Offer, "offer", offer).await
    }

    async fn apply_remote_answer(&self, answer: &SessionDescription) -> Result<(), MediaError> {
        self.apply_remote(RtcSdpType::Answer, "answer", answer).await
    }

    async fn apply_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let payload = CandidatePayload::decode(candidate)?;
        let init = RtcIceCandidateInit::new(&payload.candidate);
        init.set_sdp_mid(payload.sdp_mid.as_deref());
        init.set_sdp_m_line_index(payload.sdp_m_line_index);
        JsFuture::from(
            self.peer()
                .add_ice_candidate_with_opt_rtc_ice_candidate_init(Some(&init)),
        )
        .await
        .map_err(|e| negotiation_error("addIceCandidate", e))?;
        Ok(())
    }

    fn close(&self) {
        self.connection.lock().close();
    }
}

/// [`MediaAdapter`] backed by `navigator.mediaDevices` and `RTCPeerConnection`
pub struct BrowserMedia {
    ice_servers: Vec<IceServerConfig>,
}

impl BrowserMedia {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    fn rtc_configuration(&self) -> RtcConfiguration {
        let servers = js_sys::Array::new();
        for server in &self.ice_servers {
            let urls: js_sys::Array = server.urls.iter().map(|url| JsValue::from_str(url)).collect();
            let ice = RtcIceServer::new();
            ice.set_urls(&urls);
            if let Some(username) = &server.username {
                ice.set_username(username);
            }
            if let Some(credential) = &server.credential {
                ice.set_credential(credential);
            }
            servers.push(&ice);
        }

        let config = RtcConfiguration::new();
        config.set_ice_servers(&servers);
        config
    }
}

#[async_trait(?Send)]
impl MediaAdapter for BrowserMedia {
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<MediaHandle, MediaError> {
        let window = web_sys::window()
            .ok_or_else(|| MediaError::Unavailable("no window".to_string()))?;
        let devices = window.navigator().media_devices().map_err(capture_error)?;

        let constraints = MediaStreamConstraints::new();
        constraints.set_audio(&JsValue::TRUE);
        constraints.set_video(&JsValue::from_bool(kind.has_video()));

        let request = devices
            .get_user_media_with_constraints(&constraints)
            .map_err(capture_error)?;
        // Suspends for as long as the permission prompt is open.
        let stream = JsFuture::from(request)
            .await
            .map_err(capture_error)?
            .dyn_into::<MediaStream>()
            .map_err(|_| MediaError::Unavailable("getUserMedia resolved without a stream".into()))?;

        tracing::info!("🎙️ Local capture started ({:?})", kind);
        Ok(MediaHandle::new(kind, CapturedStream::new(stream)))
    }

    fn create_negotiation_primitive(
        &self,
        local: &MediaHandle,
        events: MediaEventSink,
    ) -> Result<Arc<dyn NegotiationPrimitive>, MediaError> {
        let stream = local
            .resource::<CapturedStream>()
            .ok_or_else(|| MediaError::Unavailable("media handle is not a browser stream".into()))?;

        let mut connection = ManagedPeerConnection::new(&self.rtc_configuration())?;
        connection.add_stream(stream);
        connection.report_to(events, local.kind());

        Ok(Arc::new(BrowserPrimitive {
            connection: Mutex::new(connection),
        }))
    }

    fn release_media(&self, handle: &MediaHandle) {
        match handle.resource::<CapturedStream>() {
            Some(stream) if stream.stop() => tracing::debug!("Stopped capture {}", handle.id()),
            Some(_) => {}
            None => tracing::debug!("Handle {} is not a browser stream", handle.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dom_exception_names_map_to_media_errors() {
        assert_eq!(
            media_error_from_dom("NotAllowedError", "denied"),
            MediaError::PermissionDenied
        );
        assert_eq!(
            media_error_from_dom("SecurityError", "insecure context"),
            MediaError::PermissionDenied
        );
        assert_eq!(
            media_error_from_dom("NotFoundError", "no mic"),
            MediaError::NoDeviceFound
        );
        assert_eq!(
            media_error_from_dom("OverconstrainedError", ""),
            MediaError::NoDeviceFound
        );
        assert!(matches!(
            media_error_from_dom("NotReadableError", "in use"),
            MediaError::Unavailable(msg) if msg.contains("in use")
        ));
    }

    #[test]
    fn test_description_payload_matches_browser_shape() {
        let desc = DescriptionPayload::encode("offer", "v=0\r\n".to_string()).unwrap();
        let json: serde_json::Value = serde_json::from_str(desc.as_str()).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");

        let decoded = DescriptionPayload::decode(&desc, "offer").unwrap();
        assert_eq!(decoded.sdp, "v=0\r\n");
    }

    #[test]
    fn test_description_of_wrong_type_is_rejected() {
        let desc = DescriptionPayload::encode("answer", "v=0".to_string()).unwrap();
        let err = DescriptionPayload::decode(&desc, "offer").unwrap_err();
        assert_eq!(err, MediaError::Negotiation("expected offer, got answer".into()));

        let garbage = SessionDescription::new("not json");
        assert!(matches!(
            DescriptionPayload::decode(&garbage, "answer"),
            Err(MediaError::Negotiation(_))
        ));
    }

    #[test]
    fn test_candidate_payload_uses_browser_field_names() {
        let raw = r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let payload = CandidatePayload::decode(&IceCandidate::new(raw)).unwrap();
        assert_eq!(payload.sdp_mid.as_deref(), Some("0"));
        assert_eq!(payload.sdp_m_line_index, Some(0));

        let bare = CandidatePayload::decode(&IceCandidate::new(r#"{"candidate":"c"}"#)).unwrap();
        assert_eq!(bare.sdp_mid, None);
        assert_eq!(bare.sdp_m_line_index, None);
    }
}

#[cfg(all(test, target_arch = "wasm32"))]
mod browser_tests {
    use super::*;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    #[wasm_bindgen_test]
    fn test_stopping_a_stream_twice_is_harmless() {
        let stream = CapturedStream::new(MediaStream::new().unwrap());
        assert!(stream.stop());
        assert!(!stream.stop());
    }

    #[wasm_bindgen_test]
    fn test_release_ignores_foreign_handles() {
        let media = BrowserMedia::new(Vec::new());
        media.release_media(&MediaHandle::new(MediaKind::Audio, ()));
    }

    #[wasm_bindgen_test]
    fn test_closing_peer_connection_twice_is_harmless() {
        let media = BrowserMedia::new(vec![IceServerConfig::stun("stun:stun.l.google.com:19302")]);
        let mut connection = ManagedPeerConnection::new(&media.rtc_configuration()).unwrap();
        connection.close();
        connection.close();
        assert_eq!(
            connection.peer().connection_state(),
            RtcPeerConnectionState::Closed
        );
    }
}
