// Simulated media: deterministic stand-in for getUserMedia + RTCPeerConnection
//
// Behaves like a strict peer connection: candidates are refused until a remote
// description is installed, an answer needs an applied offer, and remote media
// is announced once both descriptions are in place. Payloads starting with
// "bad" are refused. Every call is recorded so tests can assert exactly what
// the engine did and in which order.

use super::{
    MediaAdapter, MediaError, MediaEventSink, MediaHandle, MediaKind, NegotiationPrimitive,
};
use crate::signal::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One recorded call on a [`SimulatedPrimitive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveOp {
    CreatedOffer(SessionDescription),
    CreatedAnswer(SessionDescription),
    AppliedOffer(SessionDescription),
    AppliedAnswer(SessionDescription),
    AppliedCandidate(IceCandidate),
    Closed,
}

struct AdapterState {
    failure: Option<MediaError>,
    gate: Option<oneshot::Receiver<bool>>,
    acquired: Vec<String>,
    releases: HashMap<String, usize>,
    primitives: Vec<Arc<SimulatedPrimitive>>,
    reject_remote_payloads: bool,
}

/// Simulated [`MediaAdapter`]; clones share state.
#[derive(Clone)]
pub struct SimulatedMedia {
    label: String,
    local_candidates: usize,
    state: Arc<Mutex<AdapterState>>,
}

/// Holds a pending permission prompt open until the test decides.
pub struct PermissionGate {
    tx: oneshot::Sender<bool>,
}

impl PermissionGate {
    pub fn grant(self) {
        let _ = self.tx.send(true);
    }

    pub fn deny(self) {
        let _ = self.tx.send(false);
    }
}

impl SimulatedMedia {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            local_candidates: 2,
            state: Arc::new(Mutex::new(AdapterState {
                failure: None,
                gate: None,
                acquired: Vec::new(),
                releases: HashMap::new(),
                primitives: Vec::new(),
                reject_remote_payloads: false,
            })),
        }
    }

    /// Number of candidates each primitive gathers after its local description
    pub fn with_local_candidates(mut self, count: usize) -> Self {
        self.local_candidates = count;
        self
    }

    /// Every capture request fails as if the user clicked "Block"
    pub fn deny_permission(self) -> Self {
        self.state.lock().failure = Some(MediaError::PermissionDenied);
        self
    }

    /// Every capture request fails as if no microphone is attached
    pub fn without_device(self) -> Self {
        self.state.lock().failure = Some(MediaError::NoDeviceFound);
        self
    }

    /// Primitives refuse every remote offer and answer
    pub fn reject_remote_descriptions(self) -> Self {
        self.state.lock().reject_remote_payloads = true;
        self
    }

    /// The next capture request suspends until the returned gate is resolved.
    pub fn permission_gate(&self) -> PermissionGate {
        let (tx, rx) = oneshot::channel();
        self.state.lock().gate = Some(rx);
        PermissionGate { tx }
    }

    pub fn acquired_count(&self) -> usize {
        self.state.lock().acquired.len()
    }

    pub fn release_count(&self, handle_id: &str) -> usize {
        self.state
            .lock()
            .releases
            .get(handle_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_releases(&self) -> usize {
        self.state.lock().releases.values().sum()
    }

    pub fn primitives(&self) -> Vec<Arc<SimulatedPrimitive>> {
        self.state.lock().primitives.clone()
    }

    pub fn last_primitive(&self) -> Option<Arc<SimulatedPrimitive>> {
        self.state.lock().primitives.last().cloned()
    }
}

#[async_trait(?Send)]
impl MediaAdapter for SimulatedMedia {
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<MediaHandle, MediaError> {
        let gate = self.state.lock().gate.take();
        if let Some(rx) = gate {
            // A dropped gate counts as the prompt being dismissed.
            if !rx.await.unwrap_or(false) {
                return Err(MediaError::PermissionDenied);
            }
        }

        let mut state = self.state.lock();
        if let Some(err) = state.failure.clone() {
            return Err(err);
        }
        let handle = MediaHandle::new(kind, format!("local-stream@{}", self.label));
        state.acquired.push(handle.id().to_string());
        Ok(handle)
    }

    fn create_negotiation_primitive(
        &self,
        local: &MediaHandle,
        events: MediaEventSink,
    ) -> Result<Arc<dyn NegotiationPrimitive>, MediaError> {
        let mut state = self.state.lock();
        let primitive = Arc::new(SimulatedPrimitive {
            label: self.label.clone(),
            kind: local.kind(),
            local_candidates: self.local_candidates,
            reject_remote_payloads: state.reject_remote_payloads,
            events,
            state: Mutex::new(PrimitiveState::default()),
        });
        state.primitives.push(Arc::clone(&primitive));
        Ok(primitive)
    }

    fn release_media(&self, handle: &MediaHandle) {
        *self
            .state
            .lock()
            .releases
            .entry(handle.id().to_string())
            .or_insert(0) += 1;
    }
}

#[derive(Default)]
struct PrimitiveState {
    ops: Vec<PrimitiveOp>,
    local_description: bool,
    remote_description: bool,
    remote_announced: bool,
    closed: bool,
}

/// Simulated [`NegotiationPrimitive`]
pub struct SimulatedPrimitive {
    label: String,
    kind: MediaKind,
    local_candidates: usize,
    reject_remote_payloads: bool,
    events: MediaEventSink,
    state: Mutex<PrimitiveState>,
}

impl SimulatedPrimitive {
    pub fn ops(&self) -> Vec<PrimitiveOp> {
        self.state.lock().ops.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                PrimitiveOp::AppliedCandidate(c) => Some(c.as_str().to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matcher: fn(&PrimitiveOp) -> bool) -> usize {
        self.state.lock().ops.iter().filter(|op| matcher(op)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_open(state: &PrimitiveState) -> Result<(), MediaError> {
        if state.closed {
            return Err(MediaError::Negotiation("primitive closed".to_string()));
        }
        Ok(())
    }

    fn check_payload(&self, payload: &SessionDescription) -> Result<(), MediaError> {
        if self.reject_remote_payloads || payload.as_str().starts_with("bad") {
            return Err(MediaError::Negotiation(format!(
                "unusable session description: {}",
                payload.as_str()
            )));
        }
        Ok(())
    }

    fn gather_candidates(&self) {
        for i in 0..self.local_candidates {
            self.events
                .local_candidate(IceCandidate::new(format!("{}-cand-{}", self.label, i)));
        }
    }

    fn announce_remote_media(&self, state: &mut PrimitiveState) {
        if state.local_description && state.remote_description && !state.remote_announced {
            state.remote_announced = true;
            self.events.remote_media(MediaHandle::new(
                self.kind,
                format!("remote-stream@{}", self.label),
            ));
        }
    }
}

#[async_trait(?Send)]
impl NegotiationPrimitive for SimulatedPrimitive {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = SessionDescription::new(format!("offer:{}", self.label));
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            state.local_description = true;
            state.ops.push(PrimitiveOp::CreatedOffer(offer.clone()));
        }
        self.gather_candidates();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = SessionDescription::new(format!("answer:{}", self.label));
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            if !state.remote_description {
                return Err(MediaError::Negotiation(
                    "answer requested before an offer was applied".to_string(),
                ));
            }
            state.local_description = true;
            state.ops.push(PrimitiveOp::CreatedAnswer(answer.clone()));
            self.announce_remote_media(&mut state);
        }
        self.gather_candidates();
        Ok(answer)
    }

    async fn apply_remote_offer(&self, offer: &SessionDescription) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        self.check_payload(offer)?;
        state.remote_description = true;
        state.ops.push(PrimitiveOp::AppliedOffer(offer.clone()));
        Ok(())
    }

    async fn apply_remote_answer(&self, answer: &SessionDescription) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if !state.local_description {
            return Err(MediaError::Negotiation(
                "answer applied without a local offer".to_string(),
            ));
        }
        self.check_payload(answer)?;
        state.remote_description = true;
        state.ops.push(PrimitiveOp::AppliedAnswer(answer.clone()));
        self.announce_remote_media(&mut state);
        Ok(())
    }

    async fn apply_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if !state.remote_description {
            return Err(MediaError::Negotiation(
                "candidate applied before the remote description".to_string(),
            ));
        }
        if candidate.as_str().starts_with("bad") {
            return Err(MediaError::Negotiation(format!(
                "unusable candidate: {}",
                candidate.as_str()
            )));
        }
        state.ops.push(PrimitiveOp::AppliedCandidate(candidate.clone()));
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.ops.push(PrimitiveOp::Closed);
        }
    }
}
