// Call session: the single call record owned by the engine

use super::buffer::SignalBuffer;
use crate::media::{MediaHandle, NegotiationPrimitive};
use crate::signal::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use web_time::Instant;

/// Identifies one call attempt. Continuations and media events carry it so
/// they can tell whether the session they belong to is still the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First uuid group is enough to tell calls apart in logs.
        let full = self.0.to_string();
        write!(f, "{}", &full[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Idle,
    AwaitingLocalMedia,
    Negotiating,
    Active,
    Ended,
}

impl CallStatus {
    fn rank(self) -> u8 {
        match self {
            CallStatus::Idle => 0,
            CallStatus::AwaitingLocalMedia => 1,
            CallStatus::Negotiating => 2,
            CallStatus::Active => 3,
            CallStatus::Ended => 4,
        }
    }

    /// Statuses only move forward; `Ended` is terminal.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_live(self) -> bool {
        self != CallStatus::Ended
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Idle => write!(f, "idle"),
            CallStatus::AwaitingLocalMedia => write!(f, "awaiting-local-media"),
            CallStatus::Negotiating => write!(f, "negotiating"),
            CallStatus::Active => write!(f, "active"),
            CallStatus::Ended => write!(f, "ended"),
        }
    }
}

/// Where the remote session description stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteDescription {
    Pending,
    Applying,
    Applied,
}

pub struct CallSession {
    id: SessionId,
    local: String,
    remote: String,
    role: CallRole,
    status: CallStatus,
    media: Option<MediaHandle>,
    primitive: Option<Arc<dyn NegotiationPrimitive>>,
    buffer: SignalBuffer,
    remote_description: RemoteDescription,
    negotiating_since: Option<Instant>,
    announced: bool,
}

impl CallSession {
    pub(crate) fn new(
        local: impl Into<String>,
        remote: impl Into<String>,
        role: CallRole,
        max_pending_candidates: usize,
    ) -> Self {
        Self {
            id: SessionId::new(),
            local: local.into(),
            remote: remote.into(),
            role,
            status: CallStatus::Idle,
            media: None,
            primitive: None,
            buffer: SignalBuffer::new(max_pending_candidates),
            remote_description: RemoteDescription::Pending,
            negotiating_since: None,
            announced: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub(crate) fn set_local(&mut self, local: &str) {
        self.local = local.to_string();
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn media(&self) -> Option<&MediaHandle> {
        self.media.as_ref()
    }

    pub fn has_primitive(&self) -> bool {
        self.primitive.is_some()
    }

    /// A callee session nobody has answered yet
    pub fn is_ringing(&self) -> bool {
        self.role == CallRole::Callee && self.status == CallStatus::Idle
    }

    /// Move to `next`. Returns false (and leaves the session untouched) for a
    /// backwards or repeated transition.
    pub(crate) fn advance(&mut self, next: CallStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub(crate) fn attach(
        &mut self,
        media: MediaHandle,
        primitive: Arc<dyn NegotiationPrimitive>,
        now: Instant,
    ) {
        self.media = Some(media);
        self.primitive = Some(primitive);
        self.negotiating_since = Some(now);
        self.advance(CallStatus::Negotiating);
    }

    pub(crate) fn primitive(&self) -> Option<Arc<dyn NegotiationPrimitive>> {
        self.primitive.clone()
    }

    pub(crate) fn remote_description(&self) -> RemoteDescription {
        self.remote_description
    }

    pub(crate) fn set_remote_description(&mut self, state: RemoteDescription) {
        self.remote_description = state;
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut SignalBuffer {
        &mut self.buffer
    }

    pub(crate) fn buffer_offer(&mut self, offer: SessionDescription) -> Result<(), super::BufferError> {
        self.buffer.buffer_offer(offer)
    }

    pub(crate) fn buffer_candidate(&mut self, candidate: IceCandidate) -> Result<(), super::BufferError> {
        self.buffer.push_candidate(candidate)
    }

    /// Remote candidates go straight to the primitive only once it exists, the
    /// remote description is in, and every buffered candidate has been applied.
    pub(crate) fn accepts_candidates_directly(&self) -> bool {
        self.primitive.is_some()
            && self.remote_description == RemoteDescription::Applied
            && self.buffer.is_sealed()
    }

    pub(crate) fn negotiating_since(&self) -> Option<Instant> {
        self.negotiating_since
    }

    pub(crate) fn mark_active(&mut self) -> bool {
        if self.advance(CallStatus::Active) {
            self.negotiating_since = None;
            true
        } else {
            false
        }
    }

    /// Returns true the first time the incoming call is announced
    pub(crate) fn announce(&mut self) -> bool {
        !std::mem::replace(&mut self.announced, true)
    }

    /// End the session and hand back whatever still needs releasing. Each
    /// resource is handed out at most once.
    pub(crate) fn teardown(
        &mut self,
    ) -> (Option<MediaHandle>, Option<Arc<dyn NegotiationPrimitive>>) {
        self.status = CallStatus::Ended;
        self.negotiating_since = None;
        self.buffer.clear();
        (self.media.take(), self.primitive.take())
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            id: self.id,
            local: self.local.clone(),
            remote: self.remote.clone(),
            role: self.role,
            status: self.status,
            has_media: self.media.is_some(),
            has_primitive: self.primitive.is_some(),
            pending_offer: self.buffer.has_pending_offer(),
            pending_candidates: self.buffer.pending_candidates(),
        }
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("status", &self.status)
            .field("has_primitive", &self.primitive.is_some())
            .finish()
    }
}

/// Read-only view of the current call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub id: SessionId,
    pub local: String,
    pub remote: String,
    pub role: CallRole,
    pub status: CallStatus,
    pub has_media: bool,
    pub has_primitive: bool,
    pub pending_offer: bool,
    pub pending_candidates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    #[test]
    fn test_status_only_moves_forward() {
        let mut session = CallSession::new("alice", "bob", CallRole::Caller, 8);
        assert!(session.advance(CallStatus::AwaitingLocalMedia));
        assert!(!session.advance(CallStatus::Idle));
        assert!(!session.advance(CallStatus::AwaitingLocalMedia));
        assert!(session.advance(CallStatus::Ended));
        assert!(!session.advance(CallStatus::Active));
        assert_eq!(session.status(), CallStatus::Ended);
    }

    #[test]
    fn test_teardown_hands_out_media_once() {
        let mut session = CallSession::new("bob", "alice", CallRole::Callee, 8);
        session.media = Some(MediaHandle::new(MediaKind::Audio, ()));

        let (media, primitive) = session.teardown();
        assert!(media.is_some());
        assert!(primitive.is_none());

        let (media, _) = session.teardown();
        assert!(media.is_none());
        assert!(!session.is_live());
    }

    #[test]
    fn test_candidates_not_direct_before_remote_description() {
        let session = CallSession::new("bob", "alice", CallRole::Callee, 8);
        assert!(!session.accepts_candidates_directly());
    }

    #[test]
    fn test_announce_once() {
        let mut session = CallSession::new("bob", "alice", CallRole::Callee, 8);
        assert!(session.is_ringing());
        assert!(session.announce());
        assert!(!session.announce());
    }

    #[test]
    fn test_snapshot_reflects_buffer() {
        let mut session = CallSession::new("bob", "alice", CallRole::Callee, 8);
        session.buffer_offer(SessionDescription::new("offer")).unwrap();
        session.buffer_candidate(IceCandidate::new("c1")).unwrap();

        let snap = session.snapshot();
        assert!(snap.pending_offer);
        assert_eq!(snap.pending_candidates, 1);
        assert_eq!(snap.status, CallStatus::Idle);
        assert!(!snap.has_media);
    }

    #[test]
    fn test_session_id_display_is_short() {
        assert_eq!(SessionId::new().to_string().len(), 8);
    }
}
