//! Media capability contract
//!
//! The call engine never touches audio itself. It asks a [`MediaAdapter`] for a
//! local capture source, builds a [`NegotiationPrimitive`] around it, and feeds
//! the primitive the remote side's descriptions and candidates. Whatever the
//! primitive produces asynchronously (local candidates, remote media, fatal
//! failures) comes back through a [`MediaEventSink`].
//!
//! Browser deployments realize this with `getUserMedia` + `RTCPeerConnection`;
//! tests and the desktop simulator use [`simulated`].

#[cfg(any(test, feature = "test-utils"))]
pub mod simulated;

use crate::call::SessionId;
use crate::signal::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// What to capture locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKind {
    #[default]
    Audio,
    AudioVideo,
}

impl MediaKind {
    pub fn has_video(&self) -> bool {
        matches!(self, MediaKind::AudioVideo)
    }
}

/// Errors raised by the media platform
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Media permission denied")]
    PermissionDenied,
    #[error("No capture device found")]
    NoDeviceFound,
    #[error("Negotiation rejected: {0}")]
    Negotiation(String),
    #[error("Media unavailable: {0}")]
    Unavailable(String),
}

/// Opaque, cheaply clonable reference to a captured or received media source.
///
/// The resource behind it belongs to the adapter that created it; the engine
/// only hands handles to the UI and back to [`MediaAdapter::release_media`].
#[derive(Clone)]
pub struct MediaHandle {
    id: String,
    kind: MediaKind,
    resource: Arc<dyn Any>,
}

impl MediaHandle {
    pub fn new<R: Any>(kind: MediaKind, resource: R) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            resource: Arc::new(resource),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Borrow the platform resource if it is of type `R`
    pub fn resource<R: Any>(&self) -> Option<&R> {
        self.resource.downcast_ref::<R>()
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for MediaHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Asynchronous output of a negotiation primitive
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A locally gathered candidate; the engine forwards it to the remote party
    /// as soon as it is seen.
    LocalCandidate(IceCandidate),
    /// The remote party's media became renderable
    RemoteMedia(MediaHandle),
    /// The primitive failed in a way the call cannot recover from
    Failed(String),
}

/// Where a primitive reports its [`MediaEvent`]s.
///
/// Each sink is tagged with the session it was created for, so events from a
/// primitive that outlives its call are recognised as stale and ignored.
#[derive(Clone)]
pub struct MediaEventSink {
    session: SessionId,
    tx: UnboundedSender<(SessionId, MediaEvent)>,
}

impl MediaEventSink {
    pub(crate) fn new(session: SessionId, tx: UnboundedSender<(SessionId, MediaEvent)>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(MediaEvent::LocalCandidate(candidate));
    }

    pub fn remote_media(&self, handle: MediaHandle) {
        self.emit(MediaEvent::RemoteMedia(handle));
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.emit(MediaEvent::Failed(reason.into()));
    }

    fn emit(&self, event: MediaEvent) {
        if self.tx.unbounded_send((self.session, event)).is_err() {
            tracing::debug!("Media event for session {} dropped: engine gone", self.session);
        }
    }
}

impl fmt::Debug for MediaEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaEventSink")
            .field("session", &self.session)
            .finish()
    }
}

/// The platform object that exchanges session descriptions and discovers a
/// network path for one call.
#[async_trait(?Send)]
pub trait NegotiationPrimitive {
    /// Produce a local offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Produce a local answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn apply_remote_offer(&self, offer: &SessionDescription) -> Result<(), MediaError>;

    async fn apply_remote_answer(&self, answer: &SessionDescription) -> Result<(), MediaError>;

    async fn apply_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Tear the primitive down. Calling it again must be harmless.
    fn close(&self);
}

/// Local capture and negotiation factory provided by the platform
#[async_trait(?Send)]
pub trait MediaAdapter {
    /// Acquire a local source. May suspend on a user permission prompt.
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<MediaHandle, MediaError>;

    /// Build a primitive that sends `local` and reports through `events`.
    fn create_negotiation_primitive(
        &self,
        local: &MediaHandle,
        events: MediaEventSink,
    ) -> Result<Arc<dyn NegotiationPrimitive>, MediaError>;

    /// Stop capture. Must be a no-op for a handle that was already released.
    fn release_media(&self, handle: &MediaHandle);
}
