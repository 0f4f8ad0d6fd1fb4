// Call errors and the kinds surfaced to the UI

use super::buffer::BufferError;
use crate::media::MediaError;
use crate::signal::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("Media permission denied")]
    PermissionDenied,
    #[error("No capture device found")]
    NoDeviceFound,
    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),
}

/// Payload-free error category, as reported through `CallEvent::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallErrorKind {
    PermissionDenied,
    NoDeviceFound,
    NegotiationFailure,
    ProtocolViolation,
    RemoteUnavailable,
}

impl CallError {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            CallError::PermissionDenied => CallErrorKind::PermissionDenied,
            CallError::NoDeviceFound => CallErrorKind::NoDeviceFound,
            CallError::NegotiationFailure(_) => CallErrorKind::NegotiationFailure,
            CallError::ProtocolViolation(_) => CallErrorKind::ProtocolViolation,
            CallError::RemoteUnavailable(_) => CallErrorKind::RemoteUnavailable,
        }
    }

    pub(crate) fn busy(remote: &str) -> Self {
        CallError::ProtocolViolation(format!("busy: a call with {} is in progress", remote))
    }

    pub(crate) fn cancelled() -> Self {
        CallError::ProtocolViolation("call ended before setup completed".to_string())
    }
}

impl fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallErrorKind::PermissionDenied => write!(f, "permission-denied"),
            CallErrorKind::NoDeviceFound => write!(f, "no-device-found"),
            CallErrorKind::NegotiationFailure => write!(f, "negotiation-failure"),
            CallErrorKind::ProtocolViolation => write!(f, "protocol-violation"),
            CallErrorKind::RemoteUnavailable => write!(f, "remote-unavailable"),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied => CallError::PermissionDenied,
            MediaError::NoDeviceFound => CallError::NoDeviceFound,
            // No media API at all (insecure context, headless host) looks the
            // same to the user as having no device.
            MediaError::Unavailable(_) => CallError::NoDeviceFound,
            MediaError::Negotiation(reason) => CallError::NegotiationFailure(reason),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        CallError::RemoteUnavailable(err.to_string())
    }
}

impl From<BufferError> for CallError {
    fn from(err: BufferError) -> Self {
        CallError::ProtocolViolation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_errors_map_to_call_errors() {
        assert_eq!(
            CallError::from(MediaError::PermissionDenied),
            CallError::PermissionDenied
        );
        assert_eq!(
            CallError::from(MediaError::Unavailable("no mediaDevices".into())).kind(),
            CallErrorKind::NoDeviceFound
        );
        assert_eq!(
            CallError::from(MediaError::Negotiation("bad sdp".into())),
            CallError::NegotiationFailure("bad sdp".into())
        );
    }

    #[test]
    fn test_transport_error_is_remote_unavailable() {
        let err = CallError::from(TransportError::RemoteUnavailable("bob".into()));
        assert_eq!(err.kind(), CallErrorKind::RemoteUnavailable);
    }

    #[test]
    fn test_buffer_error_is_protocol_violation() {
        let err = CallError::from(BufferError::Full(64));
        assert_eq!(err.kind(), CallErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(CallErrorKind::PermissionDenied.to_string(), "permission-denied");
        assert_eq!(CallErrorKind::RemoteUnavailable.to_string(), "remote-unavailable");
    }
}
