// Events the call engine reports to the UI layer

use super::error::CallErrorKind;
use super::session::CallStatus;
use crate::media::MediaHandle;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Someone is ringing us; answer with `accept_call` or `reject_call`
    IncomingCall { from: String },
    StateChanged { status: CallStatus, remote: String },
    /// Local capture is ready to be rendered (self-view)
    LocalMediaReady(MediaHandle),
    /// The remote party's media is ready to be rendered
    RemoteMediaReady(MediaHandle),
    /// User-visible failure reason
    Error { kind: CallErrorKind, message: String },
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEvent::IncomingCall { from } => write!(f, "IncomingCall {{ from: {} }}", from),
            CallEvent::StateChanged { status, remote } => {
                write!(f, "StateChanged {{ status: {}, remote: {} }}", status, remote)
            }
            CallEvent::LocalMediaReady(handle) => {
                write!(f, "LocalMediaReady {{ handle: {} }}", handle.id())
            }
            CallEvent::RemoteMediaReady(handle) => {
                write!(f, "RemoteMediaReady {{ handle: {} }}", handle.id())
            }
            CallEvent::Error { kind, message } => {
                write!(f, "Error {{ kind: {}, message: {} }}", kind, message)
            }
        }
    }
}
