// Parley Core: call negotiation and chat session plumbing
//
// Everything the browser client needs that is not DOM: the signal vocabulary
// relayed through the chat service, the capability traits the platform
// provides (signal transport, media capture, peer negotiation), the single-call
// negotiation state machine, and the chat session manager that sits next to it.

pub mod call;
pub mod chat;
pub mod config;
pub mod media;
pub mod relay;
pub mod signal;

mod events;

pub use call::{
    CallEngine, CallError, CallErrorKind, CallEvent, CallRole, CallSnapshot, CallStatus,
    SessionId,
};
pub use chat::{
    ChatError, ChatEvent, ChatMessage, ChatNotification, ChatService, ChatSession,
    ConversationKey, MessageContent, StoredMessage, VoiceNote,
};
pub use config::{CallConfig, ChatConfig, ClientConfig, IceServerConfig};
pub use media::{
    MediaAdapter, MediaError, MediaEvent, MediaEventSink, MediaHandle, MediaKind,
    NegotiationPrimitive,
};
pub use relay::{LoopbackChatService, LoopbackRelay, LoopbackTransport, RelayInbox, RelayStats};
pub use signal::{
    IceCandidate, InboundSignal, SessionDescription, Signal, SignalKind, SignalTransport,
    TransportError,
};
