//! Call signaling vocabulary and the transport that relays it
//!
//! Signals travel through the chat service's RPC channel: the service pushes
//! them to the addressed user in the order they were sent.

pub mod transport;
pub mod types;

pub use transport::{SignalTransport, TransportError};
pub use types::{IceCandidate, InboundSignal, SessionDescription, Signal, SignalKind};
