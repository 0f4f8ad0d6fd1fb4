//! Signal Transport: outbound half of the signaling channel
//!
//! Implementations are bound to the logged-in user, so every send names only
//! the recipient. The inbound half is push-based and arrives as
//! [`InboundSignal`](super::InboundSignal) values on whatever stream the
//! platform provides.

use super::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while relaying a signal or chat request
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Rejected by service: {0}")]
    Rejected(String),

    #[error("Not connected to the chat service")]
    NotConnected,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Outbound signaling, one method per signal kind.
///
/// The host is single-threaded, so futures are not required to be `Send`.
#[async_trait(?Send)]
pub trait SignalTransport {
    /// Ask `remote` to ring
    async fn send_initiate_call(&self, remote: &str) -> Result<(), TransportError>;

    async fn send_offer(
        &self,
        remote: &str,
        offer: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn send_answer(
        &self,
        remote: &str,
        answer: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn send_candidate(
        &self,
        remote: &str,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError>;

    async fn send_call_end(&self, remote: &str) -> Result<(), TransportError>;
}
