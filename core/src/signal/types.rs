// Signal types: what two clients exchange to set up and tear down a call

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Serialized session description (offer or answer).
///
/// The payload is whatever the negotiation primitive produced; it is passed
/// through untouched and never parsed here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(String);

impl SessionDescription {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Serialized network candidate, opaque in the same way as [`SessionDescription`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(String);

impl IceCandidate {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Names of the signals, as carried by the chat service's `signalType` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    IncomingCall,
    Offer,
    Answer,
    IceCandidate,
    CallEnd,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::IncomingCall => write!(f, "incoming-call"),
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::IceCandidate => write!(f, "ice-candidate"),
            SignalKind::CallEnd => write!(f, "call-end"),
        }
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming-call" => Ok(SignalKind::IncomingCall),
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "ice-candidate" | "candidate" => Ok(SignalKind::IceCandidate),
            "call-end" => Ok(SignalKind::CallEnd),
            other => Err(format!("unknown signal type: {}", other)),
        }
    }
}

/// A signal with its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Signal {
    /// The caller asks us to ring
    IncomingCall,
    /// Caller's session description
    Offer(SessionDescription),
    /// Callee's session description
    Answer(SessionDescription),
    /// One network candidate; many arrive per call
    IceCandidate(IceCandidate),
    /// The other side hung up
    CallEnd,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::IncomingCall => SignalKind::IncomingCall,
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::IceCandidate(_) => SignalKind::IceCandidate,
            Signal::CallEnd => SignalKind::CallEnd,
        }
    }

    /// Rebuild a signal from the `(signalType, signalData)` pair pushed by the
    /// chat service. Payload-free kinds ignore `data`.
    pub fn from_parts(kind: SignalKind, data: impl Into<String>) -> Self {
        match kind {
            SignalKind::IncomingCall => Signal::IncomingCall,
            SignalKind::Offer => Signal::Offer(SessionDescription::new(data)),
            SignalKind::Answer => Signal::Answer(SessionDescription::new(data)),
            SignalKind::IceCandidate => Signal::IceCandidate(IceCandidate::new(data)),
            SignalKind::CallEnd => Signal::CallEnd,
        }
    }
}

/// A signal pushed to us, tagged with who sent it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundSignal {
    pub from: String,
    pub signal: Signal,
}

impl InboundSignal {
    pub fn new(from: impl Into<String>, signal: Signal) -> Self {
        Self {
            from: from.into(),
            signal,
        }
    }
}

impl fmt::Display for InboundSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.signal.kind(), self.from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_kind_display_matches_wire_names() {
        assert_eq!(SignalKind::IncomingCall.to_string(), "incoming-call");
        assert_eq!(SignalKind::Offer.to_string(), "offer");
        assert_eq!(SignalKind::Answer.to_string(), "answer");
        assert_eq!(SignalKind::IceCandidate.to_string(), "ice-candidate");
        assert_eq!(SignalKind::CallEnd.to_string(), "call-end");
    }

    #[test]
    fn test_signal_kind_parses_wire_names() {
        assert_eq!("offer".parse::<SignalKind>().unwrap(), SignalKind::Offer);
        assert_eq!("candidate".parse::<SignalKind>().unwrap(), SignalKind::IceCandidate);
        assert!("hello".parse::<SignalKind>().is_err());
    }

    #[test]
    fn test_from_parts_keeps_payload_opaque() {
        let raw = r#"{"type":"offer","sdp":"v=0\r\n"}"#;
        let signal = Signal::from_parts(SignalKind::Offer, raw);
        assert_eq!(signal, Signal::Offer(SessionDescription::new(raw)));

        let end = Signal::from_parts(SignalKind::CallEnd, "ignored");
        assert_eq!(end, Signal::CallEnd);
    }

    #[test]
    fn test_signal_json_shape() {
        let signal = Signal::IceCandidate(IceCandidate::new("candidate:1"));
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["data"], "candidate:1");

        let json = serde_json::to_value(&Signal::CallEnd).unwrap();
        assert_eq!(json["type"], "call-end");
    }

    #[test]
    fn test_inbound_display() {
        let inbound = InboundSignal::new("alice", Signal::CallEnd);
        assert_eq!(inbound.to_string(), "call-end from alice");
    }
}
