// Signal buffer: remote signals that arrived before we could use them
//
// Holds at most one remote offer and a bounded FIFO of remote candidates.
// Draining hands candidates out in arrival order; anything that arrives while
// a drain is in progress queues behind what is already there. Once the drain
// finds the queue empty the buffer is sealed and refuses further input.

use crate::signal::{IceCandidate, SessionDescription};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer already drained")]
    Sealed,
    #[error("candidate buffer full ({0} pending)")]
    Full(usize),
    #[error("an offer is already pending")]
    DuplicateOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Collecting,
    Draining,
    Sealed,
}

#[derive(Debug)]
pub struct SignalBuffer {
    pending_offer: Option<SessionDescription>,
    candidates: VecDeque<IceCandidate>,
    capacity: usize,
    state: BufferState,
}

impl SignalBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending_offer: None,
            candidates: VecDeque::new(),
            capacity,
            state: BufferState::Collecting,
        }
    }

    pub fn buffer_offer(&mut self, offer: SessionDescription) -> Result<(), BufferError> {
        if self.state == BufferState::Sealed {
            return Err(BufferError::Sealed);
        }
        if self.pending_offer.is_some() {
            return Err(BufferError::DuplicateOffer);
        }
        self.pending_offer = Some(offer);
        Ok(())
    }

    pub fn push_candidate(&mut self, candidate: IceCandidate) -> Result<(), BufferError> {
        if self.state == BufferState::Sealed {
            return Err(BufferError::Sealed);
        }
        if self.candidates.len() >= self.capacity {
            return Err(BufferError::Full(self.candidates.len()));
        }
        self.candidates.push_back(candidate);
        Ok(())
    }

    pub fn take_offer(&mut self) -> Option<SessionDescription> {
        self.pending_offer.take()
    }

    pub fn begin_drain(&mut self) {
        if self.state == BufferState::Collecting {
            self.state = BufferState::Draining;
        }
    }

    /// Next candidate in arrival order. Returns `None` and seals the buffer
    /// once the queue is empty.
    pub fn next_candidate(&mut self) -> Option<IceCandidate> {
        let next = self.candidates.pop_front();
        if next.is_none() && self.state == BufferState::Draining {
            self.state = BufferState::Sealed;
        }
        next
    }

    /// Drop everything and refuse further input
    pub fn clear(&mut self) {
        self.pending_offer = None;
        self.candidates.clear();
        self.state = BufferState::Sealed;
    }

    pub fn has_pending_offer(&self) -> bool {
        self.pending_offer.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_sealed(&self) -> bool {
        self.state == BufferState::Sealed
    }

    pub fn is_draining(&self) -> bool {
        self.state == BufferState::Draining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> IceCandidate {
        IceCandidate::new(s)
    }

    #[test]
    fn test_drain_preserves_arrival_order() {
        let mut buf = SignalBuffer::new(8);
        buf.push_candidate(c("c1")).unwrap();
        buf.push_candidate(c("c2")).unwrap();

        buf.begin_drain();
        assert_eq!(buf.next_candidate(), Some(c("c1")));
        // Arrives mid-drain: queues behind c2.
        buf.push_candidate(c("c3")).unwrap();
        assert_eq!(buf.next_candidate(), Some(c("c2")));
        assert_eq!(buf.next_candidate(), Some(c("c3")));
        assert_eq!(buf.next_candidate(), None);
        assert!(buf.is_sealed());
    }

    #[test]
    fn test_sealed_buffer_refuses_input() {
        let mut buf = SignalBuffer::new(8);
        buf.begin_drain();
        assert_eq!(buf.next_candidate(), None);

        assert_eq!(buf.push_candidate(c("late")), Err(BufferError::Sealed));
        assert_eq!(
            buf.buffer_offer(SessionDescription::new("o")),
            Err(BufferError::Sealed)
        );
    }

    #[test]
    fn test_next_candidate_while_collecting_does_not_seal() {
        let mut buf = SignalBuffer::new(8);
        assert_eq!(buf.next_candidate(), None);
        assert!(!buf.is_sealed());
        buf.push_candidate(c("c1")).unwrap();
    }

    #[test]
    fn test_capacity_bound() {
        let mut buf = SignalBuffer::new(2);
        buf.push_candidate(c("c1")).unwrap();
        buf.push_candidate(c("c2")).unwrap();
        assert_eq!(buf.push_candidate(c("c3")), Err(BufferError::Full(2)));
        assert_eq!(buf.pending_candidates(), 2);
    }

    #[test]
    fn test_single_pending_offer() {
        let mut buf = SignalBuffer::new(2);
        buf.buffer_offer(SessionDescription::new("first")).unwrap();
        assert_eq!(
            buf.buffer_offer(SessionDescription::new("second")),
            Err(BufferError::DuplicateOffer)
        );
        assert_eq!(buf.take_offer(), Some(SessionDescription::new("first")));
        assert!(!buf.has_pending_offer());
    }

    #[test]
    fn test_clear_empties_and_seals() {
        let mut buf = SignalBuffer::new(4);
        buf.buffer_offer(SessionDescription::new("o")).unwrap();
        buf.push_candidate(c("c1")).unwrap();
        buf.clear();
        assert!(!buf.has_pending_offer());
        assert_eq!(buf.pending_candidates(), 0);
        assert!(buf.is_sealed());
    }
}
