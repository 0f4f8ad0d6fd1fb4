//! Ordering independence of callee negotiation
//!
//! The caller's incoming-call notice always arrives first. After it, whatever
//! the interleaving of the user's accept with the caller's offer and
//! candidates, the callee ends up Active with the offer applied once, one
//! answer sent, and every candidate applied exactly once in arrival order.

use futures::executor::block_on;
use parley_core::media::simulated::{PrimitiveOp, SimulatedMedia};
use parley_core::{
    CallConfig, CallEngine, CallStatus, IceCandidate, InboundSignal, LoopbackRelay,
    SessionDescription, Signal,
};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Accept,
    Offer,
    Candidate(&'static str),
}

fn all_steps() -> Vec<Step> {
    vec![
        Step::Accept,
        Step::Offer,
        Step::Candidate("c1"),
        Step::Candidate("c2"),
        Step::Candidate("c3"),
    ]
}

struct Outcome {
    status: CallStatus,
    offers_applied: usize,
    answers_sent: usize,
    applied: Vec<String>,
    pending: usize,
}

fn run_callee(steps: &[Step]) -> Outcome {
    block_on(async {
        let relay = LoopbackRelay::new();
        let mut alice = relay.register("alice");
        let _bob_inbox = relay.register("bob");
        let media = SimulatedMedia::new("bob");
        let bob = CallEngine::new(
            Arc::new(relay.transport("bob")),
            Arc::new(media.clone()),
            CallConfig::default(),
        );

        bob.handle_signal(InboundSignal::new("alice", Signal::IncomingCall))
            .await;

        for step in steps {
            match step {
                Step::Accept => {
                    bob.accept_call("bob", "alice").await.unwrap();
                }
                Step::Offer => {
                    bob.handle_signal(InboundSignal::new(
                        "alice",
                        Signal::Offer(SessionDescription::new("offer:alice")),
                    ))
                    .await;
                }
                Step::Candidate(c) => {
                    bob.handle_signal(InboundSignal::new(
                        "alice",
                        Signal::IceCandidate(IceCandidate::new(*c)),
                    ))
                    .await;
                }
            }
        }

        let primitive = media.last_primitive().unwrap();
        let answers_sent = std::iter::from_fn(|| alice.signals.try_next().ok().flatten())
            .filter(|s| matches!(s.signal, Signal::Answer(_)))
            .count();
        let snapshot = bob.snapshot().unwrap();

        Outcome {
            status: snapshot.status,
            offers_applied: primitive.count(|op| matches!(op, PrimitiveOp::AppliedOffer(_))),
            answers_sent,
            applied: primitive.applied_candidates(),
            pending: snapshot.pending_candidates,
        }
    })
}

fn arrival_order(steps: &[Step]) -> Vec<String> {
    steps
        .iter()
        .filter_map(|s| match s {
            Step::Candidate(c) => Some(c.to_string()),
            _ => None,
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_any_interleaving_negotiates_identically(
        steps in Just(all_steps()).prop_shuffle(),
    ) {
        let outcome = run_callee(&steps);

        prop_assert_eq!(outcome.status, CallStatus::Active);
        prop_assert_eq!(outcome.offers_applied, 1);
        prop_assert_eq!(outcome.answers_sent, 1);
        prop_assert_eq!(outcome.applied, arrival_order(&steps));
        prop_assert_eq!(outcome.pending, 0);
    }
}

#[test]
fn test_every_accept_position_in_wire_order() {
    // Wire order is fixed (offer, then candidates); only the accept moves.
    for accept_at in 0..=4 {
        let mut steps = vec![
            Step::Offer,
            Step::Candidate("c1"),
            Step::Candidate("c2"),
            Step::Candidate("c3"),
        ];
        steps.insert(accept_at, Step::Accept);

        let outcome = run_callee(&steps);
        assert_eq!(outcome.status, CallStatus::Active, "accept at {}", accept_at);
        assert_eq!(outcome.applied, vec!["c1", "c2", "c3"]);
        assert_eq!(outcome.answers_sent, 1);
    }
}
