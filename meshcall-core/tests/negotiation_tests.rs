//! Peer registries negotiating against each other over the loopback hub

use meshcall_core::loopback::{LoopbackHub, LoopbackPeerFactory, LoopbackSignaling};
use meshcall_core::{
    CallId, IceCandidate, IgnoreReason, LocalMediaStream, MediaTrack, NegotiationOutcome,
    ParticipantId, PeerRegistry, SignalingEvent, SignalingHandler, SignalingState, TrackSource,
    TransportEvent,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Side {
    id: ParticipantId,
    registry: PeerRegistry<LoopbackSignaling>,
    signaling: Arc<SignalingHandler<LoopbackSignaling>>,
    factory: LoopbackPeerFactory,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    _stream: LocalMediaStream,
}

fn call() -> CallId {
    CallId::new("call-1")
}

fn side(hub: &LoopbackHub, name: &str) -> Side {
    let id = ParticipantId::new(name);
    let signaling = Arc::new(SignalingHandler::new(Arc::new(hub.connect(name))));
    let factory = LoopbackPeerFactory::new(name);
    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = PeerRegistry::new(
        id.clone(),
        Arc::clone(&signaling),
        Arc::new(factory.clone()),
        tx,
    );
    let stream = LocalMediaStream::new(
        format!("{name}-stream"),
        vec![
            Arc::new(MediaTrack::new(format!("{name}-mic"), "s", TrackSource::Microphone)),
            Arc::new(MediaTrack::new(format!("{name}-cam"), "s", TrackSource::Camera)),
        ],
    );
    registry.bind(call(), stream.track_refs());
    Side {
        id,
        registry,
        signaling,
        factory,
        transport_events: rx,
        _stream: stream,
    }
}

async fn next_signal(side: &Side) -> Option<SignalingEvent> {
    tokio::time::timeout(Duration::from_millis(20), side.signaling.receive_message())
        .await
        .ok()
        .and_then(Result::ok)
}

async fn apply(side: &mut Side, event: SignalingEvent) -> Option<NegotiationOutcome> {
    let result = match event {
        SignalingEvent::Offer {
            call_id,
            from_user_id,
            sdp,
        } => {
            side.registry
                .handle_inbound_offer(&from_user_id, sdp, &call_id)
                .await
        }
        SignalingEvent::Answer {
            call_id,
            from_user_id,
            sdp,
        } => {
            side.registry
                .handle_inbound_answer(&from_user_id, sdp, &call_id)
                .await
        }
        SignalingEvent::IceCandidate {
            call_id,
            from_user_id,
            candidate,
        } => {
            side.registry
                .handle_inbound_candidate(&from_user_id, candidate, &call_id)
                .await
        }
        _ => return None,
    };
    Some(result.unwrap())
}

/// Drain one side's transport callbacks and signaling inbox
async fn step(side: &mut Side) -> bool {
    let mut progressed = false;
    while let Ok(event) = side.transport_events.try_recv() {
        side.registry.handle_transport_event(event).await;
        progressed = true;
    }
    while let Some(event) = next_signal(side).await {
        apply(side, event).await;
        progressed = true;
    }
    progressed
}

async fn settle(a: &mut Side, b: &mut Side) {
    for _ in 0..50 {
        let moved_a = step(a).await;
        let moved_b = step(b).await;
        if !moved_a && !moved_b {
            return;
        }
    }
    panic!("negotiation did not settle");
}

async fn glare(alice_first: bool) -> (Side, Side) {
    let hub = LoopbackHub::new();
    let mut alice = side(&hub, "alice");
    let mut bob = side(&hub, "bob");

    assert_eq!(
        alice.registry.create_offer(&bob.id).await.unwrap(),
        NegotiationOutcome::OfferSent
    );
    assert_eq!(
        bob.registry.create_offer(&alice.id).await.unwrap(),
        NegotiationOutcome::OfferSent
    );

    let to_alice = next_signal(&alice).await.unwrap();
    let to_bob = next_signal(&bob).await.unwrap();
    let (alice_outcome, bob_outcome) = if alice_first {
        let a = apply(&mut alice, to_alice).await;
        let b = apply(&mut bob, to_bob).await;
        (a, b)
    } else {
        let b = apply(&mut bob, to_bob).await;
        let a = apply(&mut alice, to_alice).await;
        (a, b)
    };
    // "alice" sorts lower and yields; "bob" keeps its offer.
    assert_eq!(alice_outcome, Some(NegotiationOutcome::GlareYielded));
    assert_eq!(
        bob_outcome,
        Some(NegotiationOutcome::Ignored(IgnoreReason::GlareHeld))
    );

    settle(&mut alice, &mut bob).await;
    (alice, bob)
}

#[tokio::test]
async fn test_glare_converges_on_single_link() {
    let (alice, bob) = glare(true).await;

    assert_eq!(
        alice.registry.link_states(),
        vec![(bob.id.clone(), SignalingState::Stable)]
    );
    assert_eq!(
        bob.registry.link_states(),
        vec![(alice.id.clone(), SignalingState::Stable)]
    );
    assert!(alice.registry.link(&bob.id).unwrap().is_established());
    assert!(bob.registry.link(&alice.id).unwrap().is_established());

    // Only the yielding side rebuilt its connection.
    assert_eq!(alice.factory.created_count(&bob.id), 2);
    assert_eq!(bob.factory.created_count(&alice.id), 1);
    assert!(alice.factory.is_connected(&bob.id));
    assert!(bob.factory.is_connected(&alice.id));
}

#[tokio::test]
async fn test_glare_winner_independent_of_delivery_order() {
    let (alice, bob) = glare(false).await;

    assert_eq!(alice.factory.created_count(&bob.id), 2);
    assert_eq!(bob.factory.created_count(&alice.id), 1);
    assert!(alice.factory.is_connected(&bob.id));
    assert!(bob.factory.is_connected(&alice.id));
}

#[tokio::test]
async fn test_plain_offer_answer_connects() {
    let hub = LoopbackHub::new();
    let mut alice = side(&hub, "alice");
    let mut bob = side(&hub, "bob");

    alice.registry.create_offer(&bob.id).await.unwrap();
    let offer = next_signal(&bob).await.unwrap();
    assert_eq!(
        apply(&mut bob, offer).await,
        Some(NegotiationOutcome::AnswerSent)
    );
    let answer = next_signal(&alice).await.unwrap();
    assert_eq!(
        apply(&mut alice, answer).await,
        Some(NegotiationOutcome::Established)
    );
    settle(&mut alice, &mut bob).await;

    assert!(alice.factory.is_connected(&bob.id));
    assert!(bob.factory.is_connected(&alice.id));
    assert_eq!(alice.factory.created_count(&bob.id), 1);
    assert_eq!(
        alice.registry.create_offer(&bob.id).await.unwrap(),
        NegotiationOutcome::Ignored(IgnoreReason::AlreadyConnected)
    );
}

#[tokio::test]
async fn test_late_messages_after_teardown_are_ignored() {
    let hub = LoopbackHub::new();
    let mut alice = side(&hub, "alice");
    let mut bob = side(&hub, "bob");

    alice.registry.create_offer(&bob.id).await.unwrap();
    let offer = next_signal(&bob).await.unwrap();
    apply(&mut bob, offer).await;

    // Alice hangs up before bob's answer arrives.
    alice.registry.close_all().await;
    let answer = next_signal(&alice).await.unwrap();
    let SignalingEvent::Answer {
        call_id,
        from_user_id,
        sdp,
    } = answer
    else {
        panic!("expected an answer");
    };
    assert_eq!(
        alice
            .registry
            .handle_inbound_answer(&from_user_id, sdp, &call_id)
            .await
            .unwrap(),
        NegotiationOutcome::Ignored(IgnoreReason::StaleCall)
    );
    assert_eq!(
        alice
            .registry
            .handle_inbound_candidate(&bob.id, IceCandidate::new("candidate:1"), &call())
            .await
            .unwrap(),
        NegotiationOutcome::Ignored(IgnoreReason::StaleCall)
    );
    assert!(alice.registry.is_empty());
    assert_eq!(alice.registry.pending_candidates(&bob.id), 0);
}

fn remote_sdp(owner: &str) -> String {
    format!("v=0\r\no=- 7 1 IN IP4 127.0.0.1\r\ns={owner}\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:{owner} {owner}-mic\r\n")
}

fn candidates(from: usize, count: usize) -> Vec<IceCandidate> {
    (from..from + count)
        .map(|n| IceCandidate::new(format!("candidate:{n} 1 udp 100 10.0.0.{n} 5000 typ host")))
        .collect()
}

#[tokio::test]
async fn test_glare_yield_carries_queued_candidates_over() {
    let hub = LoopbackHub::new();
    let _bob = hub.connect("bob");
    let mut alice = side(&hub, "alice");
    let bob = ParticipantId::new("bob");

    alice.registry.create_offer(&bob).await.unwrap();
    for candidate in candidates(0, 3) {
        let outcome = alice
            .registry
            .handle_inbound_candidate(&bob, candidate, &call())
            .await
            .unwrap();
        assert_eq!(outcome, NegotiationOutcome::CandidateQueued);
    }
    assert_eq!(alice.registry.pending_candidates(&bob), 3);

    let outcome = alice
        .registry
        .handle_inbound_offer(&bob, remote_sdp("bob"), &call())
        .await
        .unwrap();
    assert_eq!(outcome, NegotiationOutcome::GlareYielded);
    assert_eq!(alice.factory.created_count(&bob), 2);
    assert_eq!(alice.factory.applied_candidates(&bob), candidates(0, 3));
    assert_eq!(alice.registry.pending_candidates(&bob), 0);
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn prop_answerer_applies_candidates_in_arrival_order(before in 0usize..8, after in 0usize..8) {
        let applied = runtime().block_on(async {
            let hub = LoopbackHub::new();
            let _alice = hub.connect("alice");
            let mut bob = side(&hub, "bob");
            let alice = ParticipantId::new("alice");

            for candidate in candidates(0, before) {
                let outcome = bob
                    .registry
                    .handle_inbound_candidate(&alice, candidate, &call())
                    .await
                    .unwrap();
                assert_eq!(outcome, NegotiationOutcome::CandidateQueued);
            }
            let outcome = bob
                .registry
                .handle_inbound_offer(&alice, remote_sdp("alice"), &call())
                .await
                .unwrap();
            assert_eq!(outcome, NegotiationOutcome::AnswerSent);
            for candidate in candidates(before, after) {
                let outcome = bob
                    .registry
                    .handle_inbound_candidate(&alice, candidate, &call())
                    .await
                    .unwrap();
                assert_eq!(outcome, NegotiationOutcome::CandidateApplied);
            }
            assert_eq!(bob.registry.pending_candidates(&alice), 0);
            bob.factory.applied_candidates(&alice)
        });
        prop_assert_eq!(applied, candidates(0, before + after));
    }

    #[test]
    fn prop_offerer_holds_candidates_until_answer(early in 0usize..8, late in 0usize..8) {
        let applied = runtime().block_on(async {
            let hub = LoopbackHub::new();
            let _alice = hub.connect("alice");
            let mut bob = side(&hub, "bob");
            let alice = ParticipantId::new("alice");

            bob.registry.create_offer(&alice).await.unwrap();
            for candidate in candidates(0, early) {
                bob.registry
                    .handle_inbound_candidate(&alice, candidate, &call())
                    .await
                    .unwrap();
            }
            assert_eq!(bob.registry.pending_candidates(&alice), early);
            assert!(bob.factory.applied_candidates(&alice).is_empty());

            let answer = remote_sdp("alice");
            let outcome = bob
                .registry
                .handle_inbound_answer(&alice, answer, &call())
                .await
                .unwrap();
            assert_eq!(outcome, NegotiationOutcome::Established);
            for candidate in candidates(early, late) {
                bob.registry
                    .handle_inbound_candidate(&alice, candidate, &call())
                    .await
                    .unwrap();
            }
            bob.factory.applied_candidates(&alice)
        });
        prop_assert_eq!(applied, candidates(0, early + late));
    }
}
