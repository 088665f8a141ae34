use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::*;

struct StubMedia {
    closed: AtomicBool,
}

impl StubMedia {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MediaSession for StubMedia {
    async fn acquire_media(&self, _is_video: bool) -> Result<()> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        Ok("offer-sdp".to_string())
    }

    async fn create_answer(&self, _remote_offer: &str) -> Result<String> {
        Ok("answer-sdp".to_string())
    }

    async fn apply_remote_answer(&self, _sdp: &str) -> Result<()> {
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct RecordingOutbound {
    frames: Mutex<Vec<ClientFrame>>,
}

impl RecordingOutbound {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
        })
    }

    async fn frames(&self) -> Vec<ClientFrame> {
        self.frames.lock().await.clone()
    }
}

#[async_trait]
impl SignalingOutbound for RecordingOutbound {
    async fn relay(&self, frame: ClientFrame) -> Result<()> {
        self.frames.lock().await.push(frame);
        Ok(())
    }
}

fn coordinator_with(
    media: Arc<StubMedia>,
    outbound: Arc<RecordingOutbound>,
    ring_timeout: Duration,
) -> Arc<CallCoordinator> {
    CallCoordinator::new(media, outbound, ring_timeout)
}

fn assert_invalid_call_state(err: anyhow::Error, expected_operation: &str) {
    match err.downcast_ref::<CoreError>() {
        Some(CoreError::InvalidCallState { operation, .. }) => {
            assert_eq!(*operation, expected_operation);
        }
        other => panic!("expected InvalidCallState, got {other:?}"),
    }
}

#[tokio::test]
async fn caller_reaches_connected_through_offer_and_answer() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, Arc::clone(&outbound), DEFAULT_RING_TIMEOUT);

    let call_id = call
        .initiate(UserId::from("bob"), true)
        .await
        .expect("initiate");
    assert_eq!(call.state().await, CallState::Calling);

    let frames = outbound.frames().await;
    match &frames[0] {
        ClientFrame::CallOffer { to, offer } => {
            assert_eq!(to, &UserId::from("bob"));
            assert_eq!(offer.call_id, call_id);
            assert!(offer.is_video);
            assert_eq!(offer.sdp, "offer-sdp");
        }
        other => panic!("expected call_offer, got {other:?}"),
    }

    call.on_remote_answer(CallAnswerPayload {
        call_id,
        sdp: "remote-answer".to_string(),
    })
    .await;
    assert_eq!(call.state().await, CallState::Connected);

    call.end().await.expect("end");
    assert_eq!(call.state().await, CallState::Ended);
    let frames = outbound.frames().await;
    match frames.last() {
        Some(ClientFrame::CallEnded { end, .. }) => {
            assert_eq!(end.reason, CallEndReason::Hangup);
        }
        other => panic!("expected call_ended, got {other:?}"),
    }
}

#[tokio::test]
async fn callee_accept_answers_the_stored_offer() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, Arc::clone(&outbound), DEFAULT_RING_TIMEOUT);

    let call_id = CallId::fresh();
    call.on_remote_offer(
        UserId::from("alice"),
        CallOfferPayload {
            call_id,
            sdp: "remote-offer".to_string(),
            is_video: false,
        },
    )
    .await;
    assert_eq!(call.state().await, CallState::Incoming);

    call.accept().await.expect("accept");
    assert_eq!(call.state().await, CallState::Connected);

    let frames = outbound.frames().await;
    match &frames[0] {
        ClientFrame::CallAnswer { to, answer } => {
            assert_eq!(to, &UserId::from("alice"));
            assert_eq!(answer.call_id, call_id);
            assert_eq!(answer.sdp, "answer-sdp");
        }
        other => panic!("expected call_answer, got {other:?}"),
    }

    call.on_remote_end(CallEndPayload {
        call_id,
        reason: CallEndReason::Hangup,
    })
    .await;
    assert_eq!(call.state().await, CallState::Ended);
}

#[tokio::test]
async fn out_of_order_operations_are_refused() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, outbound, DEFAULT_RING_TIMEOUT);

    assert_invalid_call_state(call.accept().await.expect_err("accept from idle"), "accept");
    assert_invalid_call_state(call.reject().await.expect_err("reject from idle"), "reject");
    assert_invalid_call_state(call.end().await.expect_err("end from idle"), "end");

    call.initiate(UserId::from("bob"), false)
        .await
        .expect("initiate");
    assert_invalid_call_state(
        call.initiate(UserId::from("carol"), false)
            .await
            .expect_err("initiate while calling"),
        "initiate",
    );

    call.on_remote_answer(CallAnswerPayload {
        call_id: call.active_call_id().await.expect("call id"),
        sdp: "remote-answer".to_string(),
    })
    .await;
    assert_eq!(call.state().await, CallState::Connected);
    assert_invalid_call_state(
        call.accept().await.expect_err("accept while connected"),
        "accept",
    );
}

#[tokio::test]
async fn double_accept_is_refused() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, outbound, DEFAULT_RING_TIMEOUT);

    call.on_remote_offer(
        UserId::from("alice"),
        CallOfferPayload {
            call_id: CallId::fresh(),
            sdp: "remote-offer".to_string(),
            is_video: false,
        },
    )
    .await;

    call.accept().await.expect("first accept");
    assert_invalid_call_state(call.accept().await.expect_err("second accept"), "accept");
}

#[tokio::test]
async fn unanswered_ring_times_out_into_failed() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(
        Arc::clone(&media),
        Arc::clone(&outbound),
        Duration::from_millis(30),
    );

    let call_id = call
        .initiate(UserId::from("bob"), false)
        .await
        .expect("initiate");
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(call.state().await, CallState::Failed);
    assert!(media.closed.load(Ordering::SeqCst));
    let frames = outbound.frames().await;
    match frames.last() {
        Some(ClientFrame::CallEnded { end, .. }) => {
            assert_eq!(end.call_id, call_id);
            assert_eq!(end.reason, CallEndReason::Timeout);
        }
        other => panic!("expected timeout call_ended, got {other:?}"),
    }

    // A late pickup no longer moves the state.
    call.on_remote_answer(CallAnswerPayload {
        call_id,
        sdp: "late-answer".to_string(),
    })
    .await;
    assert_eq!(call.state().await, CallState::Failed);
}

#[tokio::test]
async fn answered_call_outlives_the_ring_timer() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, outbound, Duration::from_millis(30));

    let call_id = call
        .initiate(UserId::from("bob"), false)
        .await
        .expect("initiate");
    call.on_remote_answer(CallAnswerPayload {
        call_id,
        sdp: "remote-answer".to_string(),
    })
    .await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(call.state().await, CallState::Connected);
}

#[tokio::test]
async fn busy_session_declines_a_second_offer() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, Arc::clone(&outbound), DEFAULT_RING_TIMEOUT);

    let first = CallId::fresh();
    call.on_remote_offer(
        UserId::from("alice"),
        CallOfferPayload {
            call_id: first,
            sdp: "first-offer".to_string(),
            is_video: false,
        },
    )
    .await;

    let second = CallId::fresh();
    call.on_remote_offer(
        UserId::from("carol"),
        CallOfferPayload {
            call_id: second,
            sdp: "second-offer".to_string(),
            is_video: false,
        },
    )
    .await;

    assert_eq!(call.state().await, CallState::Incoming);
    assert_eq!(call.active_call_id().await, Some(first));

    let frames = outbound.frames().await;
    match frames.last() {
        Some(ClientFrame::CallRejected { to, reject }) => {
            assert_eq!(to, &UserId::from("carol"));
            assert_eq!(reject.call_id, second);
        }
        other => panic!("expected busy call_rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn local_reject_declines_and_ends() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, Arc::clone(&outbound), DEFAULT_RING_TIMEOUT);

    let call_id = CallId::fresh();
    call.on_remote_offer(
        UserId::from("alice"),
        CallOfferPayload {
            call_id,
            sdp: "remote-offer".to_string(),
            is_video: false,
        },
    )
    .await;

    call.reject().await.expect("reject");
    assert_eq!(call.state().await, CallState::Ended);

    let frames = outbound.frames().await;
    match frames.last() {
        Some(ClientFrame::CallRejected { reject, .. }) => {
            assert_eq!(reject.call_id, call_id);
        }
        other => panic!("expected call_rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn remote_reject_ends_the_outgoing_call() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, outbound, DEFAULT_RING_TIMEOUT);

    let call_id = call
        .initiate(UserId::from("bob"), false)
        .await
        .expect("initiate");
    call.on_remote_reject(CallRejectPayload { call_id }).await;
    assert_eq!(call.state().await, CallState::Ended);
}

#[tokio::test]
async fn transport_failure_fails_locally_without_a_frame() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(
        Arc::clone(&media),
        Arc::clone(&outbound),
        DEFAULT_RING_TIMEOUT,
    );

    call.initiate(UserId::from("bob"), false)
        .await
        .expect("initiate");
    call.on_transport_failed().await;

    assert_eq!(call.state().await, CallState::Failed);
    assert!(media.closed.load(Ordering::SeqCst));
    // Only the offer went out; the failure itself is never relayed.
    assert_eq!(outbound.frames().await.len(), 1);
}

#[tokio::test]
async fn stale_frames_for_other_calls_are_dropped() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, outbound, DEFAULT_RING_TIMEOUT);

    let call_id = call
        .initiate(UserId::from("bob"), false)
        .await
        .expect("initiate");

    let foreign = CallId::fresh();
    call.on_remote_answer(CallAnswerPayload {
        call_id: foreign,
        sdp: "foreign-answer".to_string(),
    })
    .await;
    assert_eq!(call.state().await, CallState::Calling);

    call.on_remote_end(CallEndPayload {
        call_id: foreign,
        reason: CallEndReason::Hangup,
    })
    .await;
    assert_eq!(call.state().await, CallState::Calling);

    call.on_remote_ice(IceCandidatePayload {
        call_id,
        candidate: serde_json::json!({"candidate": "stub"}),
    })
    .await;
    assert_eq!(call.state().await, CallState::Calling);
}

#[tokio::test]
async fn local_candidates_are_relayed_while_a_call_is_in_flight() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, Arc::clone(&outbound), DEFAULT_RING_TIMEOUT);

    let gathered = serde_json::json!({"candidate": "host 10.0.0.1", "sdpMLineIndex": 0});
    assert_invalid_call_state(
        call.relay_ice_candidate(gathered.clone())
            .await
            .expect_err("relay from idle"),
        "relay_ice_candidate",
    );

    let call_id = call
        .initiate(UserId::from("bob"), false)
        .await
        .expect("initiate");
    call.relay_ice_candidate(gathered.clone())
        .await
        .expect("relay while calling");

    let frames = outbound.frames().await;
    match frames.last() {
        Some(ClientFrame::CallIceCandidate { to, candidate }) => {
            assert_eq!(to, &UserId::from("bob"));
            assert_eq!(candidate.call_id, call_id);
            assert_eq!(candidate.candidate, gathered);
        }
        other => panic!("expected call_ice_candidate, got {other:?}"),
    }

    call.on_remote_answer(CallAnswerPayload {
        call_id,
        sdp: "remote-answer".to_string(),
    })
    .await;
    call.relay_ice_candidate(gathered.clone())
        .await
        .expect("relay while connected");

    call.end().await.expect("end");
    assert_invalid_call_state(
        call.relay_ice_candidate(gathered)
            .await
            .expect_err("relay after hangup"),
        "relay_ice_candidate",
    );
}

#[tokio::test]
async fn terminal_call_makes_room_for_a_fresh_one() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, outbound, DEFAULT_RING_TIMEOUT);

    let first = call
        .initiate(UserId::from("bob"), false)
        .await
        .expect("initiate");
    call.end().await.expect("end");
    assert_eq!(call.state().await, CallState::Ended);

    let second = call
        .initiate(UserId::from("carol"), true)
        .await
        .expect("second initiate");
    assert_ne!(first, second);
    assert_eq!(call.state().await, CallState::Calling);
}

#[tokio::test]
async fn transitions_are_broadcast_in_order() {
    let media = StubMedia::new();
    let outbound = RecordingOutbound::new();
    let call = coordinator_with(media, outbound, DEFAULT_RING_TIMEOUT);
    let mut transitions = call.subscribe();

    let call_id = call
        .initiate(UserId::from("bob"), false)
        .await
        .expect("initiate");
    call.on_remote_answer(CallAnswerPayload {
        call_id,
        sdp: "remote-answer".to_string(),
    })
    .await;
    call.end().await.expect("end");

    let states: Vec<CallState> = [
        transitions.recv().await.expect("first"),
        transitions.recv().await.expect("second"),
        transitions.recv().await.expect("third"),
    ]
    .into_iter()
    .map(|transition| transition.state)
    .collect();
    assert_eq!(
        states,
        vec![CallState::Calling, CallState::Connected, CallState::Ended]
    );
}
