//! Correlator integration: a large mix of concurrent calls and stream
//! frames must resolve every call exactly once, and never from a
//! stream-only frame.

use std::sync::Arc;

use deriv_bot::{Correlator, LinkHandle};
use serde_json::{json, Value};

const CALLS: usize = 1_000;
const STREAM_FRAMES: usize = 1_000;

#[tokio::test]
async fn test_thousand_calls_resolve_exactly_once() {
    let correlator = Arc::new(Correlator::new());

    let mut receivers = Vec::with_capacity(CALLS);
    let mut req_ids = Vec::with_capacity(CALLS);
    for _ in 0..CALLS {
        let (req_id, rx) = correlator.register();
        req_ids.push(req_id);
        receivers.push(rx);
    }
    assert_eq!(correlator.pending_count(), CALLS);

    // Interleave responses with stream frames carrying no (or foreign)
    // req_ids.
    let mut stream_claimed = 0usize;
    for (i, req_id) in req_ids.iter().enumerate() {
        if i < STREAM_FRAMES {
            // A stream frame must never claim a pending slot: ids from a
            // range the correlator never allocated.
            if correlator.resolve(1_000_000 + i as u64, json!({"msg_type": "tick"})) {
                stream_claimed += 1;
            }
        }
        assert!(correlator.resolve(*req_id, json!({"msg_type": "ping", "req_id": req_id})));
        // A duplicate response falls through to stream dispatch.
        assert!(!correlator.resolve(*req_id, json!({"msg_type": "ping", "req_id": req_id})));
    }

    assert_eq!(stream_claimed, 0);
    assert_eq!(correlator.pending_count(), 0);

    for (rx, req_id) in receivers.into_iter().zip(req_ids) {
        let frame = rx.await.expect("every call resolves");
        assert_eq!(frame["req_id"].as_u64(), Some(req_id));
    }
}

#[tokio::test]
async fn test_concurrent_calls_over_a_link_handle() {
    let (handle, mut frames) = LinkHandle::pair();

    // Responder: answer every outbound frame, interleaving stream-only
    // frames that must not affect any call.
    let responder_handle = handle.clone();
    let responder = tokio::spawn(async move {
        let mut answered = 0usize;
        while answered < CALLS {
            let Some(text) = frames.recv().await else { break };
            let sent: Value = serde_json::from_str(&text).unwrap();
            let req_id = sent["req_id"].as_u64().unwrap();

            let claimed = responder_handle.inject_frame(
                &json!({"msg_type": "tick", "tick": {"symbol": "X", "epoch": 1, "quote": 1}})
                    .to_string(),
            );
            assert!(!claimed, "stream frame must not resolve a call");

            assert!(responder_handle.inject_frame(
                &json!({"msg_type": "ping", "ping": "pong", "req_id": req_id}).to_string()
            ));
            answered += 1;
        }
    });

    let mut calls = Vec::with_capacity(CALLS);
    for _ in 0..CALLS {
        let handle = handle.clone();
        calls.push(tokio::spawn(
            async move { handle.call(json!({"ping": 1})).await },
        ));
    }

    let mut resolved = 0usize;
    for call in calls {
        let frame = call.await.unwrap().expect("call resolves");
        assert_eq!(frame["msg_type"], "ping");
        resolved += 1;
    }
    assert_eq!(resolved, CALLS);

    responder.await.unwrap();
}

#[tokio::test]
async fn test_link_loss_fails_all_pending() {
    let correlator = Correlator::new();
    let mut receivers = Vec::new();
    for _ in 0..50 {
        let (_, rx) = correlator.register();
        receivers.push(rx);
    }

    correlator.fail_all();

    for rx in receivers {
        assert!(rx.await.is_err(), "pending call observes link loss");
    }
    assert_eq!(correlator.pending_count(), 0);
}
