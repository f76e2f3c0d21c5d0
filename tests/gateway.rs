//! Call gateway: metadata, classification, forced logout and streams.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use common::{sbom, Harness};
use traceguard_sync::client::ops;
use traceguard_sync::gateway::inprocess::CallShape;
use traceguard_sync::gateway::{
    CloseReason, StreamEnd, StreamFrame, TransportError, TransportStatus, AUTHORIZATION_KEY,
};
use traceguard_sync::model::{Sbom, UpdateEvent, UpdateKind};
use traceguard_sync::session::SessionChange;
use traceguard_sync::trace::{SAMPLED_KEY, SPAN_ID_KEY, TRACE_ID_KEY};
use traceguard_sync::{CallError, TraceGuardClient};

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[tokio::test]
async fn test_every_call_carries_fresh_trace_and_bearer() {
    let h = Harness::new();
    let credential = h.login("alice").await;
    let client = TraceGuardClient::new(h.gateway.clone());
    client.list_sboms(1, 10).await.unwrap();
    client.list_sboms(2, 10).await.unwrap();

    let calls = h.backend.transport.calls_to(ops::LIST_SBOMS);
    assert_eq!(calls.len(), 2);
    for call in &calls {
        assert_eq!(call.shape, CallShape::Unary);
        assert!(is_lower_hex(call.metadata.get(TRACE_ID_KEY).unwrap(), 32));
        assert!(is_lower_hex(call.metadata.get(SPAN_ID_KEY).unwrap(), 16));
        assert_eq!(call.metadata.get(SAMPLED_KEY), Some("1"));
        assert_eq!(
            call.metadata.get(AUTHORIZATION_KEY),
            Some(format!("Bearer {}", credential.token).as_str())
        );
    }
    assert_ne!(
        calls[0].metadata.get(TRACE_ID_KEY),
        calls[1].metadata.get(TRACE_ID_KEY)
    );
}

#[tokio::test]
async fn test_unauthenticated_call_has_no_authorization_header() {
    let h = Harness::new();
    h.backend
        .transport
        .on_unary_json("test.v1.Echo/Echo", |_, body: Value| Ok(body));

    let echoed: Value = h
        .gateway
        .unary_call("test.v1.Echo/Echo", &json!({"ping": 1}))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"ping": 1}));

    let call = &h.backend.transport.calls_to("test.v1.Echo/Echo")[0];
    assert!(!call.metadata.contains(AUTHORIZATION_KEY));
    assert!(call.metadata.contains(TRACE_ID_KEY));
}

#[tokio::test]
async fn test_sampling_flag_follows_gateway_setting() {
    let h = Harness::new();
    h.backend
        .transport
        .on_unary_json("test.v1.Echo/Echo", |_, body: Value| Ok(body));
    let gateway = h.gateway.clone().with_trace_sampling(false);
    let _: Value = gateway.unary_call("test.v1.Echo/Echo", &json!({})).await.unwrap();
    let call = &h.backend.transport.calls_to("test.v1.Echo/Echo")[0];
    assert_eq!(call.metadata.get(SAMPLED_KEY), Some("0"));
}

#[tokio::test]
async fn test_failures_map_to_exactly_one_kind() {
    let h = Harness::new();
    let cases = [
        (TransportStatus::NotFound, "not_found"),
        (TransportStatus::InvalidArgument, "validation"),
        (TransportStatus::FailedPrecondition, "validation"),
        (TransportStatus::Unavailable, "unavailable"),
        (TransportStatus::DeadlineExceeded, "unavailable"),
        (TransportStatus::Network, "transport"),
        (TransportStatus::Internal, "transport"),
        (TransportStatus::Unauthenticated, "auth"),
    ];
    for (status, expected) in cases {
        h.backend.transport.on_unary("test.v1.Fail/Fail", move |_, _| {
            Err(TransportError::new(status, "scripted"))
        });
        let err = h
            .gateway
            .unary_call::<_, Value>("test.v1.Fail/Fail", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), expected, "{status:?}");
    }
}

#[tokio::test]
async fn test_unparseable_response_is_validation_error() {
    let h = Harness::new();
    h.backend
        .transport
        .on_unary("test.v1.Garbage/Get", |_, _| Ok(b"<html>".to_vec()));
    let err = h
        .gateway
        .unary_call::<_, Sbom>("test.v1.Garbage/Get", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Validation { .. }));
}

#[tokio::test]
async fn test_auth_failure_forces_logout() {
    let h = Harness::new();
    h.login("alice").await;
    let mut watcher = h.sessions.subscribe();
    let _ = watcher.borrow_and_update();

    h.backend.revoke_all_tokens();
    let client = TraceGuardClient::new(h.gateway.clone());
    let err = client.list_sboms(1, 10).await.unwrap_err();
    assert!(err.is_auth());

    assert!(h.sessions.current_credential().is_none());
    assert!(h.storage.raw().is_none());
    watcher.changed().await.unwrap();
    assert_eq!(watcher.borrow().change, SessionChange::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_stale_auth_failure_does_not_end_newer_session() {
    let h = Harness::new();
    h.backend.transport.on_unary("test.v1.Reject/Call", |_, _| {
        Err(TransportError::new(TransportStatus::Unauthenticated, "token revoked"))
    });
    h.login("alice").await;

    h.backend.transport.set_unary_latency(Some(Duration::from_secs(1)));
    let gateway = h.gateway.clone();
    let in_flight = tokio::spawn(async move {
        gateway
            .unary_call::<_, Value>("test.v1.Reject/Call", &json!({}))
            .await
    });
    tokio::task::yield_now().await;
    h.backend.transport.set_unary_latency(None);

    h.sessions.logout();
    h.login("bob").await;

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(err.is_auth());
    assert_eq!(h.sessions.current_credential().unwrap().subject, "bob");
}

#[tokio::test]
async fn test_stream_delivers_skips_and_cancels() {
    let h = Harness::new();
    let credential = h.login("alice").await;
    let client = TraceGuardClient::new(h.gateway.clone());

    let mut stream = client.stream_updates("alice").await.unwrap();
    let feed = h.backend.next_feed().await;
    assert_eq!(feed.operation, ops::STREAM_UPDATES);
    assert_eq!(
        feed.metadata.get(AUTHORIZATION_KEY),
        Some(format!("Bearer {}", credential.token).as_str())
    );
    let request: Value = serde_json::from_slice(&feed.request).unwrap();
    assert_eq!(request["subject"], "alice");

    let created = UpdateEvent::upsert(UpdateKind::Created, &sbom("a", 1)).unwrap();
    assert!(feed.send_json(&created));
    assert!(feed.send_raw(b"{not json".to_vec()));
    let deleted = UpdateEvent::deleted(traceguard_sync::EntityKind::Sbom, "a", 2);
    assert!(feed.send_json(&deleted));

    assert_eq!(stream.next().await, StreamFrame::Event(created));
    assert!(matches!(
        stream.next().await,
        StreamFrame::Skipped(CallError::Validation { .. })
    ));
    assert_eq!(stream.next().await, StreamFrame::Event(deleted));

    stream.cancel_handle().cancel();
    assert_eq!(stream.next().await, StreamFrame::End(StreamEnd::Cancelled));
    assert_eq!(stream.next().await, StreamFrame::End(StreamEnd::Cancelled));
    assert!(feed.is_closed());
    assert!(h.sessions.current_credential().is_some());
}

#[tokio::test]
async fn test_stream_end_and_auth_failure() {
    let h = Harness::new();
    h.login("alice").await;
    let client = TraceGuardClient::new(h.gateway.clone());

    let mut stream = client.stream_updates("alice").await.unwrap();
    h.backend.next_feed().await.close();
    assert_eq!(
        stream.next().await,
        StreamFrame::End(StreamEnd::Closed(CloseReason::EndOfStream))
    );

    let mut stream = client.stream_updates("alice").await.unwrap();
    h.backend
        .next_feed()
        .await
        .fail(TransportError::new(TransportStatus::Unauthenticated, "expired"));
    match stream.next().await {
        StreamFrame::End(StreamEnd::Closed(CloseReason::Failed(e))) => assert!(e.is_auth()),
        other => panic!("unexpected frame {other:?}"),
    }
    assert!(h.sessions.current_credential().is_none());
}

#[tokio::test]
async fn test_stream_open_failure_is_classified() {
    let h = Harness::new();
    h.login("alice").await;
    h.backend
        .transport
        .fail_next_stream(TransportError::unavailable("connection refused"));
    let client = TraceGuardClient::new(h.gateway.clone());
    let err = client.stream_updates("alice").await.err().unwrap();
    assert!(err.is_retryable());
    assert!(h.sessions.current_credential().is_some());
}
