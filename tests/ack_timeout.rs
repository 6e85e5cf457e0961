//! Ack deadlines: retransmission, final failure, and late acks.
mod common;

use std::time::Duration;

use common::{ack, next_matching, settings, start_with, BOB, GATEWAY_ID};
use meshchat::gateway::{GatewaySettings, SendRequest, SessionEvent};
use meshchat::storage::messages::DeliveryState;
use meshchat::storage::NullStore;

fn impatient() -> GatewaySettings {
    let mut s = settings();
    s.outbox.ack_timeout = Duration::from_millis(150);
    s.outbox.max_attempts = 2;
    s
}

#[tokio::test]
async fn unacked_message_retries_then_fails() {
    let mut h = start_with(impatient(), NullStore).await;
    let sent = h
        .session
        .send_request(SendRequest {
            channel: 0,
            body: "anyone?".to_string(),
            to: Some(BOB),
        })
        .await
        .unwrap();

    let (first, _) = h.radio.recv_text().await;
    let (second, payload) = h.radio.recv_text().await;
    assert_eq!(first.id, sent.key.packet_id);
    assert_eq!(second.id, first.id, "retransmission reuses the packet id");
    assert_eq!(payload.body, "anyone?");

    let failed = next_matching(&mut h.session, |e| matches!(e, SessionEvent::SendFailed { .. })).await;
    match failed {
        SessionEvent::SendFailed { key, channel, .. } => {
            assert_eq!(key, sent.key);
            assert_eq!(channel, 0);
        }
        _ => unreachable!(),
    }
    let page = h.gateway.handle().history(0, None, None).await.unwrap();
    assert_eq!(page.messages[0].state, DeliveryState::Failed);

    // Budget exhausted: nothing more goes out
    assert!(h.radio.is_silent_for(Duration::from_millis(400)).await);
    assert!(meshchat::metrics::snapshot().retries >= 1);
    h.gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn ack_for_retransmission_stops_retries() {
    let mut h = start_with(impatient(), NullStore).await;
    let sent = h.session.send(0, "second time lucky").await.unwrap();
    let _ = h.radio.recv_text().await;
    let (retry, _) = h.radio.recv_text().await;

    h.radio.send(&ack(BOB, GATEWAY_ID, retry.id, 7001)).await;
    next_matching(&mut h.session, |e| {
        matches!(e, SessionEvent::Message { message, .. }
            if message.key == sent.key && message.state == DeliveryState::Acked)
    })
    .await;

    // Well past the second deadline: no failure, no third copy
    let quiet = h.radio.is_silent_for(Duration::from_millis(400)).await;
    assert!(quiet);
    let status = h.gateway.handle().status().await.unwrap();
    assert_eq!(status.outbox.awaiting_ack, 0);
    let page = h.gateway.handle().history(0, None, None).await.unwrap();
    assert_eq!(page.messages[0].state, DeliveryState::Acked);
    h.gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn ack_after_failure_does_not_resurrect() {
    let mut h = start_with(impatient(), NullStore).await;
    let sent = h.session.send(0, "too late").await.unwrap();
    let _ = h.radio.recv_text().await;
    let _ = h.radio.recv_text().await;
    next_matching(&mut h.session, |e| matches!(e, SessionEvent::SendFailed { .. })).await;

    h.radio
        .send(&ack(BOB, GATEWAY_ID, sent.key.packet_id, 7002))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let page = h.gateway.handle().history(0, None, None).await.unwrap();
    assert_eq!(page.messages[0].state, DeliveryState::Failed);
    h.gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_body_fails_at_send() {
    let mut h = start_with(settings(), NullStore).await;
    let err = h.session.send(0, &"x".repeat(600)).await.unwrap_err();
    assert!(err.to_string().contains("too large"), "{}", err);

    let page = h.gateway.handle().history(0, None, None).await.unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].state, DeliveryState::Failed);
    assert!(h.radio.is_silent_for(Duration::from_millis(100)).await);

    let err = h.session.send(7, "no such channel").await.unwrap_err();
    assert!(err.to_string().contains("unknown channel"));
    let err = h.session.send(0, "   ").await.unwrap_err();
    assert!(err.to_string().contains("invalid message body"));
    h.gateway.shutdown().await.unwrap();
}
