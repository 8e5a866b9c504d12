//! Push channel lifecycle against reachability and credential changes.

mod common;

use std::sync::Arc;

use common::{HarnessBuilder, eventually, settle};
use courier::protocol::{PushChannelState, PushFrame, ReachabilityState};
use courier::testing::{FakeTransport, RecordingConsumer};
use courier::{Admission, BackoffConfig, CloseCause, Error, HttpRequest, Session, SessionBus, SessionConfig};
use serde_json::json;

#[tokio::test]
async fn delivers_frames_in_order_and_sends_while_open() {
	let harness = HarnessBuilder::new().build();
	let consumer = RecordingConsumer::new();
	harness.session.open_push_channel(consumer.clone()).unwrap();

	consumer.wait_for_events(1).await.unwrap();
	assert_eq!(consumer.opened(), 1);
	assert_eq!(harness.session.push_channel_state(), PushChannelState::Open);

	let connection = harness.push.latest().unwrap();
	assert_eq!(connection.credential().token, "seed");
	for seq in 0..3 {
		assert!(connection.inject(PushFrame::Json(json!({ "seq": seq }))));
	}
	consumer.wait_for_events(4).await.unwrap();
	let seqs: Vec<_> = consumer.frames().iter().filter_map(|frame| frame.as_json().map(|value| value["seq"].clone())).collect();
	assert_eq!(seqs, vec![json!(0), json!(1), json!(2)]);

	harness.session.push_channel().send(PushFrame::Json(json!({ "ack": 2 }))).await.unwrap();
	assert_eq!(connection.sent(), vec![PushFrame::Json(json!({ "ack": 2 }))]);
}

#[tokio::test]
async fn send_is_refused_while_closed() {
	let harness = HarnessBuilder::new().build();
	let result = harness.session.push_channel().send(PushFrame::Binary(vec![1, 2, 3])).await;
	assert!(matches!(result, Err(Error::TryAgainLater)));
}

#[tokio::test]
async fn opening_waits_until_the_network_is_reachable() {
	let harness = HarnessBuilder::new().build();
	harness.session.reachability().update(ReachabilityState::Unreachable);
	let consumer = RecordingConsumer::new();
	harness.session.open_push_channel(consumer.clone()).unwrap();

	settle().await;
	assert_eq!(harness.push.connect_attempts(), 0);
	assert_eq!(harness.session.push_channel_state(), PushChannelState::Closed);

	harness.session.reachability().update(ReachabilityState::Reachable);
	harness.push.wait_for_attempts(1).await.unwrap();
	consumer.wait_for_events(1).await.unwrap();
	assert_eq!(harness.session.push_channel_state(), PushChannelState::Open);
}

#[tokio::test]
async fn reopens_after_reachability_recovers() {
	let harness = HarnessBuilder::new().build();
	let consumer = RecordingConsumer::new();
	harness.session.open_push_channel(consumer.clone()).unwrap();
	consumer.wait_for_events(1).await.unwrap();
	let first = harness.push.latest().unwrap();

	harness.session.reachability().update(ReachabilityState::Unreachable);
	consumer.wait_for_events(2).await.unwrap();
	assert_eq!(consumer.closed(), 1);
	assert_eq!(harness.session.push_channel_state(), PushChannelState::Closed);
	assert_eq!(harness.session.push_channel().last_close_cause(), Some(CloseCause::ReachabilityLost));
	eventually("old connection closed", || first.is_closed()).await;

	harness.session.reachability().update(ReachabilityState::Reachable);
	harness.push.wait_for_attempts(2).await.unwrap();
	consumer.wait_for_events(3).await.unwrap();
	assert_eq!(consumer.opened(), 2);
	assert_eq!(harness.session.push_channel_state(), PushChannelState::Open);
}

#[tokio::test]
async fn opening_waits_for_a_valid_credential() {
	let harness = HarnessBuilder::new().credential(None).held_renewals().build();
	let consumer = RecordingConsumer::new();
	harness.session.open_push_channel(consumer.clone()).unwrap();

	harness.renewer.wait_for_calls(1).await.unwrap();
	settle().await;
	assert_eq!(harness.push.connect_attempts(), 0);

	harness.renewer.release(1);
	harness.push.wait_for_attempts(1).await.unwrap();
	consumer.wait_for_events(1).await.unwrap();
	assert_eq!(harness.push.latest().unwrap().credential().token, "token-1");
}

#[tokio::test]
async fn explicit_close_prevents_reopening() {
	let harness = HarnessBuilder::new().build();
	let consumer = RecordingConsumer::new();
	harness.session.open_push_channel(consumer.clone()).unwrap();
	consumer.wait_for_events(1).await.unwrap();
	let connection = harness.push.latest().unwrap();

	harness.session.close_push_channel();
	consumer.wait_for_events(2).await.unwrap();
	eventually("channel closed", || harness.session.push_channel_state() == PushChannelState::Closed).await;
	eventually("connection closed", || connection.is_closed()).await;

	let _ = connection.fail("late error");
	harness.session.reachability().update(ReachabilityState::Unreachable);
	harness.session.reachability().update(ReachabilityState::Reachable);
	settle().await;
	assert_eq!(harness.push.connect_attempts(), 1);
	assert_eq!(harness.session.push_channel().last_close_cause(), Some(CloseCause::Explicit));
	assert!(!harness.session.push_channel().wants_open());
}

#[tokio::test]
async fn reopening_while_closing_connects_again() {
	let harness = HarnessBuilder::new().build();
	let consumer = RecordingConsumer::new();
	harness.session.open_push_channel(consumer.clone()).unwrap();
	consumer.wait_for_events(1).await.unwrap();
	let first = harness.push.latest().unwrap();

	harness.session.close_push_channel();
	assert_eq!(harness.session.push_channel_state(), PushChannelState::Closing);
	harness.session.open_push_channel(consumer.clone()).unwrap();
	assert!(harness.session.push_channel().wants_open());

	eventually("second connection", || harness.push.connect_attempts() == 2).await;
	eventually("channel reopened", || harness.session.push_channel_state() == PushChannelState::Open).await;
	eventually("first connection closed", || first.is_closed()).await;
	consumer.wait_for_events(3).await.unwrap();
	assert_eq!(consumer.opened(), 2);
	assert_eq!(consumer.closed(), 1);
}

#[tokio::test]
async fn transport_errors_reconnect_after_a_delay() {
	let config = SessionConfig {
		push_reconnect: BackoffConfig { base_ms: 20, max_ms: 100 },
		..SessionConfig::default()
	};
	let harness = HarnessBuilder::new().config(config).build();
	harness.push.fail_next(1);
	let consumer = RecordingConsumer::new();
	harness.session.open_push_channel(consumer.clone()).unwrap();

	harness.push.wait_for_attempts(2).await.unwrap();
	consumer.wait_for_events(1).await.unwrap();
	let connection = harness.push.latest().unwrap();

	assert!(connection.fail("connection reset"));
	harness.push.wait_for_attempts(3).await.unwrap();
	consumer.wait_for_events(3).await.unwrap();
	assert_eq!(consumer.opened(), 2);
	assert_eq!(consumer.closed(), 1);
}

#[tokio::test]
async fn rejected_handshake_renews_the_credential_once() {
	let harness = HarnessBuilder::new().build();
	harness.push.reject_next_unauthorized(1);
	let consumer = RecordingConsumer::new();
	harness.session.open_push_channel(consumer.clone()).unwrap();

	harness.push.wait_for_attempts(2).await.unwrap();
	consumer.wait_for_events(1).await.unwrap();
	assert_eq!(harness.renewer.calls(), 1);
	assert_eq!(harness.push.latest().unwrap().credential().token, "token-1");
}

#[tokio::test]
async fn push_channel_does_not_use_the_request_budget() {
	let harness = HarnessBuilder::new().gated().max_concurrent(1).build();
	assert_eq!(harness.session.enqueue_request(HttpRequest::get("/busy")), Admission::Dispatched);

	let consumer = RecordingConsumer::new();
	harness.session.open_push_channel(consumer.clone()).unwrap();
	consumer.wait_for_events(1).await.unwrap();
	assert_eq!(harness.session.push_channel_state(), PushChannelState::Open);
	assert_eq!(harness.session.in_flight(), 1);
}

#[tokio::test]
async fn sessions_without_push_transport_refuse_to_open() {
	let session = Session::builder(Arc::new(FakeTransport::new())).bus(SessionBus::new()).build().unwrap();
	let result = session.open_push_channel(RecordingConsumer::new());
	assert!(matches!(result, Err(Error::Invalid(_))));
}
