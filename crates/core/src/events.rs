//! Internal signals feeding the session event loop.

use std::time::Duration;

/// Work for the session event loop, sent by the scheduler and push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEvent {
	/// Re-run admission: a slot freed up or work may be admissible again.
	ProcessRequests,
	/// Re-run admission once a server hold-off has elapsed.
	ProcessRequestsAfter(Duration),
	/// A dispatched request finished; `received_data` is true when the server answered.
	RequestFinished { received_data: bool },
	/// Queue the push-channel-open item.
	OpenPushChannel,
	/// Queue the push-channel-open item after a reconnect delay.
	OpenPushChannelAfter(Duration),
}
