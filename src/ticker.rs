use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::hub::Hub;
use crate::models::{now_iso, BroadcastRequest, OutboundEvent, TIME_TOPIC};

/// Periodically sends the current time to this instance's connections.
///
/// Goes straight to the local hub: every instance runs its own ticker, so
/// routing it through the broker would hand each client one copy per instance.
pub fn spawn_time_ticker(hub: Hub, period: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(period);
		interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
		loop {
			interval.tick().await;
			let event = OutboundEvent::new(TIME_TOPIC, Value::String(now_iso()));
			if hub.broadcast(BroadcastRequest::all(event)).is_err() {
				debug!("event hub stopped, time ticker exiting");
				return;
			}
		}
	})
}
