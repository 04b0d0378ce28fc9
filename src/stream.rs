//! `GET /events/listen`: one long-lived SSE response per connection.

use std::sync::Arc;
use std::time::Duration;

use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::stream::TextStream;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{Shutdown, State};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::AuthUser;
use crate::bridge::BrokerBridge;
use crate::config::EventsConfig;
use crate::errors::{AppError, AppResult};
use crate::hub::{Connection, Hub, Mailbox};
use crate::models::{ConnectionId, OutboundEvent, SubscriptionBody, SubscriptionChange};
use crate::publish::validate_topic;

pub const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

pub fn frame(event: &OutboundEvent) -> AppResult<String> {
	Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

fn parse_topics(raw: Option<&str>) -> AppResult<Vec<String>> {
	let topics: Vec<String> = raw
		.unwrap_or_default()
		.split(',')
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.map(String::from)
		.collect();
	for topic in &topics {
		validate_topic(topic)?;
	}
	Ok(topics)
}

/// Owns a registered connection's mailbox for as long as the response lives.
/// Dropping it unregisters the connection and discards whatever is still queued.
struct StreamSession {
	id: ConnectionId,
	hub: Hub,
	mailbox: Mailbox,
}

impl Drop for StreamSession {
	fn drop(&mut self) {
		self.hub.unregister(self.id);
		self.mailbox.close();
		let mut discarded = 0usize;
		while self.mailbox.try_recv().is_ok() {
			discarded += 1;
		}
		info!(connection_id = %self.id, discarded, "event stream closed");
	}
}

enum Step {
	Deliver(Option<OutboundEvent>),
	KeepAlive,
	Shutdown,
}

/// SSE body with the headers proxies need to leave the stream alone.
pub struct EventStreamResponse<S>(TextStream<S>);

impl<'r, S> Responder<'r, 'r> for EventStreamResponse<S>
where
	TextStream<S>: Responder<'r, 'r>,
{
	fn respond_to(self, req: &'r Request<'_>) -> response::Result<'r> {
		let mut res = self.0.respond_to(req)?;
		res.set_header(ContentType::EventStream);
		res.set_raw_header("Cache-Control", "no-cache");
		res.set_raw_header("Connection", "keep-alive");
		Ok(res)
	}
}

fn pump(mut session: StreamSession, keepalive: Duration, mut shutdown: Shutdown) -> TextStream![String] {
	TextStream! {
		let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			let step = tokio::select! {
				ev = session.mailbox.recv() => Step::Deliver(ev),
				_ = ticker.tick() => Step::KeepAlive,
				_ = &mut shutdown => Step::Shutdown,
			};
			match step {
				Step::Deliver(Some(ev)) => match frame(&ev) {
					Ok(data) => {
						yield data;
					}
					Err(e) => warn!(connection_id = %session.id, topic = %ev.topic, error = %e, "unable to frame event"),
				},
				Step::Deliver(None) => {
					debug!(connection_id = %session.id, "mailbox closed by hub");
					break;
				}
				Step::KeepAlive => {
					yield KEEPALIVE_FRAME.to_string();
				}
				Step::Shutdown => {
					debug!(connection_id = %session.id, "server shutting down");
					break;
				}
			}
		}
		drop(session);
	}
}

#[get("/events/listen?<topics>")]
pub fn listen(
	user: AuthUser,
	hub: &State<Hub>,
	config: &State<EventsConfig>,
	shutdown: Shutdown,
	topics: Option<&str>,
) -> AppResult<EventStreamResponse<impl rocket::futures::Stream<Item = String>>> {
	let topics = parse_topics(topics)?;
	let subject = user.identity.subject.clone();
	let (conn, mailbox) = Connection::open(user.identity, topics, hub.mailbox_capacity());
	let id = conn.id;
	hub.register(conn)?;
	info!(connection_id = %id, subject = %subject, "event stream opened");
	let session = StreamSession { id, hub: hub.inner().clone(), mailbox };
	Ok(EventStreamResponse(pump(session, config.keepalive, shutdown)))
}

/// Applied here when this instance holds the connection (204). Otherwise the
/// edit is forwarded over the bus for whichever instance does hold it (202).
async fn change_subscriptions(user: AuthUser, hub: &Hub, bridge: &BrokerBridge, body: SubscriptionBody, add: bool) -> AppResult<Status> {
	let SubscriptionBody { connection_id, topics } = body;
	for topic in &topics {
		validate_topic(topic)?;
	}
	let owner = user.identity.subject;
	let local = if add {
		hub.subscribe(connection_id, &owner, topics.clone()).await
	} else {
		hub.unsubscribe(connection_id, &owner, topics.clone()).await
	};
	match local {
		Ok(()) => Ok(Status::NoContent),
		Err(AppError::NotFound) => {
			debug!(connection_id = %connection_id, owner = %owner, add, "connection not held here, forwarding subscription change");
			bridge.forward_subscriptions(SubscriptionChange { connection_id, owner, topics, add }).await?;
			Ok(Status::Accepted)
		}
		Err(e) => Err(e),
	}
}

#[post("/events/subscriptions", data = "<body>")]
pub async fn subscribe(user: AuthUser, hub: &State<Hub>, bridge: &State<Arc<BrokerBridge>>, body: Json<SubscriptionBody>) -> AppResult<Status> {
	change_subscriptions(user, hub, bridge, body.into_inner(), true).await
}

#[delete("/events/subscriptions", data = "<body>")]
pub async fn unsubscribe(user: AuthUser, hub: &State<Hub>, bridge: &State<Arc<BrokerBridge>>, body: Json<SubscriptionBody>) -> AppResult<Status> {
	change_subscriptions(user, hub, bridge, body.into_inner(), false).await
}
