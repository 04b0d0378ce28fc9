use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::State;
use tracing::info;

use crate::auth::Publisher;
use crate::bridge::BrokerBridge;
use crate::errors::{AppError, AppResult};
use crate::models::{BroadcastRequest, OutboundEvent, SendEventBody, Target, HANDSHAKE_TOPIC};

const MAX_TOPIC_LEN: usize = 128;

pub fn validate_topic(topic: &str) -> AppResult<()> {
	if topic.is_empty() {
		return Err(AppError::BadRequest("event name is required".into()));
	}
	if topic.len() > MAX_TOPIC_LEN {
		return Err(AppError::BadRequest(format!("event name longer than {} bytes", MAX_TOPIC_LEN)));
	}
	if topic.chars().any(|c| c.is_whitespace() || c.is_control()) {
		return Err(AppError::BadRequest("event name must not contain whitespace".into()));
	}
	if topic == HANDSHAKE_TOPIC {
		return Err(AppError::BadRequest(format!("{} is reserved", HANDSHAKE_TOPIC)));
	}
	Ok(())
}

fn validate_target(target: &Target) -> AppResult<()> {
	match target {
		Target::All => Ok(()),
		Target::Topic(topic) => validate_topic(topic),
		Target::Group(group) if group.trim().is_empty() => Err(AppError::BadRequest("group must not be empty".into())),
		Target::Group(_) => Ok(()),
		Target::Groups(groups) if groups.is_empty() || groups.iter().any(|g| g.trim().is_empty()) => {
			Err(AppError::BadRequest("groups must be a non-empty list of names".into()))
		}
		Target::Groups(_) => Ok(()),
	}
}

pub fn validate_request(req: &BroadcastRequest) -> AppResult<()> {
	validate_topic(&req.event.topic)?;
	validate_target(&req.target)
}

/// Entry point for authorized publishes. Always goes through the broker, so
/// the publishing instance receives its own event the same way every other
/// instance does.
pub struct PublishGateway {
	bridge: Arc<BrokerBridge>,
}

impl PublishGateway {
	pub fn new(bridge: Arc<BrokerBridge>) -> Self {
		Self { bridge }
	}

	pub async fn publish(&self, body: SendEventBody) -> AppResult<()> {
		let request = BroadcastRequest { target: body.target, event: OutboundEvent::new(body.event, body.data) };
		validate_request(&request)?;
		self.bridge.publish(request).await
	}
}

#[post("/events/send", data = "<body>")]
pub async fn send(publisher: Publisher, gateway: &State<PublishGateway>, body: Json<SendEventBody>) -> AppResult<Status> {
	let Publisher(user) = publisher;
	let body = body.into_inner();
	let topic = body.event.clone();
	gateway.publish(body).await?;
	info!(topic = %topic, publisher = %user.identity.subject, "event published");
	Ok(Status::Ok)
}
