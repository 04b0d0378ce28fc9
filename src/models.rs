use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Topic of the first event every stream receives; its payload is the stream's id.
pub const HANDSHAKE_TOPIC: &str = "connection.id";

/// Heartbeat topic emitted by the optional per-instance ticker.
pub const TIME_TOPIC: &str = "time";

pub fn now_iso() -> String {
	OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339).unwrap_or_else(|_| "".into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
	pub fn generate() -> Self {
		Self(Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

/// Authenticated caller as seen by the distribution core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub subject: String,
	#[serde(default)]
	pub groups: Vec<String>,
}

impl Identity {
	pub fn new(subject: impl Into<String>) -> Self {
		Self { subject: subject.into(), groups: Vec::new() }
	}

	pub fn with_groups<I, S>(mut self, groups: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.groups = groups.into_iter().map(Into::into).collect();
		self
	}

	pub fn in_group(&self, group: &str) -> bool {
		self.groups.iter().any(|g| g == group)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
	#[serde(rename = "event")]
	pub topic: String,
	#[serde(rename = "data")]
	pub payload: serde_json::Value,
}

impl OutboundEvent {
	pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
		Self { topic: topic.into(), payload }
	}

	pub fn handshake(id: ConnectionId) -> Self {
		Self::new(HANDSHAKE_TOPIC, serde_json::Value::String(id.to_string()))
	}
}

/// Which connections a broadcast is for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Target {
	#[default]
	All,
	/// Connections subscribed to the topic.
	Topic(String),
	/// Connections whose identity belongs to the group.
	Group(String),
	/// Connections whose identity belongs to any of the groups.
	Groups(Vec<String>),
}

impl Target {
	pub fn matches(&self, identity: &Identity, subscriptions: &HashSet<String>) -> bool {
		match self {
			Target::All => true,
			Target::Topic(topic) => subscriptions.contains(topic),
			Target::Group(group) => identity.in_group(group),
			Target::Groups(groups) => groups.iter().any(|g| identity.in_group(g)),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRequest {
	#[serde(default)]
	pub target: Target,
	pub event: OutboundEvent,
}

impl BroadcastRequest {
	pub fn all(event: OutboundEvent) -> Self {
		Self { target: Target::All, event }
	}
}

/// Subscription edit for a connection that may live on another instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChange {
	pub connection_id: ConnectionId,
	/// Subject of the caller; only the connection's own subject may edit it.
	pub owner: String,
	pub topics: Vec<String>,
	pub add: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum BusMessage {
	Broadcast(BroadcastRequest),
	Subscriptions(SubscriptionChange),
}

/// What travels over the broker between instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerEnvelope {
	/// Queue name of the publishing instance, for tracing only.
	pub origin: String,
	pub message: BusMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendEventBody {
	pub event: String,
	#[serde(default)]
	pub data: serde_json::Value,
	#[serde(default)]
	pub target: Target,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionBody {
	pub connection_id: ConnectionId,
	pub topics: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
	pub connections: usize,
	pub delivered: u64,
	pub dropped: u64,
}
