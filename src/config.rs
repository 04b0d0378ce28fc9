use std::time::Duration;

use tracing::warn;

/// Which broker backs the cross-instance fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerKind {
	Redis(String),
	/// In-process exchange; only meaningful for a single instance.
	Memory,
}

#[derive(Debug, Clone)]
pub struct EventsConfig {
	pub jwt_secret: String,
	pub broker: BrokerKind,
	pub exchange: String,
	pub queue_prefix: String,
	pub mailbox_capacity: usize,
	pub keepalive: Duration,
	pub time_tick: Option<Duration>,
}

impl Default for EventsConfig {
	fn default() -> Self {
		Self {
			jwt_secret: "dev-secret".into(),
			broker: BrokerKind::Memory,
			exchange: "fleet.events".into(),
			queue_prefix: "fleet.events.instance.".into(),
			mailbox_capacity: 64,
			keepalive: Duration::from_secs(15),
			time_tick: None,
		}
	}
}

impl EventsConfig {
	pub fn from_env() -> Self {
		let defaults = Self::default();
		let broker = broker_kind(std::env::var("EVENTS_BROKER").ok().as_deref(), || {
			std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
		});
		let mailbox_capacity = std::env::var("EVENTS_MAILBOX_CAPACITY").ok().and_then(|v| v.parse::<usize>().ok()).unwrap_or(defaults.mailbox_capacity).max(1);
		let keepalive_secs = std::env::var("EVENTS_KEEPALIVE_SECS").ok().and_then(|v| v.parse::<u64>().ok()).unwrap_or(15).max(1);
		let time_tick = std::env::var("EVENTS_TIME_TICK_SECS").ok().and_then(|v| v.parse::<u64>().ok()).filter(|s| *s > 0).map(Duration::from_secs);
		Self {
			jwt_secret: std::env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
			broker,
			exchange: std::env::var("EVENTS_EXCHANGE").unwrap_or(defaults.exchange),
			queue_prefix: std::env::var("EVENTS_QUEUE_PREFIX").unwrap_or(defaults.queue_prefix),
			mailbox_capacity,
			keepalive: Duration::from_secs(keepalive_secs),
			time_tick,
		}
	}
}

/// Unset means Redis. Unknown values also fall back to Redis, loudly.
fn broker_kind(raw: Option<&str>, redis_url: impl FnOnce() -> String) -> BrokerKind {
	match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
		Some("memory") => BrokerKind::Memory,
		None | Some("") | Some("redis") => BrokerKind::Redis(redis_url()),
		Some(other) => {
			warn!(value = other, "unknown EVENTS_BROKER, expected `redis` or `memory`; using redis");
			BrokerKind::Redis(redis_url())
		}
	}
}
