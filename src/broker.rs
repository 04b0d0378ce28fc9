//! Fan-out exchange backends.
//!
//! The topology is the same whatever the backend: one shared exchange per
//! event bus, one auto-delete queue per running instance bound with a
//! wildcard key, so every publish lands in every instance's queue once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Routing keys of broadcast messages all start with this.
pub const BROADCAST_ROUTING_PREFIX: &str = "broadcast.";

/// Binding every instance queue uses; matches all broadcasts on the bus.
pub const BROADCAST_BINDING: &str = "broadcast.*";

const SUBSCRIPTIONS_KEY: &str = "connection.subscriptions";

const REDIS_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const REDIS_QUEUE_CAPACITY: usize = 1024;

/// Raw message bodies delivered to one queue.
pub type Delivery = BoxStream<'static, Vec<u8>>;

#[rocket::async_trait]
pub trait Broker: Send + Sync {
	/// Declares the exchange or attaches to an existing one. Errors when the broker is unreachable.
	async fn declare_exchange(&self, exchange: &str) -> AppResult<()>;

	/// Creates `queue`, binds it to `exchange` and starts consuming. The queue
	/// is deleted once the returned stream is dropped.
	async fn bind_queue(&self, exchange: &str, queue: &str, binding: &str) -> AppResult<Delivery>;

	async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> AppResult<()>;
}

/// Exchange and instance queue names agreed at startup.
#[derive(Debug, Clone)]
pub struct Topology {
	pub exchange: String,
	pub queue: String,
}

impl Topology {
	pub fn new(exchange: &str, queue_prefix: &str) -> Self {
		Self { exchange: exchange.to_string(), queue: format!("{}{}", queue_prefix, Uuid::new_v4().simple()) }
	}

	pub fn routing_key(topic: &str) -> String {
		format!("{}{}", BROADCAST_ROUTING_PREFIX, topic)
	}

	/// Subscription edits ride the broadcast binding so every instance queue sees them.
	pub fn subscriptions_routing_key() -> String {
		Self::routing_key(SUBSCRIPTIONS_KEY)
	}
}

/// `#` matches everything, a trailing `*` matches any suffix, anything else must match exactly.
pub fn binding_matches(binding: &str, routing_key: &str) -> bool {
	if binding == "#" {
		return true;
	}
	match binding.strip_suffix('*') {
		Some(prefix) => routing_key.starts_with(prefix),
		None => binding == routing_key,
	}
}

struct BoundQueue {
	name: String,
	binding: String,
	tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// In-process exchange. Instances sharing one `MemoryBroker` behave like
/// processes sharing a real broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
	exchanges: Arc<DashMap<String, Vec<BoundQueue>>>,
}

impl MemoryBroker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Names of the queues currently bound to `exchange`.
	pub fn queues(&self, exchange: &str) -> Vec<String> {
		self.exchanges
			.get(exchange)
			.map(|qs| qs.iter().filter(|q| !q.tx.is_closed()).map(|q| q.name.clone()).collect())
			.unwrap_or_default()
	}
}

#[rocket::async_trait]
impl Broker for MemoryBroker {
	async fn declare_exchange(&self, exchange: &str) -> AppResult<()> {
		self.exchanges.entry(exchange.to_string()).or_default();
		Ok(())
	}

	async fn bind_queue(&self, exchange: &str, queue: &str, binding: &str) -> AppResult<Delivery> {
		let mut queues = self
			.exchanges
			.get_mut(exchange)
			.ok_or_else(|| AppError::Unavailable(format!("exchange {} not declared", exchange)))?;
		let (tx, rx) = mpsc::unbounded_channel();
		queues.push(BoundQueue { name: queue.to_string(), binding: binding.to_string(), tx });
		Ok(UnboundedReceiverStream::new(rx).boxed())
	}

	async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> AppResult<()> {
		let mut queues = self
			.exchanges
			.get_mut(exchange)
			.ok_or_else(|| AppError::Unavailable(format!("exchange {} not declared", exchange)))?;
		queues.retain(|q| !q.tx.is_closed());
		for q in queues.iter().filter(|q| binding_matches(&q.binding, routing_key)) {
			let _ = q.tx.send(payload.clone());
		}
		Ok(())
	}
}

/// Redis pub/sub backend.
///
/// Channels are named `<exchange>:<routing key>`. An instance queue is a
/// dedicated pub/sub connection pattern-subscribed to `<exchange>:<binding>`;
/// Redis forgets it as soon as the connection goes away.
pub struct RedisBroker {
	client: redis::Client,
	publisher: MultiplexedConnection,
}

impl RedisBroker {
	pub async fn connect(url: &str) -> AppResult<Self> {
		let client = redis::Client::open(url)?;
		let publisher = bounded(REDIS_TIMEOUT, "connecting", client.get_multiplexed_async_connection()).await?;
		Ok(Self { client, publisher })
	}
}

fn redis_channel(exchange: &str, key: &str) -> String {
	format!("{}:{}", exchange, key)
}

/// Fails with `Unavailable` when Redis does not answer within `limit`.
async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> AppResult<T>
where
	F: std::future::Future<Output = redis::RedisResult<T>>,
{
	match timeout(limit, call).await {
		Ok(res) => Ok(res?),
		Err(_) => Err(AppError::Unavailable(format!("redis did not answer while {}", what))),
	}
}

async fn redis_subscribe(client: &redis::Client, pattern: &str) -> AppResult<PubSub> {
	let mut pubsub = bounded(REDIS_TIMEOUT, "opening a pub/sub connection", client.get_async_pubsub()).await?;
	bounded(REDIS_TIMEOUT, &format!("subscribing to {}", pattern), pubsub.psubscribe(pattern)).await?;
	Ok(pubsub)
}

/// Forwards messages into `tx`, resubscribing with backoff whenever the connection drops.
async fn redis_pump(client: redis::Client, pattern: String, queue: String, mut pubsub: PubSub, tx: mpsc::Sender<Vec<u8>>) {
	loop {
		let mut messages = Box::pin(pubsub.into_on_message());
		loop {
			tokio::select! {
				_ = tx.closed() => {
					debug!(queue = %queue, "queue consumer gone, dropping subscription");
					return;
				}
				msg = messages.next() => match msg {
					Some(msg) => {
						if tx.send(msg.get_payload_bytes().to_vec()).await.is_err() {
							return;
						}
					}
					None => break,
				},
			}
		}
		drop(messages);
		error!(queue = %queue, "redis subscription lost, reconnecting");

		let mut backoff = INITIAL_BACKOFF;
		pubsub = loop {
			tokio::select! {
				_ = tx.closed() => return,
				_ = tokio::time::sleep(backoff) => {}
			}
			match redis_subscribe(&client, &pattern).await {
				Ok(ps) => break ps,
				Err(e) => {
					warn!(error = %e, queue = %queue, backoff_secs = backoff.as_secs(), "redis resubscribe failed");
					backoff = (backoff * 2).min(MAX_BACKOFF);
				}
			}
		};
		info!(queue = %queue, "redis subscription restored");
	}
}

#[rocket::async_trait]
impl Broker for RedisBroker {
	async fn declare_exchange(&self, exchange: &str) -> AppResult<()> {
		// Channels need no declaration; this only proves the server is reachable.
		let mut conn = self.publisher.clone();
		let _: String = bounded(REDIS_TIMEOUT, &format!("declaring {}", exchange), redis::cmd("PING").query_async(&mut conn)).await?;
		Ok(())
	}

	async fn bind_queue(&self, exchange: &str, queue: &str, binding: &str) -> AppResult<Delivery> {
		let pattern = redis_channel(exchange, binding);
		let pubsub = redis_subscribe(&self.client, &pattern).await?;
		let (tx, rx) = mpsc::channel(REDIS_QUEUE_CAPACITY);
		tokio::spawn(redis_pump(self.client.clone(), pattern, queue.to_string(), pubsub, tx));
		Ok(ReceiverStream::new(rx).boxed())
	}

	async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> AppResult<()> {
		let mut conn = self.publisher.clone();
		let channel = redis_channel(exchange, routing_key);
		let receivers: i64 = bounded(REDIS_TIMEOUT, &format!("publishing to {}", channel), conn.publish(&channel, payload)).await?;
		debug!(exchange, routing_key, receivers, "published to redis");
		Ok(())
	}
}
