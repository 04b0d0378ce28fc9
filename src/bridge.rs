use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Delivery, Topology, BROADCAST_BINDING};
use crate::errors::{AppError, AppResult};
use crate::hub::Hub;
use crate::models::{BroadcastRequest, BrokerEnvelope, BusMessage, SubscriptionChange};
use crate::publish::{validate_request, validate_topic};

/// Connects this instance's hub to the shared exchange.
///
/// Everything published through the bridge, from any instance, comes back
/// through this instance's queue and is handed to the local hub.
pub struct BrokerBridge {
	broker: Arc<dyn Broker>,
	topology: Topology,
	consumer: JoinHandle<()>,
}

impl BrokerBridge {
	/// Declares the exchange, binds the instance queue and starts the consumer.
	/// Any broker failure here is returned; callers treat it as fatal.
	pub async fn start(broker: Arc<dyn Broker>, topology: Topology, hub: Hub) -> AppResult<Self> {
		broker.declare_exchange(&topology.exchange).await?;
		let deliveries = broker.bind_queue(&topology.exchange, &topology.queue, BROADCAST_BINDING).await?;
		info!(exchange = %topology.exchange, queue = %topology.queue, "broker bridge bound");
		let consumer = tokio::spawn(consume(deliveries, hub, topology.queue.clone()));
		Ok(Self { broker, topology, consumer })
	}

	pub fn queue(&self) -> &str {
		&self.topology.queue
	}

	pub async fn publish(&self, request: BroadcastRequest) -> AppResult<()> {
		let routing_key = Topology::routing_key(&request.event.topic);
		self.send(&routing_key, BusMessage::Broadcast(request)).await
	}

	/// Hands a subscription edit to every instance; the one holding the connection applies it.
	pub async fn forward_subscriptions(&self, change: SubscriptionChange) -> AppResult<()> {
		self.send(&Topology::subscriptions_routing_key(), BusMessage::Subscriptions(change)).await
	}

	async fn send(&self, routing_key: &str, message: BusMessage) -> AppResult<()> {
		let envelope = BrokerEnvelope { origin: self.topology.queue.clone(), message };
		let payload = serde_json::to_vec(&envelope)?;
		self.broker.publish(&self.topology.exchange, routing_key, payload).await
	}

	pub fn shutdown(&self) {
		self.consumer.abort();
	}
}

impl Drop for BrokerBridge {
	fn drop(&mut self) {
		self.consumer.abort();
	}
}

pub fn decode(raw: &[u8]) -> AppResult<BrokerEnvelope> {
	let envelope: BrokerEnvelope = serde_json::from_slice(raw)?;
	let checked = match &envelope.message {
		BusMessage::Broadcast(request) => validate_request(request),
		BusMessage::Subscriptions(change) => change.topics.iter().try_for_each(|t| validate_topic(t)),
	};
	checked.map_err(|e| AppError::BadRequest(format!("rejected broker message from {}: {}", envelope.origin, e)))?;
	Ok(envelope)
}

async fn consume(mut deliveries: Delivery, hub: Hub, queue: String) {
	while let Some(raw) = deliveries.next().await {
		let envelope = match decode(&raw) {
			Ok(envelope) => envelope,
			Err(e) => {
				warn!(queue = %queue, error = %e, bytes = raw.len(), "discarding malformed broker message");
				continue;
			}
		};
		let running = match envelope.message {
			BusMessage::Broadcast(request) => hub.broadcast(request).is_ok(),
			BusMessage::Subscriptions(change) => apply_subscriptions(&hub, &queue, &envelope.origin, change).await,
		};
		if !running {
			info!(queue = %queue, "event hub stopped, broker consumer exiting");
			return;
		}
	}
	warn!(queue = %queue, "broker delivery stream ended");
}

/// Returns false once the hub has stopped.
async fn apply_subscriptions(hub: &Hub, queue: &str, origin: &str, change: SubscriptionChange) -> bool {
	let SubscriptionChange { connection_id, owner, topics, add } = change;
	let res = if add {
		hub.subscribe(connection_id, &owner, topics).await
	} else {
		hub.unsubscribe(connection_id, &owner, topics).await
	};
	match res {
		Ok(()) => debug!(queue, origin, connection_id = %connection_id, add, "applied forwarded subscription change"),
		// Held by another instance, or already gone.
		Err(AppError::NotFound) => {}
		Err(AppError::Unavailable(_)) => return false,
		Err(e) => warn!(queue, origin, connection_id = %connection_id, owner = %owner, error = %e, "rejected forwarded subscription change"),
	}
	true
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::broker::MemoryBroker;
	use crate::hub::{Connection, Mailbox};
	use crate::models::{ConnectionId, Identity, OutboundEvent, Target, HANDSHAKE_TOPIC};
	use serde_json::json;
	use std::time::Duration;
	use tokio::time::timeout;

	struct Instance {
		hub: Hub,
		bridge: BrokerBridge,
	}

	async fn instance(broker: &MemoryBroker) -> Instance {
		let (hub, _task) = Hub::start(16);
		let topology = Topology::new("fleet.events", "test.instance.");
		let bridge = BrokerBridge::start(Arc::new(broker.clone()), topology, hub.clone()).await.unwrap();
		Instance { hub, bridge }
	}

	async fn listen(hub: &Hub, identity: Identity) -> Mailbox {
		let (conn, mut mailbox) = Connection::open(identity, Vec::<String>::new(), 16);
		hub.register(conn).unwrap();
		let handshake = timeout(Duration::from_millis(200), mailbox.recv()).await.unwrap().unwrap();
		assert_eq!(handshake.topic, HANDSHAKE_TOPIC);
		mailbox
	}

	async fn quiet(mailbox: &mut Mailbox) -> bool {
		timeout(Duration::from_millis(150), mailbox.recv()).await.is_err()
	}

	#[tokio::test]
	async fn publish_on_one_instance_reaches_clients_of_another_once() {
		let broker = MemoryBroker::new();
		let i1 = instance(&broker).await;
		let i2 = instance(&broker).await;
		assert_eq!(broker.queues("fleet.events").len(), 2);

		let mut x = listen(&i1.hub, Identity::new("x")).await;
		i2.bridge.publish(BroadcastRequest::all(OutboundEvent::new("cluster.created", json!({"id": 42})))).await.unwrap();

		let got = timeout(Duration::from_millis(500), x.recv()).await.unwrap().unwrap();
		assert_eq!(got.topic, "cluster.created");
		assert_eq!(got.payload, json!({"id": 42}));
		assert!(quiet(&mut x).await, "delivered more than once");

		let s1 = i1.hub.stats().await.unwrap();
		let s2 = i2.hub.stats().await.unwrap();
		assert_eq!(s1.delivered, 1);
		assert_eq!((s2.connections, s2.delivered), (0, 0));
	}

	#[tokio::test]
	async fn publishing_instance_sees_its_own_event_through_the_broker() {
		let broker = MemoryBroker::new();
		let i1 = instance(&broker).await;
		let mut local = listen(&i1.hub, Identity::new("local").with_groups(["teamX"])).await;
		let mut outsider = listen(&i1.hub, Identity::new("outsider")).await;

		let req = BroadcastRequest { target: Target::Group("teamX".into()), event: OutboundEvent::new("deploy.finished", json!(null)) };
		i1.bridge.publish(req).await.unwrap();

		let got = timeout(Duration::from_millis(500), local.recv()).await.unwrap().unwrap();
		assert_eq!(got.topic, "deploy.finished");
		assert!(quiet(&mut outsider).await);
	}

	#[tokio::test]
	async fn malformed_messages_are_dropped_and_consumer_keeps_going() {
		let broker = MemoryBroker::new();
		let i1 = instance(&broker).await;
		let mut x = listen(&i1.hub, Identity::new("x")).await;

		broker.publish("fleet.events", "broadcast.junk", b"not json".to_vec()).await.unwrap();
		let spoofed = json!({
			"origin": "elsewhere",
			"message": {"kind": "broadcast", "body": {"target": {"type": "all"}, "event": {"event": HANDSHAKE_TOPIC, "data": "fake"}}}
		});
		broker.publish("fleet.events", "broadcast.connection.id", serde_json::to_vec(&spoofed).unwrap()).await.unwrap();
		i1.bridge.publish(BroadcastRequest::all(OutboundEvent::new("time", json!("t")))).await.unwrap();

		let got = timeout(Duration::from_millis(500), x.recv()).await.unwrap().unwrap();
		assert_eq!(got.topic, "time");
		assert!(quiet(&mut x).await);
	}

	#[tokio::test]
	async fn subscription_change_is_applied_by_the_instance_holding_the_connection() {
		let broker = MemoryBroker::new();
		let i1 = instance(&broker).await;
		let i2 = instance(&broker).await;
		let (conn, mut mailbox) = Connection::open(Identity::new("owner"), Vec::<String>::new(), 16);
		let id = conn.id;
		i1.hub.register(conn).unwrap();
		assert_eq!(timeout(Duration::from_millis(200), mailbox.recv()).await.unwrap().unwrap().topic, HANDSHAKE_TOPIC);

		let change = |owner: &str, topic: &str| SubscriptionChange { connection_id: id, owner: owner.into(), topics: vec![topic.into()], add: true };
		i2.bridge.forward_subscriptions(change("intruder", "secrets")).await.unwrap();
		i2.bridge.forward_subscriptions(change("owner", "deploys")).await.unwrap();

		for topic in ["secrets", "deploys"] {
			let req = BroadcastRequest { target: Target::Topic(topic.into()), event: OutboundEvent::new(topic, json!(null)) };
			i2.bridge.publish(req).await.unwrap();
		}
		let got = timeout(Duration::from_millis(500), mailbox.recv()).await.unwrap().unwrap();
		assert_eq!(got.topic, "deploys");
		assert!(quiet(&mut mailbox).await);
	}

	#[test]
	fn decode_accepts_envelopes_and_rejects_garbage() {
		let envelope = BrokerEnvelope {
			origin: "q".into(),
			message: BusMessage::Broadcast(BroadcastRequest::all(OutboundEvent::new("cluster.created", json!([1, 2])))),
		};
		let raw = serde_json::to_vec(&envelope).unwrap();
		assert_eq!(decode(&raw).unwrap().message, envelope.message);
		assert!(matches!(decode(b"{}"), Err(AppError::Json(_))));

		let bad_topic = BrokerEnvelope {
			origin: "q".into(),
			message: BusMessage::Subscriptions(SubscriptionChange {
				connection_id: ConnectionId::generate(),
				owner: "ops".into(),
				topics: vec!["two words".into()],
				add: true,
			}),
		};
		assert!(matches!(decode(&serde_json::to_vec(&bad_topic).unwrap()), Err(AppError::BadRequest(_))));
	}

	#[tokio::test]
	async fn unreachable_broker_fails_startup() {
		let (hub, _task) = Hub::start(4);
		struct Down;
		#[rocket::async_trait]
		impl Broker for Down {
			async fn declare_exchange(&self, _: &str) -> AppResult<()> {
				Err(AppError::Unavailable("down".into()))
			}
			async fn bind_queue(&self, _: &str, _: &str, _: &str) -> AppResult<Delivery> {
				Err(AppError::Unavailable("down".into()))
			}
			async fn publish(&self, _: &str, _: &str, _: Vec<u8>) -> AppResult<()> {
				Err(AppError::Unavailable("down".into()))
			}
		}
		let res = BrokerBridge::start(Arc::new(Down), Topology::new("fleet.events", "q."), hub).await;
		assert!(matches!(res, Err(AppError::Unavailable(_))));
	}
}
