//! Connection registry and the distribution actor that owns it.
//!
//! Every mutation of the registry and every delivery decision happens on one
//! task, fed through an unbounded command channel. Delivery into a
//! connection's mailbox is a `try_send`: a full mailbox loses that one event
//! and the loop moves on, so a slow reader can never hold up anyone else.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::models::{BroadcastRequest, ConnectionId, HubStats, Identity, OutboundEvent, Target};

/// Reading half of a connection's bounded event queue.
pub type Mailbox = mpsc::Receiver<OutboundEvent>;

pub struct Connection {
	pub id: ConnectionId,
	pub identity: Identity,
	pub subscriptions: HashSet<String>,
	mailbox: mpsc::Sender<OutboundEvent>,
}

impl Connection {
	/// Builds a connection record with a fresh id and returns it with the reading end of its mailbox.
	pub fn open<I, S>(identity: Identity, topics: I, capacity: usize) -> (Self, Mailbox)
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let (tx, rx) = mpsc::channel(capacity.max(1));
		let conn = Self {
			id: ConnectionId::generate(),
			identity,
			subscriptions: topics.into_iter().map(Into::into).collect(),
			mailbox: tx,
		};
		(conn, rx)
	}
}

#[derive(Default)]
pub(crate) struct Registry {
	connections: HashMap<ConnectionId, Connection>,
}

impl Registry {
	pub(crate) fn insert(&mut self, conn: Connection) {
		self.connections.insert(conn.id, conn);
	}

	/// Removing an id that is not present is a no-op.
	pub(crate) fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
		self.connections.remove(id)
	}

	pub(crate) fn lookup(&self, id: &ConnectionId) -> Option<&Connection> {
		self.connections.get(id)
	}

	fn lookup_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
		self.connections.get_mut(id)
	}

	pub(crate) fn resolve(&self, target: &Target) -> Vec<ConnectionId> {
		self.connections
			.values()
			.filter(|c| target.matches(&c.identity, &c.subscriptions))
			.map(|c| c.id)
			.collect()
	}

	pub(crate) fn len(&self) -> usize {
		self.connections.len()
	}

	fn clear(&mut self) -> usize {
		let n = self.connections.len();
		self.connections.clear();
		n
	}
}

enum Command {
	Register(Connection),
	Unregister(ConnectionId),
	Broadcast(BroadcastRequest),
	Subscriptions {
		id: ConnectionId,
		owner: String,
		topics: Vec<String>,
		add: bool,
		reply: oneshot::Sender<AppResult<()>>,
	},
	Stats(oneshot::Sender<HubStats>),
	Shutdown(oneshot::Sender<()>),
}

/// Handle to the distribution actor. Cheap to clone; every clone talks to the same task.
#[derive(Clone)]
pub struct Hub {
	tx: mpsc::UnboundedSender<Command>,
	mailbox_capacity: usize,
}

impl Hub {
	/// Spawns the actor task on the current runtime.
	pub fn start(mailbox_capacity: usize) -> (Self, JoinHandle<()>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let actor = Actor { registry: Registry::default(), delivered: 0, dropped: 0 };
		let handle = tokio::spawn(actor.run(rx));
		(Self { tx, mailbox_capacity: mailbox_capacity.max(1) }, handle)
	}

	pub fn mailbox_capacity(&self) -> usize {
		self.mailbox_capacity
	}

	pub fn register(&self, conn: Connection) -> AppResult<()> {
		self.send(Command::Register(conn))
	}

	/// Fire-and-forget so it can run from `Drop`. A stopped actor has already closed every mailbox.
	pub fn unregister(&self, id: ConnectionId) {
		let _ = self.tx.send(Command::Unregister(id));
	}

	pub fn broadcast(&self, req: BroadcastRequest) -> AppResult<()> {
		self.send(Command::Broadcast(req))
	}

	pub async fn subscribe(&self, id: ConnectionId, owner: &str, topics: Vec<String>) -> AppResult<()> {
		self.update_subscriptions(id, owner, topics, true).await
	}

	pub async fn unsubscribe(&self, id: ConnectionId, owner: &str, topics: Vec<String>) -> AppResult<()> {
		self.update_subscriptions(id, owner, topics, false).await
	}

	pub async fn stats(&self) -> AppResult<HubStats> {
		let (reply, rx) = oneshot::channel();
		self.send(Command::Stats(reply))?;
		rx.await.map_err(|_| stopped())
	}

	/// Unregisters every connection and stops the actor. Safe to call more than once.
	pub async fn shutdown(&self) {
		let (reply, rx) = oneshot::channel();
		if self.tx.send(Command::Shutdown(reply)).is_ok() {
			let _ = rx.await;
		}
	}

	async fn update_subscriptions(&self, id: ConnectionId, owner: &str, topics: Vec<String>, add: bool) -> AppResult<()> {
		let (reply, rx) = oneshot::channel();
		self.send(Command::Subscriptions { id, owner: owner.to_string(), topics, add, reply })?;
		rx.await.map_err(|_| stopped())?
	}

	fn send(&self, cmd: Command) -> AppResult<()> {
		self.tx.send(cmd).map_err(|_| stopped())
	}
}

fn stopped() -> AppError {
	AppError::Unavailable("event hub stopped".into())
}

struct Actor {
	registry: Registry,
	delivered: u64,
	dropped: u64,
}

impl Actor {
	async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
		while let Some(cmd) = rx.recv().await {
			match cmd {
				Command::Register(conn) => self.register(conn),
				Command::Unregister(id) => self.unregister(id),
				Command::Broadcast(req) => self.broadcast(req),
				Command::Subscriptions { id, owner, topics, add, reply } => {
					let _ = reply.send(self.update_subscriptions(id, &owner, topics, add));
				}
				Command::Stats(reply) => {
					let _ = reply.send(HubStats { connections: self.registry.len(), delivered: self.delivered, dropped: self.dropped });
				}
				Command::Shutdown(reply) => {
					let closed = self.registry.clear();
					info!(closed, delivered = self.delivered, dropped = self.dropped, "event hub shut down");
					let _ = reply.send(());
					return;
				}
			}
		}
		self.registry.clear();
	}

	fn register(&mut self, conn: Connection) {
		let id = conn.id;
		// A fresh mailbox always has room for the handshake.
		if conn.mailbox.try_send(OutboundEvent::handshake(id)).is_err() {
			debug!(connection_id = %id, "mailbox closed before registration");
			return;
		}
		debug!(connection_id = %id, subject = %conn.identity.subject, "connection registered");
		self.registry.insert(conn);
	}

	fn unregister(&mut self, id: ConnectionId) {
		// Dropping the sender closes the mailbox.
		if self.registry.remove(&id).is_some() {
			debug!(connection_id = %id, "connection unregistered");
		}
	}

	fn broadcast(&mut self, req: BroadcastRequest) {
		let mut closed = Vec::new();
		for id in self.registry.resolve(&req.target) {
			let Some(conn) = self.registry.lookup(&id) else { continue };
			match conn.mailbox.try_send(req.event.clone()) {
				Ok(()) => self.delivered += 1,
				Err(TrySendError::Full(_)) => {
					self.dropped += 1;
					debug!(connection_id = %id, topic = %req.event.topic, dropped_total = self.dropped, "mailbox full, event dropped");
				}
				Err(TrySendError::Closed(_)) => closed.push(id),
			}
		}
		for id in closed {
			self.registry.remove(&id);
			debug!(connection_id = %id, "mailbox closed, connection removed");
		}
	}

	fn update_subscriptions(&mut self, id: ConnectionId, owner: &str, topics: Vec<String>, add: bool) -> AppResult<()> {
		let conn = self.registry.lookup_mut(&id).ok_or(AppError::NotFound)?;
		if conn.identity.subject != owner {
			return Err(AppError::Forbidden);
		}
		for topic in topics {
			if add {
				conn.subscriptions.insert(topic);
			} else {
				conn.subscriptions.remove(&topic);
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::HANDSHAKE_TOPIC;
	use serde_json::json;
	use std::time::Duration;
	use tokio::time::timeout;

	fn connect(hub: &Hub, identity: Identity, capacity: usize) -> (ConnectionId, Mailbox) {
		let (conn, mailbox) = Connection::open(identity, Vec::<String>::new(), capacity);
		let id = conn.id;
		hub.register(conn).unwrap();
		(id, mailbox)
	}

	async fn next(mailbox: &mut Mailbox) -> Option<OutboundEvent> {
		timeout(Duration::from_millis(200), mailbox.recv()).await.ok().flatten()
	}

	async fn skip_handshake(mailbox: &mut Mailbox) {
		let ev = next(mailbox).await.expect("handshake");
		assert_eq!(ev.topic, HANDSHAKE_TOPIC);
	}

	#[tokio::test]
	async fn handshake_is_first_event() {
		let (hub, _task) = Hub::start(8);
		let (id, mut mailbox) = connect(&hub, Identity::new("a"), 8);
		hub.broadcast(BroadcastRequest::all(OutboundEvent::new("time", json!("now")))).unwrap();

		let first = next(&mut mailbox).await.unwrap();
		assert_eq!(first, OutboundEvent::handshake(id));
		assert_eq!(first.payload, json!(id.to_string()));
		assert_eq!(next(&mut mailbox).await.unwrap().topic, "time");
	}

	#[tokio::test]
	async fn unregister_is_idempotent() {
		let (hub, _task) = Hub::start(8);
		let (id, mut mailbox) = connect(&hub, Identity::new("a"), 8);
		let (_other, _other_mailbox) = connect(&hub, Identity::new("b"), 8);
		assert_eq!(hub.stats().await.unwrap().connections, 2);

		hub.unregister(id);
		assert_eq!(hub.stats().await.unwrap().connections, 1);
		hub.unregister(id);
		hub.unregister(ConnectionId::generate());
		assert_eq!(hub.stats().await.unwrap().connections, 1);

		skip_handshake(&mut mailbox).await;
		assert!(mailbox.recv().await.is_none(), "mailbox closed after unregister");
	}

	#[tokio::test]
	async fn group_target_reaches_only_members() {
		let (hub, _task) = Hub::start(8);
		let (_, mut a) = connect(&hub, Identity::new("a"), 8);
		let (_, mut b) = connect(&hub, Identity::new("b").with_groups(["teamX"]), 8);
		let (_, mut c) = connect(&hub, Identity::new("c").with_groups(["teamY"]), 8);
		for m in [&mut a, &mut b, &mut c] {
			skip_handshake(m).await;
		}

		hub.broadcast(BroadcastRequest { target: Target::Group("teamX".into()), event: OutboundEvent::new("cluster.created", json!({"id": 1})) }).unwrap();
		hub.broadcast(BroadcastRequest::all(OutboundEvent::new("cluster.deleted", json!({"id": 2})))).unwrap();

		assert_eq!(next(&mut b).await.unwrap().topic, "cluster.created");
		for m in [&mut a, &mut b, &mut c] {
			assert_eq!(next(m).await.unwrap().topic, "cluster.deleted");
		}
		assert!(next(&mut a).await.is_none());
		assert!(next(&mut c).await.is_none());
	}

	#[tokio::test]
	async fn topic_target_follows_subscriptions() {
		let (hub, _task) = Hub::start(8);
		let (id, mut sub) = connect(&hub, Identity::new("owner"), 8);
		let (_, mut other) = connect(&hub, Identity::new("other"), 8);
		skip_handshake(&mut sub).await;
		skip_handshake(&mut other).await;

		assert!(matches!(hub.subscribe(id, "intruder", vec!["deploys".into()]).await, Err(AppError::Forbidden)));
		assert!(matches!(hub.subscribe(ConnectionId::generate(), "owner", vec!["deploys".into()]).await, Err(AppError::NotFound)));
		hub.subscribe(id, "owner", vec!["deploys".into()]).await.unwrap();

		let deploy = BroadcastRequest { target: Target::Topic("deploys".into()), event: OutboundEvent::new("deploys", json!(1)) };
		hub.broadcast(deploy.clone()).unwrap();
		assert_eq!(next(&mut sub).await.unwrap().payload, json!(1));
		assert!(next(&mut other).await.is_none());

		hub.unsubscribe(id, "owner", vec!["deploys".into()]).await.unwrap();
		hub.broadcast(deploy).unwrap();
		assert!(next(&mut sub).await.is_none());
	}

	#[tokio::test]
	async fn saturated_mailbox_does_not_block_others() {
		let (hub, _task) = Hub::start(8);
		// Capacity 1 is already used up by the handshake nobody reads.
		let (_, _stalled) = connect(&hub, Identity::new("slow"), 1);
		let (_, mut fast) = connect(&hub, Identity::new("fast"), 64);
		skip_handshake(&mut fast).await;

		for i in 0..20 {
			hub.broadcast(BroadcastRequest::all(OutboundEvent::new("tick", json!(i)))).unwrap();
		}
		for i in 0..20 {
			assert_eq!(next(&mut fast).await.unwrap().payload, json!(i));
		}

		let (late, mut late_mailbox) = connect(&hub, Identity::new("late"), 8);
		let first = timeout(Duration::from_millis(200), late_mailbox.recv()).await.unwrap().unwrap();
		assert_eq!(first, OutboundEvent::handshake(late));

		let stats = hub.stats().await.unwrap();
		assert_eq!(stats.dropped, 20);
		assert_eq!(stats.delivered, 20);
		assert_eq!(stats.connections, 3);
	}

	#[tokio::test]
	async fn closed_mailbox_is_pruned_on_delivery() {
		let (hub, _task) = Hub::start(8);
		let (_, mailbox) = connect(&hub, Identity::new("gone"), 8);
		drop(mailbox);
		hub.broadcast(BroadcastRequest::all(OutboundEvent::new("time", json!(0)))).unwrap();
		assert_eq!(hub.stats().await.unwrap().connections, 0);
	}

	#[tokio::test]
	async fn shutdown_closes_every_mailbox() {
		let (hub, task) = Hub::start(8);
		let (_, mut a) = connect(&hub, Identity::new("a"), 8);
		let (_, mut b) = connect(&hub, Identity::new("b"), 8);
		hub.shutdown().await;
		task.await.unwrap();

		for m in [&mut a, &mut b] {
			skip_handshake(m).await;
			assert!(m.recv().await.is_none());
		}
		assert!(hub.stats().await.is_err());
		hub.shutdown().await;
	}

	#[test]
	fn registry_resolves_targets() {
		let mut registry = Registry::default();
		let (a, _ra) = Connection::open(Identity::new("a"), ["alerts"], 4);
		let (b, _rb) = Connection::open(Identity::new("b").with_groups(["teamX"]), Vec::<String>::new(), 4);
		let (a_id, b_id) = (a.id, b.id);
		registry.insert(a);
		registry.insert(b);

		assert_eq!(registry.resolve(&Target::All).len(), 2);
		assert_eq!(registry.resolve(&Target::Topic("alerts".into())), vec![a_id]);
		assert_eq!(registry.resolve(&Target::Group("teamX".into())), vec![b_id]);
		assert!(registry.lookup(&a_id).is_some());

		assert!(registry.remove(&a_id).is_some());
		assert!(registry.remove(&a_id).is_none());
		assert_eq!(registry.len(), 1);
	}
}
