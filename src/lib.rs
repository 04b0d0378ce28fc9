#![allow(clippy::result_large_err)]

#[macro_use]
extern crate rocket;

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod errors;
pub mod hub;
pub mod models;
pub mod publish;
pub mod routes;
pub mod stream;
pub mod ticker;

use std::sync::Arc;

use rocket::fairing::AdHoc;
use rocket::{Build, Orbit, Rocket};
use rocket_cors::{AllowedHeaders, AllowedMethods, AllowedOrigins, CorsOptions};
use tracing::info;

use crate::bridge::BrokerBridge;
use crate::broker::{Broker, MemoryBroker, RedisBroker, Topology};
use crate::config::{BrokerKind, EventsConfig};
use crate::errors::AppResult;
use crate::hub::Hub;
use crate::publish::PublishGateway;

/// Running pieces of one instance, wired and ready to be mounted.
pub struct Services {
	pub config: EventsConfig,
	pub hub: Hub,
	pub bridge: Arc<BrokerBridge>,
}

pub async fn connect_broker(config: &EventsConfig) -> AppResult<Arc<dyn Broker>> {
	match &config.broker {
		BrokerKind::Redis(url) => {
			info!("connecting to redis broker");
			Ok(Arc::new(RedisBroker::connect(url).await?))
		}
		BrokerKind::Memory => {
			info!("using in-process broker; events will not reach other instances");
			Ok(Arc::new(MemoryBroker::new()))
		}
	}
}

/// Starts the hub and binds the broker bridge. A broker that cannot be
/// reached fails the whole startup.
pub async fn start_services(config: EventsConfig, broker: Arc<dyn Broker>) -> AppResult<Services> {
	let (hub, _actor) = Hub::start(config.mailbox_capacity);
	let topology = Topology::new(&config.exchange, &config.queue_prefix);
	let bridge = match BrokerBridge::start(broker, topology, hub.clone()).await {
		Ok(bridge) => Arc::new(bridge),
		Err(e) => {
			hub.shutdown().await;
			return Err(e);
		}
	};
	if let Some(period) = config.time_tick {
		ticker::spawn_time_ticker(hub.clone(), period);
	}
	Ok(Services { config, hub, bridge })
}

pub fn build_rocket(services: Services) -> Rocket<Build> {
	let Services { config, hub, bridge } = services;
	let gateway = PublishGateway::new(bridge.clone());
	rocket::build()
		.manage(config)
		.manage(hub)
		.manage(bridge)
		.manage(gateway)
		.attach(build_cors())
		.attach(AdHoc::on_shutdown("event hub drain", |rocket| Box::pin(drain(rocket))))
		.register("/", errors::catchers())
		.mount("/api/v1", routes::mount_routes())
}

/// Stops the broker consumer, then closes every open stream's mailbox.
pub async fn drain(rocket: &Rocket<Orbit>) {
	if let Some(bridge) = rocket.state::<Arc<BrokerBridge>>() {
		bridge.shutdown();
	}
	if let Some(hub) = rocket.state::<Hub>() {
		hub.shutdown().await;
	}
	info!("event streams drained");
}

fn build_cors() -> rocket_cors::Cors {
	let allowed_origins = AllowedOrigins::all();
	let allowed_methods: AllowedMethods = [
		rocket::http::Method::Get,
		rocket::http::Method::Post,
		rocket::http::Method::Delete,
		rocket::http::Method::Options,
	]
	.into_iter()
	.map(From::from)
	.collect();

	CorsOptions {
		allowed_origins,
		allowed_methods,
		allowed_headers: AllowedHeaders::all(),
		allow_credentials: true,
		..Default::default()
	}
	.to_cors()
	.expect("CORS configuration must be valid")
}
