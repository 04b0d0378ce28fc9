use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{Route, State};
use serde_json::json;

use crate::bridge::BrokerBridge;
use crate::errors::AppResult;
use crate::hub::Hub;
use crate::models::now_iso;

#[get("/health")]
pub async fn health(hub: &State<Hub>, bridge: &State<Arc<BrokerBridge>>) -> AppResult<Json<serde_json::Value>> {
	let stats = hub.stats().await?;
	Ok(Json(json!({
		"status": "ok",
		"ts": now_iso(),
		"instance_queue": bridge.queue(),
		"connections": stats.connections,
		"delivered": stats.delivered,
		"dropped": stats.dropped,
	})))
}

pub fn mount_routes() -> Vec<Route> {
	routes![
		health,
		// streaming
		crate::stream::listen,
		crate::stream::subscribe,
		crate::stream::unsubscribe,
		// publishing
		crate::publish::send,
	]
}
