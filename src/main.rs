use dotenvy::dotenv;
use shuttle_runtime::SecretStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_events::config::EventsConfig;
use fleet_events::{build_rocket, connect_broker, start_services};

#[shuttle_runtime::main]
async fn rocket(#[shuttle_runtime::Secrets] secrets: SecretStore) -> shuttle_rocket::ShuttleRocket {
    // try_init: the hosting runtime may already have installed a global subscriber
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,rocket=info".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    // Local .env first, then Shuttle secrets on top
    dotenv().ok();
    load_secrets_to_env(&secrets);

    let config = EventsConfig::from_env();
    // Without the broker this instance cannot serve fleet-consistent events; refuse to start.
    let broker = connect_broker(&config).await.map_err(anyhow::Error::from)?;
    let services = start_services(config, broker).await.map_err(anyhow::Error::from)?;
    info!(queue = %services.bridge.queue(), "event distribution ready");

    Ok(build_rocket(services).into())
}

fn load_secrets_to_env(secrets: &SecretStore) {
    for key in [
        "JWT_SECRET",
        "EVENTS_BROKER",
        "REDIS_URL",
        "EVENTS_EXCHANGE",
        "EVENTS_QUEUE_PREFIX",
        "EVENTS_MAILBOX_CAPACITY",
        "EVENTS_KEEPALIVE_SECS",
        "EVENTS_TIME_TICK_SECS",
    ] {
        if let Some(val) = secrets.get(key) {
            std::env::set_var(key, val);
        }
    }
}
