use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "fleet_events_smoke")]
#[command(about = "Smoke test for the event stream endpoints", long_about = None)]
struct Opts {
	#[arg(long, default_value = "http://127.0.0.1:8000")]
	base: String,
	/// Bearer token holding `global:create` (or the admin role).
	#[arg(long, env = "SMOKE_TOKEN")]
	token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = Opts::parse();
	let base = opts.base.trim_end_matches('/');
	let client = reqwest::Client::new();
	let auth = format!("Bearer {}", opts.token);

	println!("[1/4] GET /health");
	let r = client.get(format!("{}/api/v1/health", base)).send().await?;
	println!("  status: {}", r.status());
	anyhow::ensure!(r.status().is_success(), "health failed");

	println!("[2/4] GET /events/listen");
	let mut stream = client.get(format!("{}/api/v1/events/listen", base)).header("Authorization", &auth).send().await?;
	println!("  status: {}", stream.status());
	anyhow::ensure!(stream.status().is_success(), "listen failed");
	let first = next_frame(&mut stream).await?;
	println!("  first frame: {}", first.trim_end());
	anyhow::ensure!(first.contains("connection.id"), "first frame was not the handshake");

	println!("[3/4] POST /events/send");
	let body = serde_json::json!({"event": "smoke.test", "data": {"ts": time::OffsetDateTime::now_utc().unix_timestamp()}});
	let r = client.post(format!("{}/api/v1/events/send", base)).header("Authorization", &auth).json(&body).send().await?;
	println!("  status: {}", r.status());
	anyhow::ensure!(r.status().is_success(), "send failed");

	println!("[4/4] waiting for smoke.test on the stream");
	loop {
		let frame = next_frame(&mut stream).await?;
		if frame.contains("smoke.test") {
			println!("  got: {}", frame.trim_end());
			break;
		}
	}

	println!("OK");
	Ok(())
}

async fn next_frame(resp: &mut reqwest::Response) -> anyhow::Result<String> {
	let mut buf = String::new();
	while !buf.contains("\n\n") {
		let chunk = tokio::time::timeout(Duration::from_secs(30), resp.chunk())
			.await
			.map_err(|_| anyhow::anyhow!("timed out waiting for stream data"))??;
		let Some(chunk) = chunk else { anyhow::bail!("stream closed") };
		buf.push_str(&String::from_utf8_lossy(&chunk));
	}
	Ok(buf)
}
