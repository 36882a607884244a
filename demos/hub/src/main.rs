//! Lumen Hub demo
//!
//! Runs a small lighting controller, or a client that connects to one,
//! pings it and toggles a light with a prediction.
//!
//! Environment variables:
//! - LUMEN_MODE: "server" (default) or "client"
//! - LUMEN_BIND_ADDR: Bind address (server only, default 0.0.0.0:8480)
//! - LUMEN_ENDPOINT: Host or controller id (client only, default 127.0.0.1:8480)
//! - LUMEN_USER / LUMEN_SECRET: Credentials (client only, default alice/alice)
//! - LUMEN_STATE_FILE: Where the client keeps its last known state (optional)
//! - RUST_LOG: Log filter (default info)

mod lights;

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use lumen_sync::client::{JsonFilePersistence, StatePersistence};
use lumen_sync::delta::StateTree;
use lumen_sync::prelude::*;
use lumen_sync::server::ServerEvent;
use serde_json::Value;
use tokio::{signal, time};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match var_or("LUMEN_MODE", "server").as_str() {
        "server" => run_server().await,
        "client" => run_client().await,
        other => bail!("unknown LUMEN_MODE {other:?}, expected server or client"),
    }
}

async fn run_server() -> Result<()> {
    let bind_addr: SocketAddr = var_or("LUMEN_BIND_ADDR", DEFAULT_BIND_ADDR)
        .parse()
        .context("LUMEN_BIND_ADDR is not a socket address")?;

    let config = LumenServerBuilder::new()
        .bind_addr(bind_addr)
        .privileged_key("users")
        .identity("users", "me")
        .build();
    let users = StaticCredentials::new()
        .admin("alice", "alice")
        .user("bob", "bob");

    let (server, mut events) =
        LumenServer::bind(config, users, lights::Lights, lights::initial_state()).await?;
    info!(addr = %server.local_addr(), "controller ready");

    // Stand-in for a device reporting on its own.
    let mut heartbeat = time::interval(Duration::from_secs(30));
    let mut uptime = 0u64;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = heartbeat.tick() => {
                let reported = uptime;
                server.mutate(move |state| {
                    state.insert("uptime_s".into(), Value::from(reported));
                })?;
                uptime += 30;
            }
            Some(event) = events.recv() => match event {
                ServerEvent::CommandHandled { session_id, command, error: Some(error) } => {
                    warn!(session = %session_id, command, error = %error, "command failed");
                }
                other => info!(event = ?other, "server event"),
            },
        }
    }

    info!("shutting down");
    server.shutdown().await?;
    Ok(())
}

async fn run_client() -> Result<()> {
    let endpoint = Endpoint::parse(&var_or("LUMEN_ENDPOINT", "127.0.0.1:8480"));
    let config = LumenClientBuilder::new()
        .endpoint(endpoint)
        .credentials(var_or("LUMEN_USER", "alice"), var_or("LUMEN_SECRET", "alice"))
        .mode(ConnectMode::TryOnce)
        .build();
    let persistence = env::var("LUMEN_STATE_FILE")
        .ok()
        .map(|path| Box::new(JsonFilePersistence::new(path)) as Box<dyn StatePersistence>);

    let client = LumenClient::start(config, persistence)?;

    let mut status = client.status_watch();
    let connected = time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| {
            s.state == ConnectionState::Connected
                || (s.state == ConnectionState::Idle && s.last_error.is_some())
        }),
    )
    .await
    .context("timed out waiting for the controller")??
    .clone();
    if connected.state != ConnectionState::Connected {
        bail!(
            "could not connect: {}",
            connected.last_error.unwrap_or_default()
        );
    }
    for warning in client.take_warnings() {
        warn!("{warning}");
    }

    let pong = client.send(Ping, None).await?;
    info!(server_time_ms = pong.server_time_ms, "pong");

    let prediction = Prediction::new("l1", |view: &mut StateTree| {
        if let Some(on) = view
            .get_mut("lights")
            .and_then(|lights| lights.get_mut("l1"))
            .and_then(|light| light.get_mut("on"))
        {
            *on = Value::Bool(!on.as_bool().unwrap_or(false));
        }
    });
    client
        .send(Toggle { target: "l1".into() }, Some(prediction))
        .await?;

    let view = client.view();
    info!(state = %serde_json::to_string_pretty(&*view)?, "view after toggle");

    client.shutdown().await;
    Ok(())
}
