use anyhow::{Context, Result};
use silo::{
    client::call_actor_forever,
    echo::{EchoActor, EchoClient},
    ActorId, ActorRuntime, MemoryStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let clients = std::env::var("ECHO_CLIENTS")
        .ok()
        .and_then(|clients| clients.parse().ok())
        .unwrap_or(3);

    let runtime = ActorRuntime::new(Arc::new(MemoryStore::default()));
    runtime.register::<EchoActor>().await?;

    let shutdown = CancellationToken::new();
    let mut drivers = Vec::new();
    for index in 0..clients {
        let id = ActorId::random();
        info!("Starting echo client {index} for actor {id}");
        let client = EchoClient::new(runtime.actor_ref::<EchoActor>(id)?);
        drivers.push(tokio::spawn(call_actor_forever(
            client,
            index,
            shutdown.clone(),
        )));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Cannot listen for ctrl-c")?;
    info!("Interrupted, shutting down");
    shutdown.cancel();

    for driver in drivers {
        match driver.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Echo client failed: {e}"),
            Err(e) => error!("Echo client task panicked: {e}"),
        }
    }
    runtime.shutdown().await;
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .context("Cannot initialize tracing subscriber")
}
