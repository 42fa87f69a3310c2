//! Connects to a server, prints every `ClientEvent` it receives, and
//! proposes one entry of its own. Run with `cargo run --features demo
//! --bin entrysync-demo -- <host> [port]`.

use std::time::Duration;

use entrysync::{Client, ClientConfig, ClientEvent, EntryFlags, EntryType, EntryValue};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(entrysync::DEFAULT_PORT);

    let config = ClientConfig {
        client_ident: "entrysync-demo".to_string(),
        server_port: port,
        ..ClientConfig::new(host.clone())
    };

    info!(host, port, "connecting");
    let (client, mut events) = match Client::connect(config).await {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("failed to connect: {e}");
            std::process::exit(1);
        }
    };

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::ConnectionStateChanged(state) => {
                    info!(?state, "connection state changed");
                }
                ClientEvent::EntryAssigned { id, name } => {
                    info!(id, name, "entry assigned");
                }
                ClientEvent::EntryUpdated { id, .. } => {
                    info!(id, "entry updated");
                }
                ClientEvent::EntryFlagsUpdated { id } => {
                    info!(id, "entry flags updated");
                }
                ClientEvent::EntryDeleted { id, name } => {
                    info!(id, name, "entry deleted");
                }
                ClientEvent::EntriesCleared => {
                    info!("entries cleared");
                }
                ClientEvent::RpcResponse {
                    def_id,
                    unique_id,
                    results,
                } => {
                    info!(def_id, unique_id, ?results, "rpc response");
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Err(e) = client
        .set_entry(
            "/demo/hello",
            EntryType::String,
            EntryValue::String("world".to_string()),
            EntryFlags::default(),
        )
        .await
    {
        eprintln!("set_entry failed: {e}");
    }

    tokio::signal::ctrl_c().await.ok();
    client.close().await;
}
