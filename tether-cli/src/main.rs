//! `tether`: pair with a desktop through the relay and talk to it.
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); results go to stdout.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tether_core::{DeviceIdentity, Update};
use tether_transport::{Bridge, TransportConfig, DEFAULT_HANDSHAKE_TIMEOUT};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Args {
    /// Relay base URL (http, https, ws or wss)
    #[arg(long, env = "TETHER_RELAY_URL")]
    relay: String,
    /// Pairing code shown on the desktop
    #[arg(long, env = "TETHER_PAIRING_CODE")]
    code: String,
    /// Stable device identifier (random if unset)
    #[arg(long, env = "TETHER_DEVICE_ID")]
    device_id: Option<String>,
    /// Description shown on the desktop's approval prompt
    #[arg(long, env = "TETHER_DEVICE_DESCRIPTION", default_value = "tether cli")]
    device_name: String,
    /// Handshake deadline in seconds
    #[arg(
        long,
        env = "TETHER_HANDSHAKE_TIMEOUT_SECS",
        default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
    )]
    timeout: u64,
    /// Per-request deadline in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the desktop's version and machine name
    Version,
    /// Send one request and print the response
    Request {
        /// HTTP-style method, e.g. GET
        method: String,
        /// Resource path on the desktop
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
    /// Print updates for the given paths until Ctrl-C
    Watch {
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let device_id = args
        .device_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let config = TransportConfig::new(
        args.relay,
        args.code,
        DeviceIdentity::new(device_id, args.device_name),
    )
    .with_handshake_timeout(Duration::from_secs(args.timeout));

    info!("waiting for the desktop to accept this device");
    let bridge = Bridge::connect(config)
        .await
        .context("pairing failed")?
        .with_request_timeout(Duration::from_secs(args.request_timeout));
    info!("connected");

    let result = run(&bridge, args.command).await;
    bridge.close().await;
    result
}

async fn run(bridge: &Bridge, command: Command) -> Result<()> {
    match command {
        Command::Version => {
            let info = bridge.version().await?;
            println!("{} ({})", info.version, info.machine_name);
        }
        Command::Request { method, path, body } => {
            let body = body
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--body is not valid JSON")?;
            let response = bridge.request(method, path, body).await?;
            println!("{}", response.status);
            println!("{}", serde_json::to_string_pretty(&response.body)?);
        }
        Command::Watch { paths } => watch(bridge, paths).await?,
    }
    Ok(())
}

async fn watch(bridge: &Bridge, paths: Vec<String>) -> Result<()> {
    let (tx, mut updates) = mpsc::unbounded_channel::<Update>();
    for path in paths {
        let mut subscription = bridge.subscribe(path).await?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(update) = subscription.next().await {
                if tx.send(update).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(update) => println!("{} {} {}", update.path, update.status, update.body),
                None => {
                    warn!(state = %bridge.state(), "tunnel closed");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
    }
}
