use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use passage::{Config, Identity, Keypair, Node};

#[derive(Parser, Debug)]
#[command(name = "passage")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP address to bind.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Relay server to use for punching and circuit fallback.
    #[arg(short, long)]
    relay: Option<SocketAddr>,

    /// Addresses the operator asserts are reachable.
    #[arg(short = 'a', long = "addr")]
    operator_addrs: Vec<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a relay server (requires a publicly reachable bind address).
    Relay,
    /// Run a node: announce to the directory and accept connections.
    Serve,
    /// Connect to a peer by identity and ping it.
    Connect {
        /// Target identity, 64 hex characters.
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config {
        listen_addr: args.bind,
        relay_addr: args.relay,
        operator_addrs: args.operator_addrs,
        ..Config::default()
    };

    match args.command {
        Command::Relay => {
            config.serve_relay = true;
            config.serve_directory = true;
            let node = Node::start(Keypair::generate(), config).await?;
            info!(
                "relay running: {}/{}",
                node.local_addr(),
                node.identity().to_hex()
            );
            tokio::signal::ctrl_c().await?;
            node.shutdown().await;
        }
        Command::Serve => {
            let has_relay = config.relay_addr.is_some();
            let node = Node::start(Keypair::generate(), config).await?;
            info!(
                "node running: {}/{}",
                node.local_addr(),
                node.identity().to_hex()
            );
            if has_relay {
                if let Err(e) = node.connect_relay().await {
                    warn!(error = %e, "relay registration failed");
                }
            }
            if let Err(e) = node.announce().await {
                warn!(error = %e, "initial announce failed");
            }
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    incoming = node.accept_stream() => {
                        let Some(mut stream) = incoming else { break };
                        info!(peer = %stream.peer.short(), tag = %stream.tag, "stream accepted");
                        tokio::spawn(async move {
                            // Echo until the peer finishes.
                            let mut buf = [0u8; 4096];
                            while let Ok(Some(n)) = stream.recv.read(&mut buf).await {
                                if stream.send.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                            let _ = stream.send.finish();
                        });
                    }
                }
            }
            node.shutdown().await;
        }
        Command::Connect { target } => {
            let target = Identity::from_hex(&target).context("invalid target identity")?;
            let node = Node::start(Keypair::generate(), config).await?;
            info!("node identity: {}", node.identity().to_hex());

            let conn = node.connect(target).await?;
            info!(path = conn.path(), "connected to {}", target.short());

            let started = time::Instant::now();
            conn.ping().await?;
            info!(rtt_ms = started.elapsed().as_millis(), "ping ok");

            time::sleep(Duration::from_millis(100)).await;
            conn.close();
            node.shutdown().await;
        }
    }

    Ok(())
}
