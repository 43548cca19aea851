//! lsnet - link-state overlay node
//!
//! Usage: `lsnet <config> <hostname>`, then commands on stdin:
//! `DUMPTABLE <file>`, `FORCEUPDATE`, `CHECKSTABLE`, `SNDMSG <dst> <text>`,
//! `PING <dst>`, `TRACEROUTE <dst>`, `SHUTDOWN`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use lsnet_logging::{LogConfig, LsnetSubscriberBuilder};
use lsnet_node::{Command, DeliveryEvent, NodeConfig, OverlayNode};

#[derive(Parser)]
#[command(name = "lsnet", about = "Link-state overlay routing node", version)]
struct Cli {
    /// Main configuration file
    config: PathBuf,

    /// Hostname of this node, as listed in the weights file
    hostname: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log to stderr as JSON lines instead of pretty text
    #[arg(long)]
    json_logs: bool,

    /// Also write JSONL logs into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::cli(cli.verbose, cli.json_logs);
    if let Some(dir) = &cli.log_dir {
        log_config = log_config.with_node_file(dir, &cli.hostname);
    }
    // Keep the guard alive so buffered file output is flushed on exit
    let _log_guard = LsnetSubscriberBuilder::new().with_config(log_config).init();

    let config = NodeConfig::load(&cli.config, &cli.hostname)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let node = Arc::new(OverlayNode::new(config)?);
    node.start().await.context("starting node")?;

    let printer = tokio::spawn(print_deliveries(Arc::clone(&node)));
    let mut shutdown = node.shutdown_signal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                warn!("node signalled shutdown");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Ok(Command::Shutdown) => break,
                    Ok(command) => {
                        if let Err(e) = run_command(&node, command).await {
                            eprintln!("error: {e:#}");
                        }
                    }
                    Err(e) => eprintln!("error: {e}"),
                }
            }
        }
    }

    node.stop().await?;
    printer.abort();
    Ok(())
}

async fn run_command(node: &OverlayNode, command: Command) -> anyhow::Result<()> {
    match command {
        Command::DumpTable(path) => {
            node.dump_table(&path).await?;
            println!("routing table written to {}", path.display());
        }
        Command::ForceUpdate => node.trigger_force_update().await?,
        Command::CheckStable => {
            println!("{}", if node.is_recomputing() { "no" } else { "yes" });
        }
        Command::SendMessage { destination, text } => {
            let id = node.send_message(&destination, text).await?;
            println!("sent {id}");
        }
        Command::Ping(destination) => {
            let id = node.ping(&destination).await?;
            println!("ping {id}");
        }
        Command::Traceroute(destination) => {
            let id = node.traceroute(&destination).await?;
            println!("traceroute {id}");
        }
        Command::Shutdown => {}
    }
    Ok(())
}

async fn print_deliveries(node: Arc<OverlayNode>) {
    let mut deliveries = node.deliveries();
    loop {
        let event = match deliveries.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "delivery printer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            DeliveryEvent::Message { from, text } => println!("{from} --> {text}"),
            DeliveryEvent::PingReply { from, sequence, rtt } => {
                println!("{sequence} {from} {}", rtt.as_millis())
            }
            DeliveryEvent::PingTimeout { destination, sequence } => {
                println!("PING ERROR: {destination} (seq {sequence}) timed out")
            }
            DeliveryEvent::Traceroute { destination, hops, .. } => {
                println!("traceroute to {destination}:");
                for hop in hops {
                    println!("{} {} {}", hop.hop, hop.hostname, hop.millis);
                }
            }
            DeliveryEvent::Control(packet) => {
                println!("{} from {}: {}", packet.kind, packet.source_name, packet.payload)
            }
            DeliveryEvent::PartialDelivery { id, kind, received_bytes, reason } => {
                println!("PARTIAL {kind} {id}: {received_bytes} bytes received ({reason})")
            }
            DeliveryEvent::Undeliverable { id, destination, reason } => {
                let destination = destination.as_deref().unwrap_or("?");
                println!("UNDELIVERABLE {id} to {destination}: {reason}")
            }
        }
    }
}
