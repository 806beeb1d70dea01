//! mqlink CLI - message queue IPC server and client
//!
//! # Usage
//!
//! ```bash
//! # Start an echo server on the well-known queue
//! mqlink serve --id 5555
//!
//! # Ping it from another terminal
//! mqlink ping --server /IPC_SERVER.5555 --message hello --count 10
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use mqlink_ipc::{MqEndpoint, QueueName, Role, TransportConfig};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Instant;
use tracing::{info, warn};

/// mqlink - connection-oriented IPC over POSIX message queues
#[derive(Parser)]
#[command(name = "mqlink")]
#[command(about = "Point-to-point IPC over POSIX message queues")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Transport configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a client and echo every message back
    Serve {
        /// Server instance id; the queue is /IPC_SERVER.<id>
        #[arg(long, default_value = "5555", conflicts_with = "name")]
        id: String,

        /// Explicit queue name
        #[arg(short, long)]
        name: Option<String>,

        /// Exit after echoing this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Connect to a server, send messages and print the replies
    Ping {
        /// Server queue name
        #[arg(short, long, default_value = "/IPC_SERVER.5555")]
        server: String,

        /// Client queue name (defaults to /IPC_CLIENT.<pid>)
        #[arg(long)]
        name: Option<String>,

        /// Message payload
        #[arg(short, long, default_value = "ping")]
        message: String,

        /// Number of messages to send
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<TransportConfig> {
    match path {
        Some(path) => TransportConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(TransportConfig::default()),
    }
}

fn serve(config: TransportConfig, name: QueueName, count: Option<usize>) -> Result<()> {
    let server = MqEndpoint::with_config(name.as_str(), Role::Server, config)
        .with_context(|| format!("Failed to create server queue {}", name))?;

    let (tx, rx) = mpsc::channel();
    server.register_receive_callback(Box::new(move |responder, msg| {
        if let Err(e) = responder.send(msg) {
            warn!("Echo failed: {}", e);
        }
        let _ = tx.send(msg.len());
    }))?;

    println!("{} Listening on {}", ">>>".green(), name.to_string().cyan());
    server.accept().context("Accept failed")?;
    println!(
        "{} Client {} connected",
        ">>>".green(),
        server
            .write_name()
            .map(|n| n.to_string())
            .unwrap_or_default()
            .cyan()
    );

    let mut echoed = 0usize;
    while count.map_or(true, |limit| echoed < limit) {
        let Ok(len) = rx.recv() else {
            break;
        };
        echoed += 1;
        info!("Echoed message {} ({} bytes)", echoed, len);
    }

    println!("{} Echoed {} message(s)", ">>>".green(), echoed);
    server.deinit();
    Ok(())
}

fn ping(
    config: TransportConfig,
    server: &str,
    name: QueueName,
    message: &str,
    count: usize,
) -> Result<()> {
    let max = config.max_message_size;
    let client = MqEndpoint::with_config(name.as_str(), Role::Client, config)
        .with_context(|| format!("Failed to create client queue {}", name))?;

    let start = Instant::now();
    client
        .connect(server)
        .with_context(|| format!("Failed to connect to {}", server))?;
    println!(
        "{} Connected {} -> {} in {:.2?}",
        ">>>".green(),
        name.to_string().cyan(),
        server.cyan(),
        start.elapsed()
    );

    let mut buf = vec![0u8; max];
    for seq in 1..=count {
        let sent_at = Instant::now();
        client.send(message.as_bytes()).context("Send failed")?;
        let len = client.receive(&mut buf).context("Receive failed")?;
        println!(
            "  {} seq={} bytes={} rtt={:.2?} reply={}",
            "<".blue(),
            seq,
            len,
            sent_at.elapsed(),
            String::from_utf8_lossy(&buf[..len]).yellow()
        );
    }

    client.deinit();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve { id, name, count } => {
            let name = match name {
                Some(name) => QueueName::new(name)?,
                None => QueueName::for_role(Role::Server, id)?,
            };
            serve(config, name, count)
        }

        Commands::Ping {
            server,
            name,
            message,
            count,
        } => {
            let name = match name {
                Some(name) => QueueName::new(name)?,
                None => QueueName::for_process(Role::Client),
            };
            ping(config, &server, name, &message, count)
        }
    }
}
