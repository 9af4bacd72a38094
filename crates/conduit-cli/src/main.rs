//! Conduit CLI
//!
//! Run a server, a client, or a UDP node over the Conduit transport.

mod config;

use clap::{Parser, Subcommand};
use conduit_core::{AsyncHandle, ConnectionInfo, RawMessage};
use conduit_transport::{Connector, Role, TransportLayer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use config::{Config, parse_endpoint};

/// How long to wait for a connector to bind or connect
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for a connector to release its resources
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Conduit - framed messages over TCP, TLS and UDP
#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept connections and print received messages
    Serve {
        /// Bind address (overrides the configured endpoint)
        #[arg(short, long)]
        bind: Option<String>,

        /// Send every received message back to its sender
        #[arg(long)]
        echo: bool,
    },

    /// Connect to a server and send messages
    Connect {
        /// Server address (overrides the configured endpoint)
        #[arg(short, long)]
        remote: Option<String>,

        /// Message to send (repeatable)
        #[arg(short, long, required = true)]
        message: Vec<String>,

        /// Number of replies to wait for before disconnecting
        #[arg(long, default_value_t = 0)]
        replies: usize,

        /// Seconds to wait for each send and reply
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },

    /// Run a connectionless UDP node
    Node {
        /// Bind address (overrides the configured endpoint)
        #[arg(short, long)]
        bind: Option<String>,

        /// Peer to send messages to
        #[arg(long)]
        send: Option<String>,

        /// Message to send to the peer (repeatable)
        #[arg(short, long)]
        message: Vec<String>,
    },

    /// Validate the configuration and exit
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load_or_default(cli.config.as_deref())?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Serve { bind, echo } => serve(&config, bind.as_deref(), echo),
        Commands::Connect {
            remote,
            message,
            replies,
            timeout,
        } => connect(
            &config,
            remote.as_deref(),
            message,
            replies,
            Duration::from_secs(timeout),
        ),
        Commands::Node {
            bind,
            send,
            message,
        } => run_node(&config, bind.as_deref(), send.as_deref(), message),
        Commands::CheckConfig => check_config(&config),
    }
}

/// Run a server until Ctrl+C
fn serve(config: &Config, bind: Option<&str>, echo: bool) -> anyhow::Result<()> {
    let server = Arc::new(
        config
            .builder(Role::Server, bind)?
            .state_listener(Arc::new(log_state))
            .build()?,
    );

    let weak = Arc::downgrade(&server);
    server.set_receiver(Arc::new(move |message: RawMessage| {
        print_message(&message);
        if !echo {
            return;
        }
        if let Some(server) = weak.upgrade() {
            if let Err(e) = server.send(message) {
                warn!("Echo failed: {}", e);
            }
        }
    }));

    server.start()?.wait_timeout(START_TIMEOUT)?;
    info!("Started {} on {}", server.kind(), server.local_address());

    println!("Listening on: {}", server.local_address());
    println!("Echo: {}", echo);
    println!("Press Ctrl+C to stop");

    wait_for_ctrl_c()?;
    println!("\nShutting down...");
    server.stop().wait_timeout(STOP_TIMEOUT)?;

    Ok(())
}

/// Connect, send each message, and optionally wait for replies
fn connect(
    config: &Config,
    remote: Option<&str>,
    messages: Vec<String>,
    replies: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    let builder = config
        .builder(Role::Client, remote)?
        .state_listener(Arc::new(log_state));
    let remote = builder.config().endpoint.clone();
    let client = builder.build()?;

    let (tx, rx) = crossbeam_channel::unbounded();
    client.set_receiver(Arc::new(move |message: RawMessage| {
        let _ = tx.send(message);
    }));

    client.start()?.wait_timeout(START_TIMEOUT)?;
    println!("Connected to: {}", remote);

    for text in messages {
        let len = text.len();
        client
            .send(RawMessage::new(text.into_bytes(), remote.clone()))?
            .wait_timeout(timeout)?;
        println!("Sent {} bytes", len);
    }

    for received in 0..replies {
        match rx.recv_timeout(timeout) {
            Ok(message) => print_message(&message),
            Err(_) => {
                client.stop().wait_timeout(STOP_TIMEOUT)?;
                anyhow::bail!("Timed out after {} of {} replies", received, replies);
            }
        }
    }

    client.stop().wait_timeout(STOP_TIMEOUT)?;
    Ok(())
}

/// Run a UDP node until Ctrl+C, optionally sending to a peer first
fn run_node(
    config: &Config,
    bind: Option<&str>,
    peer: Option<&str>,
    messages: Vec<String>,
) -> anyhow::Result<()> {
    let mut config = config.clone();
    config.transport.layer = TransportLayer::Udp;

    let node = config.builder(Role::Node, bind)?.build()?;
    node.set_receiver(Arc::new(|message: RawMessage| print_message(&message)));

    node.start()?.wait_timeout(START_TIMEOUT)?;
    println!("Node bound to: {}", node.local_address());

    match peer {
        Some(peer) => {
            let peer = parse_endpoint(peer)?;
            for text in messages {
                let len = text.len();
                node.send(RawMessage::new(text.into_bytes(), peer.clone()))?
                    .wait_timeout(START_TIMEOUT)?;
                println!("Sent {} bytes to {}", len, peer);
            }
        }
        None if !messages.is_empty() => {
            warn!("Ignoring {} message(s): no --send peer given", messages.len());
        }
        None => {}
    }

    println!("Press Ctrl+C to stop");
    wait_for_ctrl_c()?;
    println!("\nShutting down...");
    node.stop().wait_timeout(STOP_TIMEOUT)?;

    Ok(())
}

/// Validate the configuration against the connector builder
fn check_config(config: &Config) -> anyhow::Result<()> {
    let role = match config.transport.layer {
        TransportLayer::Tcp => Role::Server,
        TransportLayer::Udp => Role::Node,
    };
    let builder = config.builder(role, None)?;
    builder.validate()?;

    println!("Configuration OK");
    println!("  Transport: {}", config.transport.layer);
    println!("  Endpoint: {}", builder.config().endpoint);
    println!("  Framing: {:?}", builder.config().framing);
    println!("  Max frame size: {}", builder.config().max_frame_size);
    println!("  Worker threads: {}", builder.config().io_threads());
    println!("  Security: {}", builder.config().security.name());
    println!("  Options: {}", builder.config().options.iter().count());

    Ok(())
}

fn log_state(info: ConnectionInfo) {
    info!("{}", info);
}

fn print_message(message: &RawMessage) {
    println!(
        "{}: {}",
        message.endpoint(),
        String::from_utf8_lossy(message.payload())
    );
}

fn wait_for_ctrl_c() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_connect() {
        let cli = Cli::try_parse_from([
            "conduit", "connect", "--remote", "127.0.0.1:9000", "-m", "one", "-m", "two",
            "--replies", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Connect {
                remote,
                message,
                replies,
                timeout,
            } => {
                assert_eq!(remote.as_deref(), Some("127.0.0.1:9000"));
                assert_eq!(message, vec!["one", "two"]);
                assert_eq!(replies, 2);
                assert_eq!(timeout, 5);
            }
            _ => panic!("expected connect"),
        }
    }

    #[test]
    fn test_connect_requires_message() {
        assert!(Cli::try_parse_from(["conduit", "connect"]).is_err());
    }

    #[test]
    fn test_parse_serve_and_node() {
        let cli = Cli::try_parse_from(["conduit", "-v", "serve", "--echo"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Serve { bind: None, echo: true }));

        let cli = Cli::try_parse_from([
            "conduit", "--config", "conduit.toml", "node", "--send", "127.0.0.1:9001", "-m", "hi",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("conduit.toml")));
        assert!(matches!(cli.command, Commands::Node { send: Some(_), .. }));
    }

    #[test]
    fn test_check_config_defaults() {
        assert!(check_config(&Config::default()).is_ok());
    }
}
