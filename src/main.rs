//! ChatRelay - Short text messaging through a central relay
//!
//! Participants log in over a control connection and send their text as
//! acknowledged datagrams; the server relays it to everyone or to one user.

mod config;
mod network;
mod protocol;
mod reliability;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use network::{Client, ClientEvent, Server, ServerEvent, SessionRegistry};

/// ChatRelay - Text relay server and client
#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(author = "ChatRelay Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Relay short text messages between named participants", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Server {
        /// Control channel port
        #[arg(short, long)]
        port: Option<u16>,

        /// Datagram port
        #[arg(short, long)]
        udp_port: Option<u16>,

        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Join a relay server
    Client {
        /// Name to log in with
        #[arg(short, long)]
        name: Option<String>,

        /// Server address to connect to
        #[arg(short, long)]
        server: Option<String>,

        /// Control channel port
        #[arg(short, long)]
        port: Option<u16>,

        /// Datagram port
        #[arg(short, long)]
        udp_port: Option<u16>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Write the configuration to this path instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let file_layer = match &config.general.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();

    match cli.command {
        Commands::Server {
            port,
            udp_port,
            bind,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.tcp_port = port;
            }
            if let Some(udp_port) = udp_port {
                config.server.udp_port = udp_port;
            }
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            run_server(config).await?;
        }
        Commands::Client {
            name,
            server,
            port,
            udp_port,
        } => {
            let mut config = config;
            if let Some(name) = name {
                config.general.identity = Some(name);
            }
            if let Some(server) = server {
                config.client.server_host = server;
            }
            if let Some(port) = port {
                config.client.tcp_port = port;
            }
            if let Some(udp_port) = udp_port {
                config.client.udp_port = udp_port;
            }
            run_client(config).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else if let Some(path) = output {
                config.save(&path)?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the relay server until Ctrl+C
async fn run_server(config: Config) -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    let mut server = Server::new(config.server_network(), registry.clone());

    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    server.start().await?;

    if let Some((tcp_addr, udp_addr)) = server.local_addrs() {
        println!("\n========================================");
        println!("  ChatRelay Server Running");
        println!("========================================");
        println!("  Control: {}", tcp_addr);
        println!("  Datagrams: {}", udp_addr);
        println!("========================================");
        println!("\nPress Ctrl+C to stop.\n");
    }

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::UserLoggedIn { identity, addr } => {
                        println!("+ {} logged in from {} ({} online)", identity, addr, registry.len().await);
                    }
                    ServerEvent::LoginRejected { identity, addr } => {
                        println!("! Login as '{}' from {} rejected: name in use", identity, addr);
                    }
                    ServerEvent::UserLoggedOut { identity, reason } => {
                        println!("- {} left ({}, {} online)", identity, reason, registry.len().await);
                    }
                    ServerEvent::Started { tcp_addr, udp_addr } => {
                        tracing::info!("Serving control on {} and datagrams on {}", tcp_addr, udp_addr);
                    }
                    ServerEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// A line typed by the user
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Broadcast(String),
    Private { target: String, text: String },
    Ping(String),
    Users,
    Quit,
    Invalid(&'static str),
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if !line.starts_with('/') {
        return Input::Broadcast(line.to_string());
    }

    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let target = parts.next().filter(|s| !s.is_empty());
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match (command, target, rest) {
        ("/msg", Some(target), Some(text)) => Input::Private {
            target: target.to_string(),
            text: text.to_string(),
        },
        ("/msg", _, _) => Input::Invalid("usage: /msg <user> <text>"),
        ("/ping", Some(target), None) => Input::Ping(target.to_string()),
        ("/ping", _, _) => Input::Invalid("usage: /ping <user>"),
        ("/users", None, None) => Input::Users,
        ("/quit", None, None) => Input::Quit,
        _ => Input::Invalid("commands: /msg <user> <text>, /ping <user>, /users, /quit"),
    }
}

/// Run the interactive client
async fn run_client(config: Config) -> anyhow::Result<()> {
    let identity = config.identity();
    let mut client = Client::new(config.client_network(), identity);

    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("client event receiver already taken"))?;

    println!("Connecting to {} as '{}'...", config.client.server_host, client.identity());
    client.connect_hostname(&config.client.server_host).await?;

    println!("Type a line to message everyone. Commands: /msg <user> <text>, /ping <user>, /users, /quit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut users: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::Connected { server_addr } => {
                        tracing::info!("Connected to {}", server_addr);
                    }
                    ClientEvent::MessageReceived { sender, text, private } => {
                        if private {
                            println!("[private] {}: {}", sender, text);
                        } else {
                            println!("{}: {}", sender, text);
                        }
                    }
                    ClientEvent::UserListChanged { users: list } => {
                        println!("* Online: {}", list.join(", "));
                        users = list;
                    }
                    ClientEvent::Acknowledged { sequence } => {
                        tracing::debug!("Message #{} delivered to server", sequence);
                    }
                    ClientEvent::PingMeasured { target, rtt } => {
                        println!("* Ping {}: {} ms", target, rtt.as_millis());
                    }
                    ClientEvent::Retransmitted { sequence, attempt } => {
                        tracing::debug!("Message #{} resent (attempt {})", sequence, attempt);
                    }
                    ClientEvent::DeliveryAbandoned { sequence } => {
                        println!("! Message #{} could not be delivered", sequence);
                    }
                    ClientEvent::ConnectionLost { reason } => {
                        println!("Disconnected: {}", reason);
                        return Ok(());
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let result = match parse_input(&line) {
                    Input::Broadcast(text) => client.send_text(&text, None).await.map(drop),
                    Input::Private { target, text } => {
                        client.send_text(&text, Some(&target)).await.map(drop)
                    }
                    Input::Ping(target) => client.ping(&target).await,
                    Input::Users => {
                        println!("* Online: {}", users.join(", "));
                        Ok(())
                    }
                    Input::Quit => break,
                    Input::Invalid(help) => {
                        println!("{}", help);
                        Ok(())
                    }
                    Input::Empty => Ok(()),
                };
                if let Err(e) = result {
                    println!("! {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    if client.is_connected().await {
        client.logout().await?;
        // Let the control task send the logout before the runtime exits
        while let Some(event) = event_rx.recv().await {
            if matches!(event, ClientEvent::ConnectionLost { .. }) {
                break;
            }
        }
    }
    tracing::info!("Client stopped ({:?})", client.state().await);

    Ok(())
}
