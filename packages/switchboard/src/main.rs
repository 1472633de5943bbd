use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;

use switchboard::config::{CliOverrides, FileConfig, ServerConfig, load_config};
use switchboard::wire::{BROADCAST, Message};
use switchboard::{Client, Server};

const DEFAULT_CONFIG_FILE: &str = "switchboard.toml";

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "TCP message relay for chat clients")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground (default)
    Serve(ServeArgs),

    /// Send one text message and disconnect
    Send(SendArgs),

    /// Print every message delivered to a user
    Listen(ListenArgs),
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Config file (defaults to ./switchboard.toml; missing is fine)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Parser)]
struct SendArgs {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:8888")]
    server: String,

    /// User id to connect as
    #[arg(long = "as")]
    user: String,

    /// Recipient (omit to broadcast)
    #[arg(long)]
    to: Option<String>,

    /// Message text
    text: String,
}

#[derive(Parser)]
struct ListenArgs {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:8888")]
    server: String,

    /// User id to connect as
    #[arg(long = "as")]
    user: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        None => serve(ServeArgs::default()).await,
        Some(Commands::Serve(args)) => serve(args).await,
        Some(Commands::Send(args)) => send(args).await,
        Some(Commands::Listen(args)) => listen(args).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "switchboard=debug,info"
    } else {
        "switchboard=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut file_config: FileConfig = load_config(&config_path)
        .extract()
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    file_config.apply_overrides(&CliOverrides {
        host: args.host,
        port: args.port,
    });
    let config = ServerConfig::from_file(&file_config.server);

    let server = Server::start(config).await?;

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    server
        .serve_until(shutdown_signal)
        .await
        .context("server error")?;
    info!("switchboard stopped");
    Ok(())
}

async fn send(args: SendArgs) -> Result<()> {
    let (mut client, _online) = Client::connect(args.server.as_str(), args.user.as_str()).await?;
    let to = args.to.unwrap_or_else(|| BROADCAST.to_string());
    client
        .send(&Message::text(args.user, to, args.text))
        .await
        .context("failed to send message")?;
    client.disconnect().await
}

async fn listen(args: ListenArgs) -> Result<()> {
    let (mut client, online) = Client::connect(args.server.as_str(), args.user.as_str()).await?;
    println!("connected as {}; online: {}", client.user_id(), online.join(", "));

    loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = client.recv() => next?,
        };
        let Some(msg) = next else {
            println!("server closed the connection");
            return Ok(());
        };
        println!("{}", describe(&msg));
    }

    client.disconnect().await
}

fn describe(msg: &Message) -> String {
    let body = match (msg.content(), msg.payload(), msg.file_name()) {
        (_, Some(payload), Some(name)) => format!("{} ({} bytes)", name, payload.len()),
        (Some(content), _, _) => content.to_string(),
        (None, Some(payload), None) => format!("<{} bytes>", payload.len()),
        (None, None, _) => String::new(),
    };
    format!(
        "[{}] {} {} -> {}: {}",
        msg.timestamp().format("%H:%M:%S"),
        msg.kind(),
        msg.sender_id(),
        if msg.is_broadcast() { BROADCAST } else { msg.receiver_id() },
        body
    )
}
