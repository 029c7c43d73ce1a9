// dtnode — command-line front end for the DTN node engine
//
// Runs a node interactively and edits the settings file it starts from.

mod config;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::*;
use dtnode_core::bundle::Bundle;
use dtnode_core::bus::NodeEvent;
use dtnode_core::cla::MemoryCla;
use dtnode_core::config::NodeConfig;
use dtnode_core::eid::{Eid, LocalAddresses};
use dtnode_core::registrar::{SinkError, SinkHandler};
use dtnode_core::{logging, Forwarded, Node};
use std::path::PathBuf;
use std::sync::Arc;

/// Lifetime given to bundles sent from the console
const CONSOLE_BUNDLE_LIFETIME_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Parser)]
#[command(name = "dtnode")]
#[command(about = "dtnode — delay-tolerant networking node", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and read console commands
    Start {
        /// Write logs to daily files in this directory instead of stderr
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Register an in-memory convergence layer named "mem"
        #[arg(long)]
        loopback: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Parse an endpoint identifier
    Eid { raw: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings_path = config::settings_path(cli.config.as_deref())?;

    match cli.command {
        Commands::Start { log_dir, loopback } => cmd_start(settings_path, log_dir, loopback).await,
        Commands::Config { action } => cmd_config(settings_path, action),
        Commands::Eid { raw } => cmd_eid(settings_path, &raw),
    }
}

fn cmd_config(path: PathBuf, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let config = config::set(&path, &key, &value)?;
            let stored = config.get(&key.to_ascii_uppercase()).unwrap_or_default();
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), stored);
        }

        ConfigAction::Get { key } => {
            let config = config::load(&path)?;
            match config.get(&key.to_ascii_uppercase()) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }

        ConfigAction::List => {
            let config = config::load(&path)?;
            println!("{}", "Configuration".bold());
            println!("  {}", path.display().to_string().dimmed());
            println!();
            for key in NodeConfig::keys() {
                let value = config.get(key).unwrap_or_default();
                println!("  {:<38} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn cmd_eid(path: PathBuf, raw: &str) -> Result<()> {
    let eid = Eid::create(raw).with_context(|| format!("Invalid EID: {}", raw))?;
    let config = Arc::new(config::load(&path)?);
    let local = LocalAddresses::new(config);

    println!("{}", eid.to_string().bold());
    println!("  scheme:  {}", eid.scheme().bright_cyan());
    println!("  code:    {}", eid.iana_code());
    println!("  ssp:     {}", eid.ssp());
    if let Some(cla) = eid.cla_name() {
        println!("  cla:     {}", cla);
    }
    match local.local_sink(&eid) {
        Some(sink) => println!("  local:   {} (sink {})", "yes".green(), sink),
        None => println!("  local:   {}", "no".yellow()),
    }
    Ok(())
}

/// Prints every bundle delivered to its sink
struct ConsoleSink {
    sink: String,
}

#[async_trait]
impl SinkHandler for ConsoleSink {
    async fn deliver(&self, bundle: &mut Bundle) -> Result<(), SinkError> {
        let text = String::from_utf8_lossy(&bundle.payload).to_string();
        println!();
        println!("{} [{}] from {}: {}", "📨".bold(), self.sink.bright_cyan(), bundle.source, text);
        bundle.clear_payload();
        Ok(())
    }
}

async fn cmd_start(path: PathBuf, log_dir: Option<PathBuf>, loopback: bool) -> Result<()> {
    let config = Arc::new(config::load(&path)?);
    let log_dir = match log_dir {
        Some(dir) => Some(dir),
        None if !std::io::IsTerminal::is_terminal(&std::io::stderr()) => Some(config::data_dir()?.join("logs")),
        None => None,
    };
    let _logging = logging::init(&config, log_dir.as_deref()).context("Failed to initialize logging")?;

    let node = Node::new(config.clone());
    if loopback {
        node.add_cla(Arc::new(MemoryCla::new("mem")))?;
    }
    node.start().context("Failed to start node")?;

    println!("{}", "dtnode — Running".bold());
    println!();
    println!("Local EID: {}", config.local_eid.get().to_string().bright_cyan());
    println!("CLAs:      {}", node.manager().cla_names().join(", "));
    println!();
    println!("{}", "Commands:".bold());
    println!("  {} <sink>                 ", "register".bright_green());
    println!("  {} <eid> <text>              ", "send".bright_green());
    println!("  {} <host>                     ", "peer".bright_green());
    println!("  {} <KEY> <value>               ", "set".bright_green());
    println!("  {}                          ", "status".bright_green());
    println!("  {}                            ", "quit".bright_green());
    println!();

    use tokio::io::AsyncBufReadExt;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("> ");
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = line.trim();
        let mut parts = line.splitn(3, ' ');

        match (parts.next(), parts.next(), parts.next()) {
            (Some(""), _, _) => continue,
            (Some("quit" | "exit"), _, _) => break,

            (Some("register"), Some(sink), None) => {
                let handler = Arc::new(ConsoleSink { sink: sink.to_string() });
                match node.registrar().register(sink, handler) {
                    Ok(()) => println!("{} Registered {}", "✓".green(), sink),
                    Err(e) => println!("{} {}", "✗".red(), e),
                }
            }

            (Some("send"), Some(destination), Some(text)) => {
                let destination = match Eid::create(destination) {
                    Ok(eid) => eid,
                    Err(e) => {
                        println!("{} {}", "✗".red(), e);
                        continue;
                    }
                };
                let bundle = Bundle::new(
                    config.local_eid.get(),
                    destination,
                    CONSOLE_BUNDLE_LIFETIME_MS,
                    text.as_bytes().to_vec(),
                );
                match node.forward(bundle).await {
                    Ok(Forwarded::Delivered) => println!("{} Delivered locally", "✓".green()),
                    Ok(Forwarded::Sent { next_hop }) => println!("{} Sent via {}", "✓".green(), next_hop),
                    Err(e) => println!("{} {}", "✗".red(), e),
                }
            }

            (Some("peer"), Some(host), None) => {
                node.bus().publish(NodeEvent::PeerReachable {
                    address: host.to_string(),
                });
                println!("{} Announced {}", "✓".green(), host);
            }

            (Some("set"), Some(key), Some(value)) => match config.set(&key.to_ascii_uppercase(), value) {
                Ok(()) => println!("{} {} = {}", "✓".green(), key.bright_cyan(), value),
                Err(e) => println!("{} {}", "✗".red(), e),
            },

            (Some("status"), None, None) => {
                let stats = node.manager().stats();
                println!("Channels:   {}", node.manager().channel_count());
                for eid in node.manager().channels() {
                    println!("  • {}", eid);
                }
                println!("Routes:     {}", node.routing().len());
                println!("Sinks:      {}", node.registrar().sinks().join(", "));
                println!(
                    "Opens:      {} requested, {} attempted, {} coalesced",
                    stats.open_requests, stats.transport_opens, stats.coalesced
                );
                println!("Events:     {}", node.bus().published());
            }

            _ => println!("Try: register, send, peer, set, status, quit"),
        }
    }

    println!("Shutting down...");
    node.shutdown().await;
    config
        .to_settings()
        .save(&path)
        .context("Failed to save settings")?;
    Ok(())
}
