//! lbv-quick: bring WireGuard tunnels up from the command line
//!
//! Initializes the global allocator, sets up logging, and drives a single
//! tunnel context.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use lbv_tunnel::{
    load_source, parse, Configuration, Context, ContextOptions, KeyPair, PrivateKey, SearchPath,
    SessionStatus, SystemConfiguration,
};
use std::io::Read;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Userspace WireGuard tunnel manager
#[derive(Parser)]
#[command(name = "lbv-quick")]
#[command(version)]
#[command(about = "Bring WireGuard tunnels up and down", long_about = None)]
struct Cli {
    /// Directories searched for <INTERFACE>.conf (platform path list)
    #[arg(short = 's', long, global = true)]
    configuration_search_path: Option<String>,

    /// MTU for interfaces that do not set one
    #[arg(short, long, global = true)]
    mtu: Option<u16>,

    /// Seconds to wait for the first handshake
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// Seconds without a handshake before a peer is considered lost
    #[arg(long, global = true)]
    handshake_timeout: Option<u64>,

    /// System configuration file (.toml or .json)
    #[arg(short = 'c', long, global = true)]
    system_config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring a tunnel up and keep it up until Ctrl-C
    Up {
        /// Configuration file or interface name
        source: String,
    },

    /// Print the configuration in canonical form
    Strip {
        /// Configuration file or interface name
        source: String,
    },

    /// Validate a configuration
    Check {
        /// Configuration file or interface name
        source: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate a new private key
    Genkey,

    /// Derive the public key from a private key (reads from stdin)
    Pubkey,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match &cli.command {
        Commands::Up { source } => cmd_up(&cli, source),
        Commands::Strip { source } => cmd_strip(&cli, source),
        Commands::Check { source, json } => cmd_check(&cli, source, *json),
        Commands::Genkey => cmd_genkey(),
        Commands::Pubkey => cmd_pubkey(),
    }
}

/// System configuration from `-c`, with command line overrides applied
fn system_configuration(cli: &Cli) -> Result<SystemConfiguration> {
    let mut system = match &cli.system_config {
        Some(path) => SystemConfiguration::load(path)
            .with_context(|| format!("Failed to load system configuration {}", path.display()))?,
        None => SystemConfiguration::default(),
    };

    if let Some(mtu) = cli.mtu {
        system.default_mtu = Some(mtu);
    }
    if let Some(secs) = cli.timeout {
        system.connect_timeout_secs = secs;
    }
    if let Some(secs) = cli.handshake_timeout {
        system.handshake_timeout_secs = secs;
    }
    Ok(system)
}

fn search_path(cli: &Cli) -> Result<SearchPath> {
    match &cli.configuration_search_path {
        Some(paths) => SearchPath::parse(paths).context("Invalid search path"),
        None => Ok(SearchPath::from_env()),
    }
}

fn load_configuration(cli: &Cli, source: &str) -> Result<Configuration> {
    let loaded = load_source(source, &search_path(cli)?)?;
    let config = parse(&loaded.text).with_context(|| match &loaded.path {
        Some(path) => format!("Invalid configuration in {}", path.display()),
        None => "Invalid configuration".to_string(),
    })?;
    Ok(config)
}

/// Bring the tunnel up and wait for Ctrl-C
fn cmd_up(cli: &Cli, source: &str) -> Result<()> {
    let mut options = ContextOptions::default().with_system(system_configuration(cli)?);
    if let Some(paths) = &cli.configuration_search_path {
        options = options.with_search_path(paths.clone());
    }
    let context = Context::new(options).context("Failed to create context")?;

    let handle = context
        .tunnel_up(source, None)
        .with_context(|| format!("Failed to bring up {} (code {})", source, context.get_error_code()))?;

    let config = context.config(handle)?;
    for address in &config.interface.addresses {
        info!(session = %handle, "Address {}", address);
    }
    for server in config.interface.dns_servers() {
        info!(session = %handle, "DNS {}", server);
    }

    for session in context.sessions() {
        info!(
            session = %session.handle,
            name = session.name.as_deref().unwrap_or("-"),
            mtu = session.mtu,
            "Tunnel {}", session.status
        );
        for peer in &session.peers {
            info!(peer = %peer.public_key, endpoint = %peer.endpoint, "{:?}", peer.state);
        }
    }

    info!("Press Ctrl-C to stop");
    context
        .runtime_handle()
        .block_on(tokio::signal::ctrl_c())
        .context("Failed to wait for Ctrl-C")?;

    if let Ok(stats) = context.stats(handle) {
        info!("{}", stats.format());
    }
    if context.status(handle)? == SessionStatus::Down {
        warn!(session = %handle, "Tunnel was down");
    }

    context.tunnel_down(handle).context("Failed to bring tunnel down")?;
    info!(session = %handle, "Tunnel {}", SessionStatus::Closed);
    Ok(())
}

/// Print the canonical configuration
fn cmd_strip(cli: &Cli, source: &str) -> Result<()> {
    let config = load_configuration(cli, source)?;
    print!("{}", config);
    Ok(())
}

/// Validate a configuration
fn cmd_check(cli: &Cli, source: &str, json: bool) -> Result<()> {
    let result = load_configuration(cli, source);

    if json {
        let report = match &result {
            Ok(config) => serde_json::json!({
                "valid": true,
                "public_key": config.interface.public_key().to_base64(),
                "addresses": config.interface.addresses.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
                "peers": config.peers.iter().map(|p| serde_json::json!({
                    "public_key": p.public_key.to_base64(),
                    "endpoint": p.endpoint.to_string(),
                    "allowed_ips": p.allowed_ips.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
                })).collect::<Vec<_>>(),
            }),
            Err(e) => serde_json::json!({
                "valid": false,
                "error": format!("{:#}", e),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        if result.is_err() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = result?;
    println!("✓ Configuration valid");
    println!("  Public key: {}", config.interface.public_key());
    for address in &config.interface.addresses {
        println!("  Address:    {}", address);
    }
    println!("  Peers:      {}", config.peers.len());
    Ok(())
}

/// Generate a new private key
fn cmd_genkey() -> Result<()> {
    let pair = KeyPair::generate();
    println!("{}", pair.private.to_base64());
    Ok(())
}

/// Derive the public key from a private key read from stdin
fn cmd_pubkey() -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read stdin")?;

    let input = input.trim();
    if input.is_empty() {
        bail!("Expected a private key on stdin");
    }

    let private = PrivateKey::from_base64(input).context("Invalid private key")?;
    println!("{}", KeyPair::from_private(private).public);
    Ok(())
}
