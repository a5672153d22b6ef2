//! myrtle - MySQL/MariaDB protocol client
//!
//! Connects, negotiates and runs one command, printing the decoded response
//! envelope. Useful for checking connectivity, TLS and compression settings.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use myrtle_client::{Connection, ConnectionConfig, TlsClientConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "myrtle")]
#[command(about = "Command-line client for MySQL-compatible servers")]
#[command(version)]
struct Cli {
    /// YAML config file (defaults to $MYRTLE_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Login user
    #[arg(short, long)]
    user: Option<String>,

    /// Login password
    #[arg(short, long, env = "MYRTLE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Default database
    #[arg(short = 'D', long)]
    database: Option<String>,

    /// Enable protocol compression
    #[arg(long)]
    compress: bool,

    /// Per-command read timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Keep recent frames and print them on exit
    #[arg(long)]
    trace_frames: bool,

    // ===== TLS Options =====
    /// Upgrade the connection to TLS
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to the host)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping the server
    Ping,

    /// Show what the server announced in its greeting
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the server status line
    Stats,

    /// Run a statement and describe the response
    Query {
        /// SQL text
        sql: String,
    },

    /// Switch the default database
    InitDb {
        /// Database name
        database: String,
    },

    /// Reset session state
    ResetConnection,
}

fn build_config(cli: &Cli) -> Result<ConnectionConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = ConnectionConfig::from_file(path)?;
            config.apply_env_overrides();
            config
        }
        None => ConnectionConfig::load()?,
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(user) = &cli.user {
        config.user = user.clone();
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone());
    }
    if let Some(database) = &cli.database {
        config.database = Some(database.clone());
    }
    if cli.compress {
        config.compress = true;
    }
    if cli.trace_frames {
        config.trace_frames = true;
    }

    if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
        let tls = config.tls.get_or_insert_with(TlsClientConfig::new);
        tls.enabled = true;

        if let Some(path) = &cli.ca_cert {
            tls.ca_cert_path = Some(path.clone());
        }
        if let (Some(cert), Some(key)) = (&cli.client_cert, &cli.client_key) {
            tls.client_cert_path = Some(cert.clone());
            tls.client_key_path = Some(key.clone());
        } else if cli.client_cert.is_some() || cli.client_key.is_some() {
            return Err("--client-cert and --client-key must be used together".into());
        }
        if cli.insecure {
            tls.insecure = true;
        }
        if let Some(name) = &cli.server_name {
            tls.server_name = Some(name.clone());
        }
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli).map_err(|e| {
        eprintln!("{}: {}", "Configuration error".red(), e);
        e
    })?;

    let mut conn = Connection::connect(config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let timeout = cli.timeout.map(Duration::from_secs);
    let result = commands::execute(&mut conn, cli.command, timeout).await;

    if let Some(trace) = conn.frame_trace() {
        eprint!("{}", trace.dump().dimmed());
    }
    conn.close().await?;

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
